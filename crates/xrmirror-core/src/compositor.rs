use std::time::Duration;

use crate::gpu::GpuDevice;
use crate::types::{
    BlendMode, Extent2D, Fov, FrameState, Pose, ReferenceSpaceKind, SessionState, TextureFormat,
    Time, View, ViewConfiguration, ViewDescriptor,
};
use crate::XrResult;

/// Event drained from the compositor's queue, decoded once at the polling boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositorEvent {
    StateChanged(SessionState),
    InstanceLossPending { loss_time: Time },
    /// Any event the state machine has no transition for.
    Ignored,
}

/// Outcome of waiting on an acquired swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageWait {
    Ready,
    TimedOut,
}

/// Parameters for a compositor-managed image chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainCreateInfo {
    pub extent: Extent2D,
    pub sample_count: u32,
    pub mip_count: u32,
    pub array_size: u32,
    pub face_count: u32,
    pub color_attachment: bool,
}

impl SwapchainCreateInfo {
    /// Single-sample, single-mip color target at the descriptor's recommended extent.
    pub fn for_view(descriptor: &ViewDescriptor) -> Self {
        Self {
            extent: descriptor.recommended_extent(),
            sample_count: 1,
            mip_count: 1,
            array_size: 1,
            face_count: 1,
            color_attachment: true,
        }
    }
}

/// An image chain together with the GPU textures backing it, in chain order.
pub struct SwapchainAllocation<S, T> {
    pub chain: S,
    pub format: TextureFormat,
    pub textures: Vec<T>,
}

/// Compositor-owned ring of images. Dropping the handle destroys the chain.
pub trait ImageChain {
    /// Returns the index of the next image; the compositor chooses it.
    fn acquire_image(&mut self) -> XrResult<u32>;
    /// Blocks until the acquired image is writable. `None` waits without bound.
    fn wait_image(&mut self, timeout: Option<Duration>) -> XrResult<ImageWait>;
    fn release_image(&mut self) -> XrResult<()>;
}

/// One eye's entry in a projection layer.
pub struct LayerView<'a, S> {
    pub pose: Pose,
    pub fov: Fov,
    pub swapchain: &'a S,
    pub extent: Extent2D,
    pub image_array_index: u32,
}

/// Composited projection layer handed to end-frame.
pub struct ProjectionLayer<'a, S, P> {
    pub space: &'a P,
    pub views: Vec<LayerView<'a, S>>,
}

/// The compositor runtime as consumed by the session and frame logic.
///
/// Handles returned by the trait (`Swapchain`, `Space`) release their compositor
/// resource when dropped.
pub trait Compositor<G: GpuDevice> {
    type Swapchain: ImageChain;
    type Space;

    fn begin_session(&mut self, configuration: ViewConfiguration) -> XrResult<()>;
    /// Only valid once the compositor has moved the session to STOPPING.
    fn end_session(&mut self) -> XrResult<()>;
    /// Asks the compositor to move a running session towards STOPPING.
    fn request_exit(&mut self) -> XrResult<()>;

    /// Drains at most one event; never blocks.
    fn poll_event(&mut self) -> XrResult<Option<CompositorEvent>>;

    /// Two-call enumeration. With `None` returns the required count; with a buffer
    /// fills it and returns how many descriptors were written.
    fn enumerate_views(
        &mut self,
        configuration: ViewConfiguration,
        out: Option<&mut [ViewDescriptor]>,
    ) -> XrResult<usize>;

    fn create_reference_space(
        &mut self,
        kind: ReferenceSpaceKind,
        anchor: Pose,
    ) -> XrResult<Self::Space>;

    fn create_swapchain(
        &mut self,
        device: &mut G,
        info: &SwapchainCreateInfo,
    ) -> XrResult<SwapchainAllocation<Self::Swapchain, G::Texture>>;

    fn wait_frame(&mut self) -> XrResult<FrameState>;
    fn begin_frame(&mut self) -> XrResult<()>;

    /// Writes located views into `out` and returns how many the compositor
    /// reported, which may differ from `out.len()`.
    fn locate_views(
        &mut self,
        configuration: ViewConfiguration,
        time: Time,
        space: &Self::Space,
        out: &mut [View],
    ) -> XrResult<usize>;

    fn end_frame(
        &mut self,
        time: Time,
        blend_mode: BlendMode,
        layer: Option<ProjectionLayer<'_, Self::Swapchain, Self::Space>>,
    ) -> XrResult<()>;
}
