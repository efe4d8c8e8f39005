use crate::types::{Extent2D, TextureFormat, View};
use crate::XrResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Clear,
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Store,
    DontCare,
}

/// Color attachment for a single render pass.
pub struct ColorTarget<'a, T> {
    pub texture: &'a T,
    pub extent: Extent2D,
    pub clear_color: [f32; 4],
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

/// The desktop window's presentable texture for the current frame.
pub struct WindowTexture<T> {
    pub texture: T,
    pub extent: Extent2D,
    pub format: TextureFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Eye(usize),
    Mirror,
}

/// What the caller's render callback draws into.
pub struct RenderView<'a, T> {
    pub kind: TargetKind,
    pub texture: &'a T,
    pub extent: Extent2D,
    pub format: TextureFormat,
    pub view: View,
}

/// GPU command submission as consumed by the frame coordinator.
pub trait GpuDevice {
    type Texture;
    type CommandBuffer;

    fn acquire_command_buffer(&mut self) -> XrResult<Self::CommandBuffer>;

    fn begin_render_pass(
        &mut self,
        cmd: &mut Self::CommandBuffer,
        target: &ColorTarget<'_, Self::Texture>,
    ) -> XrResult<()>;

    fn end_render_pass(&mut self, cmd: &mut Self::CommandBuffer) -> XrResult<()>;

    /// `Ok(None)` when the window has nothing to present into this frame
    /// (minimized, occluded, or no window at all).
    fn acquire_window_texture(
        &mut self,
        cmd: &mut Self::CommandBuffer,
    ) -> XrResult<Option<WindowTexture<Self::Texture>>>;

    /// Submits everything recorded into `cmd`. Does not wait for completion.
    fn submit(&mut self, cmd: Self::CommandBuffer) -> XrResult<()>;

    /// Throws away an unsubmitted buffer so its slot can be reused. Closes any
    /// open render pass first.
    fn discard(&mut self, cmd: Self::CommandBuffer);
}
