//! Session lifecycle and frame synchronization for a stereo head-mounted display
//! compositor that also mirrors every frame to a desktop target.
//!
//! The crate is backend-neutral: the compositor runtime and the GPU device are
//! consumed through the [`Compositor`] and [`GpuDevice`] traits. Backends live in
//! sibling crates; [`mock`] provides a scriptable in-process implementation.

#![forbid(unsafe_code)]

pub mod compositor;
pub mod config;
pub mod frame;
pub mod gpu;
pub mod mock;
pub mod runtime;
pub mod session;
pub mod space;
pub mod swapchain;
pub mod types;
pub mod view_set;

pub use compositor::{
    Compositor, CompositorEvent, ImageChain, ImageWait, LayerView, ProjectionLayer,
    SwapchainAllocation, SwapchainCreateInfo,
};
pub use config::{ImageWaitPolicy, SessionConfig};
pub use frame::{FrameCoordinator, FrameReport, FrameStats};
pub use gpu::{ColorTarget, GpuDevice, LoadOp, RenderView, StoreOp, TargetKind, WindowTexture};
pub use runtime::MirrorSession;
pub use session::{Flow, SessionStateMachine};
pub use space::ReferenceSpace;
pub use swapchain::ViewSwapchain;
pub use types::{
    BlendMode, Extent2D, Fov, FrameState, Pose, ReferenceSpaceKind, SessionState, TextureFormat,
    Time, View, ViewConfiguration, ViewDescriptor,
};
pub use view_set::ViewSet;

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum XrError {
    #[error("compositor call {call} failed: {reason}")]
    Compositor { call: &'static str, reason: String },
    #[error("swapchain creation for view {view} failed: {source}")]
    SwapchainCreation {
        view: usize,
        #[source]
        source: Box<XrError>,
    },
    #[error("GPU resource acquisition failed: {0}")]
    ResourceAcquisition(String),
    #[error("swapchain image wait expired after {0:?}")]
    ImageWaitTimeout(Duration),
    #[error("compositor unavailable: {0}")]
    Unavailable(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("session has terminated")]
    Terminated,
}

impl XrError {
    /// Failure of a single compositor entry point.
    pub fn compositor(call: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Compositor {
            call,
            reason: reason.to_string(),
        }
    }

    /// Failure to acquire or submit a GPU resource.
    pub fn gpu(reason: impl std::fmt::Display) -> Self {
        Self::ResourceAcquisition(reason.to_string())
    }

    pub fn config(reason: impl std::fmt::Display) -> Self {
        Self::Config(reason.to_string())
    }

    /// Whether the caller may keep driving the session after this error.
    ///
    /// Transient errors abort the enclosing transition or frame only; the session
    /// is left in its last consistent state.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Compositor { .. }
            | Self::SwapchainCreation { .. }
            | Self::ResourceAcquisition(_)
            | Self::ImageWaitTimeout(_) => true,
            Self::Unavailable(_) | Self::Config(_) | Self::Terminated => false,
        }
    }
}

pub type XrResult<T> = Result<T, XrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(XrError::compositor("xrBeginFrame", "XR_ERROR_RUNTIME_FAILURE").is_transient());
        assert!(XrError::gpu("out of command buffers").is_transient());
        assert!(!XrError::Terminated.is_transient());
        assert!(!XrError::Unavailable("no runtime".into()).is_transient());
    }

    #[test]
    fn swapchain_error_names_view_and_cause() {
        let err = XrError::SwapchainCreation {
            view: 2,
            source: Box::new(XrError::compositor(
                "xrCreateSwapchain",
                "XR_ERROR_OUT_OF_MEMORY",
            )),
        };
        let text = err.to_string();
        assert!(text.contains("view 2"));
        assert!(text.contains("XR_ERROR_OUT_OF_MEMORY"));
    }
}
