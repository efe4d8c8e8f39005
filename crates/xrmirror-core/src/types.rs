use std::time::Duration;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Session state as reported by the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Ready,
    Synchronized,
    Visible,
    Focused,
    Stopping,
    LossPending,
    Exiting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Ready => "ready",
            Self::Synchronized => "synchronized",
            Self::Visible => "visible",
            Self::Focused => "focused",
            Self::Stopping => "stopping",
            Self::LossPending => "loss-pending",
            Self::Exiting => "exiting",
        }
    }

    /// States in which a begun session may be asked to stop.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Synchronized | Self::Visible | Self::Focused
        )
    }
}

/// Compositor timestamp in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Time(pub i64);

impl Time {
    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(&self) -> i64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    pub orientation: Quat,
    pub position: Vec3,
}

impl Pose {
    pub const IDENTITY: Self = Self {
        orientation: Quat::IDENTITY,
        position: Vec3::ZERO,
    };
}

/// Field of view half-angles in radians; left and down are usually negative.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Fov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

/// One eye's pose and field of view for the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct View {
    pub pose: Pose,
    pub fov: Fov,
}

/// Per-view rendering limits reported by the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewDescriptor {
    pub recommended_width: u32,
    pub recommended_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub recommended_sample_count: u32,
    pub max_sample_count: u32,
}

impl ViewDescriptor {
    pub fn recommended_extent(&self) -> Extent2D {
        Extent2D::new(self.recommended_width, self.recommended_height)
    }
}

/// Timing data issued by the compositor's wait-frame step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameState {
    pub predicted_display_time: Time,
    pub predicted_display_period: Duration,
    pub should_render: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewConfiguration {
    PrimaryMono,
    #[default]
    PrimaryStereo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceSpaceKind {
    View,
    #[default]
    Local,
    Stage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    #[default]
    Opaque,
    Additive,
    AlphaBlend,
}

/// Pixel format negotiated for a swapchain or window target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba8Srgb,
    Bgra8Srgb,
    /// Backend-specific format code with no portable name.
    Other(u32),
}

impl TextureFormat {
    pub fn is_srgb(&self) -> bool {
        matches!(self, Self::Rgba8Srgb | Self::Bgra8Srgb)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Rgba8Unorm => "RGBA8_UNORM",
            Self::Bgra8Unorm => "BGRA8_UNORM",
            Self::Rgba8Srgb => "RGBA8_SRGB",
            Self::Bgra8Srgb => "BGRA8_SRGB",
            Self::Other(_) => "UNKNOWN_FORMAT",
        }
    }
}
