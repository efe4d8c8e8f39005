//! Translation between OpenXR / Vulkan values and the core data model.

use ash::vk;
use glam::{Quat, Vec3};
use openxr as xr;

use xrmirror_core::{
    BlendMode, CompositorEvent, Fov, Pose, ReferenceSpaceKind, SessionState, TextureFormat, Time,
    View, ViewConfiguration, ViewDescriptor,
};

pub fn to_pose(pose: xr::Posef) -> Pose {
    Pose {
        orientation: Quat::from_xyzw(
            pose.orientation.x,
            pose.orientation.y,
            pose.orientation.z,
            pose.orientation.w,
        ),
        position: Vec3::new(pose.position.x, pose.position.y, pose.position.z),
    }
}

pub fn to_xr_pose(pose: Pose) -> xr::Posef {
    xr::Posef {
        orientation: xr::Quaternionf {
            x: pose.orientation.x,
            y: pose.orientation.y,
            z: pose.orientation.z,
            w: pose.orientation.w,
        },
        position: xr::Vector3f {
            x: pose.position.x,
            y: pose.position.y,
            z: pose.position.z,
        },
    }
}

pub fn to_fov(fov: xr::Fovf) -> Fov {
    Fov {
        angle_left: fov.angle_left,
        angle_right: fov.angle_right,
        angle_up: fov.angle_up,
        angle_down: fov.angle_down,
    }
}

pub fn to_xr_fov(fov: Fov) -> xr::Fovf {
    xr::Fovf {
        angle_left: fov.angle_left,
        angle_right: fov.angle_right,
        angle_up: fov.angle_up,
        angle_down: fov.angle_down,
    }
}

pub fn to_view(view: &xr::View) -> View {
    View {
        pose: to_pose(view.pose),
        fov: to_fov(view.fov),
    }
}

pub fn to_descriptor(view: &xr::sys::ViewConfigurationView) -> ViewDescriptor {
    ViewDescriptor {
        recommended_width: view.recommended_image_rect_width,
        recommended_height: view.recommended_image_rect_height,
        max_width: view.max_image_rect_width,
        max_height: view.max_image_rect_height,
        recommended_sample_count: view.recommended_swapchain_sample_count,
        max_sample_count: view.max_swapchain_sample_count,
    }
}

pub fn to_time(time: xr::Time) -> Time {
    Time::from_nanos(time.as_nanos())
}

pub fn to_xr_time(time: Time) -> xr::Time {
    xr::Time::from_nanos(time.as_nanos())
}

pub fn view_configuration_type(configuration: ViewConfiguration) -> xr::ViewConfigurationType {
    match configuration {
        ViewConfiguration::PrimaryMono => xr::ViewConfigurationType::PRIMARY_MONO,
        ViewConfiguration::PrimaryStereo => xr::ViewConfigurationType::PRIMARY_STEREO,
    }
}

pub fn reference_space_type(kind: ReferenceSpaceKind) -> xr::ReferenceSpaceType {
    match kind {
        ReferenceSpaceKind::View => xr::ReferenceSpaceType::VIEW,
        ReferenceSpaceKind::Local => xr::ReferenceSpaceType::LOCAL,
        ReferenceSpaceKind::Stage => xr::ReferenceSpaceType::STAGE,
    }
}

pub fn blend_mode(mode: BlendMode) -> xr::EnvironmentBlendMode {
    match mode {
        BlendMode::Opaque => xr::EnvironmentBlendMode::OPAQUE,
        BlendMode::Additive => xr::EnvironmentBlendMode::ADDITIVE,
        BlendMode::AlphaBlend => xr::EnvironmentBlendMode::ALPHA_BLEND,
    }
}

/// `None` for states the core does not model (e.g. UNKNOWN or vendor values).
pub fn session_state(state: xr::SessionState) -> Option<SessionState> {
    Some(match state {
        xr::SessionState::IDLE => SessionState::Idle,
        xr::SessionState::READY => SessionState::Ready,
        xr::SessionState::SYNCHRONIZED => SessionState::Synchronized,
        xr::SessionState::VISIBLE => SessionState::Visible,
        xr::SessionState::FOCUSED => SessionState::Focused,
        xr::SessionState::STOPPING => SessionState::Stopping,
        xr::SessionState::LOSS_PENDING => SessionState::LossPending,
        xr::SessionState::EXITING => SessionState::Exiting,
        _ => return None,
    })
}

/// Decodes a polled event while its buffer is still borrowed.
pub fn decode_event(event: &xr::Event<'_>) -> CompositorEvent {
    match event {
        xr::Event::SessionStateChanged(e) => session_state(e.state())
            .map_or(CompositorEvent::Ignored, CompositorEvent::StateChanged),
        xr::Event::InstanceLossPending(e) => CompositorEvent::InstanceLossPending {
            loss_time: to_time(e.loss_time()),
        },
        _ => CompositorEvent::Ignored,
    }
}

pub fn texture_format(format: vk::Format) -> TextureFormat {
    match format {
        vk::Format::R8G8B8A8_UNORM => TextureFormat::Rgba8Unorm,
        vk::Format::B8G8R8A8_UNORM => TextureFormat::Bgra8Unorm,
        vk::Format::R8G8B8A8_SRGB => TextureFormat::Rgba8Srgb,
        vk::Format::B8G8R8A8_SRGB => TextureFormat::Bgra8Srgb,
        other => TextureFormat::Other(other.as_raw() as u32),
    }
}

const PREFERRED_FORMATS: [vk::Format; 4] = [
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::B8G8R8A8_SRGB,
];

/// Picks the first preferred format the runtime offers, else the runtime's own
/// first choice.
pub fn choose_swapchain_format(available: &[u32]) -> vk::Format {
    PREFERRED_FORMATS
        .iter()
        .copied()
        .find(|fmt| available.contains(&(fmt.as_raw() as u32)))
        .or_else(|| {
            available
                .first()
                .map(|&raw| vk::Format::from_raw(raw as i32))
        })
        .unwrap_or(vk::Format::R8G8B8A8_UNORM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_preference_order() {
        let raw = |f: vk::Format| f.as_raw() as u32;
        assert_eq!(
            choose_swapchain_format(&[raw(vk::Format::B8G8R8A8_SRGB), raw(vk::Format::B8G8R8A8_UNORM)]),
            vk::Format::B8G8R8A8_UNORM
        );
        assert_eq!(
            choose_swapchain_format(&[raw(vk::Format::R16G16B16A16_SFLOAT)]),
            vk::Format::R16G16B16A16_SFLOAT
        );
        assert_eq!(choose_swapchain_format(&[]), vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn srgb_formats_are_flagged() {
        assert!(texture_format(vk::Format::R8G8B8A8_SRGB).is_srgb());
        assert!(!texture_format(vk::Format::B8G8R8A8_UNORM).is_srgb());
        assert!(matches!(
            texture_format(vk::Format::R16G16B16A16_SFLOAT),
            TextureFormat::Other(_)
        ));
    }

    #[test]
    fn pose_conversion_preserves_components() {
        let pose = Pose {
            orientation: Quat::from_rotation_y(0.5),
            position: Vec3::new(0.1, 1.6, -0.3),
        };
        assert_eq!(to_pose(to_xr_pose(pose)), pose);
    }

    #[test]
    fn unmodelled_states_are_ignored() {
        assert_eq!(session_state(xr::SessionState::UNKNOWN), None);
        assert_eq!(
            session_state(xr::SessionState::LOSS_PENDING),
            Some(SessionState::LossPending)
        );
    }
}
