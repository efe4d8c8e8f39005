//! OpenXR runtime with a Vulkan device behind the `xrmirror-core` boundary traits.

use openxr as xr;
use tracing::{info, warn};

use xrmirror_core::{Extent2D, XrError, XrResult};

pub mod compositor;
pub mod convert;
pub mod vulkan;

pub use compositor::{OpenXrCompositor, OpenXrSwapchain};
pub use vulkan::{VulkanCommandBuffer, VulkanDevice, VulkanTexture};

#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub application_name: String,
    /// Offscreen mirror size; an empty extent disables the mirror target.
    pub mirror_extent: Extent2D,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            application_name: "xrmirror".to_string(),
            mirror_extent: Extent2D::new(1280, 720),
        }
    }
}

/// Loads the OpenXR runtime, creates a Vulkan device that satisfies its
/// requirements and opens a session on the head-mounted display.
pub fn connect(options: &BackendOptions) -> XrResult<(OpenXrCompositor, VulkanDevice)> {
    let entry = unsafe { xr::Entry::load() }
        .map_err(|e| XrError::Unavailable(format!("OpenXR loader: {e:?}")))?;
    let available = entry
        .enumerate_extensions()
        .map_err(|e| XrError::compositor("xrEnumerateInstanceExtensionProperties", e))?;
    if !available.khr_vulkan_enable {
        return Err(XrError::Unavailable(
            "OpenXR KHR_vulkan_enable not available".to_string(),
        ));
    }
    let mut extensions = xr::ExtensionSet::default();
    extensions.khr_vulkan_enable = true;

    let app_info = xr::ApplicationInfo {
        application_name: &options.application_name,
        application_version: 1,
        engine_name: &options.application_name,
        engine_version: 1,
        api_version: xr::Version::new(1, 0, 0),
    };
    let instance = entry
        .create_instance(&app_info, &extensions, &[])
        .map_err(|e| XrError::compositor("xrCreateInstance", e))?;

    let runtime_name = match instance.properties() {
        Ok(props) => {
            let version = props.runtime_version;
            info!(
                "OpenXR runtime: {} {}.{}.{}",
                props.runtime_name,
                version.major(),
                version.minor(),
                version.patch()
            );
            props.runtime_name
        }
        Err(e) => {
            warn!("OpenXR runtime properties unavailable: {e}");
            "unknown-runtime".to_string()
        }
    };

    let system = instance
        .system(xr::FormFactor::HEAD_MOUNTED_DISPLAY)
        .map_err(|e| match e {
            xr::sys::Result::ERROR_FORM_FACTOR_UNAVAILABLE => {
                XrError::Unavailable("no head-mounted display connected".to_string())
            }
            other => XrError::compositor("xrGetSystem", other),
        })?;
    match instance.system_properties(system) {
        Ok(props) => info!(
            "OpenXR system: '{}' vendor 0x{:X}, max swapchain {}x{}, max layers {}",
            props.system_name,
            props.vendor_id,
            props.graphics_properties.max_swapchain_image_width,
            props.graphics_properties.max_swapchain_image_height,
            props.graphics_properties.max_layer_count
        ),
        Err(e) => warn!("OpenXR system properties unavailable: {e}"),
    }

    let device = VulkanDevice::new(
        &instance,
        system,
        &options.application_name,
        options.mirror_extent,
    )?;
    let create_info = device.session_create_info();
    let (session, frame_waiter, frame_stream) = unsafe {
        instance
            .create_session::<xr::Vulkan>(system, &create_info)
            .map_err(|e| XrError::compositor("xrCreateSession", e))?
    };
    info!("OpenXR session created");

    let compositor = OpenXrCompositor::new(
        instance,
        system,
        session,
        frame_waiter,
        frame_stream,
        runtime_name,
    );
    Ok((compositor, device))
}
