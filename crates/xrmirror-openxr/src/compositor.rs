use std::ptr;
use std::time::Duration;

use ash::vk;
use openxr as xr;
use tracing::{debug, info, trace};

use xrmirror_core::{
    BlendMode, Compositor, CompositorEvent, FrameState, ImageChain, ImageWait, Pose,
    ProjectionLayer, ReferenceSpaceKind, SwapchainAllocation, SwapchainCreateInfo, Time, View,
    ViewConfiguration, ViewDescriptor, XrError, XrResult,
};

use crate::convert::{
    blend_mode, choose_swapchain_format, decode_event, reference_space_type, texture_format,
    to_descriptor, to_time, to_view, to_xr_fov, to_xr_pose, to_xr_time, view_configuration_type,
};
use crate::vulkan::{VulkanDevice, VulkanTexture};

fn check(call: &'static str, result: xr::sys::Result) -> XrResult<xr::sys::Result> {
    if result.into_raw() < 0 {
        Err(XrError::compositor(call, result))
    } else {
        Ok(result)
    }
}

pub struct OpenXrSwapchain {
    handle: xr::Swapchain<xr::Vulkan>,
    instance: xr::Instance,
}

impl OpenXrSwapchain {
    pub fn handle(&self) -> &xr::Swapchain<xr::Vulkan> {
        &self.handle
    }
}

impl ImageChain for OpenXrSwapchain {
    fn acquire_image(&mut self) -> XrResult<u32> {
        self.handle
            .acquire_image()
            .map_err(|e| XrError::compositor("xrAcquireSwapchainImage", e))
    }

    // Called through the raw entry point: the safe wrapper folds
    // XR_TIMEOUT_EXPIRED into success.
    fn wait_image(&mut self, timeout: Option<Duration>) -> XrResult<ImageWait> {
        let timeout = timeout.map_or(xr::Duration::INFINITE, |d| {
            xr::Duration::from_nanos(i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        });
        let info = xr::sys::SwapchainImageWaitInfo {
            ty: xr::sys::StructureType::SWAPCHAIN_IMAGE_WAIT_INFO,
            next: ptr::null(),
            timeout,
        };
        let result =
            unsafe { (self.instance.fp().wait_swapchain_image)(self.handle.as_raw(), &info) };
        if result == xr::sys::Result::TIMEOUT_EXPIRED {
            return Ok(ImageWait::TimedOut);
        }
        check("xrWaitSwapchainImage", result)?;
        Ok(ImageWait::Ready)
    }

    fn release_image(&mut self) -> XrResult<()> {
        self.handle
            .release_image()
            .map_err(|e| XrError::compositor("xrReleaseSwapchainImage", e))
    }
}

/// OpenXR session with the Vulkan graphics binding.
pub struct OpenXrCompositor {
    frame_stream: xr::FrameStream<xr::Vulkan>,
    frame_waiter: xr::FrameWaiter,
    session: xr::Session<xr::Vulkan>,
    event_buffer: xr::EventDataBuffer,
    system: xr::SystemId,
    instance: xr::Instance,
    runtime_name: String,
    swapchain_format: Option<vk::Format>,
}

impl OpenXrCompositor {
    pub(crate) fn new(
        instance: xr::Instance,
        system: xr::SystemId,
        session: xr::Session<xr::Vulkan>,
        frame_waiter: xr::FrameWaiter,
        frame_stream: xr::FrameStream<xr::Vulkan>,
        runtime_name: String,
    ) -> Self {
        Self {
            frame_stream,
            frame_waiter,
            session,
            event_buffer: xr::EventDataBuffer::new(),
            system,
            instance,
            runtime_name,
            swapchain_format: None,
        }
    }

    pub fn instance(&self) -> &xr::Instance {
        &self.instance
    }

    pub fn session(&self) -> &xr::Session<xr::Vulkan> {
        &self.session
    }

    pub fn runtime_name(&self) -> &str {
        &self.runtime_name
    }

    fn negotiate_format(&mut self) -> XrResult<vk::Format> {
        if let Some(format) = self.swapchain_format {
            return Ok(format);
        }
        let available = self
            .session
            .enumerate_swapchain_formats()
            .map_err(|e| XrError::compositor("xrEnumerateSwapchainFormats", e))?;
        let format = choose_swapchain_format(&available);
        let gamma = if texture_format(format).is_srgb() {
            "sRGB (runtime gamma conversion)"
        } else {
            "linear UNORM (passthrough)"
        };
        info!(
            "swapchain format: runtime='{}' selected={format:?} (0x{:X}) gamma_mode={gamma} available={available:?}",
            self.runtime_name,
            format.as_raw()
        );
        self.swapchain_format = Some(format);
        Ok(format)
    }
}

impl Compositor<VulkanDevice> for OpenXrCompositor {
    type Swapchain = OpenXrSwapchain;
    type Space = xr::Space;

    fn begin_session(&mut self, configuration: ViewConfiguration) -> XrResult<()> {
        self.session
            .begin(view_configuration_type(configuration))
            .map(|_| ())
            .map_err(|e| XrError::compositor("xrBeginSession", e))
    }

    fn end_session(&mut self) -> XrResult<()> {
        self.session
            .end()
            .map(|_| ())
            .map_err(|e| XrError::compositor("xrEndSession", e))
    }

    fn request_exit(&mut self) -> XrResult<()> {
        self.session
            .request_exit()
            .map_err(|e| XrError::compositor("xrRequestExitSession", e))
    }

    fn poll_event(&mut self) -> XrResult<Option<CompositorEvent>> {
        let event = self
            .instance
            .poll_event(&mut self.event_buffer)
            .map_err(|e| XrError::compositor("xrPollEvent", e))?;
        Ok(event.as_ref().map(decode_event))
    }

    fn enumerate_views(
        &mut self,
        configuration: ViewConfiguration,
        out: Option<&mut [ViewDescriptor]>,
    ) -> XrResult<usize> {
        let ty = view_configuration_type(configuration);
        let enumerate = self.instance.fp().enumerate_view_configuration_views;
        let mut count = 0u32;

        let Some(out) = out else {
            let result = unsafe {
                enumerate(
                    self.instance.as_raw(),
                    self.system,
                    ty,
                    0,
                    &mut count,
                    ptr::null_mut(),
                )
            };
            check("xrEnumerateViewConfigurationViews", result)?;
            return Ok(count as usize);
        };

        let blank = xr::sys::ViewConfigurationView {
            ty: xr::sys::StructureType::VIEW_CONFIGURATION_VIEW,
            next: ptr::null_mut(),
            recommended_image_rect_width: 0,
            max_image_rect_width: 0,
            recommended_image_rect_height: 0,
            max_image_rect_height: 0,
            recommended_swapchain_sample_count: 0,
            max_swapchain_sample_count: 0,
        };
        let mut raw = vec![blank; out.len()];
        let result = unsafe {
            enumerate(
                self.instance.as_raw(),
                self.system,
                ty,
                raw.len() as u32,
                &mut count,
                raw.as_mut_ptr(),
            )
        };
        check("xrEnumerateViewConfigurationViews", result)?;

        let written = (count as usize).min(out.len());
        for (slot, view) in out.iter_mut().zip(&raw[..written]) {
            *slot = to_descriptor(view);
        }
        Ok(written)
    }

    fn create_reference_space(
        &mut self,
        kind: ReferenceSpaceKind,
        anchor: Pose,
    ) -> XrResult<xr::Space> {
        self.session
            .create_reference_space(reference_space_type(kind), to_xr_pose(anchor))
            .map_err(|e| XrError::compositor("xrCreateReferenceSpace", e))
    }

    fn create_swapchain(
        &mut self,
        device: &mut VulkanDevice,
        info: &SwapchainCreateInfo,
    ) -> XrResult<SwapchainAllocation<OpenXrSwapchain, VulkanTexture>> {
        let format = self.negotiate_format()?;
        let usage_flags = if info.color_attachment {
            xr::SwapchainUsageFlags::COLOR_ATTACHMENT
        } else {
            xr::SwapchainUsageFlags::SAMPLED
        };
        let create_info = xr::SwapchainCreateInfo {
            create_flags: xr::SwapchainCreateFlags::EMPTY,
            usage_flags,
            format: format.as_raw() as u32,
            sample_count: info.sample_count,
            width: info.extent.width,
            height: info.extent.height,
            face_count: info.face_count,
            array_size: info.array_size,
            mip_count: info.mip_count,
        };
        let handle = self
            .session
            .create_swapchain(&create_info)
            .map_err(|e| XrError::compositor("xrCreateSwapchain", e))?;
        let images = handle
            .enumerate_images()
            .map_err(|e| XrError::compositor("xrEnumerateSwapchainImages", e))?;
        debug!(
            "OpenXR swapchain with {} image(s) at {}x{}",
            images.len(),
            info.extent.width,
            info.extent.height
        );
        let textures = device.wrap_swapchain_images(&images, format, info.extent)?;

        Ok(SwapchainAllocation {
            chain: OpenXrSwapchain {
                handle,
                instance: self.instance.clone(),
            },
            format: texture_format(format),
            textures,
        })
    }

    fn wait_frame(&mut self) -> XrResult<FrameState> {
        let state = self
            .frame_waiter
            .wait()
            .map_err(|e| XrError::compositor("xrWaitFrame", e))?;
        Ok(FrameState {
            predicted_display_time: to_time(state.predicted_display_time),
            predicted_display_period: Duration::from_nanos(
                u64::try_from(state.predicted_display_period.as_nanos()).unwrap_or(0),
            ),
            should_render: state.should_render,
        })
    }

    fn begin_frame(&mut self) -> XrResult<()> {
        self.frame_stream
            .begin()
            .map(|_| ())
            .map_err(|e| XrError::compositor("xrBeginFrame", e))
    }

    fn locate_views(
        &mut self,
        configuration: ViewConfiguration,
        time: Time,
        space: &xr::Space,
        out: &mut [View],
    ) -> XrResult<usize> {
        let (flags, views) = self
            .session
            .locate_views(view_configuration_type(configuration), to_xr_time(time), space)
            .map_err(|e| XrError::compositor("xrLocateViews", e))?;
        if !flags.contains(xr::ViewStateFlags::ORIENTATION_VALID) {
            trace!("located views without a valid orientation");
        }
        for (slot, view) in out.iter_mut().zip(&views) {
            *slot = to_view(view);
        }
        Ok(views.len())
    }

    fn end_frame(
        &mut self,
        time: Time,
        blend: BlendMode,
        layer: Option<ProjectionLayer<'_, OpenXrSwapchain, xr::Space>>,
    ) -> XrResult<()> {
        let time = to_xr_time(time);
        let blend = blend_mode(blend);
        let Some(layer) = layer else {
            return self
                .frame_stream
                .end(time, blend, &[])
                .map_err(|e| XrError::compositor("xrEndFrame", e));
        };

        let views: Vec<xr::CompositionLayerProjectionView<xr::Vulkan>> = layer
            .views
            .iter()
            .map(|view| {
                let sub_image = unsafe {
                    xr::SwapchainSubImage::from_raw(xr::sys::SwapchainSubImage {
                        swapchain: view.swapchain.handle.as_raw(),
                        image_rect: xr::Rect2Di {
                            offset: xr::Offset2Di { x: 0, y: 0 },
                            extent: xr::Extent2Di {
                                width: view.extent.width as i32,
                                height: view.extent.height as i32,
                            },
                        },
                        image_array_index: view.image_array_index,
                    })
                };
                xr::CompositionLayerProjectionView::new()
                    .pose(to_xr_pose(view.pose))
                    .fov(to_xr_fov(view.fov))
                    .sub_image(sub_image)
            })
            .collect();
        let projection = xr::CompositionLayerProjection::new()
            .space(layer.space)
            .views(&views);
        let layers: [&xr::CompositionLayerBase<xr::Vulkan>; 1] = [&projection];
        self.frame_stream
            .end(time, blend, &layers)
            .map_err(|e| XrError::compositor("xrEndFrame", e))
    }
}
