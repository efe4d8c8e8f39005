//! Vulkan device sized to the OpenXR runtime's graphics requirements.
//!
//! Eye textures wrap images owned by OpenXR swapchains. The desktop mirror is an
//! offscreen image owned by the device, since window presentation is left to
//! the embedding application.

use std::collections::HashMap;
use std::ffi::{c_char, CString};
use std::sync::Arc;

use ash::vk::{self, Handle};
use ash::Entry as VkEntry;
use openxr as xr;
use tracing::{debug, info, warn};

use xrmirror_core::{
    ColorTarget, Extent2D, GpuDevice, LoadOp, StoreOp, TextureFormat, WindowTexture, XrError,
    XrResult,
};

use crate::convert::texture_format;

const FRAMES_IN_FLIGHT: usize = 3;
const FENCE_WAIT_TIMEOUT_NS: u64 = 1_000_000_000;
const MIRROR_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Instance and device, destroyed once the last texture or device handle goes.
struct Shared {
    _entry: VkEntry,
    instance: ash::Instance,
    device: ash::Device,
}

impl Drop for Shared {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

struct TextureInner {
    shared: Arc<Shared>,
    image: vk::Image,
    /// Set only for images this device allocated itself.
    memory: Option<vk::DeviceMemory>,
    view: vk::ImageView,
    framebuffer: vk::Framebuffer,
    format: vk::Format,
    extent: Extent2D,
}

impl Drop for TextureInner {
    fn drop(&mut self) {
        let device = &self.shared.device;
        unsafe {
            device.destroy_framebuffer(self.framebuffer, None);
            device.destroy_image_view(self.view, None);
            if let Some(memory) = self.memory {
                device.destroy_image(self.image, None);
                device.free_memory(memory, None);
            }
        }
    }
}

/// Color-attachment-ready image with its view and framebuffer.
#[derive(Clone)]
pub struct VulkanTexture {
    inner: Arc<TextureInner>,
}

impl VulkanTexture {
    pub fn image(&self) -> vk::Image {
        self.inner.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.inner.view
    }

    pub fn format(&self) -> vk::Format {
        self.inner.format
    }

    pub fn extent(&self) -> Extent2D {
        self.inner.extent
    }
}

pub struct VulkanCommandBuffer {
    buffer: vk::CommandBuffer,
    slot: usize,
    in_pass: bool,
}

impl VulkanCommandBuffer {
    /// Raw handle for recording draw commands inside a pass.
    pub fn raw(&self) -> vk::CommandBuffer {
        self.buffer
    }
}

struct FrameSlot {
    buffer: vk::CommandBuffer,
    fence: vk::Fence,
    in_flight: bool,
    /// Begun but neither submitted nor discarded.
    recording: bool,
}

pub struct VulkanDevice {
    // The mirror holds a reference to `shared`; it goes first.
    mirror: Option<VulkanTexture>,
    render_passes: HashMap<(vk::Format, LoadOp, StoreOp), vk::RenderPass>,
    slots: Vec<FrameSlot>,
    next_slot: usize,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    queue_family_index: u32,
    physical_device: vk::PhysicalDevice,
    shared: Arc<Shared>,
}

impl VulkanDevice {
    pub fn new(
        xr_instance: &xr::Instance,
        system: xr::SystemId,
        application_name: &str,
        mirror_extent: Extent2D,
    ) -> XrResult<Self> {
        let entry = unsafe { VkEntry::load() }
            .map_err(|e| XrError::Unavailable(format!("Vulkan loader: {e}")))?;

        let reqs = xr_instance
            .graphics_requirements::<xr::Vulkan>(system)
            .map_err(|e| XrError::compositor("xrGetVulkanGraphicsRequirementsKHR", e))?;
        let api_version = vk::make_api_version(
            0,
            reqs.min_api_version_supported.major() as u32,
            reqs.min_api_version_supported.minor() as u32,
            reqs.min_api_version_supported.patch(),
        );

        let instance_exts = xr_instance
            .vulkan_legacy_instance_extensions(system)
            .map_err(|e| XrError::compositor("xrGetVulkanInstanceExtensionsKHR", e))?;
        let instance_exts = parse_extension_list(&instance_exts)?;
        let instance_ext_ptrs: Vec<*const c_char> =
            instance_exts.iter().map(|s| s.as_ptr()).collect();

        let device_exts = xr_instance
            .vulkan_legacy_device_extensions(system)
            .map_err(|e| XrError::compositor("xrGetVulkanDeviceExtensionsKHR", e))?;
        let device_exts = parse_extension_list(&device_exts)?;
        let device_ext_ptrs: Vec<*const c_char> = device_exts.iter().map(|s| s.as_ptr()).collect();

        let app_name = CString::new(application_name)
            .map_err(|e| XrError::config(format!("application name: {e}")))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .engine_name(&app_name)
            .api_version(api_version);
        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&instance_ext_ptrs);
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| XrError::gpu(format!("vkCreateInstance: {e}")))?;

        let physical_device = unsafe {
            xr_instance.vulkan_graphics_device(system, instance.handle().as_raw() as *const _)
        };
        let physical_device = match physical_device {
            Ok(raw) => vk::PhysicalDevice::from_raw(raw as u64),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(XrError::compositor("xrGetVulkanGraphicsDeviceKHR", e));
            }
        };

        let queue_family_index = match find_graphics_queue_family(&instance, physical_device) {
            Ok(index) => index,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        let priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities);
        let device_create = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&device_ext_ptrs);
        let device = match unsafe { instance.create_device(physical_device, &device_create, None) }
        {
            Ok(device) => device,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(XrError::gpu(format!("vkCreateDevice: {e}")));
            }
        };
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let shared = Arc::new(Shared {
            _entry: entry,
            instance,
            device,
        });

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { shared.device.create_command_pool(&pool_info, None) }
            .map_err(|e| XrError::gpu(format!("vkCreateCommandPool: {e}")))?;

        let mut this = Self {
            mirror: None,
            render_passes: HashMap::new(),
            slots: Vec::with_capacity(FRAMES_IN_FLIGHT),
            next_slot: 0,
            command_pool,
            queue,
            queue_family_index,
            physical_device,
            shared,
        };
        this.allocate_slots()?;
        if !mirror_extent.is_empty() {
            this.mirror = Some(this.create_mirror(mirror_extent)?);
        }

        info!(
            "Vulkan device ready: api {}.{}.{}, queue family {queue_family_index}, mirror {}x{}",
            vk::api_version_major(api_version),
            vk::api_version_minor(api_version),
            vk::api_version_patch(api_version),
            mirror_extent.width,
            mirror_extent.height
        );
        Ok(this)
    }

    fn allocate_slots(&mut self) -> XrResult<()> {
        let device = &self.shared.device;
        let alloc = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(FRAMES_IN_FLIGHT as u32);
        let buffers = unsafe { device.allocate_command_buffers(&alloc) }
            .map_err(|e| XrError::gpu(format!("vkAllocateCommandBuffers: {e}")))?;
        for buffer in buffers {
            let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::builder(), None) }
                .map_err(|e| XrError::gpu(format!("vkCreateFence: {e}")))?;
            self.slots.push(FrameSlot {
                buffer,
                fence,
                in_flight: false,
                recording: false,
            });
        }
        Ok(())
    }

    /// Raw handles for `xrCreateSession` with the Vulkan graphics binding.
    pub fn session_create_info(&self) -> xr::vulkan::SessionCreateInfo {
        xr::vulkan::SessionCreateInfo {
            instance: self.shared.instance.handle().as_raw() as *const _,
            physical_device: self.physical_device.as_raw() as *const _,
            device: self.shared.device.handle().as_raw() as *const _,
            queue_family_index: self.queue_family_index,
            queue_index: 0,
        }
    }

    /// Wraps images owned by a compositor swapchain as render targets.
    pub fn wrap_swapchain_images(
        &mut self,
        images: &[u64],
        format: vk::Format,
        extent: Extent2D,
    ) -> XrResult<Vec<VulkanTexture>> {
        images
            .iter()
            .map(|&raw| self.wrap_image(vk::Image::from_raw(raw), None, format, extent))
            .collect()
    }

    /// The offscreen mirror image, if one was configured.
    pub fn mirror(&self) -> Option<&VulkanTexture> {
        self.mirror.as_ref()
    }

    fn wrap_image(
        &mut self,
        image: vk::Image,
        memory: Option<vk::DeviceMemory>,
        format: vk::Format,
        extent: Extent2D,
    ) -> XrResult<VulkanTexture> {
        let render_pass = self.render_pass(format, LoadOp::Clear, StoreOp::Store)?;
        let device = &self.shared.device;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(color_subresource_range());
        let view = unsafe { device.create_image_view(&view_info, None) }
            .map_err(|e| XrError::gpu(format!("vkCreateImageView: {e}")))?;

        let attachments = [view];
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let framebuffer = match unsafe { device.create_framebuffer(&framebuffer_info, None) } {
            Ok(framebuffer) => framebuffer,
            Err(e) => {
                unsafe { device.destroy_image_view(view, None) };
                return Err(XrError::gpu(format!("vkCreateFramebuffer: {e}")));
            }
        };

        Ok(VulkanTexture {
            inner: Arc::new(TextureInner {
                shared: self.shared.clone(),
                image,
                memory,
                view,
                framebuffer,
                format,
                extent,
            }),
        })
    }

    fn create_mirror(&mut self, extent: Extent2D) -> XrResult<VulkanTexture> {
        let device = &self.shared.device;
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(MIRROR_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { device.create_image(&image_info, None) }
            .map_err(|e| XrError::gpu(format!("vkCreateImage (mirror): {e}")))?;

        let req = unsafe { device.get_image_memory_requirements(image) };
        let memory_type_index = find_memory_type(
            &self.shared.instance,
            self.physical_device,
            req.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        let Some(memory_type_index) = memory_type_index else {
            unsafe { device.destroy_image(image, None) };
            return Err(XrError::gpu("no device-local memory type for the mirror"));
        };
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(req.size)
            .memory_type_index(memory_type_index);
        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(XrError::gpu(format!("vkAllocateMemory (mirror): {e}")));
            }
        };
        if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
            unsafe {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
            }
            return Err(XrError::gpu(format!("vkBindImageMemory (mirror): {e}")));
        }

        self.wrap_image(image, Some(memory), MIRROR_FORMAT, extent)
    }

    fn render_pass(
        &mut self,
        format: vk::Format,
        load_op: LoadOp,
        store_op: StoreOp,
    ) -> XrResult<vk::RenderPass> {
        if let Some(&pass) = self.render_passes.get(&(format, load_op, store_op)) {
            return Ok(pass);
        }

        let (vk_load, initial_layout) = match load_op {
            LoadOp::Clear => (vk::AttachmentLoadOp::CLEAR, vk::ImageLayout::UNDEFINED),
            LoadOp::Load => (
                vk::AttachmentLoadOp::LOAD,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ),
        };
        let vk_store = match store_op {
            StoreOp::Store => vk::AttachmentStoreOp::STORE,
            StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
        };
        // OpenXR expects released images in COLOR_ATTACHMENT_OPTIMAL.
        let attachment = vk::AttachmentDescription::builder()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk_load)
            .store_op(vk_store)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(initial_layout)
            .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let color_ref = vk::AttachmentReference::builder()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(std::slice::from_ref(&color_ref));
        let info = vk::RenderPassCreateInfo::builder()
            .attachments(std::slice::from_ref(&attachment))
            .subpasses(std::slice::from_ref(&subpass));

        let pass = unsafe { self.shared.device.create_render_pass(&info, None) }
            .map_err(|e| XrError::gpu(format!("vkCreateRenderPass: {e}")))?;
        debug!("render pass created for {format:?} {load_op:?}/{store_op:?}");
        self.render_passes.insert((format, load_op, store_op), pass);
        Ok(pass)
    }

    pub fn device(&self) -> &ash::Device {
        &self.shared.device
    }
}

impl GpuDevice for VulkanDevice {
    type Texture = VulkanTexture;
    type CommandBuffer = VulkanCommandBuffer;

    fn acquire_command_buffer(&mut self) -> XrResult<VulkanCommandBuffer> {
        let index = self.next_slot;
        let device = &self.shared.device;
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| XrError::gpu("no command buffer slots"))?;

        if slot.in_flight {
            unsafe { device.wait_for_fences(&[slot.fence], true, FENCE_WAIT_TIMEOUT_NS) }
                .map_err(|e| XrError::gpu(format!("vkWaitForFences: {e}")))?;
            slot.in_flight = false;
        }
        if slot.recording {
            warn!("command buffer slot {index} was left recording; resetting");
            unsafe {
                device.reset_command_buffer(slot.buffer, vk::CommandBufferResetFlags::empty())
            }
            .map_err(|e| XrError::gpu(format!("vkResetCommandBuffer: {e}")))?;
            slot.recording = false;
        }

        let begin = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(slot.buffer, &begin) }
            .map_err(|e| XrError::gpu(format!("vkBeginCommandBuffer: {e}")))?;
        slot.recording = true;

        let buffer = slot.buffer;
        self.next_slot = (index + 1) % self.slots.len();
        Ok(VulkanCommandBuffer {
            buffer,
            slot: index,
            in_pass: false,
        })
    }

    fn begin_render_pass(
        &mut self,
        cmd: &mut VulkanCommandBuffer,
        target: &ColorTarget<'_, VulkanTexture>,
    ) -> XrResult<()> {
        if cmd.in_pass {
            return Err(XrError::gpu("render pass already open"));
        }
        let texture = &target.texture.inner;
        let render_pass = self.render_pass(texture.format, target.load_op, target.store_op)?;
        let extent = vk::Extent2D {
            width: target.extent.width,
            height: target.extent.height,
        };
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: target.clear_color,
            },
        }];
        let begin = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(texture.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        let device = &self.shared.device;
        unsafe {
            device.cmd_begin_render_pass(cmd.buffer, &begin, vk::SubpassContents::INLINE);
            device.cmd_set_viewport(cmd.buffer, 0, &[viewport]);
            device.cmd_set_scissor(cmd.buffer, 0, &[scissor]);
        }
        cmd.in_pass = true;
        Ok(())
    }

    fn end_render_pass(&mut self, cmd: &mut VulkanCommandBuffer) -> XrResult<()> {
        if !cmd.in_pass {
            return Err(XrError::gpu("no render pass open"));
        }
        unsafe { self.shared.device.cmd_end_render_pass(cmd.buffer) };
        cmd.in_pass = false;
        Ok(())
    }

    fn acquire_window_texture(
        &mut self,
        _cmd: &mut VulkanCommandBuffer,
    ) -> XrResult<Option<WindowTexture<VulkanTexture>>> {
        Ok(self.mirror.as_ref().map(|mirror| WindowTexture {
            texture: mirror.clone(),
            extent: mirror.extent(),
            format: texture_format(mirror.format()),
        }))
    }

    fn submit(&mut self, cmd: VulkanCommandBuffer) -> XrResult<()> {
        if cmd.in_pass {
            let err = XrError::gpu("submitted with an open render pass");
            self.discard(cmd);
            return Err(err);
        }
        let device = &self.shared.device;
        let slot = self
            .slots
            .get_mut(cmd.slot)
            .ok_or_else(|| XrError::gpu(format!("unknown command buffer slot {}", cmd.slot)))?;

        // Any failure below leaves the buffer for the next acquire to reset.
        unsafe { device.end_command_buffer(cmd.buffer) }
            .map_err(|e| XrError::gpu(format!("vkEndCommandBuffer: {e}")))?;
        slot.recording = false;
        unsafe { device.reset_fences(&[slot.fence]) }
            .map_err(|e| XrError::gpu(format!("vkResetFences: {e}")))?;
        let buffers = [cmd.buffer];
        let submit = vk::SubmitInfo::builder().command_buffers(&buffers);
        unsafe { device.queue_submit(self.queue, &[submit.build()], slot.fence) }
            .map_err(|e| XrError::gpu(format!("vkQueueSubmit: {e}")))?;
        slot.in_flight = true;
        Ok(())
    }

    fn discard(&mut self, cmd: VulkanCommandBuffer) {
        let device = &self.shared.device;
        let Some(slot) = self.slots.get_mut(cmd.slot) else {
            warn!("discarding unknown command buffer slot {}", cmd.slot);
            return;
        };
        unsafe {
            if cmd.in_pass {
                device.cmd_end_render_pass(cmd.buffer);
            }
            if let Err(e) = device.end_command_buffer(cmd.buffer) {
                debug!("vkEndCommandBuffer on discard: {e}");
            }
            match device.reset_command_buffer(cmd.buffer, vk::CommandBufferResetFlags::empty()) {
                Ok(()) => slot.recording = false,
                Err(e) => warn!("vkResetCommandBuffer on discard: {e}"),
            }
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let device = &self.shared.device;
        unsafe {
            let _ = device.device_wait_idle();
            for slot in self.slots.drain(..) {
                device.destroy_fence(slot.fence, None);
            }
            for (_, pass) in self.render_passes.drain() {
                device.destroy_render_pass(pass, None);
            }
            device.destroy_command_pool(self.command_pool, None);
        }
        self.mirror = None;
    }
}

/// Mirror texture format as seen by the render callback.
pub fn mirror_format() -> TextureFormat {
    texture_format(MIRROR_FORMAT)
}

fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn parse_extension_list(list: &str) -> XrResult<Vec<CString>> {
    list.split_whitespace()
        .map(|s| CString::new(s).map_err(|e| XrError::gpu(format!("extension name: {e}"))))
        .collect()
}

fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> XrResult<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|idx| idx as u32)
        .ok_or_else(|| XrError::Unavailable("no Vulkan graphics queue family".to_string()))
}

fn find_memory_type(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let mem = unsafe { instance.get_physical_device_memory_properties(physical_device) };
    (0..mem.memory_type_count).find(|&i| {
        (type_bits & (1 << i)) != 0
            && mem.memory_types[i as usize]
                .property_flags
                .contains(properties)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_list_splits_on_whitespace() {
        let exts = parse_extension_list("VK_KHR_a  VK_KHR_b\tVK_EXT_c ").unwrap();
        let names: Vec<_> = exts.iter().map(|s| s.to_str().unwrap()).collect();
        assert_eq!(names, ["VK_KHR_a", "VK_KHR_b", "VK_EXT_c"]);
        assert!(parse_extension_list("").unwrap().is_empty());
    }

    #[test]
    fn mirror_is_linear_rgba() {
        assert_eq!(mirror_format(), TextureFormat::Rgba8Unorm);
    }
}
