//! Scriptable in-process compositor and GPU device.
//!
//! Both sides write into one shared [`MockLog`], so the relative order of
//! compositor and GPU calls can be inspected after a run. Used by the test
//! suites and by the headless run mode of the binary.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use glam::{Quat, Vec3};

use crate::compositor::{
    Compositor, CompositorEvent, ImageChain, ImageWait, ProjectionLayer, SwapchainAllocation,
    SwapchainCreateInfo,
};
use crate::gpu::{ColorTarget, GpuDevice, WindowTexture};
use crate::types::{
    BlendMode, Extent2D, Fov, FrameState, Pose, ReferenceSpaceKind, SessionState, TextureFormat,
    Time, View, ViewConfiguration, ViewDescriptor,
};
use crate::{XrError, XrResult};

/// Texture id handed out for the desktop window.
pub const WINDOW_TEXTURE_ID: u64 = u64::MAX;

const DEFAULT_CHAIN_DEPTH: u32 = 3;
const DEFAULT_PERIOD: Duration = Duration::from_nanos(11_111_111);
const EYE_OFFSET: f32 = 0.032;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerViewRecord {
    pub swapchain: u32,
    pub extent: Extent2D,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    BeginSession,
    EndSession,
    PollEvent,
    EnumerateViews { capacity: Option<usize>, count: usize },
    CreateSpace { space: u32 },
    DestroySpace { space: u32 },
    CreateSwapchain { swapchain: u32, extent: Extent2D },
    CreateSwapchainFailed { attempt: usize },
    DestroySwapchain { swapchain: u32 },
    WaitFrame,
    BeginFrame,
    LocateViews { reported: usize },
    AcquireImage { swapchain: u32, index: u32 },
    WaitImage { swapchain: u32, timed_out: bool },
    ReleaseImage { swapchain: u32 },
    EndFrame { layer: Option<Vec<LayerViewRecord>> },
    AcquireCommandBuffer { cmd: u32 },
    BeginRenderPass { cmd: u32, texture: u64 },
    EndRenderPass { cmd: u32 },
    AcquireWindowTexture,
    Submit { cmd: u32 },
    Discard { cmd: u32 },
    RequestExit,
}

/// Ordered record of every call made against the mock backend.
#[derive(Debug, Clone, Default)]
pub struct MockLog(Rc<RefCell<Vec<MockCall>>>);

impl MockLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, call: MockCall) {
        self.0.borrow_mut().push(call);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.0.borrow().clone()
    }

    pub fn count(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.0.borrow().iter().filter(|call| predicate(call)).count()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

fn injected(call: &'static str) -> XrError {
    XrError::compositor(call, "XR_ERROR_RUNTIME_FAILURE (injected)")
}

pub struct MockSwapchain {
    id: u32,
    log: MockLog,
    depth: u32,
    next_index: u32,
    timeouts_per_wait: u32,
    timeouts_left: u32,
}

impl MockSwapchain {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl ImageChain for MockSwapchain {
    fn acquire_image(&mut self) -> XrResult<u32> {
        let index = self.next_index;
        self.next_index = (self.next_index + 1) % self.depth;
        self.timeouts_left = self.timeouts_per_wait;
        self.log.push(MockCall::AcquireImage {
            swapchain: self.id,
            index,
        });
        Ok(index)
    }

    fn wait_image(&mut self, timeout: Option<Duration>) -> XrResult<ImageWait> {
        let timed_out = timeout.is_some() && self.timeouts_left > 0;
        if timed_out {
            self.timeouts_left -= 1;
        }
        self.log.push(MockCall::WaitImage {
            swapchain: self.id,
            timed_out,
        });
        Ok(if timed_out {
            ImageWait::TimedOut
        } else {
            ImageWait::Ready
        })
    }

    fn release_image(&mut self) -> XrResult<()> {
        self.log.push(MockCall::ReleaseImage { swapchain: self.id });
        Ok(())
    }
}

impl Drop for MockSwapchain {
    fn drop(&mut self) {
        self.log.push(MockCall::DestroySwapchain { swapchain: self.id });
    }
}

pub struct MockSpace {
    id: u32,
    log: MockLog,
    kind: ReferenceSpaceKind,
    anchor: Pose,
}

impl MockSpace {
    pub fn kind(&self) -> ReferenceSpaceKind {
        self.kind
    }

    pub fn anchor(&self) -> Pose {
        self.anchor
    }
}

impl Drop for MockSpace {
    fn drop(&mut self) {
        self.log.push(MockCall::DestroySpace { space: self.id });
    }
}

/// Compositor double driven by a queue of scripted events and frame states.
pub struct MockCompositor {
    log: MockLog,
    events: VecDeque<CompositorEvent>,
    descriptors: Vec<ViewDescriptor>,
    second_call_count: Option<usize>,
    frames: VecDeque<bool>,
    default_should_render: bool,
    located_count: Option<usize>,
    fail_swapchain_at: Option<usize>,
    failures: Vec<&'static str>,
    swapchain_attempts: usize,
    chain_depth: u32,
    textures_per_chain: Option<u32>,
    timeouts_per_wait: u32,
    session_running: bool,
    strict_end: bool,
    delivered_state: Option<SessionState>,
    next_id: u32,
    time: Time,
    period: Duration,
}

impl MockCompositor {
    pub fn new(log: MockLog) -> Self {
        Self {
            log,
            events: VecDeque::new(),
            descriptors: Vec::new(),
            second_call_count: None,
            frames: VecDeque::new(),
            default_should_render: true,
            located_count: None,
            fail_swapchain_at: None,
            failures: Vec::new(),
            swapchain_attempts: 0,
            chain_depth: DEFAULT_CHAIN_DEPTH,
            textures_per_chain: None,
            timeouts_per_wait: 0,
            session_running: false,
            strict_end: false,
            delivered_state: None,
            next_id: 1,
            time: Time::from_nanos(0),
            period: DEFAULT_PERIOD,
        }
    }

    /// Reports `count` identical views of `extent`.
    pub fn with_views(mut self, count: usize, extent: Extent2D) -> Self {
        self.set_views(count, extent);
        self
    }

    pub fn set_views(&mut self, count: usize, extent: Extent2D) {
        let descriptor = ViewDescriptor {
            recommended_width: extent.width,
            recommended_height: extent.height,
            max_width: extent.width * 2,
            max_height: extent.height * 2,
            recommended_sample_count: 1,
            max_sample_count: 4,
        };
        self.descriptors = vec![descriptor; count];
    }

    pub fn set_descriptors(&mut self, descriptors: Vec<ViewDescriptor>) {
        self.descriptors = descriptors;
    }

    pub fn push_event(&mut self, event: CompositorEvent) {
        self.events.push_back(event);
    }

    pub fn push_state(&mut self, state: SessionState) {
        self.push_event(CompositorEvent::StateChanged(state));
    }

    /// Queues the `should_render` value of upcoming frames.
    pub fn push_frame(&mut self, should_render: bool) {
        self.frames.push_back(should_render);
    }

    pub fn set_default_should_render(&mut self, should_render: bool) {
        self.default_should_render = should_render;
    }

    /// Overrides the count written by the second enumeration call.
    pub fn set_second_call_count(&mut self, count: usize) {
        self.second_call_count = Some(count);
    }

    /// Overrides how many views locate-views reports.
    pub fn set_located_count(&mut self, count: Option<usize>) {
        self.located_count = count;
    }

    /// Fails the swapchain creation attempt with this zero-based index.
    pub fn fail_swapchain_at(&mut self, attempt: usize) {
        self.fail_swapchain_at = Some(attempt);
    }

    /// Fails the next call to the named entry point, e.g. `"xrEndFrame"`.
    pub fn fail_next(&mut self, call: &'static str) {
        self.failures.push(call);
    }

    pub fn set_chain_depth(&mut self, depth: u32) {
        self.chain_depth = depth.max(1);
    }

    /// Backs new chains with `count` textures instead of one per image, so the
    /// compositor can hand out indices with no texture behind them.
    pub fn set_textures_per_chain(&mut self, count: Option<u32>) {
        self.textures_per_chain = count;
    }

    /// Makes every bounded image wait expire `count` times before succeeding.
    pub fn set_timeouts_per_wait(&mut self, count: u32) {
        self.timeouts_per_wait = count;
    }

    /// Rejects end-session unless STOPPING was the last state handed out, as
    /// OpenXR runtimes do.
    pub fn set_strict_end_session(&mut self, strict: bool) {
        self.strict_end = strict;
    }

    pub fn session_running(&self) -> bool {
        self.session_running
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn log(&self) -> &MockLog {
        &self.log
    }

    fn check(&mut self, call: &'static str) -> XrResult<()> {
        match self.failures.iter().position(|name| *name == call) {
            Some(pos) => {
                self.failures.remove(pos);
                Err(injected(call))
            }
            None => Ok(()),
        }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Compositor<MockGpu> for MockCompositor {
    type Swapchain = MockSwapchain;
    type Space = MockSpace;

    fn begin_session(&mut self, _configuration: ViewConfiguration) -> XrResult<()> {
        self.check("xrBeginSession")?;
        self.log.push(MockCall::BeginSession);
        if self.session_running {
            return Err(XrError::compositor(
                "xrBeginSession",
                "XR_ERROR_SESSION_RUNNING",
            ));
        }
        self.session_running = true;
        Ok(())
    }

    fn end_session(&mut self) -> XrResult<()> {
        self.check("xrEndSession")?;
        self.log.push(MockCall::EndSession);
        if !self.session_running {
            return Err(XrError::compositor(
                "xrEndSession",
                "XR_ERROR_SESSION_NOT_RUNNING",
            ));
        }
        if self.strict_end && self.delivered_state != Some(SessionState::Stopping) {
            return Err(XrError::compositor(
                "xrEndSession",
                "XR_ERROR_SESSION_NOT_STOPPING",
            ));
        }
        self.session_running = false;
        Ok(())
    }

    /// Queues the STOPPING, IDLE, EXITING sequence a runtime would emit.
    fn request_exit(&mut self) -> XrResult<()> {
        self.check("xrRequestExitSession")?;
        self.log.push(MockCall::RequestExit);
        if !self.session_running {
            return Err(XrError::compositor(
                "xrRequestExitSession",
                "XR_ERROR_SESSION_NOT_RUNNING",
            ));
        }
        for state in [SessionState::Stopping, SessionState::Idle, SessionState::Exiting] {
            self.push_state(state);
        }
        Ok(())
    }

    fn poll_event(&mut self) -> XrResult<Option<CompositorEvent>> {
        self.check("xrPollEvent")?;
        self.log.push(MockCall::PollEvent);
        let event = self.events.pop_front();
        if let Some(CompositorEvent::StateChanged(state)) = event {
            self.delivered_state = Some(state);
        }
        Ok(event)
    }

    fn enumerate_views(
        &mut self,
        _configuration: ViewConfiguration,
        out: Option<&mut [ViewDescriptor]>,
    ) -> XrResult<usize> {
        self.check("xrEnumerateViewConfigurationViews")?;
        let capacity = out.as_ref().map(|out| out.len());
        let count = match out {
            None => self.descriptors.len(),
            Some(out) => {
                let available = self.second_call_count.unwrap_or(self.descriptors.len());
                let count = available.min(out.len());
                for (slot, i) in out.iter_mut().zip(0..count) {
                    *slot = self.descriptors.get(i).copied().unwrap_or_default();
                }
                count
            }
        };
        self.log.push(MockCall::EnumerateViews { capacity, count });
        Ok(count)
    }

    fn create_reference_space(
        &mut self,
        kind: ReferenceSpaceKind,
        anchor: Pose,
    ) -> XrResult<MockSpace> {
        self.check("xrCreateReferenceSpace")?;
        let id = self.next_id();
        self.log.push(MockCall::CreateSpace { space: id });
        Ok(MockSpace {
            id,
            log: self.log.clone(),
            kind,
            anchor,
        })
    }

    fn create_swapchain(
        &mut self,
        device: &mut MockGpu,
        info: &SwapchainCreateInfo,
    ) -> XrResult<SwapchainAllocation<MockSwapchain, MockTexture>> {
        let attempt = self.swapchain_attempts;
        self.swapchain_attempts += 1;
        if self.fail_swapchain_at == Some(attempt) {
            self.log.push(MockCall::CreateSwapchainFailed { attempt });
            return Err(XrError::compositor(
                "xrCreateSwapchain",
                "XR_ERROR_OUT_OF_MEMORY (injected)",
            ));
        }
        self.check("xrCreateSwapchain")?;

        let id = self.next_id();
        self.log.push(MockCall::CreateSwapchain {
            swapchain: id,
            extent: info.extent,
        });
        let textures = (0..self.textures_per_chain.unwrap_or(self.chain_depth))
            .map(|_| device.create_texture())
            .collect();
        Ok(SwapchainAllocation {
            chain: MockSwapchain {
                id,
                log: self.log.clone(),
                depth: self.chain_depth,
                next_index: 0,
                timeouts_per_wait: self.timeouts_per_wait,
                timeouts_left: 0,
            },
            format: TextureFormat::Rgba8Srgb,
            textures,
        })
    }

    fn wait_frame(&mut self) -> XrResult<FrameState> {
        self.check("xrWaitFrame")?;
        self.log.push(MockCall::WaitFrame);
        self.time = Time::from_nanos(self.time.as_nanos() + self.period.as_nanos() as i64);
        let should_render = self
            .frames
            .pop_front()
            .unwrap_or(self.default_should_render);
        Ok(FrameState {
            predicted_display_time: self.time,
            predicted_display_period: self.period,
            should_render,
        })
    }

    fn begin_frame(&mut self) -> XrResult<()> {
        self.check("xrBeginFrame")?;
        self.log.push(MockCall::BeginFrame);
        Ok(())
    }

    fn locate_views(
        &mut self,
        _configuration: ViewConfiguration,
        _time: Time,
        _space: &MockSpace,
        out: &mut [View],
    ) -> XrResult<usize> {
        self.check("xrLocateViews")?;
        let reported = self.located_count.unwrap_or(out.len());
        for (i, view) in out.iter_mut().take(reported).enumerate() {
            let side = if i % 2 == 0 { -1.0 } else { 1.0 };
            *view = View {
                pose: Pose {
                    orientation: Quat::from_rotation_y(0.01 * i as f32),
                    position: Vec3::new(side * EYE_OFFSET, 1.6, 0.0),
                },
                fov: Fov {
                    angle_left: -0.8,
                    angle_right: 0.8,
                    angle_up: 0.8,
                    angle_down: -0.8,
                },
            };
        }
        self.log.push(MockCall::LocateViews { reported });
        Ok(reported)
    }

    fn end_frame(
        &mut self,
        _time: Time,
        _blend_mode: BlendMode,
        layer: Option<ProjectionLayer<'_, MockSwapchain, MockSpace>>,
    ) -> XrResult<()> {
        self.check("xrEndFrame")?;
        let layer = layer.map(|layer| {
            layer
                .views
                .iter()
                .map(|view| LayerViewRecord {
                    swapchain: view.swapchain.id,
                    extent: view.extent,
                })
                .collect()
        });
        self.log.push(MockCall::EndFrame { layer });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockTexture {
    pub id: u64,
}

#[derive(Debug)]
pub struct MockCommandBuffer {
    pub id: u32,
    open_pass: bool,
}

/// GPU double that records passes and submissions.
pub struct MockGpu {
    log: MockLog,
    window: Option<Extent2D>,
    command_buffer_failures: u32,
    fail_window_texture: bool,
    next_cmd: u32,
    next_texture: u64,
}

impl MockGpu {
    pub fn new(log: MockLog) -> Self {
        Self {
            log,
            window: Some(Extent2D::new(1280, 720)),
            command_buffer_failures: 0,
            fail_window_texture: false,
            next_cmd: 1,
            next_texture: 1,
        }
    }

    /// `None` simulates a minimized window.
    pub fn set_window(&mut self, extent: Option<Extent2D>) {
        self.window = extent;
    }

    /// Fails the next `count` command buffer acquisitions.
    pub fn fail_command_buffers(&mut self, count: u32) {
        self.command_buffer_failures = count;
    }

    pub fn set_fail_window_texture(&mut self, fail: bool) {
        self.fail_window_texture = fail;
    }

    pub fn create_texture(&mut self) -> MockTexture {
        let id = self.next_texture;
        self.next_texture += 1;
        MockTexture { id }
    }

    pub fn log(&self) -> &MockLog {
        &self.log
    }
}

impl GpuDevice for MockGpu {
    type Texture = MockTexture;
    type CommandBuffer = MockCommandBuffer;

    fn acquire_command_buffer(&mut self) -> XrResult<MockCommandBuffer> {
        if self.command_buffer_failures > 0 {
            self.command_buffer_failures -= 1;
            return Err(XrError::gpu("command buffer pool exhausted (injected)"));
        }
        let id = self.next_cmd;
        self.next_cmd += 1;
        self.log.push(MockCall::AcquireCommandBuffer { cmd: id });
        Ok(MockCommandBuffer {
            id,
            open_pass: false,
        })
    }

    fn begin_render_pass(
        &mut self,
        cmd: &mut MockCommandBuffer,
        target: &ColorTarget<'_, MockTexture>,
    ) -> XrResult<()> {
        if cmd.open_pass {
            return Err(XrError::gpu("render pass already open"));
        }
        cmd.open_pass = true;
        self.log.push(MockCall::BeginRenderPass {
            cmd: cmd.id,
            texture: target.texture.id,
        });
        Ok(())
    }

    fn end_render_pass(&mut self, cmd: &mut MockCommandBuffer) -> XrResult<()> {
        if !cmd.open_pass {
            return Err(XrError::gpu("no render pass open"));
        }
        cmd.open_pass = false;
        self.log.push(MockCall::EndRenderPass { cmd: cmd.id });
        Ok(())
    }

    fn acquire_window_texture(
        &mut self,
        _cmd: &mut MockCommandBuffer,
    ) -> XrResult<Option<WindowTexture<MockTexture>>> {
        self.log.push(MockCall::AcquireWindowTexture);
        if self.fail_window_texture {
            return Err(XrError::gpu("window surface lost (injected)"));
        }
        Ok(self.window.map(|extent| WindowTexture {
            texture: MockTexture {
                id: WINDOW_TEXTURE_ID,
            },
            extent,
            format: TextureFormat::Bgra8Unorm,
        }))
    }

    fn submit(&mut self, cmd: MockCommandBuffer) -> XrResult<()> {
        if cmd.open_pass {
            self.discard(cmd);
            return Err(XrError::gpu("submitted with an open render pass"));
        }
        self.log.push(MockCall::Submit { cmd: cmd.id });
        Ok(())
    }

    fn discard(&mut self, cmd: MockCommandBuffer) {
        self.log.push(MockCall::Discard { cmd: cmd.id });
    }
}
