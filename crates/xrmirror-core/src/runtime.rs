//! Caller-facing session handle: init, poll, render, shutdown.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::compositor::Compositor;
use crate::config::SessionConfig;
use crate::frame::{FrameCoordinator, FrameReport, FrameStats};
use crate::gpu::{GpuDevice, RenderView};
use crate::session::{Flow, SessionStateMachine};
use crate::types::SessionState;
use crate::XrResult;

/// How long shutdown keeps a running session going while waiting for STOPPING.
const WIND_DOWN_TIMEOUT: Duration = Duration::from_secs(2);
const WIND_DOWN_IDLE: Duration = Duration::from_millis(5);

/// Owns a compositor connection, the GPU device and all session resources.
///
/// Resources are released in dependency order on shutdown or drop: swapchains
/// and the reference space, then the compositor, then the device.
pub struct MirrorSession<C: Compositor<G>, G: GpuDevice> {
    // Field order is drop order.
    machine: SessionStateMachine<C, G>,
    frames: FrameCoordinator,
    compositor: C,
    device: G,
}

impl<C: Compositor<G>, G: GpuDevice> MirrorSession<C, G> {
    /// Wraps an already-connected compositor and device. No session is begun
    /// until the compositor reports READY.
    pub fn init(compositor: C, device: G, config: SessionConfig) -> XrResult<Self> {
        config.validate()?;
        info!(
            "session configured: {:?} views, {:?} space, {:?} blend",
            config.view_configuration, config.reference_space, config.blend_mode
        );
        Ok(Self {
            machine: SessionStateMachine::new(config),
            frames: FrameCoordinator::new(),
            compositor,
            device,
        })
    }

    /// Drains at most one compositor event and advances the session.
    ///
    /// Errors are transient unless [`XrError::is_transient`] says otherwise; the
    /// session stays in its last consistent state and may be polled again.
    ///
    /// [`XrError::is_transient`]: crate::XrError::is_transient
    pub fn poll_and_advance(&mut self) -> XrResult<Flow> {
        self.machine
            .poll_events(&mut self.compositor, &mut self.device)
    }

    /// Drives one frame, invoking `render` for every located eye view and once
    /// for the desktop mirror.
    pub fn render_frame<F>(&mut self, mut render: F) -> XrResult<FrameReport>
    where
        F: FnMut(&mut G, &mut G::CommandBuffer, &RenderView<'_, G::Texture>),
    {
        self.frames.render_frame(
            &mut self.machine,
            &mut self.compositor,
            &mut self.device,
            &mut render,
        )
    }

    /// Asks the compositor to stop the session. Keep polling and rendering;
    /// the session ends when the resulting STOPPING is applied.
    pub fn request_exit(&mut self) -> XrResult<()> {
        self.machine.request_exit(&mut self.compositor)
    }

    /// Ends a running session and releases every resource.
    ///
    /// A session that is still running is first asked to exit and driven with
    /// empty frames until the compositor reports STOPPING.
    pub fn shutdown(mut self) -> XrResult<()> {
        self.wind_down();
        let result = self.machine.shutdown(&mut self.compositor);
        let stats = self.frames.stats();
        info!(
            "shutdown after {} frame(s): {} rendered, {} skipped, {} mirror-only, {} aborted",
            stats.frames,
            stats.rendered_frames,
            stats.skipped_frames,
            stats.mirror_only_frames,
            stats.aborted_frames
        );
        result
    }

    fn wind_down(&mut self) {
        if !self.machine.is_running() || self.machine.terminal().is_some() {
            return;
        }
        if let Err(err) = self.request_exit() {
            warn!("exit request failed: {err}");
            return;
        }
        let deadline = Instant::now() + WIND_DOWN_TIMEOUT;
        while self.machine.is_running() && Instant::now() < deadline {
            match self.poll_and_advance() {
                Ok(flow) if flow.is_terminal() => break,
                Ok(_) => {}
                Err(err) => {
                    warn!("event handling failed while stopping: {err}");
                    break;
                }
            }
            if self.machine.frame_loop_active() {
                if let Err(err) = self.render_frame(|_, _, _| {}) {
                    debug!("frame failed while stopping: {err}");
                }
            } else if self.machine.is_running() {
                thread::sleep(WIND_DOWN_IDLE);
            }
        }
        if self.machine.is_running() {
            warn!("compositor did not stop the session within {WIND_DOWN_TIMEOUT:?}");
        }
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn frame_loop_active(&self) -> bool {
        self.machine.frame_loop_active()
    }

    pub fn stats(&self) -> &FrameStats {
        self.frames.stats()
    }

    pub fn machine(&self) -> &SessionStateMachine<C, G> {
        &self.machine
    }

    pub fn compositor(&self) -> &C {
        &self.compositor
    }

    pub fn compositor_mut(&mut self) -> &mut C {
        &mut self.compositor
    }

    pub fn device(&self) -> &G {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut G {
        &mut self.device
    }
}

impl<C: Compositor<G>, G: GpuDevice> Drop for MirrorSession<C, G> {
    fn drop(&mut self) {
        if self.machine.is_running() {
            self.wind_down();
            if let Err(err) = self.machine.shutdown(&mut self.compositor) {
                warn!("session not ended cleanly on drop: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockCompositor, MockGpu, MockLog};
    use crate::types::Extent2D;
    use crate::XrError;

    fn session(views: usize) -> (MirrorSession<MockCompositor, MockGpu>, MockLog) {
        let log = MockLog::new();
        let compositor = MockCompositor::new(log.clone()).with_views(views, Extent2D::new(64, 32));
        let device = MockGpu::new(log.clone());
        let session = MirrorSession::init(compositor, device, SessionConfig::default())
            .expect("default config is valid");
        (session, log)
    }

    #[test]
    fn init_rejects_invalid_config() {
        let log = MockLog::new();
        let mut config = SessionConfig::default();
        config.clear_color[1] = f32::NAN;
        let result = MirrorSession::init(
            MockCompositor::new(log.clone()),
            MockGpu::new(log.clone()),
            config,
        );
        assert!(matches!(result, Err(XrError::Config(_))));
        assert!(log.calls().is_empty());
    }

    fn position(calls: &[MockCall], call: &MockCall) -> usize {
        calls.iter().position(|c| c == call).unwrap()
    }

    #[test]
    fn drop_requests_exit_before_ending() {
        let (mut session, log) = session(2);
        session.compositor_mut().push_state(SessionState::Ready);
        assert_eq!(session.poll_and_advance().unwrap(), Flow::Continue);
        assert!(session.machine().is_running());
        drop(session);

        let calls = log.calls();
        assert_eq!(log.count(|c| *c == MockCall::EndSession), 1);
        assert!(position(&calls, &MockCall::RequestExit) < position(&calls, &MockCall::EndSession));
        assert_eq!(
            log.count(|c| matches!(c, MockCall::DestroySwapchain { .. })),
            2
        );
        assert_eq!(log.count(|c| matches!(c, MockCall::DestroySpace { .. })), 1);
    }

    #[test]
    fn shutdown_waits_for_stopping() {
        let (mut session, log) = session(2);
        session.compositor_mut().set_strict_end_session(true);
        session.compositor_mut().push_state(SessionState::Ready);
        session.poll_and_advance().unwrap();
        session.render_frame(|_, _, _| {}).unwrap();

        session.shutdown().unwrap();
        let calls = log.calls();
        assert_eq!(log.count(|c| *c == MockCall::EndSession), 1);
        assert!(position(&calls, &MockCall::RequestExit) < position(&calls, &MockCall::EndSession));
        // Swapchains outlive the end of the session and go with the shutdown.
        let last_destroy = calls
            .iter()
            .rposition(|c| matches!(c, MockCall::DestroySwapchain { .. }))
            .unwrap();
        assert!(position(&calls, &MockCall::EndSession) < last_destroy);
    }

    #[test]
    fn shutdown_after_stopping_does_not_end_again() {
        let (mut session, log) = session(2);
        session.compositor_mut().set_strict_end_session(true);
        session.compositor_mut().push_state(SessionState::Ready);
        session.poll_and_advance().unwrap();
        session.request_exit().unwrap();
        while session.poll_and_advance().unwrap() == Flow::Continue {}
        assert_eq!(session.state(), SessionState::Exiting);

        session.shutdown().unwrap();
        assert_eq!(log.count(|c| *c == MockCall::RequestExit), 1);
        assert_eq!(log.count(|c| *c == MockCall::EndSession), 1);
    }

    #[test]
    fn failed_exit_request_falls_back_to_ending() {
        let (mut session, log) = session(2);
        session.compositor_mut().push_state(SessionState::Ready);
        session.poll_and_advance().unwrap();
        session.compositor_mut().fail_next("xrRequestExitSession");

        session.shutdown().unwrap();
        assert_eq!(log.count(|c| *c == MockCall::RequestExit), 0);
        assert_eq!(log.count(|c| *c == MockCall::EndSession), 1);
    }

    #[test]
    fn shutdown_without_session_is_quiet() {
        let (session, log) = session(2);
        session.shutdown().unwrap();
        assert_eq!(log.count(|c| *c == MockCall::EndSession), 0);
    }
}
