//! Compositor session state machine.
//!
//! Consumes one compositor event per poll and drives the transitions that begin
//! and end the session, build and retain the renderable resources, and gate the
//! frame loop:
//!
//! - READY: begin session, enumerate views, create the [`ViewSet`] and the
//!   [`ReferenceSpace`], activate the frame loop.
//! - STOPPING: deactivate the frame loop and end the session. Renderable
//!   resources are kept and replaced on the next READY.
//! - EXITING / LOSS_PENDING / instance loss: latch a terminal [`Flow`].

use tracing::{debug, info, warn};

use crate::compositor::{Compositor, CompositorEvent};
use crate::config::SessionConfig;
use crate::gpu::GpuDevice;
use crate::space::ReferenceSpace;
use crate::types::SessionState;
use crate::view_set::ViewSet;
use crate::XrResult;

/// What the caller should do after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The session is exiting; tear down.
    Stop,
    /// The compositor instance is being lost; tear down and optionally reconnect.
    Fatal,
}

impl Flow {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Continue)
    }
}

pub struct SessionStateMachine<C: Compositor<G>, G: GpuDevice> {
    // Swapchains and the space are released before anything else the owner holds.
    view_set: Option<ViewSet<C::Swapchain, G::Texture>>,
    space: Option<ReferenceSpace<C::Space>>,
    config: SessionConfig,
    state: SessionState,
    running: bool,
    exit_requested: bool,
    frame_loop_active: bool,
    terminal: Option<Flow>,
}

impl<C: Compositor<G>, G: GpuDevice> SessionStateMachine<C, G> {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            view_set: None,
            space: None,
            config,
            state: SessionState::Idle,
            running: false,
            exit_requested: false,
            frame_loop_active: false,
            terminal: None,
        }
    }

    /// Drains at most one compositor event and applies its transition.
    pub fn poll_events(&mut self, compositor: &mut C, device: &mut G) -> XrResult<Flow> {
        if let Some(flow) = self.terminal {
            return Ok(flow);
        }
        match compositor.poll_event()? {
            Some(event) => self.apply(event, compositor, device),
            None => Ok(Flow::Continue),
        }
    }

    /// Applies one decoded event.
    pub fn apply(
        &mut self,
        event: CompositorEvent,
        compositor: &mut C,
        device: &mut G,
    ) -> XrResult<Flow> {
        if let Some(flow) = self.terminal {
            return Ok(flow);
        }
        match event {
            CompositorEvent::StateChanged(state) => self.transition(state, compositor, device),
            CompositorEvent::InstanceLossPending { loss_time } => {
                warn!(
                    "compositor instance loss pending at {}ns, bailing out",
                    loss_time.as_nanos()
                );
                Ok(self.terminate(Flow::Fatal))
            }
            CompositorEvent::Ignored => Ok(Flow::Continue),
        }
    }

    /// The new state is only recorded once its transition has been applied.
    fn transition(
        &mut self,
        next: SessionState,
        compositor: &mut C,
        device: &mut G,
    ) -> XrResult<Flow> {
        info!(
            "session state: {} -> {}",
            self.state.as_str(),
            next.as_str()
        );
        let flow = self.apply_state(next, compositor, device)?;
        self.state = next;
        Ok(flow)
    }

    fn apply_state(
        &mut self,
        next: SessionState,
        compositor: &mut C,
        device: &mut G,
    ) -> XrResult<Flow> {
        match next {
            SessionState::Ready => {
                self.enter_renderable(compositor, device)?;
                Ok(Flow::Continue)
            }
            SessionState::Stopping => {
                self.frame_loop_active = false;
                if self.running {
                    compositor.end_session()?;
                    self.running = false;
                    self.exit_requested = false;
                    info!("ended compositor session");
                } else {
                    debug!("stop requested for a session that is not running");
                }
                Ok(Flow::Continue)
            }
            SessionState::Exiting => {
                info!("session is exiting");
                Ok(self.terminate(Flow::Stop))
            }
            SessionState::LossPending => {
                warn!("session loss pending, bailing out");
                Ok(self.terminate(Flow::Fatal))
            }
            SessionState::Idle
            | SessionState::Synchronized
            | SessionState::Visible
            | SessionState::Focused => Ok(Flow::Continue),
        }
    }

    fn enter_renderable(&mut self, compositor: &mut C, device: &mut G) -> XrResult<()> {
        if self.running {
            warn!("READY received while the session is already running, ignoring");
            return Ok(());
        }

        let previous_views = self.view_set.take();
        let previous_space = self.space.take();
        if previous_views.is_some() || previous_space.is_some() {
            debug!("releasing view set and reference space from the previous session");
        }
        drop(previous_views);
        drop(previous_space);

        compositor.begin_session(self.config.view_configuration)?;
        self.running = true;
        self.exit_requested = false;
        info!("begun compositor session");

        match self.build_renderables(compositor, device) {
            Ok((views, space)) => {
                info!("renderable with {} view(s)", views.len());
                self.view_set = Some(views);
                self.space = Some(space);
                self.frame_loop_active = true;
                Ok(())
            }
            Err(err) => {
                // Whatever was built has already been dropped; undo the begin too.
                warn!("entering the renderable state failed: {err}");
                match compositor.end_session() {
                    Ok(()) => self.running = false,
                    Err(end_err) => warn!("ending session after failed READY: {end_err}"),
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn build_renderables(
        &self,
        compositor: &mut C,
        device: &mut G,
    ) -> XrResult<(
        ViewSet<C::Swapchain, G::Texture>,
        ReferenceSpace<C::Space>,
    )> {
        let views = ViewSet::create(compositor, device, self.config.view_configuration)?;
        let space = ReferenceSpace::create::<C, G>(compositor, self.config.reference_space)?;
        Ok((views, space))
    }

    fn terminate(&mut self, flow: Flow) -> Flow {
        self.frame_loop_active = false;
        self.terminal = Some(flow);
        flow
    }

    /// Asks the compositor to stop the running session. The session is ended
    /// once the resulting STOPPING is applied.
    pub fn request_exit(&mut self, compositor: &mut C) -> XrResult<()> {
        if !self.running || self.exit_requested {
            debug!("exit request skipped: running={}", self.running);
            return Ok(());
        }
        compositor.request_exit()?;
        self.exit_requested = true;
        info!("requested session exit");
        Ok(())
    }

    /// Whether an exit was requested and STOPPING has not arrived yet.
    pub fn exit_requested(&self) -> bool {
        self.exit_requested
    }

    /// Ends a session that is still running and releases the renderable
    /// resources. Runtimes only accept the end while STOPPING; see
    /// [`SessionStateMachine::request_exit`].
    pub fn shutdown(&mut self, compositor: &mut C) -> XrResult<()> {
        self.frame_loop_active = false;
        self.view_set = None;
        self.space = None;
        if self.running {
            compositor.end_session()?;
            self.running = false;
            info!("ended compositor session at shutdown");
        }
        Ok(())
    }

    /// Last state whose transition was applied successfully.
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether begin-session has been called without a matching end.
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn frame_loop_active(&self) -> bool {
        self.frame_loop_active
    }

    pub fn terminal(&self) -> Option<Flow> {
        self.terminal
    }

    pub fn view_set(&self) -> Option<&ViewSet<C::Swapchain, G::Texture>> {
        self.view_set.as_ref()
    }

    pub fn reference_space(&self) -> Option<&ReferenceSpace<C::Space>> {
        self.space.as_ref()
    }

    /// Mutable views with the read-only space, as the frame coordinator needs them.
    #[allow(clippy::type_complexity)]
    pub fn renderables_mut(
        &mut self,
    ) -> Option<(
        &mut ViewSet<C::Swapchain, G::Texture>,
        &ReferenceSpace<C::Space>,
    )> {
        match (self.view_set.as_mut(), self.space.as_ref()) {
            (Some(views), Some(space)) => Some((views, space)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockCompositor, MockGpu, MockLog};
    use crate::types::{Extent2D, Time};
    use crate::XrError;

    type Machine = SessionStateMachine<MockCompositor, MockGpu>;

    fn setup(views: usize) -> (Machine, MockCompositor, MockGpu, MockLog) {
        let log = MockLog::new();
        let compositor = MockCompositor::new(log.clone()).with_views(views, Extent2D::new(96, 64));
        let device = MockGpu::new(log.clone());
        (Machine::new(SessionConfig::default()), compositor, device, log)
    }

    fn drive(
        machine: &mut Machine,
        compositor: &mut MockCompositor,
        device: &mut MockGpu,
        state: SessionState,
    ) -> XrResult<Flow> {
        machine.apply(CompositorEvent::StateChanged(state), compositor, device)
    }

    #[test]
    fn ready_builds_renderables() {
        let (mut machine, mut compositor, mut device, log) = setup(2);
        let flow = drive(&mut machine, &mut compositor, &mut device, SessionState::Ready).unwrap();
        assert_eq!(flow, Flow::Continue);
        assert!(machine.is_running());
        assert!(machine.frame_loop_active());
        assert_eq!(machine.view_set().map(|v| v.len()), Some(2));
        assert!(machine.reference_space().is_some());
        assert_eq!(log.calls()[0], MockCall::BeginSession);
    }

    #[test]
    fn stopping_ends_session_and_keeps_views() {
        let (mut machine, mut compositor, mut device, log) = setup(2);
        drive(&mut machine, &mut compositor, &mut device, SessionState::Ready).unwrap();
        drive(&mut machine, &mut compositor, &mut device, SessionState::Stopping).unwrap();
        assert!(!machine.is_running());
        assert!(!machine.frame_loop_active());
        assert!(machine.view_set().is_some());
        assert_eq!(log.count(|c| *c == MockCall::EndSession), 1);
    }

    #[test]
    fn duplicate_ready_is_ignored() {
        let (mut machine, mut compositor, mut device, log) = setup(2);
        drive(&mut machine, &mut compositor, &mut device, SessionState::Ready).unwrap();
        drive(&mut machine, &mut compositor, &mut device, SessionState::Ready).unwrap();
        assert_eq!(log.count(|c| *c == MockCall::BeginSession), 1);
        assert_eq!(
            log.count(|c| matches!(c, MockCall::CreateSwapchain { .. })),
            2
        );
    }

    #[test]
    fn second_ready_replaces_view_set() {
        let (mut machine, mut compositor, mut device, log) = setup(2);
        drive(&mut machine, &mut compositor, &mut device, SessionState::Ready).unwrap();
        drive(&mut machine, &mut compositor, &mut device, SessionState::Stopping).unwrap();
        drive(&mut machine, &mut compositor, &mut device, SessionState::Ready).unwrap();
        assert_eq!(log.count(|c| *c == MockCall::BeginSession), 2);
        assert_eq!(
            log.count(|c| matches!(c, MockCall::DestroySwapchain { .. })),
            2
        );
        assert_eq!(log.count(|c| matches!(c, MockCall::DestroySpace { .. })), 1);
        assert_eq!(machine.view_set().map(|v| v.len()), Some(2));
    }

    #[test]
    fn stopping_without_session_records_state_only() {
        let (mut machine, mut compositor, mut device, log) = setup(2);
        let flow =
            drive(&mut machine, &mut compositor, &mut device, SessionState::Stopping).unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(machine.state(), SessionState::Stopping);
        assert!(log.calls().is_empty());
    }

    #[test]
    fn failed_ready_ends_session_again() {
        let (mut machine, mut compositor, mut device, log) = setup(4);
        compositor.fail_swapchain_at(2);
        let err = drive(&mut machine, &mut compositor, &mut device, SessionState::Ready)
            .unwrap_err();
        assert!(matches!(err, XrError::SwapchainCreation { view: 2, .. }));
        assert_eq!(machine.state(), SessionState::Idle);
        assert!(!machine.is_running());
        assert!(!machine.frame_loop_active());
        assert!(machine.view_set().is_none());
        assert_eq!(log.calls().last(), Some(&MockCall::EndSession));
    }

    #[test]
    fn exiting_latches_stop() {
        let (mut machine, mut compositor, mut device, _log) = setup(2);
        drive(&mut machine, &mut compositor, &mut device, SessionState::Ready).unwrap();
        let flow =
            drive(&mut machine, &mut compositor, &mut device, SessionState::Exiting).unwrap();
        assert_eq!(flow, Flow::Stop);
        assert!(flow.is_terminal());
        assert!(!machine.frame_loop_active());

        compositor.push_state(SessionState::Ready);
        assert_eq!(
            machine.poll_events(&mut compositor, &mut device).unwrap(),
            Flow::Stop
        );
        assert_eq!(compositor.pending_events(), 1);
    }

    #[test]
    fn loss_is_fatal() {
        let (mut machine, mut compositor, mut device, _log) = setup(2);
        let flow = drive(
            &mut machine,
            &mut compositor,
            &mut device,
            SessionState::LossPending,
        )
        .unwrap();
        assert_eq!(flow, Flow::Fatal);

        let (mut machine, mut compositor, mut device, _log) = setup(2);
        let flow = machine
            .apply(
                CompositorEvent::InstanceLossPending {
                    loss_time: Time::from_nanos(5),
                },
                &mut compositor,
                &mut device,
            )
            .unwrap();
        assert_eq!(flow, Flow::Fatal);
        assert!(flow.is_terminal());
        assert_eq!(machine.terminal(), Some(Flow::Fatal));
    }

    #[test]
    fn failed_stop_keeps_running_state() {
        let (mut machine, mut compositor, mut device, _log) = setup(2);
        drive(&mut machine, &mut compositor, &mut device, SessionState::Ready).unwrap();
        compositor.fail_next("xrEndSession");
        assert!(drive(&mut machine, &mut compositor, &mut device, SessionState::Stopping).is_err());
        assert_eq!(machine.state(), SessionState::Ready);
        assert!(machine.is_running());

        drive(&mut machine, &mut compositor, &mut device, SessionState::Stopping).unwrap();
        assert_eq!(machine.state(), SessionState::Stopping);
        assert!(!machine.is_running());
    }

    #[test]
    fn exit_is_requested_once_per_running_session() {
        let (mut machine, mut compositor, mut device, log) = setup(2);
        machine.request_exit(&mut compositor).unwrap();
        assert_eq!(log.count(|c| *c == MockCall::RequestExit), 0);

        drive(&mut machine, &mut compositor, &mut device, SessionState::Ready).unwrap();
        machine.request_exit(&mut compositor).unwrap();
        machine.request_exit(&mut compositor).unwrap();
        assert_eq!(log.count(|c| *c == MockCall::RequestExit), 1);
        assert!(machine.exit_requested());

        let flow = machine.poll_events(&mut compositor, &mut device).unwrap();
        assert!(!flow.is_terminal());
        assert_eq!(machine.state(), SessionState::Stopping);
        assert!(!machine.exit_requested());
        assert_eq!(log.count(|c| *c == MockCall::EndSession), 1);
    }

    #[test]
    fn empty_queue_continues() {
        let (mut machine, mut compositor, mut device, _log) = setup(2);
        assert_eq!(
            machine.poll_events(&mut compositor, &mut device).unwrap(),
            Flow::Continue
        );
        assert_eq!(machine.state(), SessionState::Idle);
    }
}
