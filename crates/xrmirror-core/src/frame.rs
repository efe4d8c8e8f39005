//! Per-frame protocol: wait → begin → render → end.
//!
//! Eye views are encoded into one command buffer together with the desktop
//! mirror, the buffer is submitted, and only then are the swapchain images
//! released and the frame ended with its projection layer. When the frame loop
//! is inactive the mirror is still rendered, outside compositor timing.

use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::compositor::{Compositor, ImageChain, LayerView, ProjectionLayer};
use crate::config::SessionConfig;
use crate::gpu::{ColorTarget, GpuDevice, LoadOp, RenderView, StoreOp, TargetKind};
use crate::session::SessionStateMachine;
use crate::space::ReferenceSpace;
use crate::types::{FrameState, View};
use crate::view_set::ViewSet;
use crate::{XrError, XrResult};

/// Running counters over every frame driven by a coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameStats {
    pub frames: u64,
    /// Frames that submitted a projection layer.
    pub rendered_frames: u64,
    /// Compositor frames where rendering was not requested.
    pub skipped_frames: u64,
    pub mirror_only_frames: u64,
    pub aborted_frames: u64,
    pub cardinality_mismatches: u64,
    pub image_wait_timeouts: u64,
    /// Display refresh derived from the predicted display period.
    pub refresh_hz: Option<f32>,
}

/// Summary of one `render_frame` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub frame_index: u64,
    /// Whether the frame went through the compositor's wait/begin/end.
    pub synchronized: bool,
    pub should_render: bool,
    pub located_views: usize,
    pub layer_views: usize,
    pub mirror_rendered: bool,
}

#[derive(Debug, Default)]
pub struct FrameCoordinator {
    stats: FrameStats,
    next_frame: u64,
}

struct Encoded {
    located: usize,
    rendered: usize,
    mirror_rendered: bool,
}

impl FrameCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    /// Runs one frame. `render` is invoked once per located eye view and once
    /// for the desktop mirror, inside a render pass on the target texture.
    pub fn render_frame<C, G, F>(
        &mut self,
        machine: &mut SessionStateMachine<C, G>,
        compositor: &mut C,
        device: &mut G,
        render: &mut F,
    ) -> XrResult<FrameReport>
    where
        C: Compositor<G>,
        G: GpuDevice,
        F: FnMut(&mut G, &mut G::CommandBuffer, &RenderView<'_, G::Texture>),
    {
        if machine.terminal().is_some() {
            return Err(XrError::Terminated);
        }
        let frame_index = self.next_frame;
        self.next_frame += 1;
        self.stats.frames += 1;
        let config = machine.config().clone();

        if !machine.frame_loop_active() {
            let mirror_view = machine
                .view_set()
                .and_then(|views| views.views().first().copied())
                .unwrap_or_default();
            let mut cmd = device.acquire_command_buffer()?;
            let mirror_rendered = self.render_mirror(device, &mut cmd, &config, mirror_view, render);
            device.submit(cmd)?;
            self.stats.mirror_only_frames += 1;
            return Ok(FrameReport {
                frame_index,
                synchronized: false,
                should_render: false,
                located_views: 0,
                layer_views: 0,
                mirror_rendered,
            });
        }

        let frame_state = compositor.wait_frame()?;
        self.note_display_period(frame_state.predicted_display_period);
        compositor.begin_frame()?;
        trace!(
            "frame {frame_index}: display at {}ns, should_render={}",
            frame_state.predicted_display_time.as_nanos(),
            frame_state.should_render
        );

        let mut renderables = machine.renderables_mut();
        let encoded = self.encode_and_submit(
            compositor,
            device,
            &config,
            &frame_state,
            renderables.as_mut().map(|(views, space)| (&mut **views, &**space)),
            render,
        );

        let encoded = match encoded {
            Ok(encoded) => encoded,
            Err(err) => {
                self.stats.aborted_frames += 1;
                warn!("frame {frame_index} aborted: {err}");
                if let Err(end_err) = compositor.end_frame(
                    frame_state.predicted_display_time,
                    config.blend_mode,
                    None,
                ) {
                    warn!("ending aborted frame {frame_index}: {end_err}");
                }
                return Err(err);
            }
        };

        let layer = match renderables {
            Some((views, space)) if frame_state.should_render && encoded.rendered > 0 => {
                Some(projection_layer(views, space, encoded.rendered))
            }
            _ => None,
        };
        let layer_views = layer.as_ref().map_or(0, |layer| layer.views.len());
        compositor.end_frame(frame_state.predicted_display_time, config.blend_mode, layer)?;

        if !frame_state.should_render {
            self.stats.skipped_frames += 1;
        } else if layer_views > 0 {
            self.stats.rendered_frames += 1;
        }

        Ok(FrameReport {
            frame_index,
            synchronized: true,
            should_render: frame_state.should_render,
            located_views: encoded.located,
            layer_views,
            mirror_rendered: encoded.mirror_rendered,
        })
    }

    fn encode_and_submit<C, G, F>(
        &mut self,
        compositor: &mut C,
        device: &mut G,
        config: &SessionConfig,
        frame_state: &FrameState,
        renderables: Option<(
            &mut ViewSet<C::Swapchain, G::Texture>,
            &ReferenceSpace<C::Space>,
        )>,
        render: &mut F,
    ) -> XrResult<Encoded>
    where
        C: Compositor<G>,
        G: GpuDevice,
        F: FnMut(&mut G, &mut G::CommandBuffer, &RenderView<'_, G::Texture>),
    {
        let mut cmd = device.acquire_command_buffer()?;

        let Some((views, space)) = renderables else {
            let mirror_rendered =
                self.render_mirror(device, &mut cmd, config, View::default(), render);
            device.submit(cmd)?;
            return Ok(Encoded {
                located: 0,
                rendered: 0,
                mirror_rendered,
            });
        };

        let located = match self.encode_eyes(
            compositor,
            device,
            &mut cmd,
            config,
            frame_state,
            views,
            space,
            render,
        ) {
            Ok(located) => located,
            Err(err) => {
                // Nothing was submitted: drop the recording and hand back the images.
                device.discard(cmd);
                views.abandon_all();
                return Err(err);
            }
        };

        let mirror_view = views.views().first().copied().unwrap_or_default();
        let mirror_rendered = self.render_mirror(device, &mut cmd, config, mirror_view, render);

        if let Err(err) = device.submit(cmd) {
            views.abandon_all();
            return Err(err);
        }
        for index in 0..located {
            let released = views
                .swapchain_mut(index)
                .map_or(Ok(()), |swapchain| swapchain.release());
            if let Err(err) = released {
                views.abandon_all();
                return Err(err);
            }
        }
        Ok(Encoded {
            located,
            rendered: located,
            mirror_rendered,
        })
    }

    /// Locates the views and records one pass per located eye, returning how
    /// many were rendered. On error some images may still be held.
    #[allow(clippy::too_many_arguments)]
    fn encode_eyes<C, G, F>(
        &mut self,
        compositor: &mut C,
        device: &mut G,
        cmd: &mut G::CommandBuffer,
        config: &SessionConfig,
        frame_state: &FrameState,
        views: &mut ViewSet<C::Swapchain, G::Texture>,
        space: &ReferenceSpace<C::Space>,
        render: &mut F,
    ) -> XrResult<usize>
    where
        C: Compositor<G>,
        G: GpuDevice,
        F: FnMut(&mut G, &mut G::CommandBuffer, &RenderView<'_, G::Texture>),
    {
        if !frame_state.should_render || views.is_empty() {
            return Ok(0);
        }
        let expected = views.len();
        let reported = compositor.locate_views(
            config.view_configuration,
            frame_state.predicted_display_time,
            space.handle(),
            views.views_mut(),
        )?;
        if reported != expected {
            self.stats.cardinality_mismatches += 1;
            warn!("located {reported} view(s), expected {expected}; rendering the overlap");
        }
        let located = reported.min(expected);

        for index in 0..located {
            self.render_eye(device, cmd, config, views, index, render)?;
        }
        Ok(located)
    }

    fn render_eye<S, G, F>(
        &mut self,
        device: &mut G,
        cmd: &mut G::CommandBuffer,
        config: &SessionConfig,
        views: &mut ViewSet<S, G::Texture>,
        index: usize,
        render: &mut F,
    ) -> XrResult<()>
    where
        S: ImageChain,
        G: GpuDevice,
        F: FnMut(&mut G, &mut G::CommandBuffer, &RenderView<'_, G::Texture>),
    {
        let (swapchain, view) = views
            .parts_mut(index)
            .ok_or_else(|| XrError::compositor("xrLocateViews", format!("no view {index}")))?;
        let policy = config.image_wait;
        let image = match swapchain.acquire(policy.timeout(), policy.fatal_on_timeout) {
            Ok((image, expiries)) => {
                self.stats.image_wait_timeouts += u64::from(expiries);
                image
            }
            Err(err) => {
                if matches!(err, XrError::ImageWaitTimeout(_)) {
                    self.stats.image_wait_timeouts += 1;
                }
                return Err(err);
            }
        };

        let view = *view;
        let extent = swapchain.extent();
        let format = swapchain.format();
        let texture = swapchain.texture(image).ok_or_else(|| {
            XrError::compositor("xrAcquireSwapchainImage", format!("no texture {image}"))
        })?;

        device.begin_render_pass(
            cmd,
            &ColorTarget {
                texture,
                extent,
                clear_color: config.clear_color,
                load_op: LoadOp::Clear,
                store_op: StoreOp::Store,
            },
        )?;
        render(
            device,
            cmd,
            &RenderView {
                kind: TargetKind::Eye(index),
                texture,
                extent,
                format,
                view,
            },
        );
        device.end_render_pass(cmd)
    }

    /// Renders the desktop mirror. Failures skip the mirror for this frame only.
    fn render_mirror<G, F>(
        &mut self,
        device: &mut G,
        cmd: &mut G::CommandBuffer,
        config: &SessionConfig,
        view: View,
        render: &mut F,
    ) -> bool
    where
        G: GpuDevice,
        F: FnMut(&mut G, &mut G::CommandBuffer, &RenderView<'_, G::Texture>),
    {
        let window = match device.acquire_window_texture(cmd) {
            Ok(Some(window)) => window,
            Ok(None) => {
                debug!("no window texture this frame");
                return false;
            }
            Err(err) => {
                warn!("mirror skipped: {err}");
                return false;
            }
        };

        let target = ColorTarget {
            texture: &window.texture,
            extent: window.extent,
            clear_color: config.mirror_clear_color,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
        };
        if let Err(err) = device.begin_render_pass(cmd, &target) {
            warn!("mirror skipped: {err}");
            return false;
        }
        render(
            device,
            cmd,
            &RenderView {
                kind: TargetKind::Mirror,
                texture: &window.texture,
                extent: window.extent,
                format: window.format,
                view,
            },
        );
        if let Err(err) = device.end_render_pass(cmd) {
            warn!("mirror pass did not end cleanly: {err}");
            return false;
        }
        true
    }

    fn note_display_period(&mut self, period: Duration) {
        let nanos = period.as_nanos();
        if nanos == 0 {
            return;
        }
        let refresh_hz = 1_000_000_000.0 / nanos as f32;
        let changed = self
            .stats
            .refresh_hz
            .is_none_or(|prev| (prev - refresh_hz).abs() > 0.1);
        if changed {
            info!("display refresh {refresh_hz:.1} Hz");
            self.stats.refresh_hz = Some(refresh_hz);
        }
    }
}

fn projection_layer<'a, S, T, P>(
    views: &'a ViewSet<S, T>,
    space: &'a ReferenceSpace<P>,
    count: usize,
) -> ProjectionLayer<'a, S, P>
where
    S: ImageChain,
{
    let views = views
        .swapchains()
        .iter()
        .zip(views.views())
        .take(count)
        .map(|(swapchain, view)| LayerView {
            pose: view.pose,
            fov: view.fov,
            swapchain: swapchain.chain(),
            extent: swapchain.extent(),
            image_array_index: 0,
        })
        .collect();
    ProjectionLayer {
        space: space.handle(),
        views,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::CompositorEvent;
    use crate::mock::{MockCall, MockCompositor, MockGpu, MockLog, WINDOW_TEXTURE_ID};
    use crate::types::{Extent2D, SessionState};

    struct Rig {
        machine: SessionStateMachine<MockCompositor, MockGpu>,
        compositor: MockCompositor,
        device: MockGpu,
        frames: FrameCoordinator,
        log: MockLog,
    }

    impl Rig {
        fn ready(views: usize) -> Self {
            let log = MockLog::new();
            let mut rig = Self {
                machine: SessionStateMachine::new(SessionConfig::default()),
                compositor: MockCompositor::new(log.clone())
                    .with_views(views, Extent2D::new(128, 96)),
                device: MockGpu::new(log.clone()),
                frames: FrameCoordinator::new(),
                log,
            };
            rig.machine
                .apply(
                    CompositorEvent::StateChanged(SessionState::Ready),
                    &mut rig.compositor,
                    &mut rig.device,
                )
                .unwrap();
            rig.log.clear();
            rig
        }

        fn frame(&mut self, targets: &mut Vec<TargetKind>) -> XrResult<FrameReport> {
            self.frames.render_frame(
                &mut self.machine,
                &mut self.compositor,
                &mut self.device,
                &mut |_, _, view| targets.push(view.kind),
            )
        }
    }

    #[test]
    fn renders_each_eye_then_mirror() {
        let mut rig = Rig::ready(2);
        let mut targets = Vec::new();
        let report = rig.frame(&mut targets).unwrap();
        assert_eq!(
            targets,
            vec![TargetKind::Eye(0), TargetKind::Eye(1), TargetKind::Mirror]
        );
        assert!(report.synchronized);
        assert_eq!(report.layer_views, 2);
        assert!(report.mirror_rendered);
        assert_eq!(rig.frames.stats().rendered_frames, 1);
    }

    #[test]
    fn skipped_frame_still_mirrors() {
        let mut rig = Rig::ready(2);
        rig.compositor.push_frame(false);
        let mut targets = Vec::new();
        let report = rig.frame(&mut targets).unwrap();
        assert_eq!(targets, vec![TargetKind::Mirror]);
        assert_eq!(report.layer_views, 0);
        assert!(rig
            .log
            .calls()
            .contains(&MockCall::EndFrame { layer: None }));
        assert_eq!(rig.frames.stats().skipped_frames, 1);
    }

    #[test]
    fn inactive_loop_renders_mirror_outside_compositor_timing() {
        let mut rig = Rig::ready(2);
        rig.machine
            .apply(
                CompositorEvent::StateChanged(SessionState::Stopping),
                &mut rig.compositor,
                &mut rig.device,
            )
            .unwrap();
        rig.log.clear();
        let mut targets = Vec::new();
        let report = rig.frame(&mut targets).unwrap();
        assert!(!report.synchronized);
        assert_eq!(targets, vec![TargetKind::Mirror]);
        assert_eq!(rig.log.count(|c| *c == MockCall::WaitFrame), 0);
        assert!(rig.log.calls().contains(&MockCall::BeginRenderPass {
            cmd: 1,
            texture: WINDOW_TEXTURE_ID
        }));
    }

    #[test]
    fn located_count_bounds_layer() {
        let mut rig = Rig::ready(2);
        rig.compositor.set_located_count(Some(1));
        let mut targets = Vec::new();
        let report = rig.frame(&mut targets).unwrap();
        assert_eq!(report.located_views, 1);
        assert_eq!(report.layer_views, 1);
        assert_eq!(rig.frames.stats().cardinality_mismatches, 1);
    }

    #[test]
    fn zero_located_views_submits_no_layer() {
        let mut rig = Rig::ready(2);
        rig.compositor.set_located_count(Some(0));
        let mut targets = Vec::new();
        let report = rig.frame(&mut targets).unwrap();
        assert_eq!(report.layer_views, 0);
        assert_eq!(targets, vec![TargetKind::Mirror]);
        assert!(rig
            .log
            .calls()
            .contains(&MockCall::EndFrame { layer: None }));
    }

    #[test]
    fn missing_window_skips_mirror_only() {
        let mut rig = Rig::ready(2);
        rig.device.set_window(None);
        let mut targets = Vec::new();
        let report = rig.frame(&mut targets).unwrap();
        assert!(!report.mirror_rendered);
        assert_eq!(report.layer_views, 2);

        rig.device.set_window(Some(Extent2D::new(640, 480)));
        rig.device.set_fail_window_texture(true);
        let report = rig.frame(&mut targets).unwrap();
        assert!(!report.mirror_rendered);
        assert_eq!(report.layer_views, 2);
    }

    #[test]
    fn compositor_failure_mid_frame_ends_frame_empty() {
        let mut rig = Rig::ready(2);
        rig.compositor.fail_next("xrLocateViews");
        let mut targets = Vec::new();
        assert!(rig.frame(&mut targets).is_err());
        let calls = rig.log.calls();
        assert_eq!(calls.last(), Some(&MockCall::EndFrame { layer: None }));
        assert!(calls.contains(&MockCall::Discard { cmd: 1 }));
        assert!(!calls.iter().any(|c| matches!(c, MockCall::Submit { .. })));
        assert_eq!(rig.frames.stats().aborted_frames, 1);
        // Next frame proceeds normally.
        assert_eq!(rig.frame(&mut targets).unwrap().layer_views, 2);
    }

    #[test]
    fn refresh_rate_from_display_period() {
        let mut rig = Rig::ready(2);
        let mut targets = Vec::new();
        rig.frame(&mut targets).unwrap();
        let hz = rig.frames.stats().refresh_hz.unwrap();
        assert!((hz - 90.0).abs() < 0.1);
    }
}
