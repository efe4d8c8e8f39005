//! Drives a head-mounted display session and mirrors every frame to the desktop.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, info, trace, warn};

use xrmirror_core::mock::{MockCall, MockCompositor, MockGpu, MockLog};
use xrmirror_core::{
    Compositor, Extent2D, Flow, GpuDevice, MirrorSession, ReferenceSpaceKind, SessionConfig,
    SessionState, ViewConfiguration,
};
use xrmirror_openxr::BackendOptions;

const IDLE_SLEEP: Duration = Duration::from_millis(5);

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Backend {
    /// OpenXR runtime with a Vulkan device.
    Openxr,
    /// Scripted in-process compositor, no headset required.
    Mock,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SpaceArg {
    Local,
    Stage,
    View,
}

impl From<SpaceArg> for ReferenceSpaceKind {
    fn from(arg: SpaceArg) -> Self {
        match arg {
            SpaceArg::Local => Self::Local,
            SpaceArg::Stage => Self::Stage,
            SpaceArg::View => Self::View,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "xrmirror")]
#[command(about = "Render to a stereo HMD compositor and mirror to the desktop")]
struct Args {
    #[arg(long, value_enum, default_value_t = Backend::Openxr)]
    backend: Backend,

    /// JSON session configuration; flags below override its fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many compositor-synchronized frames
    #[arg(long)]
    frames: Option<u64>,

    /// Use the mono view configuration instead of stereo
    #[arg(long)]
    mono: bool,

    #[arg(long, value_enum)]
    reference_space: Option<SpaceArg>,

    /// Bound each swapchain image wait; expiries are logged and retried
    #[arg(long)]
    image_wait_timeout_ms: Option<u64>,

    /// Treat an image wait expiry as a frame error instead of retrying
    #[arg(long)]
    fatal_image_wait: bool,

    #[arg(long, default_value_t = 1280)]
    mirror_width: u32,

    #[arg(long, default_value_t = 720)]
    mirror_height: u32,

    #[arg(long, env = "XRMIRROR_APP_NAME", default_value = "xrmirror")]
    app_name: String,

    /// Views reported by the mock compositor
    #[arg(long, default_value_t = 2)]
    mock_views: usize,

    /// Debug-level logging unless RUST_LOG is set
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    let Some(path) = path else {
        return Ok(SessionConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
}

fn session_config(args: &Args) -> Result<SessionConfig> {
    let mut config = load_config(args.config.as_deref())?;
    if args.mono {
        config.view_configuration = ViewConfiguration::PrimaryMono;
    }
    if let Some(space) = args.reference_space {
        config.reference_space = space.into();
    }
    if let Some(timeout_ms) = args.image_wait_timeout_ms {
        config.image_wait.timeout_ms = Some(timeout_ms);
    }
    if args.fatal_image_wait {
        config.image_wait.fatal_on_timeout = true;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = session_config(&args)?;
    match args.backend {
        Backend::Openxr => run_openxr(&args, config),
        Backend::Mock => run_mock(&args, config),
    }
}

fn run_openxr(args: &Args, config: SessionConfig) -> Result<()> {
    let options = BackendOptions {
        application_name: args.app_name.clone(),
        mirror_extent: Extent2D::new(args.mirror_width, args.mirror_height),
    };
    let (compositor, device) = xrmirror_openxr::connect(&options)?;
    let session = MirrorSession::init(compositor, device, config)?;
    drive(session, args.frames)
}

/// Scripted run: READY, `--frames` synchronized frames, then an exit request
/// that the mock answers with STOPPING and EXITING.
fn run_mock(args: &Args, config: SessionConfig) -> Result<()> {
    let log = MockLog::new();
    let mut compositor = MockCompositor::new(log.clone())
        .with_views(args.mock_views, Extent2D::new(1440, 1600));
    compositor.set_strict_end_session(true);
    compositor.push_state(SessionState::Ready);
    let mut device = MockGpu::new(log.clone());
    device.set_window(Some(Extent2D::new(args.mirror_width, args.mirror_height)));

    let session = MirrorSession::init(compositor, device, config)?;
    drive(session, Some(args.frames.unwrap_or(3)))?;

    info!(
        "mock run: {} begin, {} end, {} swapchain(s), {} submit(s)",
        log.count(|c| *c == MockCall::BeginSession),
        log.count(|c| *c == MockCall::EndSession),
        log.count(|c| matches!(c, MockCall::CreateSwapchain { .. })),
        log.count(|c| matches!(c, MockCall::Submit { .. }))
    );
    Ok(())
}

/// Poll → render loop. Once `limit` synchronized frames have completed, the
/// compositor is asked to exit and the loop runs on until it does.
fn drive<C, G>(mut session: MirrorSession<C, G>, limit: Option<u64>) -> Result<()>
where
    C: Compositor<G>,
    G: GpuDevice,
{
    let mut synchronized = 0u64;
    let mut exit_requested = false;
    let mut lost = false;
    loop {
        match session.poll_and_advance() {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => {
                info!("compositor requested exit");
                break;
            }
            Ok(Flow::Fatal) => {
                error!("compositor instance lost");
                lost = true;
                break;
            }
            Err(err) if err.is_transient() => warn!("event handling failed: {err}"),
            Err(err) => return Err(err.into()),
        }

        match session.render_frame(|_, _, view| {
            trace!(
                "draw {:?} {}x{} {}",
                view.kind,
                view.extent.width,
                view.extent.height,
                view.format.name()
            );
        }) {
            Ok(report) => synchronized += u64::from(report.synchronized),
            Err(err) if err.is_transient() => warn!("frame failed: {err}"),
            Err(err) => return Err(err.into()),
        }

        if !exit_requested && limit.is_some_and(|limit| synchronized >= limit) {
            info!("frame limit reached, requesting exit");
            session.request_exit()?;
            exit_requested = true;
        }

        if !session.frame_loop_active() {
            thread::sleep(IDLE_SLEEP);
        }
    }

    let stats = *session.stats();
    let shutdown = session.shutdown();
    if let Some(hz) = stats.refresh_hz {
        info!("display refresh was {hz:.1} Hz");
    }
    if lost {
        if let Err(err) = shutdown {
            warn!("shutdown after instance loss: {err}");
        }
        return Err(anyhow!("compositor instance lost"));
    }
    shutdown?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use xrmirror_core::{CompositorEvent, Time};

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from([
            "xrmirror",
            "--backend",
            "mock",
            "--mono",
            "--reference-space",
            "stage",
            "--image-wait-timeout-ms",
            "20",
        ]);
        assert_eq!(args.backend, Backend::Mock);
        let config = session_config(&args).unwrap();
        assert_eq!(config.view_configuration, ViewConfiguration::PrimaryMono);
        assert_eq!(config.reference_space, ReferenceSpaceKind::Stage);
        assert_eq!(config.image_wait.timeout_ms, Some(20));
        assert!(!config.image_wait.fatal_on_timeout);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let args = Args::parse_from(["xrmirror", "--image-wait-timeout-ms", "0"]);
        assert!(session_config(&args).is_err());
    }

    #[test]
    fn mock_run_completes() {
        let args = Args::parse_from(["xrmirror", "--backend", "mock", "--frames", "4"]);
        let config = session_config(&args).unwrap();
        run_mock(&args, config).unwrap();
    }

    fn mock_session(views: usize) -> (MirrorSession<MockCompositor, MockGpu>, MockLog) {
        let log = MockLog::new();
        let mut compositor =
            MockCompositor::new(log.clone()).with_views(views, Extent2D::new(64, 64));
        compositor.set_strict_end_session(true);
        compositor.push_state(SessionState::Ready);
        let device = MockGpu::new(log.clone());
        let session = MirrorSession::init(compositor, device, SessionConfig::default()).unwrap();
        (session, log)
    }

    #[test]
    fn frame_limit_counts_only_completed_frames() {
        let (mut session, log) = mock_session(2);
        session.compositor_mut().fail_next("xrLocateViews");
        session.device_mut().fail_command_buffers(1);
        drive(session, Some(2)).unwrap();

        let layers = log.count(|c| matches!(c, MockCall::EndFrame { layer: Some(_) }));
        assert_eq!(layers, 2);
        assert_eq!(log.count(|c| *c == MockCall::RequestExit), 1);
        assert_eq!(log.count(|c| *c == MockCall::EndSession), 1);
    }

    #[test]
    fn instance_loss_is_reported() {
        let (mut session, _log) = mock_session(2);
        session
            .compositor_mut()
            .push_event(CompositorEvent::InstanceLossPending {
                loss_time: Time::from_nanos(0),
            });
        let err = drive(session, None).unwrap_err();
        assert!(err.to_string().contains("instance lost"), "{err}");
    }
}
