//! picam server: headless MJPEG camera server
//!
//! Streams the Raspberry Pi camera to browsers, switches to a long-exposure
//! profile between sunset and sunrise, and optionally keeps snapshots.
//!
//! ## Usage
//!
//! ```bash
//! # Start server (web UI on port 8000)
//! picam-server
//!
//! # Keep snapshots for a day
//! PICAM_SNAPSHOT_DIR=/var/lib/picam PICAM_RETENTION_HOURS=24 picam-server
//!
//! # Day/night switching
//! PICAM_SUN_LOCATION=2643743 PICAM_SUN_API_KEY=... picam-server
//!
//! # Without camera hardware
//! cargo run -p picam-server --features test-source -- --test-source
//! ```

mod config;

use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use picam::capture::{CaptureSettings, CaptureSource, NightProfile, RpicamCapture};
use picam::mode::{CameraMode, ModeConfig, ModeController, OpenWeatherOracle};
use picam::storage::{RetentionConfig, RetentionSweeper, SnapshotConfig, SnapshotWriter};
use picam::web::{self, AppState, Viewers};
use picam::FrameBroadcaster;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(config.log_file.as_deref())?;

    info!("picam server starting");
    info!("  Web port: {}", config.web_port);
    info!("  Title: {}", config.title);
    info!(
        "  Capture: {}x{} @ {} fps",
        config.width, config.height, config.framerate
    );
    if let Some(ref path) = config.log_file {
        info!("  Log file: {:?}", path);
    }

    let settings = CaptureSettings {
        width: config.width,
        height: config.height,
        framerate: config.framerate,
        ..Default::default()
    };
    let broadcaster = Arc::new(FrameBroadcaster::new(settings.frame_interval()));

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    // Snapshot persistence and retention
    if let Some(ref dir) = config.snapshot_dir {
        info!("  Snapshot dir: {:?}", dir);
        info!("  Retention: {} hours", config.retention.as_secs() / 3600);

        let (writer, snapshots) = SnapshotWriter::new(SnapshotConfig::new(dir))?;
        broadcaster.attach_snapshots(snapshots);
        tracker.spawn(writer.run());

        let sweeper = RetentionSweeper::new(RetentionConfig::new(dir, config.retention));
        tracker.spawn(sweeper.run(cancel.clone()));
    } else {
        info!("  Snapshots: disabled (set PICAM_SNAPSHOT_DIR to enable)");
    }

    // Capture and day/night control
    let capture = create_capture(&config)?;
    let mode_config = ModeConfig {
        tick_interval: config.tick_interval,
        night: NightProfile {
            settle: config.night_settle,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut controller =
        ModeController::new(settings, capture, Arc::clone(&broadcaster), mode_config);
    if let Some(ref sun) = config.sun {
        info!("  Day/night switching: location {}", sun.location);
        let oracle = OpenWeatherOracle::new(sun.location.clone(), sun.api_key.clone())?;
        controller = controller.with_oracle(Arc::new(oracle));
    } else {
        info!("  Day/night switching: disabled (set PICAM_SUN_LOCATION and PICAM_SUN_API_KEY)");
    }
    controller.start().await?;
    let mode = controller.subscribe_mode();
    let controller_task = tracker.spawn(controller.run(cancel.clone()));

    // Web server
    let bind = SocketAddr::from(([0, 0, 0, 0], config.web_port));
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;
    info!("Web server listening on http://{}", bind);

    let state = AppState::new(Arc::clone(&broadcaster), &config.title);
    let viewers = state.viewers();
    let web_cancel = cancel.clone();
    tracker.spawn(async move {
        if let Err(e) = web::serve(listener, state, web_cancel).await {
            error!("Web server error: {:#}", e);
        }
    });

    tracker.close();

    run_headless(
        broadcaster,
        viewers,
        mode,
        controller_task,
        cancel,
        tracker,
    )
    .await
}

fn create_capture(config: &Config) -> Result<Box<dyn CaptureSource>> {
    if config.test_source {
        #[cfg(feature = "test-source")]
        {
            info!("  Capture source: synthetic test pattern");
            return Ok(Box::new(picam::capture::TestPatternCapture::default()));
        }
        #[cfg(not(feature = "test-source"))]
        anyhow::bail!("Test source not enabled. Rebuild with --features test-source");
    }

    info!("  Capture source: {}", config.capture_bin);
    Ok(Box::new(RpicamCapture::new(config.capture_bin.clone())))
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create log directory {:?}", parent))?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("picam=info".parse()?)
                .add_directive("picam_server=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

/// Headless mode: log stats periodically, shut down on SIGINT or a failed
/// mode switch
async fn run_headless(
    broadcaster: Arc<FrameBroadcaster>,
    viewers: Viewers,
    mode: watch::Receiver<CameraMode>,
    mut controller_task: JoinHandle<Result<()>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) -> Result<()> {
    info!("Streaming...");
    let mut stats_interval = interval(Duration::from_secs(30));
    let mut outcome = Ok(());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            result = &mut controller_task => {
                outcome = match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.context("Mode controller failed")),
                    Err(e) => Err(anyhow::Error::new(e).context("Mode controller panicked")),
                };
                if let Err(ref e) = outcome {
                    error!("{:#}", e);
                }
                break;
            }
            _ = stats_interval.tick() => {
                let stats = broadcaster.stats();
                info!(
                    "Stats: {} frames, {} viewers, {} snapshots queued, {} dropped, {} mode",
                    stats.frames_published,
                    viewers.count(),
                    stats.snapshots_queued,
                    stats.snapshots_dropped,
                    *mode.borrow()
                );
            }
        }
    }

    cancel.cancel();
    broadcaster.close();

    if tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.is_err() {
        warn!("Shutdown timed out after 5s");
    }
    outcome
}
