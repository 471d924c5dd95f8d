//! Raspberry Pi camera capture through `rpicam-vid`
//!
//! The encoder runs as a child process writing MJPEG to stdout. A blocking
//! reader splits the pipe at image boundaries and feeds the broadcaster.
//! The source stops counting as running once the reader hits EOF, so a
//! crashed encoder is noticed by the mode controller.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{CaptureSettings, CaptureSource, ExposureMode};
use crate::frame::JpegSplitter;
use crate::FrameBroadcaster;

/// Default capture program (`libcamera-vid` on older images)
pub const DEFAULT_PROGRAM: &str = "rpicam-vid";

const READ_BUF_SIZE: usize = 64 * 1024;

/// How long a freshly spawned process must stay alive to count as started
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Handle to a running `rpicam-vid` process
pub struct RpicamCapture {
    program: String,
    startup_grace: Duration,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    /// Set by the reader when the pipe closes
    stream_ended: Arc<AtomicBool>,
}

impl RpicamCapture {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            startup_grace: DEFAULT_STARTUP_GRACE,
            child: None,
            reader: None,
            stream_ended: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Read the MJPEG stream from stdout until EOF.
    ///
    /// The image being written when the pipe closes is incomplete and is
    /// dropped, both here and in the broadcaster.
    fn read_stream<R: Read>(mut reader: R, sink: Arc<FrameBroadcaster>) {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        let mut splitter = JpegSplitter::new();
        let mut total_bytes = 0u64;

        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    info!("Capture stream ended (EOF)");
                    break;
                }
                Ok(n) => {
                    total_bytes += n as u64;
                    for chunk in splitter.feed(&buf[..n]) {
                        sink.write(&chunk);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Error reading capture stream: {}", e);
                    break;
                }
            }
        }

        let held_back = splitter.finish().map_or(0, |rest| rest.len());
        let dropped = held_back + sink.discard_partial();
        if dropped > 0 {
            debug!("Dropped {} bytes of unfinished image", dropped);
        }
        info!("Capture reader finished: {} bytes", total_bytes);
    }

    /// Kill the child and wait for the reader to drain the pipe.
    async fn shutdown(&mut self) -> Result<()> {
        self.kill_child();
        if let Some(reader) = self.reader.take() {
            reader.await.context("Capture reader panicked")?;
        }
        Ok(())
    }

    fn kill_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!("Stopping {}", self.program);
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Default for RpicamCapture {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

/// Command line for the given settings
pub fn rpicam_args(settings: &CaptureSettings) -> Vec<String> {
    let mut args = vec![
        "-t".to_string(),
        "0".to_string(), // Run indefinitely
        "--nopreview".to_string(),
        "--codec".to_string(),
        "mjpeg".to_string(),
        "--width".to_string(),
        settings.width.to_string(),
        "--height".to_string(),
        settings.height.to_string(),
        "--framerate".to_string(),
        settings.framerate.to_string(),
        "--flush".to_string(),
        "-o".to_string(),
        "-".to_string(), // Output to stdout
    ];

    // Fixed shutter and gain together disable the AGC/AEC loop
    if settings.shutter_speed_us > 0 {
        args.push("--shutter".to_string());
        args.push(settings.shutter_speed_us.to_string());
    }
    if let Some(gain) = settings.analogue_gain() {
        args.push("--gain".to_string());
        args.push(gain.to_string());
    }
    if settings.exposure_mode == ExposureMode::Off
        && (settings.shutter_speed_us == 0 || settings.iso == 0)
    {
        debug!("Exposure locked without fixed shutter and ISO, sensor will still adapt");
    }

    args
}

#[async_trait::async_trait]
impl CaptureSource for RpicamCapture {
    async fn start(
        &mut self,
        settings: &CaptureSettings,
        sink: Arc<FrameBroadcaster>,
    ) -> Result<()> {
        if self.child.is_some() {
            bail!("{} is already running", self.program);
        }

        let args = rpicam_args(settings);
        info!("Starting {}: {}", self.program, settings);
        debug!("{} args: {:?}", self.program, args);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to spawn {}. Is it installed?", self.program))?;

        let stdout = child
            .stdout
            .take()
            .with_context(|| format!("Failed to capture stdout from {}", self.program))?;

        let stream_ended = Arc::new(AtomicBool::new(false));
        self.stream_ended = Arc::clone(&stream_ended);
        let program = self.program.clone();
        self.reader = Some(tokio::task::spawn_blocking(move || {
            Self::read_stream(stdout, sink);
            stream_ended.store(true, Ordering::SeqCst);
            debug!("{} output ended", program);
        }));
        self.child = Some(child);

        // A busy or missing camera makes the encoder exit right away
        tokio::time::sleep(self.startup_grace).await;
        let exited = match self.child.as_mut() {
            Some(child) => child
                .try_wait()
                .with_context(|| format!("Failed to poll {}", self.program))?,
            None => None,
        };
        if let Some(status) = exited {
            self.shutdown().await?;
            bail!("{} exited during startup ({})", self.program, status);
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.shutdown().await
    }

    fn is_running(&self) -> bool {
        self.child.is_some() && !self.stream_ended.load(Ordering::SeqCst)
    }
}

impl Drop for RpicamCapture {
    fn drop(&mut self) {
        self.kill_child();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut image = vec![0xFF, 0xD8, 0xFF, 0xE0];
        image.extend_from_slice(body);
        image.extend_from_slice(&[0xFF, 0xD9]);
        image
    }

    fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .map(|i| args[i + 1].as_str())
    }

    #[test]
    fn day_args_leave_exposure_automatic() {
        let args = rpicam_args(&CaptureSettings::default());
        assert_eq!(arg_value(&args, "--codec"), Some("mjpeg"));
        assert_eq!(arg_value(&args, "--width"), Some("1296"));
        assert_eq!(arg_value(&args, "--height"), Some("972"));
        assert_eq!(arg_value(&args, "--framerate"), Some("32"));
        assert_eq!(arg_value(&args, "-o"), Some("-"));
        assert!(arg_value(&args, "--shutter").is_none());
        assert!(arg_value(&args, "--gain").is_none());
    }

    #[test]
    fn night_args_fix_shutter_and_gain() {
        let mut settings = CaptureSettings::default();
        crate::capture::NightProfile::default().apply(&mut settings);
        settings.exposure_mode = ExposureMode::Off;

        let args = rpicam_args(&settings);
        assert_eq!(arg_value(&args, "--shutter"), Some("6000000"));
        assert_eq!(arg_value(&args, "--gain"), Some("8"));
        let fps: f64 = arg_value(&args, "--framerate").unwrap().parse().unwrap();
        assert!((fps - 1.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn reader_publishes_frames_from_pipe_bytes() {
        let mut stream = Vec::new();
        for body in [b"one".as_slice(), b"two".as_slice(), b"three".as_slice()] {
            stream.extend(jpeg(body));
        }

        let sink = Arc::new(FrameBroadcaster::new(Duration::ZERO));
        RpicamCapture::read_stream(std::io::Cursor::new(stream), Arc::clone(&sink));

        // No marker follows the last image, so it is never published
        assert_eq!(sink.generation(), 2);
        let frame = sink.latest().unwrap();
        assert_eq!(&frame.data[4..7], b"two");
    }

    #[test]
    fn image_cut_off_by_a_kill_is_not_published_after_restart() {
        let sink = Arc::new(FrameBroadcaster::new(Duration::ZERO));

        let mut killed = jpeg(b"one");
        killed.extend(jpeg(b"two"));
        killed.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0]);
        killed.extend_from_slice(b"trunc");
        RpicamCapture::read_stream(std::io::Cursor::new(killed), Arc::clone(&sink));
        assert_eq!(sink.generation(), 1);

        let mut restarted = jpeg(b"fresh");
        restarted.extend(jpeg(b"next"));
        RpicamCapture::read_stream(std::io::Cursor::new(restarted), Arc::clone(&sink));

        assert_eq!(sink.generation(), 2);
        let frame = sink.latest().unwrap();
        assert_eq!(frame.data.as_ref(), jpeg(b"fresh").as_slice());
        assert!(frame.data.ends_with(&[0xFF, 0xD9]));
    }

    #[tokio::test]
    async fn program_exiting_at_startup_fails_to_start() {
        let mut capture =
            RpicamCapture::new("false").with_startup_grace(Duration::from_millis(300));
        let sink = Arc::new(FrameBroadcaster::new(Duration::ZERO));
        let err = capture
            .start(&CaptureSettings::default(), sink)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited during startup"));
        assert!(!capture.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn program_exiting_later_stops_running() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-rpicam-vid");
        std::fs::write(&script, "#!/bin/sh\nsleep 0.5\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut capture = RpicamCapture::new(script.to_string_lossy())
            .with_startup_grace(Duration::from_millis(100));
        let sink = Arc::new(FrameBroadcaster::new(Duration::ZERO));
        capture
            .start(&CaptureSettings::default(), sink)
            .await
            .unwrap();
        assert!(capture.is_running());

        tokio::time::timeout(Duration::from_secs(5), async {
            while capture.is_running() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        capture.stop().await.unwrap();
    }

    #[tokio::test]
    async fn missing_program_fails_to_start() {
        let mut capture = RpicamCapture::new("picam-definitely-not-installed");
        let sink = Arc::new(FrameBroadcaster::new(Duration::ZERO));
        let err = capture
            .start(&CaptureSettings::default(), sink)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
        assert!(!capture.is_running());
        capture.stop().await.unwrap();
    }
}
