//! Day/night mode controller
//!
//! Switches the capture source between the startup ("day") settings and a
//! long-exposure night profile based on cached sunrise/sunset times:
//! - Day → Night when the current time falls outside [sunrise, sunset]
//! - Night → Day when it falls back inside
//!
//! A switch stops the capture source, rewrites the settings and starts it
//! again. Snapshots are suspended for the duration of the switch; viewers keep
//! waiting on the broadcaster and pick up again with the first new frame.

pub mod sun;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{CaptureSettings, CaptureSource, ExposureMode, NightProfile};
use crate::FrameBroadcaster;

pub use sun::{OpenWeatherOracle, RedactedString, SunOracle, SunTimes, SunWindow};

/// Current capture profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraMode {
    Day,
    Night,
}

impl fmt::Display for CameraMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraMode::Day => write!(f, "day"),
            CameraMode::Night => write!(f, "night"),
        }
    }
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ModeConfig {
    /// Period between mode checks
    pub tick_interval: Duration,
    /// Age after which cached sun times are fetched again
    pub refresh_after: Duration,
    pub night: NightProfile,
    /// Start attempts after a reconfiguration before giving up
    pub restart_attempts: u32,
    /// Pause between failed start attempts
    pub restart_backoff: Duration,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            refresh_after: Duration::from_secs(4 * 60 * 60),
            night: NightProfile::default(),
            restart_attempts: 3,
            restart_backoff: Duration::from_secs(2),
        }
    }
}

/// Mode the controller should switch to, if any
pub fn next_mode(mode: CameraMode, window: &SunWindow, now: DateTime<Utc>) -> Option<CameraMode> {
    match (mode, window.is_daylight(now)) {
        (CameraMode::Day, false) => Some(CameraMode::Night),
        (CameraMode::Night, true) => Some(CameraMode::Day),
        _ => None,
    }
}

/// Owns the capture source and its settings, and drives day/night switches.
pub struct ModeController {
    mode: watch::Sender<CameraMode>,
    original: CaptureSettings,
    current: CaptureSettings,
    window: Option<SunWindow>,
    oracle: Option<Arc<dyn SunOracle>>,
    capture: Box<dyn CaptureSource>,
    broadcaster: Arc<FrameBroadcaster>,
    config: ModeConfig,
    /// Capture is supposed to be producing frames
    capturing: bool,
}

impl ModeController {
    /// `settings` become the immutable day profile.
    pub fn new(
        settings: CaptureSettings,
        capture: Box<dyn CaptureSource>,
        broadcaster: Arc<FrameBroadcaster>,
        config: ModeConfig,
    ) -> Self {
        let (mode, _) = watch::channel(CameraMode::Day);
        Self {
            mode,
            original: settings.clone(),
            current: settings,
            window: None,
            oracle: None,
            capture,
            broadcaster,
            config,
            capturing: false,
        }
    }

    /// Enable day/night switching. Without an oracle the camera stays in day mode.
    pub fn with_oracle(mut self, oracle: Arc<dyn SunOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn mode(&self) -> CameraMode {
        *self.mode.borrow()
    }

    /// Read-only view of the mode for status reporting
    pub fn subscribe_mode(&self) -> watch::Receiver<CameraMode> {
        self.mode.subscribe()
    }

    pub fn sun_window(&self) -> Option<&SunWindow> {
        self.window.as_ref()
    }

    /// Settings the capture source is currently running with
    pub fn settings(&self) -> &CaptureSettings {
        &self.current
    }

    /// Settings captured at startup
    pub fn original_settings(&self) -> &CaptureSettings {
        &self.original
    }

    /// Start capturing with the startup settings.
    pub async fn start(&mut self) -> Result<()> {
        self.broadcaster
            .set_snapshot_interval(self.current.frame_interval());
        self.capture
            .start(&self.current, Arc::clone(&self.broadcaster))
            .await
            .context("Failed to start capture")?;
        self.capturing = true;
        Ok(())
    }

    /// Check the clock and switch modes if needed.
    ///
    /// Returns the mode switched to. Oracle failures are logged and never
    /// returned; errors mean the capture source could not be restarted.
    pub async fn tick(&mut self) -> Result<Option<CameraMode>> {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<Option<CameraMode>> {
        if self.capturing && !self.capture.is_running() {
            self.recover_capture().await?;
        }
        self.refresh_sun_window(now).await;

        let Some(window) = self.window.as_ref() else {
            return Ok(None);
        };
        let Some(target) = next_mode(self.mode(), window, now) else {
            return Ok(None);
        };

        match target {
            CameraMode::Night => self.enter_night().await?,
            CameraMode::Day => self.enter_day().await?,
        }
        self.mode.send_replace(target);
        info!("Camera now in {} mode", target);
        Ok(Some(target))
    }

    async fn refresh_sun_window(&mut self, now: DateTime<Utc>) {
        let Some(oracle) = self.oracle.as_ref() else {
            return;
        };
        if let Some(window) = &self.window {
            if !window.is_stale(now, self.config.refresh_after) {
                return;
            }
        }

        match oracle.sun_times().await {
            Ok(times) => {
                info!(
                    "Sun times updated: sunrise {}, sunset {}",
                    times.sunrise, times.sunset
                );
                self.window = Some(SunWindow::new(times, now));
            }
            Err(e) if self.window.is_some() => {
                warn!("Sun oracle failed, keeping cached sun times: {:#}", e);
            }
            Err(e) => {
                warn!("Sun oracle failed, no sun times yet: {:#}", e);
            }
        }
    }

    async fn enter_night(&mut self) -> Result<()> {
        info!("Sun is down, switching to night mode");
        self.broadcaster.suspend();
        self.capture
            .stop()
            .await
            .context("Failed to stop capture for night mode")?;
        self.broadcaster.discard_partial();

        self.config.night.apply(&mut self.current);
        debug!(
            "Waiting {:?} for exposure to settle",
            self.config.night.settle
        );
        tokio::time::sleep(self.config.night.settle).await;
        self.current.exposure_mode = ExposureMode::Off;

        self.broadcaster
            .set_snapshot_interval(self.current.frame_interval());
        self.broadcaster.resume();
        self.restart_capture().await
    }

    async fn enter_day(&mut self) -> Result<()> {
        info!("Sun is up, switching to day mode");
        self.broadcaster.suspend();
        self.capture
            .stop()
            .await
            .context("Failed to stop capture for day mode")?;
        self.broadcaster.discard_partial();

        self.current = self.original.clone();

        self.broadcaster
            .set_snapshot_interval(self.current.frame_interval());
        self.broadcaster.resume();
        self.restart_capture().await
    }

    /// Restart a capture source that stopped on its own.
    async fn recover_capture(&mut self) -> Result<()> {
        warn!("Capture stopped unexpectedly in {} mode, restarting", self.mode());
        self.capture
            .stop()
            .await
            .context("Failed to clean up stopped capture")?;
        self.broadcaster.discard_partial();
        self.restart_capture().await
    }

    /// Start the capture source, retrying a bounded number of times.
    async fn restart_capture(&mut self) -> Result<()> {
        let attempts = self.config.restart_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .capture
                .start(&self.current, Arc::clone(&self.broadcaster))
                .await
            {
                Ok(()) => {
                    self.capturing = true;
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    warn!(attempt, "Capture restart failed, retrying: {:#}", e);
                    tokio::time::sleep(self.config.restart_backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.capturing = false;
                    return Err(e.context(format!(
                        "Capture did not restart after {} attempts",
                        attempts
                    )));
                }
            }
        }
    }

    /// Stop the capture source.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.capturing = false;
        self.capture.stop().await
    }

    /// Tick until cancelled, then stop the capture source.
    ///
    /// A failed restart ends the loop with an error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                result = self.tick() => {
                    if let Err(e) = result {
                        break Err(e);
                    }
                }
            }
        };

        info!("Mode controller shutting down");
        if let Err(e) = self.shutdown().await {
            warn!("Failed to stop capture: {:#}", e);
        }
        result
    }
}
