//! Capture parameters shared by every capture source

use std::fmt;
use std::time::Duration;

/// Automatic exposure control of the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureMode {
    /// Sensor picks shutter and gain
    Auto,
    /// Exposure locked to the configured shutter speed and ISO
    Off,
}

impl fmt::Display for ExposureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExposureMode::Auto => write!(f, "auto"),
            ExposureMode::Off => write!(f, "off"),
        }
    }
}

/// Parameters applied when a capture source starts
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frames per second, fractional for long exposures
    pub framerate: f64,
    /// Shutter speed in microseconds (0 = automatic)
    pub shutter_speed_us: u64,
    /// Sensor sensitivity (0 = automatic)
    pub iso: u32,
    pub exposure_mode: ExposureMode,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 1296,
            height: 972,
            framerate: 32.0,
            shutter_speed_us: 0,
            iso: 0,
            exposure_mode: ExposureMode::Auto,
        }
    }
}

impl CaptureSettings {
    /// Time between two frames, zero when the framerate is not usable
    pub fn frame_interval(&self) -> Duration {
        if self.framerate.is_finite() && self.framerate > 0.0 {
            Duration::from_secs_f64(1.0 / self.framerate)
        } else {
            Duration::ZERO
        }
    }

    /// Analogue gain equivalent of the ISO setting (ISO 100 = gain 1.0)
    pub fn analogue_gain(&self) -> Option<f64> {
        (self.iso > 0).then(|| self.iso as f64 / 100.0)
    }
}

impl fmt::Display for CaptureSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} @ {:.3}fps, shutter {}us, ISO {}, exposure {}",
            self.width,
            self.height,
            self.framerate,
            self.shutter_speed_us,
            self.iso,
            self.exposure_mode
        )
    }
}

/// Long-exposure profile used after sunset
#[derive(Debug, Clone, PartialEq)]
pub struct NightProfile {
    /// One frame every six seconds by default
    pub framerate: f64,
    pub shutter_speed_us: u64,
    pub iso: u32,
    /// Time given to the sensor to converge before exposure is locked
    pub settle: Duration,
}

impl Default for NightProfile {
    fn default() -> Self {
        Self {
            framerate: 1.0 / 6.0,
            shutter_speed_us: 6_000_000,
            iso: 800,
            settle: Duration::from_secs(30),
        }
    }
}

impl NightProfile {
    /// Overwrite framerate, shutter speed and ISO. Exposure mode is left to the
    /// caller, it is locked only after the settle period.
    pub fn apply(&self, settings: &mut CaptureSettings) {
        settings.framerate = self.framerate;
        settings.shutter_speed_us = self.shutter_speed_us;
        settings.iso = self.iso;
    }
}
