//! Capture module
//!
//! Capture sources push raw MJPEG bytes into the [`FrameBroadcaster`]:
//! - `rpicam-vid` subprocess on a Raspberry Pi camera
//! - Synthetic test pattern for development without hardware (`test-source`)

pub mod rpicam;
pub mod settings;
#[cfg(feature = "test-source")]
pub mod test_source;

use std::sync::Arc;

use anyhow::Result;

use crate::FrameBroadcaster;

pub use rpicam::RpicamCapture;
pub use settings::{CaptureSettings, ExposureMode, NightProfile};
#[cfg(feature = "test-source")]
pub use test_source::TestPatternCapture;

/// A camera that can be started with a set of parameters and stopped again.
///
/// Settings are only read on `start`, so reconfiguring means stop, change
/// the settings, start.
#[async_trait::async_trait]
pub trait CaptureSource: Send {
    /// Start producing MJPEG bytes into `sink`
    async fn start(&mut self, settings: &CaptureSettings, sink: Arc<FrameBroadcaster>)
        -> Result<()>;

    /// Stop producing. Stopping an idle source is not an error.
    async fn stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;
}
