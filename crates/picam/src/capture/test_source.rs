//! Synthetic capture source for development without camera hardware
//!
//! Emits small JPEG-shaped frames (SOI, APP0-like header, counter, EOI) at the
//! configured framerate. Each frame is written as a header chunk followed by
//! a body chunk, the same way a pipe delivers real frames in pieces.

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

use super::{CaptureSettings, CaptureSource};
use crate::FrameBroadcaster;

/// Shortest interval the generator will tick at
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Capture source producing synthetic frames
pub struct TestPatternCapture {
    task: Option<JoinHandle<()>>,
    /// Simulated payload size per frame
    pub frame_size: usize,
}

impl TestPatternCapture {
    pub fn new(frame_size: usize) -> Self {
        Self {
            task: None,
            frame_size,
        }
    }
}

impl Default for TestPatternCapture {
    fn default() -> Self {
        Self::new(10_000) // ~10KB per frame
    }
}

/// Build one synthetic frame split into header and body chunks
pub fn test_frame(frame_num: u32, frame_size: usize) -> (Vec<u8>, Vec<u8>) {
    let mut header = vec![0xFF, 0xD8, 0xFF, 0xE0];
    header.extend_from_slice(&frame_num.to_be_bytes());

    let mut body = Vec::with_capacity(frame_size.max(2));
    while body.len() + 2 < frame_size {
        body.push((frame_num & 0x7F) as u8);
    }
    body.extend_from_slice(&[0xFF, 0xD9]);
    (header, body)
}

#[async_trait::async_trait]
impl CaptureSource for TestPatternCapture {
    async fn start(
        &mut self,
        settings: &CaptureSettings,
        sink: Arc<FrameBroadcaster>,
    ) -> Result<()> {
        if self.task.is_some() {
            bail!("Test source is already running");
        }

        let period = settings.frame_interval().max(MIN_INTERVAL);
        let frame_size = self.frame_size;
        info!("Test source started: {}", settings);

        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut frame_num = 0u32;

            loop {
                ticker.tick().await;
                let (header, body) = test_frame(frame_num, frame_size);
                sink.write(&header);
                sink.write(&body);

                frame_num = frame_num.wrapping_add(1);
                if frame_num % 300 == 0 {
                    debug!("Test source: {} frames generated", frame_num);
                }
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            info!("Test source stopped");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.task.is_some()
    }
}
