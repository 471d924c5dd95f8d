//! Snapshot persistence
//!
//! Writes throttled copies of published frames to a directory, one JPEG per
//! file, named by local capture time so a plain directory listing is in
//! chronological order.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::frame::Frame;

/// Queue depth between the broadcaster and the writer task
pub const SNAPSHOT_QUEUE_DEPTH: usize = 8;

const FILE_TIME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S%.6f";

/// Configuration for snapshot persistence
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Directory receiving `<timestamp>.jpg` files
    pub dir: PathBuf,
    /// Channel capacity; snapshots beyond it are dropped
    pub queue_depth: usize,
}

impl SnapshotConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            queue_depth: SNAPSHOT_QUEUE_DEPTH,
        }
    }
}

/// Background writer fed by the frame broadcaster
pub struct SnapshotWriter {
    dir: PathBuf,
    rx: mpsc::Receiver<Frame>,
    written: u64,
}

impl SnapshotWriter {
    /// Create the snapshot directory and the channel feeding the writer.
    ///
    /// Hand the sender to
    /// [`FrameBroadcaster::attach_snapshots`](crate::FrameBroadcaster::attach_snapshots).
    pub fn new(config: SnapshotConfig) -> Result<(Self, mpsc::Sender<Frame>)> {
        std::fs::create_dir_all(&config.dir).with_context(|| {
            format!("Failed to create snapshot directory: {:?}", config.dir)
        })?;

        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        Ok((
            Self {
                dir: config.dir,
                rx,
                written: 0,
            },
            tx,
        ))
    }

    /// Write snapshots until every sender is dropped.
    ///
    /// Returns the number of files written.
    pub async fn run(mut self) -> u64 {
        info!("Saving snapshots to {:?}", self.dir);
        while let Some(frame) = self.rx.recv().await {
            match write_snapshot(&self.dir, &frame).await {
                Ok(path) => {
                    self.written += 1;
                    debug!(generation = frame.generation, "Saved snapshot {:?}", path);
                }
                Err(e) => warn!("Failed to save snapshot: {:#}", e),
            }
        }
        info!("Snapshot writer stopped after {} files", self.written);
        self.written
    }
}

/// File name for a frame: local capture time plus `.jpg`
pub fn snapshot_file_name(frame: &Frame) -> String {
    format!(
        "{}.jpg",
        frame.captured_at.with_timezone(&Local).format(FILE_TIME_FORMAT)
    )
}

async fn write_snapshot(dir: &Path, frame: &Frame) -> Result<PathBuf> {
    let path = dir.join(snapshot_file_name(frame));
    tokio::fs::write(&path, &frame.data)
        .await
        .with_context(|| format!("Failed to write {:?}", path))?;
    Ok(path)
}
