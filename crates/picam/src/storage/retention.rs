//! Age-based retention for saved snapshots

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retention configuration
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Directory swept recursively
    pub dir: PathBuf,
    /// Files last modified longer ago than this are deleted
    pub max_age: Duration,
    /// Time between sweeps
    pub interval: Duration,
}

impl RetentionConfig {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
            interval: Duration::from_secs(60),
        }
    }
}

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub files_deleted: u64,
    pub bytes_deleted: u64,
    pub files_kept: u64,
}

/// Periodically deletes snapshot files older than the retention limit.
pub struct RetentionSweeper {
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(config: RetentionConfig) -> Self {
        Self { config }
    }

    /// Sweep once, judging file age against `now`.
    pub async fn sweep_at(&self, now: SystemTime) -> Result<SweepStats> {
        let dir = self.config.dir.clone();
        let max_age = self.config.max_age;
        tokio::task::spawn_blocking(move || sweep_dir(&dir, now, max_age))
            .await
            .context("Retention sweep task panicked")?
    }

    pub async fn sweep(&self) -> Result<SweepStats> {
        self.sweep_at(SystemTime::now()).await
    }

    /// Sweep on every interval tick until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Retention: deleting files in {:?} older than {}h",
            self.config.dir,
            self.config.max_age.as_secs() / 3600
        );
        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    debug!("Checking for files to delete");
                    match self.sweep().await {
                        Ok(stats) if stats.files_deleted > 0 => {
                            info!(
                                "Retention: removed {} files ({} bytes)",
                                stats.files_deleted, stats.bytes_deleted
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Retention sweep failed: {:#}", e),
                    }
                }
            }
        }
    }
}

fn sweep_dir(dir: &Path, now: SystemTime, max_age: Duration) -> Result<SweepStats> {
    let mut stats = SweepStats::default();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current)
            .with_context(|| format!("Failed to read directory {:?}", current))?;

        for entry in entries.flatten() {
            let path = entry.path();
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("Cannot stat {:?}: {}", path, e);
                    continue;
                }
            };

            if metadata.is_dir() {
                pending.push(path);
                continue;
            }

            let modified = match metadata.modified() {
                Ok(t) => t,
                Err(e) => {
                    warn!("No modification time for {:?}: {}", path, e);
                    continue;
                }
            };

            // Files from the future (clock skew) count as fresh
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= max_age {
                stats.files_kept += 1;
                continue;
            }

            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!("File {:?} too old, deleted", path);
                    stats.files_deleted += 1;
                    stats.bytes_deleted += metadata.len();
                }
                Err(e) => warn!("Failed to delete {:?}: {}", path, e),
            }
        }
    }

    Ok(stats)
}
