//! Storage module for persisted snapshots
//!
//! - Snapshot writer: throttled JPEG files from the live stream
//! - Retention: periodic deletion of files past their age limit

pub mod retention;
pub mod snapshot;

pub use retention::{RetentionConfig, RetentionSweeper, SweepStats};
pub use snapshot::{SnapshotConfig, SnapshotWriter};
