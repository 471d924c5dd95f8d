//! Latest-frame broadcaster between the capture producer and HTTP viewers
//!
//! A single producer pushes raw MJPEG chunks through [`FrameBroadcaster::write`].
//! Whenever a chunk opens a new image, the bytes accumulated since the previous
//! marker are published as a [`Frame`] with the next [`Generation`], and every
//! waiting consumer is woken. Consumers call [`FrameBroadcaster::wait`] with the
//! last generation they have seen; slow consumers simply skip to the newest
//! frame, there is no per-consumer queue.
//!
//! Publication goes through a `tokio::sync::watch` channel, whose lock is held
//! only for the swap. Accumulation and snapshot throttling sit behind a separate
//! mutex that only the producer touches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::frame::{is_frame_start, Frame, Generation};

/// Counters exposed for the periodic stats line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_published: u64,
    pub snapshots_queued: u64,
    pub snapshots_dropped: u64,
}

#[derive(Debug, Default)]
struct Published {
    frame: Option<Frame>,
    generation: Generation,
    closed: bool,
}

struct WriterState {
    buffer: BytesMut,
    suspended: bool,
    snapshot_interval: Duration,
    last_snapshot: Option<Instant>,
    snapshots: Option<mpsc::Sender<Frame>>,
}

/// Single-writer, multi-reader holder of the latest complete JPEG frame.
pub struct FrameBroadcaster {
    published: watch::Sender<Published>,
    writer: Mutex<WriterState>,
    snapshots_queued: AtomicU64,
    snapshots_dropped: AtomicU64,
}

impl FrameBroadcaster {
    /// Create a broadcaster. `snapshot_interval` throttles persisted snapshots
    /// (normally the capture frame interval).
    pub fn new(snapshot_interval: Duration) -> Self {
        let (published, _) = watch::channel(Published::default());
        Self {
            published,
            writer: Mutex::new(WriterState {
                buffer: BytesMut::new(),
                suspended: false,
                snapshot_interval,
                last_snapshot: None,
                snapshots: None,
            }),
            snapshots_queued: AtomicU64::new(0),
            snapshots_dropped: AtomicU64::new(0),
        }
    }

    /// Route throttled copies of published frames to a snapshot writer.
    pub fn attach_snapshots(&self, tx: mpsc::Sender<Frame>) {
        self.lock_writer().snapshots = Some(tx);
    }

    /// Feed raw bytes from the capture source.
    ///
    /// A chunk starting with the JPEG SOI marker finalizes the bytes gathered
    /// since the previous marker as a frame. Bytes seen before the first
    /// marker are dropped since they cannot form a decodable image.
    pub fn write(&self, chunk: &[u8]) {
        let mut guard = self.lock_writer();
        let writer = &mut *guard;

        if is_frame_start(chunk) {
            if is_frame_start(&writer.buffer) {
                let data = writer.buffer.split().freeze();
                if let Some(frame) = self.publish(data) {
                    self.queue_snapshot(writer, &frame);
                }
            } else if !writer.buffer.is_empty() {
                debug!(bytes = writer.buffer.len(), "Discarding data without frame marker");
                writer.buffer.clear();
            }
            writer.buffer.extend_from_slice(chunk);
        } else if writer.buffer.is_empty() {
            trace!(bytes = chunk.len(), "Skipping bytes before first frame marker");
        } else {
            writer.buffer.extend_from_slice(chunk);
        }
    }

    fn publish(&self, data: Bytes) -> Option<Frame> {
        let mut published = None;
        self.published.send_if_modified(|state| {
            if state.closed {
                return false;
            }
            state.generation += 1;
            let frame = Frame {
                generation: state.generation,
                captured_at: Utc::now(),
                data,
            };
            state.frame = Some(frame.clone());
            published = Some(frame);
            true
        });

        if let Some(ref frame) = published {
            trace!(generation = frame.generation, bytes = frame.len(), "Frame published");
        }
        published
    }

    fn queue_snapshot(&self, writer: &mut WriterState, frame: &Frame) {
        if writer.suspended {
            return;
        }
        let Some(tx) = writer.snapshots.as_ref() else {
            return;
        };

        let now = Instant::now();
        if let Some(last) = writer.last_snapshot {
            if now.duration_since(last) < writer.snapshot_interval {
                return;
            }
        }

        match tx.try_send(frame.clone()) {
            Ok(()) => {
                writer.last_snapshot = Some(now);
                self.snapshots_queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.snapshots_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(generation = frame.generation, "Snapshot writer busy, dropping snapshot");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Snapshot writer stopped, disabling snapshots");
                writer.snapshots = None;
            }
        }
    }

    /// Wait until a frame newer than `last_seen` is available.
    ///
    /// Returns `None` once the broadcaster has been closed.
    pub async fn wait(&self, last_seen: Generation) -> Option<Frame> {
        let mut rx = self.published.subscribe();
        let state = rx
            .wait_for(|s| s.closed || s.generation > last_seen)
            .await
            .ok()?;
        if state.closed {
            None
        } else {
            state.frame.clone()
        }
    }

    /// Most recently published frame, if any
    pub fn latest(&self) -> Option<Frame> {
        self.published.borrow().frame.clone()
    }

    pub fn generation(&self) -> Generation {
        self.published.borrow().generation
    }

    /// Stop persisting snapshots. Frames keep flowing to viewers.
    pub fn suspend(&self) {
        self.lock_writer().suspended = true;
        debug!("Snapshots suspended");
    }

    pub fn resume(&self) {
        self.lock_writer().suspended = false;
        debug!("Snapshots resumed");
    }

    pub fn is_suspended(&self) -> bool {
        self.lock_writer().suspended
    }

    /// Update the minimum spacing between persisted snapshots.
    pub fn set_snapshot_interval(&self, interval: Duration) {
        self.lock_writer().snapshot_interval = interval;
    }

    /// Drop the image being accumulated.
    ///
    /// Called once a producer is gone: its unfinished image must not be
    /// published when the next producer writes its first marker. Returns the
    /// number of bytes dropped.
    pub fn discard_partial(&self) -> usize {
        let mut writer = self.lock_writer();
        let dropped = writer.buffer.len();
        writer.buffer.clear();
        if dropped > 0 {
            debug!(bytes = dropped, "Discarded unfinished frame");
        }
        dropped
    }

    /// Wake every waiter with `None` and detach the snapshot writer.
    pub fn close(&self) {
        self.published.send_modify(|state| state.closed = true);
        let mut writer = self.lock_writer();
        writer.snapshots = None;
        writer.buffer.clear();
        debug!("Frame broadcaster closed");
    }

    pub fn is_closed(&self) -> bool {
        self.published.borrow().closed
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_published: self.generation(),
            snapshots_queued: self.snapshots_queued.load(Ordering::Relaxed),
            snapshots_dropped: self.snapshots_dropped.load(Ordering::Relaxed),
        }
    }

    fn lock_writer(&self) -> MutexGuard<'_, WriterState> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
