//! picam - MJPEG camera streaming with day/night exposure switching
//!
//! - **Broadcast**: single-writer, many-reader latest-frame buffer
//! - **`capture`**: `rpicam-vid` subprocess and the synthetic `test-source`
//! - **`mode`**: day/night controller driven by cached sunrise/sunset times
//! - **`storage`**: throttled snapshot files and age-based retention
//! - **`web`**: axum router serving the landing page and the MJPEG stream

mod broadcast;
mod frame;

pub use broadcast::{BroadcastStats, FrameBroadcaster};
pub use frame::{is_frame_start, Frame, Generation, JpegSplitter, JPEG_SOI};

pub mod capture;
pub mod mode;
pub mod storage;
pub mod web;
