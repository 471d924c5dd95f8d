//! Frame types for the MJPEG pipeline

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};

/// JPEG start-of-image marker. Every frame begins with these two bytes.
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// Monotonic version of a published frame.
///
/// Generation 0 means nothing has been published yet, so consumers start
/// waiting from 0 to receive the first frame.
pub type Generation = u64;

/// One complete JPEG image as published by the broadcaster.
///
/// Cloning is cheap: the payload is reference counted and never mutated
/// after publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Generation assigned when the frame was published
    pub generation: Generation,
    /// Wall-clock time the frame was completed
    pub captured_at: DateTime<Utc>,
    /// JPEG bytes, starting with [`JPEG_SOI`]
    pub data: Bytes,
}

impl Frame {
    /// Size of the encoded image in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Returns true if `chunk` opens a new JPEG image.
pub fn is_frame_start(chunk: &[u8]) -> bool {
    chunk.starts_with(&JPEG_SOI)
}

/// Re-chunks an arbitrary byte stream so every JPEG image starts a new chunk.
///
/// Pipe reads from the capture process land on arbitrary boundaries, while
/// [`FrameBroadcaster::write`](crate::FrameBroadcaster::write) treats a chunk
/// that starts with the SOI marker as the beginning of the next frame.
/// A new image is recognised by `FF D8 FF` (SOI followed by the next marker).
/// The last two bytes of every feed are held back in case a marker straddles
/// two reads.
#[derive(Debug, Default)]
pub struct JpegSplitter {
    pending: BytesMut,
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push raw bytes and return the chunks that are ready to be written.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(data);

        let mut chunks = Vec::new();
        // Position 0 is the image currently being accumulated
        while let Some(pos) = find_image_start(&self.pending, 1) {
            chunks.push(self.pending.split_to(pos).freeze());
        }

        // Hold back a possible partial marker
        if self.pending.len() > JPEG_SOI.len() {
            let ready = self.pending.len() - JPEG_SOI.len();
            chunks.push(self.pending.split_to(ready).freeze());
        }

        chunks
    }

    /// Flush whatever is still buffered (end of stream).
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.split().freeze())
        }
    }
}

fn find_image_start(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < 3 || from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(3)
        .position(|w| w == [0xFF, 0xD8, 0xFF])
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut v = vec![0xFF, 0xD8, 0xFF, 0xE0];
        v.extend_from_slice(body);
        v.extend_from_slice(&[0xFF, 0xD9]);
        v
    }

    #[test]
    fn frame_start_detection() {
        assert!(is_frame_start(&[0xFF, 0xD8, 0x00]));
        assert!(!is_frame_start(&[0xFF]));
        assert!(!is_frame_start(&[0x00, 0xFF, 0xD8]));
    }

    #[test]
    fn splitter_starts_each_image_on_a_new_chunk() {
        let mut stream = jpeg(b"first");
        stream.extend(jpeg(b"second"));
        stream.extend(jpeg(b"third"));

        let mut splitter = JpegSplitter::new();
        let mut chunks = splitter.feed(&stream);
        chunks.extend(splitter.finish());

        let starts = chunks.iter().filter(|c| is_frame_start(c)).count();
        assert_eq!(starts, 3);
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(joined, stream);
    }

    #[test]
    fn splitter_handles_marker_across_reads() {
        let first = jpeg(b"aaaa");
        let second = jpeg(b"bbbb");
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        // Cut right after 0xFF of the second SOI
        let cut = first.len() + 1;
        let mut splitter = JpegSplitter::new();
        let mut chunks = splitter.feed(&stream[..cut]);
        chunks.extend(splitter.feed(&stream[cut..]));
        chunks.extend(splitter.finish());

        let frame_starts: Vec<&Bytes> = chunks.iter().filter(|c| is_frame_start(c)).collect();
        assert_eq!(frame_starts.len(), 2);
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(joined, stream);
    }

    #[test]
    fn splitter_small_feed_is_buffered() {
        let mut splitter = JpegSplitter::new();
        assert!(splitter.feed(&[0xFF, 0xD8]).is_empty());
        assert_eq!(splitter.finish().unwrap().as_ref(), &[0xFF, 0xD8]);
        assert!(splitter.finish().is_none());
    }
}
