//! MJPEG streaming over `multipart/x-mixed-replace`
//!
//! Each viewer gets its own [`StreamDispatcher`] task that waits on the
//! broadcaster and pushes encoded parts into a one-slot channel. The response
//! body drains that channel, so a slow connection only ever holds one pending
//! part and skips frames in between.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::{Frame, FrameBroadcaster, Generation};

/// Multipart boundary between images
pub const BOUNDARY: &str = "FRAME";

/// Parts buffered per client before the dispatcher waits on the connection
const CLIENT_QUEUE_DEPTH: usize = 1;

/// Encode one frame as a multipart body part
pub fn encode_part(frame: &Frame) -> Bytes {
    let head = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        frame.len()
    );
    let mut part = BytesMut::with_capacity(head.len() + frame.len() + 2);
    part.put_slice(head.as_bytes());
    part.put_slice(&frame.data);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Number of connected stream viewers
#[derive(Debug, Clone, Default)]
pub struct Viewers(Arc<AtomicUsize>);

impl Viewers {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    fn enter(&self) -> ViewerGuard {
        self.0.fetch_add(1, Ordering::Relaxed);
        ViewerGuard(Arc::clone(&self.0))
    }
}

/// Decrements the viewer count when the dispatcher ends
struct ViewerGuard(Arc<AtomicUsize>);

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Per-client streaming loop
pub struct StreamDispatcher {
    broadcaster: Arc<FrameBroadcaster>,
    peer: SocketAddr,
    last_seen: Generation,
}

impl StreamDispatcher {
    pub fn new(broadcaster: Arc<FrameBroadcaster>, peer: SocketAddr) -> Self {
        Self {
            broadcaster,
            peer,
            last_seen: 0,
        }
    }

    /// Generation of the last frame handed to the client
    pub fn last_seen(&self) -> Generation {
        self.last_seen
    }

    /// Forward frames into `tx` until the client goes away or the
    /// broadcaster closes.
    pub async fn run(&mut self, tx: mpsc::Sender<Bytes>) {
        loop {
            let frame = tokio::select! {
                frame = self.broadcaster.wait(self.last_seen) => frame,
                _ = tx.closed() => {
                    warn!("Removed streaming client {}: connection closed", self.peer);
                    return;
                }
            };
            let Some(frame) = frame else {
                debug!("Stream to {} ended: broadcaster closed", self.peer);
                return;
            };

            let generation = frame.generation;
            if tx.send(encode_part(&frame)).await.is_err() {
                warn!("Removed streaming client {}: send failed", self.peer);
                return;
            }
            self.last_seen = generation;
        }
    }
}

/// Build the streaming response for one viewer and spawn its dispatcher.
pub fn stream_response(
    broadcaster: Arc<FrameBroadcaster>,
    viewers: &Viewers,
    peer: SocketAddr,
) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(CLIENT_QUEUE_DEPTH);
    let guard = viewers.enter();
    info!("Streaming client connected: {} ({} viewers)", peer, viewers.count());

    tokio::spawn(async move {
        let _guard = guard;
        StreamDispatcher::new(broadcaster, peer).run(tx).await;
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut response = (StatusCode::OK, Body::from_stream(stream)).into_response();

    let headers = response.headers_mut();
    headers.insert(header::AGE, HeaderValue::from_static("0"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, private"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("multipart/x-mixed-replace; boundary=FRAME"),
    );
    response
}
