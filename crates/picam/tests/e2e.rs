//! E2E tests for the HTTP surface
//!
//! Runs the real router on an ephemeral port and talks to it with reqwest:
//!
//! - Broadcaster → StreamDispatcher → multipart response → HTTP client
//! - Landing page, redirect and 404 handling
//!
//! Run: `cargo test -p picam --test e2e`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use picam::web::{self, AppState, Viewers};
use picam::FrameBroadcaster;

// ── Helpers ──────────────────────────────────────────────────────────

struct TestServer {
    addr: SocketAddr,
    broadcaster: Arc<FrameBroadcaster>,
    viewers: Viewers,
    cancel: CancellationToken,
}

impl TestServer {
    async fn start() -> Self {
        let broadcaster = Arc::new(FrameBroadcaster::new(Duration::ZERO));
        let state = AppState::new(Arc::clone(&broadcaster), "test camera");
        let viewers = state.viewers();
        let cancel = CancellationToken::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(web::serve(listener, state, cancel.clone()));

        Self {
            addr,
            broadcaster,
            viewers,
            cancel,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Write one JPEG-looking image into the broadcaster
    fn push(&self, body: &[u8]) {
        let mut chunk = vec![0xFF, 0xD8];
        chunk.extend_from_slice(body);
        self.broadcaster.write(&chunk);
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.broadcaster.close();
        self.cancel.cancel();
    }
}

fn expected_part(body: &[u8]) -> Vec<u8> {
    let mut part = format!(
        "--FRAME\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        body.len() + 2
    )
    .into_bytes();
    part.extend_from_slice(&[0xFF, 0xD8]);
    part.extend_from_slice(body);
    part.extend_from_slice(b"\r\n");
    part
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Read the response body until `needle` shows up
async fn read_until(resp: &mut reqwest::Response, buf: &mut BytesMut, needle: &[u8]) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !contains(buf, needle) {
            let chunk = resp
                .chunk()
                .await
                .expect("stream read failed")
                .expect("stream ended early");
            buf.extend_from_slice(&chunk);
        }
    })
    .await
    .expect("timed out waiting for stream data");
}

// ── Routes ───────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_path_is_404() {
    let server = TestServer::start().await;
    let resp = reqwest::get(server.url("/unknown-path")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn other_methods_on_known_paths_are_404() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    for path in ["/", "/index.html", "/stream.mjpg"] {
        let resp = client.post(server.url(path)).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND, "POST {}", path);
    }
    let resp = client.delete(server.url("/index.html")).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn root_redirects_to_index() {
    let server = TestServer::start().await;
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    let resp = client.get(server.url("/")).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::MOVED_PERMANENTLY);
    assert_eq!(resp.headers()["location"], "/index.html");
}

#[tokio::test]
async fn index_page_embeds_stream() {
    let server = TestServer::start().await;
    let resp = reqwest::get(server.url("/index.html")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/html"));

    let body = resp.text().await.unwrap();
    assert!(body.contains("<title>test camera</title>"));
    assert!(body.contains("<img src=\"stream.mjpg\""));
}

// ── Streaming ────────────────────────────────────────────────────────

#[tokio::test]
async fn stream_delivers_multipart_frames() {
    let server = TestServer::start().await;
    server.push(b"AAA");
    server.push(b"BBB");

    let mut resp = reqwest::get(server.url("/stream.mjpg")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let headers = resp.headers();
    assert_eq!(
        headers["content-type"],
        "multipart/x-mixed-replace; boundary=FRAME"
    );
    assert_eq!(headers["age"], "0");
    assert_eq!(headers["cache-control"], "no-cache, private");
    assert_eq!(headers["pragma"], "no-cache");

    let mut buf = BytesMut::new();
    read_until(&mut resp, &mut buf, &expected_part(b"AAA")).await;
    assert!(buf.starts_with(b"--FRAME\r\n"));

    server.push(b"CCC");
    read_until(&mut resp, &mut buf, &expected_part(b"BBB")).await;
}

#[tokio::test]
async fn one_client_leaving_does_not_affect_another() {
    let server = TestServer::start().await;
    server.push(b"first");
    server.push(b"second");

    let mut a = reqwest::get(server.url("/stream.mjpg")).await.unwrap();
    let mut b = reqwest::get(server.url("/stream.mjpg")).await.unwrap();
    let (mut buf_a, mut buf_b) = (BytesMut::new(), BytesMut::new());
    read_until(&mut a, &mut buf_a, &expected_part(b"first")).await;
    read_until(&mut b, &mut buf_b, &expected_part(b"first")).await;
    assert_eq!(server.viewers.count(), 2);

    drop(a);

    // The server notices the disconnect on its next writes to that client
    let mut n = 0u32;
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.viewers.count() > 1 {
            server.push(format!("frame-{n}").as_bytes());
            n += 1;
            let chunk = b.chunk().await.unwrap().unwrap();
            buf_b.extend_from_slice(&chunk);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("disconnected client was never removed");

    server.push(b"after");
    server.push(b"later");
    read_until(&mut b, &mut buf_b, &expected_part(b"after")).await;
}

#[tokio::test]
async fn closing_the_broadcaster_ends_streams() {
    let server = TestServer::start().await;
    server.push(b"AAA");
    server.push(b"BBB");

    let mut resp = reqwest::get(server.url("/stream.mjpg")).await.unwrap();
    let mut buf = BytesMut::new();
    read_until(&mut resp, &mut buf, &expected_part(b"AAA")).await;

    server.broadcaster.close();
    let rest = tokio::time::timeout(Duration::from_secs(5), async {
        let mut rest = Vec::new();
        while let Some(chunk) = resp.chunk().await.unwrap() {
            rest.extend_from_slice(&chunk);
        }
        rest
    })
    .await
    .expect("stream did not end after close");
    assert!(rest.is_empty());
}
