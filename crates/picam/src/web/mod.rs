//! Web server module: axum HTTP for browser access.
//!
//! - `GET /`: permanent redirect to `/index.html`
//! - `GET /index.html`: landing page embedding the stream
//! - `GET /stream.mjpg`: live MJPEG stream
//!
//! Every other path or method is a 404.

pub mod mjpeg;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::FrameBroadcaster;

pub use mjpeg::{encode_part, StreamDispatcher, Viewers, BOUNDARY};

/// Shared state for the web server
#[derive(Clone)]
pub struct AppState {
    broadcaster: Arc<FrameBroadcaster>,
    page: Arc<str>,
    viewers: Viewers,
}

impl AppState {
    pub fn new(broadcaster: Arc<FrameBroadcaster>, title: &str) -> Self {
        Self {
            broadcaster,
            page: render_index(title).into(),
            viewers: Viewers::default(),
        }
    }

    /// Connected stream viewers, shared with the handlers
    pub fn viewers(&self) -> Viewers {
        self.viewers.clone()
    }
}

/// Landing page with the stream at half width
pub fn render_index(title: &str) -> String {
    let title = escape_html(title);
    format!(
        "<html>\n<head>\n<title>{title}</title>\n</head>\n<body>\n\
         <center><h1>{title}</h1></center>\n\
         <center><img src=\"stream.mjpg\" width=\"50%\"></center>\n\
         </body>\n</html>\n"
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root).fallback(not_found))
        .route("/index.html", get(index).fallback(not_found))
        .route("/stream.mjpg", get(stream).fallback(not_found))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /: redirect to the landing page
async fn root() -> Response {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, "/index.html")],
    )
        .into_response()
}

/// GET /index.html
async fn index(State(state): State<AppState>) -> Html<String> {
    Html(state.page.to_string())
}

/// GET /stream.mjpg: one dispatcher task per connection
async fn stream(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    mjpeg::stream_response(Arc::clone(&state.broadcaster), &state.viewers, peer)
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Serve on an already bound listener until `cancel` fires.
///
/// Open streams keep the server alive until the broadcaster is closed.
pub async fn serve(listener: TcpListener, state: AppState, cancel: CancellationToken) -> Result<()> {
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Web server error")
}
