//! Mock CDN lifecycle management.
//!
//! Spawns a tiny axum server on a random port with one route per behavior
//! the cache has to survive: valid images, missing content, throttling,
//! garbage bytes, and slow responses. Every handler counts its hits so
//! tests can assert on exact network activity (including zero).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use reqwest::Url;

type Hits = Arc<Mutex<HashMap<String, usize>>>;

/// Mock CDN instance bound to a random localhost port.
pub struct MockCdn {
    pub base_url: String,
    hits: Hits,
}

impl MockCdn {
    /// Spawns the server in a background task. It lives for the duration of
    /// the test process; each test spawns its own instance.
    pub async fn spawn() -> Self {
        let hits: Hits = Arc::new(Mutex::new(HashMap::new()));

        let app = Router::new()
            .route("/png/{id}", get(serve_png))
            .route("/missing/{id}", get(serve_missing))
            .route("/throttle/{id}", get(serve_throttle))
            .route("/garbage/{id}", get(serve_garbage))
            .route("/slow/{id}", get(serve_slow))
            .with_state(hits.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock CDN port");
        let addr = listener.local_addr().expect("Failed to read local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock CDN died");
        });

        Self {
            base_url: format!("http://{}", addr),
            hits,
        }
    }

    /// Absolute URL for a path like "/png/440".
    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("{}{}", self.base_url, path)).expect("invalid test url")
    }

    /// Number of requests that reached `path`.
    pub fn hits(&self, path: &str) -> usize {
        *self.hits.lock().unwrap().get(path).unwrap_or(&0)
    }

    /// Total requests across all routes.
    pub fn total_hits(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }
}

fn record(hits: &Hits, path: &str) {
    *hits.lock().unwrap().entry(path.to_string()).or_insert(0) += 1;
}

/// Valid PNG, correct Content-Type.
async fn serve_png(State(hits): State<Hits>, uri: Uri) -> Response {
    record(&hits, uri.path());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "image/png")],
        super::png_bytes(),
    )
        .into_response()
}

async fn serve_missing(State(hits): State<Hits>, uri: Uri) -> Response {
    record(&hits, uri.path());
    StatusCode::NOT_FOUND.into_response()
}

async fn serve_throttle(State(hits): State<Hits>, uri: Uri) -> Response {
    record(&hits, uri.path());
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, "1")],
        "slow down",
    )
        .into_response()
}

/// 200 with bytes that are not an image; the sniff must reject them.
async fn serve_garbage(State(hits): State<Hits>, uri: Uri) -> Response {
    record(&hits, uri.path());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "image/png")],
        "<html>definitely not a png</html>",
    )
        .into_response()
}

/// Valid PNG after a long delay; used by coalescing and cancellation tests.
async fn serve_slow(State(hits): State<Hits>, uri: Uri) -> Response {
    record(&hits, uri.path());
    let delay = if uri.path().contains("very") {
        Duration::from_secs(5)
    } else {
        Duration::from_millis(300)
    };
    tokio::time::sleep(delay).await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "image/png")],
        super::png_bytes(),
    )
        .into_response()
}
