//! In-process HTTP fixture server on axum.
//!
//! A single fallback handler answers every path from a route table that tests
//! may change at any time; unknown paths get `404`. Routes are matched on the
//! path without its query string, and each request target is recorded in
//! arrival order with its query in [`TestServer::requests`].

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use futures::stream::{self, Stream, StreamExt};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Chunk size of delayed bodies.
const DELAYED_CHUNK: usize = 64;

/// A canned response.
#[derive(Debug, Clone)]
pub struct TestResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    send_bytes: Option<usize>,
    chunk_delay: Option<Duration>,
}

impl TestResponse {
    /// `200 OK` with a raw body.
    #[must_use]
    pub fn bytes(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type".into(), "application/octet-stream".into())],
            body: body.into(),
            send_bytes: None,
            chunk_delay: None,
        }
    }

    /// `200 OK` with a JSON body.
    #[must_use]
    pub fn json(value: &serde_json::Value) -> Self {
        Self {
            headers: vec![("Content-Type".into(), "application/json".into())],
            ..Self::bytes(value.to_string())
        }
    }

    /// An empty response with `status`.
    #[must_use]
    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::bytes(Vec::new())
        }
    }

    /// Add a response header.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Declare the full length but drop the connection after `sent` bytes.
    #[must_use]
    pub const fn with_truncation(mut self, sent: usize) -> Self {
        self.send_bytes = Some(sent);
        self
    }

    /// Stream the body in small chunks with `delay` before each.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }
}

impl IntoResponse for TestResponse {
    fn into_response(self) -> Response {
        let Self {
            status,
            headers,
            body,
            send_bytes,
            chunk_delay,
        } = self;

        let declared = body.len();
        let body = if send_bytes.is_none() && chunk_delay.is_none() {
            Body::from(body)
        } else {
            Body::from_stream(body_stream(body, send_bytes, chunk_delay))
        };

        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, body).into_response();
        let map = response.headers_mut();
        map.insert(header::CONTENT_LENGTH, HeaderValue::from(declared));
        for (name, value) in headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => tracing::warn!("Skipping invalid test header {name}: {value}"),
            }
        }
        response
    }
}

/// The first `send_bytes` of `body`, delayed per chunk, then an error if cut short.
fn body_stream(
    body: Vec<u8>,
    send_bytes: Option<usize>,
    delay: Option<Duration>,
) -> impl Stream<Item = io::Result<Bytes>> + Send {
    let sent = send_bytes.unwrap_or(body.len()).min(body.len());
    let truncated = sent < body.len();
    let chunk = if delay.is_some() { DELAYED_CHUNK } else { sent.max(1) };
    let chunks: Vec<Bytes> = body[..sent].chunks(chunk).map(Bytes::copy_from_slice).collect();

    stream::iter(chunks)
        .then(move |chunk| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(chunk)
        })
        .chain(stream::iter(
            truncated.then(|| Err(io::Error::new(io::ErrorKind::ConnectionAborted, "truncated"))),
        ))
}

#[derive(Clone, Default)]
struct Shared {
    routes: Arc<Mutex<HashMap<String, TestResponse>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

/// A running test server. Stops when dropped.
pub struct TestServer {
    addr: SocketAddr,
    shared: Shared,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Bind to an ephemeral loopback port and start serving.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shared = Shared::default();

        let app = Router::new().fallback(respond).with_state(shared.clone());
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::debug!("Test server stopped: {e}");
            }
        });

        Ok(Self {
            addr,
            shared,
            handle,
        })
    }

    /// Absolute URL of `path` on this server.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Serve `response` for `path`, replacing any earlier route.
    pub fn route(&self, path: &str, response: TestResponse) {
        lock(&self.shared.routes).insert(path.to_string(), response);
    }

    /// Request targets received so far, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        lock(&self.shared.requests).clone()
    }

    /// How many requests hit `path`, ignoring query strings.
    #[must_use]
    pub fn hits(&self, path: &str) -> usize {
        lock(&self.shared.requests)
            .iter()
            .filter(|target| target.split('?').next() == Some(path))
            .count()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn respond(State(shared): State<Shared>, uri: Uri) -> Response {
    let target = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());
    lock(&shared.requests).push(target);

    let route = lock(&shared.routes).get(uri.path()).cloned();
    match route {
        Some(response) => response.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routes_and_request_log() {
        let server = TestServer::start().await.unwrap();
        server.route("/feed", TestResponse::json(&serde_json::json!({ "ok": true })));

        let client = reqwest::Client::new();
        let ok = client.get(server.url("/feed?channel=beta")).send().await.unwrap();
        assert_eq!(ok.status(), 200);
        assert_eq!(ok.headers()["content-type"], "application/json");
        assert_eq!(ok.text().await.unwrap(), r#"{"ok":true}"#);

        let missing = client.get(server.url("/other")).send().await.unwrap();
        assert_eq!(missing.status(), 404);

        assert_eq!(server.requests(), vec!["/feed?channel=beta".to_string(), "/other".to_string()]);
        assert_eq!(server.hits("/feed"), 1);
    }

    #[tokio::test]
    async fn test_delayed_body_arrives_whole() {
        let server = TestServer::start().await.unwrap();
        let body: Vec<u8> = (0..=255).collect();
        server.route(
            "/slow",
            TestResponse::bytes(body.clone()).with_delay(Duration::from_millis(1)),
        );

        let response = reqwest::get(server.url("/slow")).await.unwrap();
        assert_eq!(response.content_length(), Some(body.len() as u64));
        assert_eq!(response.bytes().await.unwrap().as_ref(), body.as_slice());
    }

    #[tokio::test]
    async fn test_truncated_body_fails_to_read() {
        let server = TestServer::start().await.unwrap();
        server.route("/cut", TestResponse::bytes(vec![7u8; 4096]).with_truncation(100));

        let response = reqwest::get(server.url("/cut")).await.unwrap();
        assert_eq!(response.content_length(), Some(4096));
        assert!(response.bytes().await.is_err());
    }
}
