//! Test utilities for the updater
//!
//! Helpers shared by unit tests and the integration suite:
//! - [`init_test_logging`] wires `tracing` output into the test harness
//! - [`http::TestServer`] is an in-process HTTP server for feed, upgrade-path
//!   and download tests
//! - [`fake::FakeInspector`] stands in for platform signature inspection
//!
//! # Example
//!
//! ```rust,no_run
//! use certdeploy_updater::test_utils::{TestResponse, TestServer, release_feed};
//!
//! # async fn demo() -> std::io::Result<()> {
//! let server = TestServer::start().await?;
//! server.route("/agent.exe", TestResponse::bytes(b"MZ".to_vec()));
//! server.route(
//!     "/releases/latest",
//!     TestResponse::json(&release_feed("v1.3.0", &server.url("/agent.exe"), "")),
//! );
//! # Ok(())
//! # }
//! ```

pub mod fake;
pub mod http;

pub use fake::{FakeInspector, fingerprint_of, test_signer};
pub use http::{TestResponse, TestServer};

use serde_json::json;
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Global flag to ensure logging is only initialized once in tests
static INIT_LOGGING: Once = Once::new();

/// Initialize logging for tests.
///
/// Initializes the tracing subscriber once regardless of how many times it is
/// called. Uses `level` when given, else `RUST_LOG`, else stays silent.
///
/// ```bash
/// RUST_LOG=certdeploy_updater=debug cargo test
/// ```
pub fn init_test_logging(level: Option<Level>) {
    INIT_LOGGING.call_once(|| {
        let filter = if let Some(level) = level {
            EnvFilter::new(level.to_string())
        } else if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            return;
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(false)
            .try_init();
    });
}

/// A single GitHub-style release object with one `.exe` asset.
#[must_use]
pub fn release_feed(tag: &str, download_url: &str, body: &str) -> serde_json::Value {
    json!({
        "tag_name": tag,
        "name": format!("Agent {tag}"),
        "body": body,
        "prerelease": false,
        "draft": false,
        "published_at": "2026-03-01T12:00:00Z",
        "assets": [
            {
                "name": "certdeploy-agent.exe.sha256",
                "size": 64,
                "browser_download_url": format!("{download_url}.sha256"),
                "content_type": "text/plain"
            },
            {
                "name": "certdeploy-agent.exe",
                "size": 4096,
                "browser_download_url": download_url,
                "content_type": "application/octet-stream"
            }
        ]
    })
}
