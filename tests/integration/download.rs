//! Streaming downloads against the fixture server.

use certdeploy_updater::core::UpgradeError;
use certdeploy_updater::test_utils::{TestResponse, TestServer, init_test_logging};
use certdeploy_updater::upgrade::download::temp_path;
use certdeploy_updater::upgrade::{CancelToken, DownloadProgress, FileDownloader};
use std::time::Duration;
use tempfile::TempDir;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_download_writes_file_and_reports_progress() {
    init_test_logging(None);
    let server = TestServer::start().await.unwrap();
    let body = payload(64 * 1024);
    server.route("/agent.exe", TestResponse::bytes(body.clone()));

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("agent.exe");
    let mut reports: Vec<DownloadProgress> = Vec::new();

    let written = FileDownloader::new()
        .unwrap()
        .download(&server.url("/agent.exe"), &dest, &CancelToken::new(), |p| reports.push(p))
        .await
        .unwrap();

    assert_eq!(written, body.len() as u64);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), body);
    assert!(!temp_path(&dest).exists());

    let last = reports.last().unwrap();
    assert_eq!(last.downloaded, body.len() as u64);
    assert_eq!(last.total, Some(body.len() as u64));
    assert_eq!(last.percent(), Some(100.0));
}

#[tokio::test]
async fn test_download_replaces_existing_destination() {
    let server = TestServer::start().await.unwrap();
    server.route("/agent.exe", TestResponse::bytes(b"new".to_vec()));

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("agent.exe");
    tokio::fs::write(&dest, b"old contents").await.unwrap();

    FileDownloader::new()
        .unwrap()
        .download(&server.url("/agent.exe"), &dest, &CancelToken::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"new");
}

#[tokio::test]
async fn test_truncated_download_leaves_no_file() {
    let server = TestServer::start().await.unwrap();
    server.route("/agent.exe", TestResponse::bytes(payload(8192)).with_truncation(1000));

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("agent.exe");

    let err = FileDownloader::new()
        .unwrap()
        .download(&server.url("/agent.exe"), &dest, &CancelToken::new(), |_| {})
        .await
        .unwrap_err();

    assert!(matches!(err, UpgradeError::Network(_)), "{err:?}");
    assert!(!dest.exists());
    assert!(!temp_path(&dest).exists());
}

#[tokio::test]
async fn test_http_error_status() {
    let server = TestServer::start().await.unwrap();
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("agent.exe");

    let err = FileDownloader::new()
        .unwrap()
        .download(&server.url("/missing.exe"), &dest, &CancelToken::new(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, UpgradeError::Network(_)), "{err:?}");
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_cancel_stops_download() {
    let server = TestServer::start().await.unwrap();
    server.route(
        "/slow.exe",
        TestResponse::bytes(payload(64 * 200)).with_delay(Duration::from_millis(20)),
    );

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("agent.exe");
    let cancel = CancelToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            cancel.cancel();
        })
    };

    let err = FileDownloader::new()
        .unwrap()
        .download(&server.url("/slow.exe"), &dest, &cancel, |_| {})
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, UpgradeError::Cancelled(_)), "{err:?}");
    assert!(!dest.exists());
    assert!(!temp_path(&dest).exists());
}

#[tokio::test]
async fn test_timeout_cancels_download() {
    let server = TestServer::start().await.unwrap();
    server.route(
        "/slow.exe",
        TestResponse::bytes(payload(64 * 200)).with_delay(Duration::from_millis(20)),
    );

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("agent.exe");

    let err = FileDownloader::new()
        .unwrap()
        .with_timeout(Duration::from_millis(200))
        .download(&server.url("/slow.exe"), &dest, &CancelToken::new(), |_| {})
        .await
        .unwrap_err();

    assert!(matches!(err, UpgradeError::Cancelled(_)), "{err:?}");
    assert!(err.is_retryable());
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_plain_http_to_remote_host_is_refused() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("agent.exe");

    let err = FileDownloader::new()
        .unwrap()
        .download("http://downloads.example.com/agent.exe", &dest, &CancelToken::new(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, UpgradeError::Policy(_)), "{err:?}");
    assert!(err.is_policy());
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_redirect_to_insecure_host_is_refused() {
    let server = TestServer::start().await.unwrap();
    server.route(
        "/agent.exe",
        TestResponse::status(302).with_header("Location", "http://downloads.example.com/agent.exe"),
    );

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("agent.exe");

    let err = FileDownloader::new()
        .unwrap()
        .download(&server.url("/agent.exe"), &dest, &CancelToken::new(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, UpgradeError::Network(_)), "{err:?}");
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_redirect_within_loopback_is_followed() {
    let server = TestServer::start().await.unwrap();
    server.route("/v2/agent.exe", TestResponse::bytes(b"moved".to_vec()));
    server.route(
        "/agent.exe",
        TestResponse::status(302).with_header("Location", &server.url("/v2/agent.exe")),
    );

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("agent.exe");

    FileDownloader::new()
        .unwrap()
        .download(&server.url("/agent.exe"), &dest, &CancelToken::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"moved");
    assert_eq!(server.hits("/v2/agent.exe"), 1);
}
