//! Release feed and upgrade-path service behavior.

use certdeploy_updater::config::Channel;
use certdeploy_updater::core::UpgradeError;
use certdeploy_updater::test_utils::{TestResponse, TestServer, init_test_logging, release_feed};
use certdeploy_updater::upgrade::ReleaseChecker;
use serde_json::json;

async fn server_with_feed(feed: serde_json::Value) -> (TestServer, ReleaseChecker) {
    init_test_logging(None);
    let server = TestServer::start().await.unwrap();
    server.route("/repos/certdeploy/agent/releases", TestResponse::json(&feed));
    let checker = ReleaseChecker::new(server.url("/repos/certdeploy/agent/releases")).unwrap();
    (server, checker)
}

fn release(tag: &str, prerelease: bool, draft: bool) -> serde_json::Value {
    let mut value = release_feed(tag, &format!("https://downloads.example.com/{tag}/agent.exe"), "");
    value["prerelease"] = json!(prerelease);
    value["draft"] = json!(draft);
    value
}

#[tokio::test]
async fn test_stable_channel_picks_newest_stable_release() {
    let (_server, checker) = server_with_feed(json!([
        release("v1.2.0", false, false),
        release("v1.4.0-beta.1", true, false),
        release("v1.3.0", false, false),
        release("v1.5.0", false, true),
    ]))
    .await;

    let info = checker.check_update(Channel::Stable, "1.1.0", None).await.unwrap().unwrap();
    assert_eq!(info.version, "1.3.0");
    assert_eq!(info.channel, Channel::Stable);
    assert_eq!(info.asset_name, "certdeploy-agent.exe");
    assert_eq!(info.download_url, "https://downloads.example.com/v1.3.0/agent.exe");
    assert_eq!(info.file_size, 4096);
    assert!(info.release_date.is_some());
}

#[tokio::test]
async fn test_beta_channel_includes_prereleases() {
    let (_server, checker) = server_with_feed(json!([
        release("v1.3.0", false, false),
        release("v1.4.0-beta.1", true, false),
    ]))
    .await;

    let info = checker.check_update(Channel::Beta, "1.3.0", None).await.unwrap().unwrap();
    assert_eq!(info.version, "1.4.0-beta.1");
    assert_eq!(info.channel, Channel::Beta);
}

#[tokio::test]
async fn test_not_newer_and_skipped_releases_are_ignored() {
    let (_server, checker) = server_with_feed(release("v2.0.0", false, false)).await;

    assert!(checker.check_update(Channel::Stable, "2.0.0", None).await.unwrap().is_none());
    assert!(checker.check_update(Channel::Stable, "2.1", None).await.unwrap().is_none());
    assert!(
        checker
            .check_update(Channel::Stable, "1.0.0", Some("v2.0.0"))
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        checker
            .check_update(Channel::Stable, "1.0.0", Some("1.9.0"))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_metadata_is_extracted_from_release_notes() {
    let mut feed = release("v3.0.0", false, false);
    feed["body"] = json!(
        "## Changes\n&lt;!-- metadata: min_version=2.5.0; fingerprints=AA:BB, CC --&gt;\n- New store layout"
    );
    let (_server, checker) = server_with_feed(feed).await;

    let info = checker.check_update(Channel::Stable, "2.0.0", None).await.unwrap().unwrap();
    assert_eq!(info.min_version.as_deref(), Some("2.5.0"));
    assert_eq!(info.fingerprints, vec!["AA:BB", "CC"]);
    assert_eq!(info.release_notes, "## Changes\n- New store layout");
}

#[tokio::test]
async fn test_release_without_executable_asset_is_a_format_error() {
    let mut feed = release("v2.0.0", false, false);
    feed["assets"] = json!([{ "name": "agent.msi", "size": 1, "browser_download_url": "https://x/agent.msi" }]);
    let (_server, checker) = server_with_feed(feed).await;

    let err = checker.check_update(Channel::Stable, "1.0.0", None).await.unwrap_err();
    assert!(matches!(err, UpgradeError::Format(_)), "{err:?}");
}

#[tokio::test]
async fn test_feed_errors() {
    let server = TestServer::start().await.unwrap();
    server.route("/broken", TestResponse::bytes("{ not json"));
    server.route("/down", TestResponse::status(503));
    server.route("/huge", TestResponse::bytes(vec![b' '; 2 * 1024 * 1024]));

    let err = ReleaseChecker::new(server.url("/broken"))
        .unwrap()
        .check_update(Channel::Stable, "1.0.0", None)
        .await
        .unwrap_err();
    assert!(matches!(err, UpgradeError::Format(_)), "{err:?}");

    let err = ReleaseChecker::new(server.url("/down"))
        .unwrap()
        .check_update(Channel::Stable, "1.0.0", None)
        .await
        .unwrap_err();
    assert!(matches!(err, UpgradeError::Network(_)), "{err:?}");
    assert!(err.is_retryable());

    let err = ReleaseChecker::new(server.url("/huge"))
        .unwrap()
        .check_update(Channel::Stable, "1.0.0", None)
        .await
        .unwrap_err();
    assert!(matches!(err, UpgradeError::Format(_)), "{err:?}");
}

#[tokio::test]
async fn test_upgrade_path_is_derived_from_release_url() {
    let server = TestServer::start().await.unwrap();
    server.route(
        "/repos/certdeploy/agent/upgrade-path",
        TestResponse::json(&json!({
            "steps": [
                { "version": "1.5.0", "download_url": "https://x/1.5.0.exe", "file_size": 10, "fingerprints": "AA, BB" },
                { "version": "2.0.0", "download_url": "https://x/2.0.0.exe", "file_size": 12, "fingerprints": ["CC"] }
            ]
        })),
    );
    let checker = ReleaseChecker::new(server.url("/repos/certdeploy/agent/releases/latest")).unwrap();
    assert_eq!(checker.upgrade_path_base().unwrap(), server.url("/repos/certdeploy/agent"));

    let path = checker.get_upgrade_path("1.0.0", "2.0.0").await.unwrap().unwrap();
    assert_eq!(path.from, "1.0.0");
    assert_eq!(path.to, "2.0.0");
    assert_eq!(path.len(), 2);
    assert_eq!(path.steps[0].fingerprints, vec!["AA", "BB"]);
    assert_eq!(path.steps[1].fingerprints, vec!["CC"]);
    assert_eq!(
        server.requests(),
        vec!["/repos/certdeploy/agent/upgrade-path?from=1.0.0&to=2.0.0".to_string()]
    );
}

#[tokio::test]
async fn test_missing_or_empty_upgrade_path() {
    let server = TestServer::start().await.unwrap();
    let checker = ReleaseChecker::new(server.url("/feed/releases"))
        .unwrap()
        .with_upgrade_path_url(Some(server.url("/paths/")));

    assert!(checker.get_upgrade_path("1.0.0", "2.0.0").await.unwrap().is_none());

    server.route("/paths/upgrade-path", TestResponse::json(&json!({ "steps": [] })));
    assert!(checker.get_upgrade_path("1.0.0", "2.0.0").await.unwrap().is_none());
}

#[tokio::test]
async fn test_upgrade_path_must_increase() {
    let server = TestServer::start().await.unwrap();
    server.route(
        "/api/upgrade-path",
        TestResponse::json(&json!({
            "steps": [
                { "version": "1.5.0", "download_url": "https://x/1.5.0.exe" },
                { "version": "1.4.0", "download_url": "https://x/1.4.0.exe" }
            ]
        })),
    );
    let checker = ReleaseChecker::new(server.url("/feed"))
        .unwrap()
        .with_upgrade_path_url(Some(server.url("/api")));

    let err = checker.get_upgrade_path("1.0.0", "2.0.0").await.unwrap_err();
    assert!(matches!(err, UpgradeError::Format(_)), "{err:?}");
}
