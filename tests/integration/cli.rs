//! The `upgrade` command run as a subprocess.
//!
//! The fixture server runs on the multi-threaded runtime so it keeps serving
//! while the test thread blocks on the child process.

use assert_cmd::Command;
use certdeploy_updater::config::{AgentConfig, CONFIG_PATH_ENV, Channel, UpgradeConfig};
use certdeploy_updater::test_utils::{TestResponse, TestServer, release_feed};
use predicates::prelude::*;
use serial_test::serial;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Fixture {
    temp: TempDir,
    server: TestServer,
    config: PathBuf,
    exe: PathBuf,
}

impl Fixture {
    async fn new(tag: &str, binary: &[u8]) -> Self {
        let temp = TempDir::new().unwrap();
        let server = TestServer::start().await.unwrap();
        server.route("/agent.exe", TestResponse::bytes(binary.to_vec()));
        server.route(
            "/releases/latest",
            TestResponse::json(&release_feed(tag, &server.url("/agent.exe"), "Fixes renewal retries.")),
        );

        let config = temp.path().join("config.toml");
        let upgrade = UpgradeConfig {
            release_url: server.url("/releases/latest"),
            ..UpgradeConfig::default()
        };
        std::fs::write(
            &config,
            format!(
                "[agent]\nserver = \"https://deploy.example.com\"\n\n{}",
                toml_upgrade_table(&upgrade)
            ),
        )
        .unwrap();

        let exe = temp.path().join("certdeploy-agent.exe");
        std::fs::write(&exe, b"agent 1.0.0").unwrap();

        Self {
            temp,
            server,
            config,
            exe,
        }
    }

    fn cmd(&self, current: &str) -> Command {
        let mut cmd = Command::cargo_bin("certdeploy-updater").unwrap();
        cmd.env_remove(CONFIG_PATH_ENV)
            .env("NO_COLOR", "1")
            .arg("--no-progress")
            .arg("--config")
            .arg(&self.config)
            .arg("upgrade")
            .arg("--executable")
            .arg(&self.exe)
            .arg("--current-version")
            .arg(current);
        cmd
    }

    fn saved(&self) -> UpgradeConfig {
        read_upgrade(&self.config)
    }
}

fn toml_upgrade_table(config: &UpgradeConfig) -> String {
    format!(
        "[upgrade]\nrelease_url = \"{}\"\nchannel = \"{}\"\n",
        config.release_url, config.channel
    )
}

fn read_upgrade(path: &Path) -> UpgradeConfig {
    let text = std::fs::read_to_string(path).unwrap();
    let agent: AgentConfig = toml::from_str(&text).unwrap();
    agent.upgrade
}

#[tokio::test(flavor = "multi_thread")]
async fn test_check_reports_available_update() {
    let fixture = Fixture::new("v1.1.0", b"unused").await;

    fixture
        .cmd("1.0.0")
        .arg("--check")
        .assert()
        .success()
        .stdout(predicate::str::contains("Update available: 1.0.0 -> 1.1.0"))
        .stdout(predicate::str::contains("Fixes renewal retries."));

    assert!(fixture.saved().last_check.is_some());
    assert_eq!(fixture.server.hits("/agent.exe"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_check_when_up_to_date() {
    let fixture = Fixture::new("v1.1.0", b"unused").await;

    fixture
        .cmd("1.1.0")
        .arg("--check")
        .assert()
        .success()
        .stdout(predicate::str::contains("latest version (1.1.0)"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_skip_is_persisted_and_honored() {
    let fixture = Fixture::new("v1.1.0", b"unused").await;

    fixture
        .cmd("1.0.0")
        .args(["--skip", "1.1.0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1.1.0 will not be offered again"));

    let saved = fixture.saved();
    assert_eq!(saved.skipped_version.as_deref(), Some("1.1.0"));
    let text = std::fs::read_to_string(&fixture.config).unwrap();
    assert!(text.contains("deploy.example.com"), "other tables are preserved");

    fixture
        .cmd("1.0.0")
        .arg("--check")
        .assert()
        .success()
        .stdout(predicate::str::contains("latest version"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_channel_switch_is_persisted() {
    let fixture = Fixture::new("v1.1.0", b"unused").await;

    fixture
        .cmd("1.0.0")
        .args(["--status", "--channel", "beta"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Channel: beta"));

    assert_eq!(fixture.saved().channel, Channel::Beta);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_status_without_backup() {
    let fixture = Fixture::new("v1.1.0", b"unused").await;

    fixture
        .cmd("1.0.0")
        .arg("--status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Installed version: 1.0.0"))
        .stdout(predicate::str::contains("Last check: never"))
        .stdout(predicate::str::contains("Rollback available: none"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unsigned_download_is_not_installed() {
    let fixture = Fixture::new("v1.1.0", b"definitely not a signed executable").await;

    fixture
        .cmd("1.0.0")
        .arg("--yes")
        .assert()
        .failure()
        .stderr(predicate::str::contains("signature verification failed"))
        .stderr(predicate::str::contains("suggestion"));

    assert_eq!(std::fs::read(&fixture.exe).unwrap(), b"agent 1.0.0");
    assert!(!fixture.temp.path().join("backup").exists());
    assert_eq!(fixture.server.hits("/agent.exe"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_declined_prompt_installs_nothing() {
    let fixture = Fixture::new("v1.1.0", b"unused").await;

    fixture
        .cmd("1.0.0")
        .write_stdin("n\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Upgrade cancelled."));

    assert_eq!(fixture.server.hits("/agent.exe"), 0);
    assert_eq!(std::fs::read(&fixture.exe).unwrap(), b"agent 1.0.0");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rollback_without_backup_fails() {
    let fixture = Fixture::new("v1.1.0", b"unused").await;

    fixture
        .cmd("1.0.0")
        .arg("--rollback")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no backup to restore"));
}

#[test]
#[serial]
fn test_config_path_from_environment() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("agent.toml");

    unsafe {
        std::env::set_var(CONFIG_PATH_ENV, &path);
    }
    let resolved = AgentConfig::default_path();
    unsafe {
        std::env::remove_var(CONFIG_PATH_ENV);
    }

    assert_eq!(resolved.unwrap(), path);
}

#[test]
#[serial]
fn test_empty_config_path_falls_back_to_platform_dir() {
    unsafe {
        std::env::set_var(CONFIG_PATH_ENV, "");
    }
    let resolved = AgentConfig::default_path();
    unsafe {
        std::env::remove_var(CONFIG_PATH_ENV);
    }

    if let Ok(path) = resolved {
        assert!(path.ends_with(Path::new("certdeploy").join("config.toml")));
    }
}
