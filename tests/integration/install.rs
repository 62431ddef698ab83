//! Executable replacement, backups and the install lock.

use certdeploy_updater::core::UpgradeError;
use certdeploy_updater::upgrade::{BackupStore, RetryPolicy, SelfUpdater, UpgradeLock};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::fs;

struct Install {
    _temp: TempDir,
    exe: PathBuf,
    dir: PathBuf,
}

async fn install(contents: &[u8]) -> Install {
    let temp = TempDir::new().unwrap();
    let dir = fs::canonicalize(temp.path()).await.unwrap();
    let exe = dir.join("certdeploy-agent.exe");
    fs::write(&exe, contents).await.unwrap();
    Install { _temp: temp, exe, dir }
}

async fn stage(install: &Install, version: &str) -> PathBuf {
    let staged = install.dir.join(format!("staged-{version}.exe"));
    fs::write(&staged, format!("agent {version}")).await.unwrap();
    staged
}

#[tokio::test]
async fn test_successive_upgrades_keep_one_backup() {
    let install = install(b"agent 1.0.0").await;
    let updater = SelfUpdater::new(&install.exe).with_retry_policy(RetryPolicy::none());

    for version in ["1.1.0", "1.2.0", "1.3.0"] {
        let staged = stage(&install, version).await;
        let plan = updater.prepare_update(&staged, version).await.unwrap();
        updater.apply_update(&plan).await.unwrap();
        updater.cleanup(&plan).await.unwrap();
        assert!(!staged.exists());
    }

    assert_eq!(fs::read(&install.exe).await.unwrap(), b"agent 1.3.0");
    let backups = BackupStore::for_executable(&install.exe).list().await.unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(fs::read(&backups[0]).await.unwrap(), b"agent 1.2.0");
}

#[tokio::test]
async fn test_cleanup_without_backups_is_not_an_error() {
    let install = install(b"agent 1.0.0").await;
    let store = BackupStore::for_executable(&install.exe);
    assert_eq!(store.prune(1).await.unwrap(), 0);
    assert!(store.latest().await.unwrap().is_none());
}

#[tokio::test]
async fn test_rollback_to_latest_after_restart() {
    let install = install(b"agent 1.0.0").await;
    let staged = stage(&install, "1.1.0").await;

    {
        let updater = SelfUpdater::new(&install.exe);
        let plan = updater.prepare_update(&staged, "1.1.0").await.unwrap();
        updater.apply_update(&plan).await.unwrap();
    }

    // A fresh updater knows nothing about the plan; it finds the backup on disk.
    let updater = SelfUpdater::new(&install.exe);
    assert!(updater.latest_backup().await.unwrap().is_some());
    updater.rollback_to_latest().await.unwrap();
    assert_eq!(fs::read(&install.exe).await.unwrap(), b"agent 1.0.0");
}

#[tokio::test]
async fn test_rollback_without_backup_fails() {
    let install = install(b"agent 1.0.0").await;
    let err = SelfUpdater::new(&install.exe).rollback_to_latest().await.unwrap_err();
    assert!(matches!(err, UpgradeError::Filesystem(_)), "{err:?}");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_concurrent_install_is_busy() {
    let install = install(b"agent 1.0.0").await;
    let staged = stage(&install, "1.1.0").await;
    let updater = SelfUpdater::new(&install.exe).with_lock_timeout(Duration::from_millis(200));
    let plan = updater.prepare_update(&staged, "1.1.0").await.unwrap();

    let held = UpgradeLock::acquire(BackupStore::for_executable(&install.exe).dir())
        .await
        .unwrap();

    let err = updater.apply_update(&plan).await.unwrap_err();
    assert!(matches!(err, UpgradeError::Busy(_)), "{err:?}");
    assert!(err.is_retryable());
    assert_eq!(fs::read(&install.exe).await.unwrap(), b"agent 1.0.0");

    drop(held);
    updater.apply_update(&plan).await.unwrap();
    assert_eq!(fs::read(&install.exe).await.unwrap(), b"agent 1.1.0");
}
