//! Replacement of the running executable.
//!
//! A running Windows executable cannot be overwritten, but it can be renamed.
//! [`SelfUpdater`] therefore moves the current binary into the backup
//! directory and copies the new one into its place:
//!
//! ```text
//! prepare_update   canonicalize exe, require staged file, choose backup path
//! apply_update     [lock] exe -> backup (rename), staged -> exe (copy + fsync)
//!                  copy failed: backup -> exe, or RollbackFailed
//! rollback         [lock] backup -> exe (rename, else copy), retried
//! cleanup          drop staged file, prune backups to the newest one
//! ```
//!
//! Every step is a single rename or a copy to a path that is not the
//! original, so the original executable or a complete backup of it exists at
//! every point, even if the process is killed between steps.

use crate::constants::{BACKUPS_TO_KEEP, DEFAULT_RESTORE_ATTEMPTS, DEFAULT_RESTORE_DELAY, INSTALL_LOCK_TIMEOUT};
use crate::core::{Result, UpgradeError};
use crate::upgrade::backup::BackupStore;
use crate::upgrade::lock::UpgradeLock;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info, warn};

/// Bounded retry for operations on files that may be transiently locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    /// Delay before the second attempt; doubles afterwards.
    pub initial_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RESTORE_ATTEMPTS,
            initial_delay: DEFAULT_RESTORE_DELAY,
            max_delay: DEFAULT_RESTORE_DELAY * 4,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delays between attempts.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let half_ms = u64::try_from(self.initial_delay.as_millis() / 2).unwrap_or(u64::MAX).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(half_ms)
            .max_delay(self.max_delay)
            .take(self.max_attempts.saturating_sub(1))
    }
}

/// One planned executable replacement. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePlan {
    /// Canonical path of the executable being replaced.
    pub executable: PathBuf,
    /// Where the current executable is moved.
    pub backup: PathBuf,
    /// The verified new binary.
    pub staged: PathBuf,
    /// Version being installed.
    pub target_version: String,
    /// When the plan was made.
    pub created_at: DateTime<Utc>,
}

/// Owns backup, apply, rollback and cleanup for one executable.
#[derive(Debug, Clone)]
pub struct SelfUpdater {
    executable: PathBuf,
    retry: RetryPolicy,
    lock_timeout: Duration,
}

impl SelfUpdater {
    /// An updater replacing `executable`.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            retry: RetryPolicy::default(),
            lock_timeout: INSTALL_LOCK_TIMEOUT,
        }
    }

    /// An updater replacing the running executable.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Filesystem`] if the path of the running
    /// executable cannot be determined.
    pub fn for_current_exe() -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| UpgradeError::fs("locating the running executable", &e))?;
        Ok(Self::new(exe))
    }

    /// Override the rollback retry policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the install lock timeout.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// The executable path as configured.
    #[must_use]
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    async fn canonical_executable(&self) -> Result<PathBuf> {
        fs::canonicalize(&self.executable).await.map_err(|e| {
            UpgradeError::fs(format!("resolving {}", self.executable.display()), &e)
        })
    }

    /// Plan the replacement of the executable by `staged`.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Filesystem`] if the executable or the staged
    /// file is missing, or the backup directory cannot be created.
    pub async fn prepare_update(&self, staged: &Path, target_version: &str) -> Result<UpdatePlan> {
        let executable = self.canonical_executable().await?;

        if !fs::try_exists(staged).await.unwrap_or(false) {
            return Err(UpgradeError::Filesystem(format!(
                "staged binary {} does not exist",
                staged.display()
            )));
        }

        let store = BackupStore::for_executable(&executable);
        store.ensure_dir().await?;

        // The new backup must sort after every existing one, even one stamped
        // in the future by a clock that has since moved back.
        let created_at = Utc::now();
        let floor = match store.latest().await? {
            Some(path) => store.taken_at(&path).map(|t| t + chrono::Duration::milliseconds(1)),
            None => None,
        };
        let mut stamp = floor.map_or(created_at, |floor| floor.max(created_at));
        let mut backup = store.path_at(stamp);
        while fs::try_exists(&backup).await.unwrap_or(false) {
            stamp += chrono::Duration::milliseconds(1);
            backup = store.path_at(stamp);
        }

        debug!(
            exe = %executable.display(),
            backup = %backup.display(),
            version = %target_version,
            "Prepared update"
        );
        Ok(UpdatePlan {
            executable,
            backup,
            staged: staged.to_path_buf(),
            target_version: target_version.to_string(),
            created_at,
        })
    }

    /// Install the staged binary over the executable.
    ///
    /// # Errors
    ///
    /// - [`UpgradeError::Busy`] if another process holds the install lock
    /// - [`UpgradeError::Filesystem`] if the swap failed and the original was
    ///   put back
    /// - [`UpgradeError::RollbackFailed`] if the swap failed and so did
    ///   putting the original back
    pub async fn apply_update(&self, plan: &UpdatePlan) -> Result<()> {
        let store = BackupStore::for_executable(&plan.executable);
        let _lock = UpgradeLock::acquire_with_timeout(store.dir(), self.lock_timeout).await?;

        let original_permissions = fs::metadata(&plan.executable)
            .await
            .map_err(|e| UpgradeError::fs(format!("reading {}", plan.executable.display()), &e))?
            .permissions();

        fs::rename(&plan.executable, &plan.backup).await.map_err(|e| {
            UpgradeError::fs(format!("moving {} to backup", plan.executable.display()), &e)
        })?;

        if let Err(apply) = install_copy(&plan.staged, &plan.executable, original_permissions).await {
            warn!("Installing {} failed: {apply}", plan.target_version);
            if let Err(e) = fs::remove_file(&plan.executable).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove partial copy {}: {e}", plan.executable.display());
                }
            }
            return match fs::rename(&plan.backup, &plan.executable).await {
                Ok(()) => Err(apply),
                Err(rollback) => Err(UpgradeError::RollbackFailed {
                    apply: apply.to_string(),
                    rollback: rollback.to_string(),
                }),
            };
        }

        if let Err(e) = schedule_delete_on_reboot(&plan.backup) {
            warn!("Failed to schedule backup deletion: {e}");
        }
        if let Err(e) = fs::remove_file(&plan.staged).await {
            debug!("Failed to remove staged file {}: {e}", plan.staged.display());
        }

        info!(version = %plan.target_version, "Update applied");
        Ok(())
    }

    /// Put the backup of `plan` back in place of the executable.
    ///
    /// # Errors
    ///
    /// - [`UpgradeError::Filesystem`] if the backup is missing or every
    ///   restore attempt failed
    /// - [`UpgradeError::Busy`] if another process holds the install lock
    pub async fn rollback(&self, plan: &UpdatePlan) -> Result<()> {
        if !fs::try_exists(&plan.backup).await.unwrap_or(false) {
            return Err(UpgradeError::Filesystem(format!(
                "no backup at {}",
                plan.backup.display()
            )));
        }

        let store = BackupStore::for_executable(&plan.executable);
        let _lock = UpgradeLock::acquire_with_timeout(store.dir(), self.lock_timeout).await?;

        Retry::spawn(self.retry.delays(), || restore_once(&plan.backup, &plan.executable)).await?;

        info!(exe = %plan.executable.display(), "Rolled back to backup");
        Ok(())
    }

    /// Remove the staged file and prune old backups.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Filesystem`] if the backup directory cannot be
    /// read.
    pub async fn cleanup(&self, plan: &UpdatePlan) -> Result<()> {
        match fs::remove_file(&plan.staged).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove staged file {}: {e}", plan.staged.display()),
        }

        let removed = BackupStore::for_executable(&plan.executable)
            .prune(BACKUPS_TO_KEEP)
            .await?;
        debug!(removed, "Pruned backups");
        Ok(())
    }

    /// The newest backup of the executable.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Filesystem`] if the executable cannot be
    /// resolved or the backup directory cannot be read.
    pub async fn latest_backup(&self) -> Result<Option<PathBuf>> {
        let executable = self.canonical_executable().await?;
        BackupStore::for_executable(&executable).latest().await
    }

    /// Restore the newest backup, for a manual rollback after a restart.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Filesystem`] if there is no backup, otherwise
    /// as [`SelfUpdater::rollback`].
    pub async fn rollback_to_latest(&self) -> Result<PathBuf> {
        let executable = self.canonical_executable().await?;
        let backup = BackupStore::for_executable(&executable)
            .latest()
            .await?
            .ok_or_else(|| UpgradeError::Filesystem("no backup to restore".to_string()))?;

        let plan = UpdatePlan {
            executable,
            staged: backup.clone(),
            backup: backup.clone(),
            target_version: String::new(),
            created_at: Utc::now(),
        };
        self.rollback(&plan).await?;
        Ok(backup)
    }
}

async fn install_copy(staged: &Path, target: &Path, permissions: std::fs::Permissions) -> Result<()> {
    fs::copy(staged, target)
        .await
        .map_err(|e| UpgradeError::fs(format!("copying {} into place", staged.display()), &e))?;

    let file = fs::OpenOptions::new()
        .write(true)
        .open(target)
        .await
        .map_err(|e| UpgradeError::fs(format!("opening {}", target.display()), &e))?;
    file.sync_all()
        .await
        .map_err(|e| UpgradeError::fs(format!("syncing {}", target.display()), &e))?;
    drop(file);

    fs::set_permissions(target, permissions)
        .await
        .map_err(|e| UpgradeError::fs(format!("setting permissions on {}", target.display()), &e))
}

async fn restore_once(backup: &Path, executable: &Path) -> Result<()> {
    match fs::rename(backup, executable).await {
        Ok(()) => Ok(()),
        Err(rename) => {
            debug!("Rename of backup failed ({rename}), copying instead");
            fs::copy(backup, executable).await.map_err(|e| {
                UpgradeError::fs(format!("restoring {}", executable.display()), &e)
            })?;
            if let Err(e) = fs::remove_file(backup).await {
                debug!("Leaving copied backup {} in place: {e}", backup.display());
            }
            Ok(())
        }
    }
}

/// Ask the OS to delete `path` at the next reboot.
///
/// Used for files Windows keeps locked, such as the image of a process that
/// is still running. A no-op on other platforms.
///
/// # Errors
///
/// Returns [`UpgradeError::Filesystem`] if the request is refused.
pub fn schedule_delete_on_reboot(path: &Path) -> Result<()> {
    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use windows_sys::Win32::Storage::FileSystem::{MOVEFILE_DELAY_UNTIL_REBOOT, MoveFileExW};

        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(std::iter::once(0)).collect();
        // SAFETY: `wide` is NUL-terminated and outlives the call.
        let ok = unsafe { MoveFileExW(wide.as_ptr(), std::ptr::null(), MOVEFILE_DELAY_UNTIL_REBOOT) };
        if ok == 0 {
            return Err(UpgradeError::fs(
                format!("scheduling {} for deletion", path.display()),
                &std::io::Error::last_os_error(),
            ));
        }
        debug!(path = %path.display(), "Scheduled for deletion at reboot");
    }

    #[cfg(not(windows))]
    debug!(path = %path.display(), "Delete-on-reboot not needed on this platform");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Install {
        _temp: TempDir,
        exe: PathBuf,
        staged: PathBuf,
    }

    async fn install() -> Install {
        let temp = TempDir::new().unwrap();
        let exe = temp.path().join("certdeploy-agent.exe");
        let staged = temp.path().join("scratch-2.0.0.exe");
        fs::write(&exe, b"version 1").await.unwrap();
        fs::write(&staged, b"version 2").await.unwrap();
        Install {
            exe: fs::canonicalize(&exe).await.unwrap(),
            staged,
            _temp: temp,
        }
    }

    #[test]
    fn test_retry_delays() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(
            delays,
            vec![Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(300)]
        );
        assert_eq!(RetryPolicy::none().delays().count(), 0);
    }

    #[tokio::test]
    async fn test_prepare_requires_staged_file() {
        let setup = install().await;
        let updater = SelfUpdater::new(&setup.exe);
        let err = updater
            .prepare_update(&setup.exe.with_file_name("missing.exe"), "2.0.0")
            .await
            .unwrap_err();
        assert!(matches!(err, UpgradeError::Filesystem(_)));
    }

    #[tokio::test]
    async fn test_apply_and_cleanup() {
        let setup = install().await;
        let updater = SelfUpdater::new(&setup.exe);

        let plan = updater.prepare_update(&setup.staged, "2.0.0").await.unwrap();
        assert_eq!(plan.backup.parent().unwrap(), setup.exe.parent().unwrap().join("backup"));

        updater.apply_update(&plan).await.unwrap();
        assert_eq!(fs::read(&setup.exe).await.unwrap(), b"version 2");
        assert_eq!(fs::read(&plan.backup).await.unwrap(), b"version 1");
        assert!(!setup.staged.exists());

        updater.cleanup(&plan).await.unwrap();
        let store = BackupStore::for_executable(&setup.exe);
        assert_eq!(store.list().await.unwrap(), vec![plan.backup.clone()]);
        assert_eq!(updater.latest_backup().await.unwrap(), Some(plan.backup));
    }

    #[tokio::test]
    async fn test_failed_copy_restores_original() {
        let setup = install().await;
        let updater = SelfUpdater::new(&setup.exe);

        // A directory passes the existence check but cannot be copied.
        let staged_dir = setup.exe.with_file_name("staged-dir");
        fs::create_dir(&staged_dir).await.unwrap();

        let plan = updater.prepare_update(&staged_dir, "2.0.0").await.unwrap();
        let err = updater.apply_update(&plan).await.unwrap_err();

        assert!(matches!(err, UpgradeError::Filesystem(_)), "{err}");
        assert_eq!(fs::read(&setup.exe).await.unwrap(), b"version 1");
        assert!(!plan.backup.exists());
        assert!(BackupStore::for_executable(&setup.exe).list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_after_apply() {
        let setup = install().await;
        let updater = SelfUpdater::new(&setup.exe).with_retry_policy(RetryPolicy::none());

        let plan = updater.prepare_update(&setup.staged, "2.0.0").await.unwrap();
        updater.apply_update(&plan).await.unwrap();
        updater.rollback(&plan).await.unwrap();

        assert_eq!(fs::read(&setup.exe).await.unwrap(), b"version 1");
        assert!(!plan.backup.exists());
    }

    #[tokio::test]
    async fn test_rollback_without_backup() {
        let setup = install().await;
        let updater = SelfUpdater::new(&setup.exe);
        let plan = updater.prepare_update(&setup.staged, "2.0.0").await.unwrap();

        let err = updater.rollback(&plan).await.unwrap_err();
        assert!(matches!(err, UpgradeError::Filesystem(_)));
        assert_eq!(fs::read(&setup.exe).await.unwrap(), b"version 1");
    }

    #[tokio::test]
    async fn test_rollback_to_latest() {
        let setup = install().await;
        let updater = SelfUpdater::new(&setup.exe).with_retry_policy(RetryPolicy::none());
        assert!(updater.rollback_to_latest().await.is_err());

        let plan = updater.prepare_update(&setup.staged, "2.0.0").await.unwrap();
        updater.apply_update(&plan).await.unwrap();

        let restored = updater.rollback_to_latest().await.unwrap();
        assert_eq!(restored, plan.backup);
        assert_eq!(fs::read(&setup.exe).await.unwrap(), b"version 1");
    }
}
