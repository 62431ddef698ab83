//! Cross-process lock serializing executable replacement.
//!
//! Held by [`SelfUpdater`](crate::upgrade::SelfUpdater) while it renames or
//! copies the executable, so two upgrade attempts in different processes
//! cannot interleave. The lock is released when the guard is dropped.

use crate::constants::{INSTALL_LOCK_NAME, INSTALL_LOCK_TIMEOUT, MAX_BACKOFF_DELAY_MS, STARTING_BACKOFF_DELAY_MS};
use crate::core::{Result, UpgradeError};
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_retry::strategy::ExponentialBackoff;
use tracing::debug;

/// Guard for the install lock.
#[derive(Debug)]
pub struct UpgradeLock {
    _file: Arc<File>,
    path: PathBuf,
}

impl Drop for UpgradeLock {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "Install lock released");
    }
}

impl UpgradeLock {
    /// Acquire the lock in `dir` with the default timeout.
    ///
    /// # Errors
    ///
    /// See [`UpgradeLock::acquire_with_timeout`].
    pub async fn acquire(dir: &Path) -> Result<Self> {
        Self::acquire_with_timeout(dir, INSTALL_LOCK_TIMEOUT).await
    }

    /// Acquire the lock in `dir`, polling with exponential backoff until
    /// `timeout` elapses.
    ///
    /// # Errors
    ///
    /// - [`UpgradeError::Busy`] if another process holds the lock past the timeout
    /// - [`UpgradeError::Filesystem`] if the lock file cannot be created
    pub async fn acquire_with_timeout(dir: &Path, timeout: Duration) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| UpgradeError::fs(format!("creating {}", dir.display()), &e))?;

        let path = dir.join(INSTALL_LOCK_NAME);
        let open_path = path.clone();
        let file = tokio::task::spawn_blocking(move || {
            OpenOptions::new().create(true).write(true).truncate(false).open(&open_path)
        })
        .await
        .map_err(|e| UpgradeError::Filesystem(format!("lock task failed: {e}")))?
        .map_err(|e| UpgradeError::fs(format!("opening {}", path.display()), &e))?;
        let file = Arc::new(file);

        let start = Instant::now();
        let backoff = ExponentialBackoff::from_millis(STARTING_BACKOFF_DELAY_MS)
            .max_delay(Duration::from_millis(MAX_BACKOFF_DELAY_MS));

        for delay in backoff {
            let attempt = Arc::clone(&file);
            let locked = tokio::task::spawn_blocking(move || attempt.try_lock_exclusive())
                .await
                .map_err(|e| UpgradeError::Filesystem(format!("lock task failed: {e}")))?;

            if matches!(locked, Ok(true)) {
                debug!(
                    path = %path.display(),
                    wait_ms = start.elapsed().as_millis(),
                    "Install lock acquired"
                );
                return Ok(Self { _file: file, path });
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(delay.min(remaining)).await;
        }

        Err(UpgradeError::Busy(format!(
            "install lock {} held by another process for more than {:?}",
            path.display(),
            timeout
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_second_acquire_is_busy() {
        let temp = TempDir::new().unwrap();
        let first = UpgradeLock::acquire(temp.path()).await.unwrap();

        let err = UpgradeLock::acquire_with_timeout(temp.path(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, UpgradeError::Busy(_)));

        drop(first);
        UpgradeLock::acquire_with_timeout(temp.path(), Duration::from_millis(200)).await.unwrap();
    }

    #[tokio::test]
    async fn test_creates_directory() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("backup");
        let _lock = UpgradeLock::acquire(&dir).await.unwrap();
        assert!(dir.join(INSTALL_LOCK_NAME).exists());
    }
}
