//! Timestamped backups of the agent executable.
//!
//! Backups live in a `backup/` directory next to the executable and are named
//! `<exe-file-name>.<YYYYMMDDHHMMSSmmm>.bak` (UTC). The timestamp is fixed
//! width, so it orders numerically; pruning keeps the newest by that value,
//! not by file modification time.

use crate::constants::{BACKUP_DIR_NAME, BACKUP_EXTENSION, BACKUP_TIMESTAMP_FORMAT, BACKUP_TIMESTAMP_LEN};
use crate::core::{Result, UpgradeError};
use crate::upgrade::self_updater::schedule_delete_on_reboot;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// The backup directory of one executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupStore {
    dir: PathBuf,
    exe_name: String,
}

impl BackupStore {
    /// The store for `executable`.
    #[must_use]
    pub fn for_executable(executable: &Path) -> Self {
        let parent = executable.parent().unwrap_or_else(|| Path::new("."));
        let exe_name = executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            dir: parent.join(BACKUP_DIR_NAME),
            exe_name,
        }
    }

    /// The backup directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the backup directory.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Filesystem`] if it cannot be created.
    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| UpgradeError::fs(format!("creating {}", self.dir.display()), &e))
    }

    /// Backup path for a backup taken at `at`.
    #[must_use]
    pub fn path_at(&self, at: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!(
            "{}.{}.{BACKUP_EXTENSION}",
            self.exe_name,
            at.format(BACKUP_TIMESTAMP_FORMAT)
        ))
    }

    /// The embedded timestamp of a backup file name belonging to this store.
    #[must_use]
    pub fn timestamp_of(&self, file_name: &str) -> Option<u64> {
        let stamp = file_name
            .strip_prefix(self.exe_name.as_str())?
            .strip_prefix('.')?
            .strip_suffix(BACKUP_EXTENSION)?
            .strip_suffix('.')?;
        if stamp.len() != BACKUP_TIMESTAMP_LEN || !stamp.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stamp.parse().ok()
    }

    /// When the backup at `path` was taken, read from its file name.
    #[must_use]
    pub fn taken_at(&self, path: &Path) -> Option<DateTime<Utc>> {
        let stamp = self.timestamp_of(&path.file_name()?.to_string_lossy())?.to_string();
        let (seconds, millis) = stamp.split_at(BACKUP_TIMESTAMP_LEN - 3);
        let at = NaiveDateTime::parse_from_str(seconds, "%Y%m%d%H%M%S").ok()?;
        Some(at.and_utc() + chrono::Duration::milliseconds(millis.parse().ok()?))
    }

    /// All backups, newest first. A missing directory has none.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Filesystem`] if the directory cannot be read.
    pub async fn list(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(UpgradeError::fs(format!("reading {}", self.dir.display()), &e)),
        };

        let mut backups = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UpgradeError::fs(format!("reading {}", self.dir.display()), &e))?
        {
            let name = entry.file_name();
            if let Some(stamp) = self.timestamp_of(&name.to_string_lossy()) {
                backups.push((stamp, entry.path()));
            }
        }

        backups.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(backups.into_iter().map(|(_, path)| path).collect())
    }

    /// The newest backup, if any.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Filesystem`] if the directory cannot be read.
    pub async fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self.list().await?.into_iter().next())
    }

    /// Delete all but the `keep` newest backups, returning how many were
    /// removed. A backup that cannot be deleted now is scheduled for deletion
    /// at the next reboot instead.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Filesystem`] if the directory cannot be read.
    pub async fn prune(&self, keep: usize) -> Result<usize> {
        let mut removed = 0;
        for path in self.list().await?.into_iter().skip(keep) {
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed old backup");
                    removed += 1;
                }
                Err(e) => {
                    warn!("Failed to remove backup {}: {e}", path.display());
                    if let Err(e) = schedule_delete_on_reboot(&path) {
                        warn!("Failed to schedule {} for deletion: {e}", path.display());
                    }
                }
            }
        }
        Ok(removed)
    }
}
