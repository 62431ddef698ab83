//! Upgrade progress published by the orchestrator.
//!
//! The current [`UpdateProgress`] and the registered sink share one lock.
//! Readers get copies, and the sink is invoked after the lock is released, so
//! a slow or re-entrant sink cannot block the upgrade.

use crate::upgrade::download::DownloadProgress;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Orchestrator state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateStatus {
    /// Nothing in progress.
    #[default]
    Idle,
    /// Querying the feed.
    Checking,
    /// A newer release was found.
    Available,
    /// Fetching the binary.
    Downloading,
    /// Checking the publisher signature.
    Verifying,
    /// Verified and waiting to be applied (or confirmed).
    Ready,
    /// Replacing the executable.
    Applying,
    /// The new version is installed.
    Success,
    /// The last attempt failed.
    Failed,
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::Available => "available",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Ready => "ready",
            Self::Applying => "applying",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Snapshot of the orchestrator's progress.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateProgress {
    pub status: UpdateStatus,
    pub message: String,
    pub downloaded: u64,
    pub total: Option<u64>,
    /// Bytes per second.
    pub speed: u64,
    /// 0 to 100 when the total is known.
    pub percent: Option<f64>,
    /// A backup exists that [`Upgrader`](crate::upgrade::Upgrader) could restore.
    pub can_rollback: bool,
    pub new_version: Option<String>,
    /// Verification relied on the fallback policy.
    pub needs_confirm: bool,
}

/// Receives every progress change.
pub type ProgressCallback = Arc<dyn Fn(UpdateProgress) + Send + Sync>;

#[derive(Default)]
struct Inner {
    current: UpdateProgress,
    callback: Option<ProgressCallback>,
}

/// Shared progress state with an optional sink.
#[derive(Default)]
pub struct ProgressState {
    inner: RwLock<Inner>,
}

impl fmt::Debug for ProgressState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressState").field("current", &self.snapshot()).finish_non_exhaustive()
    }
}

impl ProgressState {
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// A copy of the current progress.
    pub fn snapshot(&self) -> UpdateProgress {
        self.read().current.clone()
    }

    /// Register the sink, replacing any previous one.
    pub fn set_callback(&self, callback: Option<ProgressCallback>) {
        self.write().callback = callback;
    }

    /// Modify the progress and publish the result.
    ///
    /// The snapshot and the sink are taken under one write lock, and the sink
    /// runs after it is released.
    pub fn update(&self, change: impl FnOnce(&mut UpdateProgress)) {
        let (published, callback) = {
            let mut inner = self.write();
            change(&mut inner.current);
            (inner.current.clone(), inner.callback.clone())
        };

        if let Some(callback) = callback {
            callback(published);
        }
    }

    /// Move to `status` with `message`.
    pub fn set_status(&self, status: UpdateStatus, message: impl Into<String>) {
        let message = message.into();
        self.update(|p| {
            p.status = status;
            p.message = message;
        });
    }

    /// Record a download report.
    pub fn record_download(&self, download: DownloadProgress) {
        self.update(|p| {
            p.downloaded = download.downloaded;
            p.total = download.total;
            p.speed = download.speed;
            p.percent = download.percent();
        });
    }

    /// Back to [`UpdateStatus::Idle`] with all counters cleared.
    pub fn reset(&self) {
        self.update(|p| *p = UpdateProgress::default());
    }
}
