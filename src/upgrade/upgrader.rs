//! The upgrade orchestrator.
//!
//! [`Upgrader`] drives one upgrade attempt through its states:
//!
//! ```text
//! Idle -> Checking -> Available -> Downloading -> Verifying -> Ready -> Applying -> Success
//!                 \-> Idle (up to date)                                        \-> Failed
//! ```
//!
//! Each transition is an explicit call. Trust is enforced by types: apply
//! takes an [`ApprovedUpdate`], and the only way to obtain one is
//! [`Upgrader::download_and_verify`], which refuses binaries that fail
//! verification and asks for confirmation when trust came from the fallback
//! policy.

use crate::config::{TrustPolicy, UpgradeConfig};
use crate::core::{Result, UpgradeError};
use crate::upgrade::cancel::CancelToken;
use crate::upgrade::download::FileDownloader;
use crate::upgrade::progress::{ProgressState, UpdateProgress, UpdateStatus};
use crate::upgrade::release::{ReleaseChecker, ReleaseInfo, UpgradePath, UpgradeStep};
use crate::upgrade::self_updater::{SelfUpdater, UpdatePlan};
use crate::upgrade::verification::{SignatureVerifier, VerifyResult};
use crate::version::Version;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tracing::{debug, info, warn};

/// Outcome of [`Upgrader::check_for_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheck {
    /// Nothing newer on the configured channel.
    UpToDate,
    /// A release that can be installed directly.
    Available(ReleaseInfo),
    /// A release whose minimum version is above the installed one; install
    /// it through [`Upgrader::resolve_upgrade_path`] and
    /// [`Upgrader::chain_upgrade`].
    ChainRequired(ReleaseInfo),
}

/// A downloaded binary that passed verification and, where needed, was
/// confirmed by a human.
#[derive(Debug)]
pub struct ApprovedUpdate {
    staged: PathBuf,
    version: String,
    verification: VerifyResult,
}

impl ApprovedUpdate {
    /// Path of the verified binary.
    #[must_use]
    pub fn staged(&self) -> &Path {
        &self.staged
    }

    /// Version it installs.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The verification that approved it.
    #[must_use]
    pub fn verification(&self) -> &VerifyResult {
        &self.verification
    }
}

/// Result of one [`Upgrader::chain_upgrade`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    /// A step was applied; restart the agent and call again.
    RestartRequired {
        /// Version now installed.
        reached: String,
        /// Steps still to apply.
        remaining: usize,
    },
    /// The last step is installed (or was already).
    Completed {
        /// Version now installed.
        reached: String,
    },
}

/// Orchestrates checking, downloading, verifying and applying updates.
pub struct Upgrader {
    current_version: String,
    config: UpgradeConfig,
    config_path: Option<PathBuf>,
    checker: ReleaseChecker,
    downloader: FileDownloader,
    verifier: SignatureVerifier,
    updater: SelfUpdater,
    trust: TrustPolicy,
    scratch_dir: PathBuf,
    progress: Arc<ProgressState>,
    cancel: Mutex<CancelToken>,
}

impl std::fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgrader")
            .field("current_version", &self.current_version)
            .field("config", &self.config)
            .field("scratch_dir", &self.scratch_dir)
            .finish_non_exhaustive()
    }
}

impl Upgrader {
    /// An upgrader for an agent at `current_version`, replacing the
    /// executable managed by `updater`.
    ///
    /// Uses the compiled-in trust policy and the Authenticode inspector.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Network`] if an HTTP client cannot be built.
    pub fn new(current_version: impl Into<String>, config: UpgradeConfig, updater: SelfUpdater) -> Result<Self> {
        Ok(Self {
            current_version: current_version.into(),
            checker: ReleaseChecker::from_config(&config)?,
            config,
            config_path: None,
            downloader: FileDownloader::new()?,
            verifier: SignatureVerifier::authenticode(),
            updater,
            trust: TrustPolicy::builtin().clone(),
            scratch_dir: std::env::temp_dir().join("certdeploy-updater"),
            progress: Arc::new(ProgressState::default()),
            cancel: Mutex::new(CancelToken::new()),
        })
    }

    /// Persist config changes to `path`.
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Replace the signature verifier.
    #[must_use]
    pub fn with_verifier(mut self, verifier: SignatureVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Replace the trust policy.
    #[must_use]
    pub fn with_trust_policy(mut self, trust: TrustPolicy) -> Self {
        self.trust = trust;
        self
    }

    /// Replace the downloader.
    #[must_use]
    pub fn with_downloader(mut self, downloader: FileDownloader) -> Self {
        self.downloader = downloader;
        self
    }

    /// Download into `dir` instead of the system temp directory.
    #[must_use]
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// The current settings.
    #[must_use]
    pub fn config(&self) -> &UpgradeConfig {
        &self.config
    }

    /// The installed version this upgrader was created for.
    #[must_use]
    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    /// A copy of the current progress.
    #[must_use]
    pub fn progress(&self) -> UpdateProgress {
        self.progress.snapshot()
    }

    /// Receive every progress change.
    pub fn set_progress_callback<F>(&self, callback: F)
    where
        F: Fn(UpdateProgress) + Send + Sync + 'static,
    {
        self.progress.set_callback(Some(Arc::new(callback)));
    }

    /// Handle cancelling the current or next download.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.lock_cancel().clone()
    }

    fn lock_cancel(&self) -> std::sync::MutexGuard<'_, CancelToken> {
        match self.cancel.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Whether an automatic check is due.
    #[must_use]
    pub fn should_check_update(&self) -> bool {
        self.config.should_check_at(Utc::now())
    }

    /// Record now as the last check time and persist it.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Config`] if persisting fails.
    pub async fn update_last_check(&mut self) -> Result<()> {
        self.config.record_check(Utc::now());
        self.persist().await
    }

    /// Never offer `version` again.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Config`] if persisting fails.
    pub async fn skip_version(&mut self, version: &str) -> Result<()> {
        info!(%version, "Skipping version");
        self.config.skipped_version = Some(version.trim_start_matches(['v', 'V']).to_string());
        self.persist().await
    }

    /// Forget a skipped version.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Config`] if persisting fails.
    pub async fn clear_skipped(&mut self) -> Result<()> {
        self.config.skipped_version = None;
        self.persist().await
    }

    async fn persist(&self) -> Result<()> {
        match &self.config_path {
            Some(path) => self.config.save_to(path).await,
            None => Ok(()),
        }
    }

    fn fail<T>(&self, err: UpgradeError) -> Result<T> {
        self.progress.set_status(UpdateStatus::Failed, err.to_string());
        Err(err)
    }

    /// Query the feed for an update to `current`.
    ///
    /// # Errors
    ///
    /// Network and feed errors from [`ReleaseChecker::check_update`], and
    /// [`UpgradeError::Format`] for an unparseable minimum version.
    pub async fn check_for_update(&mut self, current: &str) -> Result<UpdateCheck> {
        self.progress.reset();
        self.progress.set_status(UpdateStatus::Checking, "Checking for updates");

        let found = match self
            .checker
            .check_update(self.config.channel, current, self.config.skipped_version.as_deref())
            .await
        {
            Ok(found) => found,
            Err(e) => return self.fail(e),
        };

        if let Err(e) = self.update_last_check().await {
            warn!("Failed to record last check time: {e}");
        }

        let Some(info) = found else {
            self.progress.set_status(UpdateStatus::Idle, format!("{current} is up to date"));
            return Ok(UpdateCheck::UpToDate);
        };

        let below_floor = match info.min_version.as_deref() {
            Some(min) => match (Version::parse(current), Version::parse(min)) {
                (Ok(current), Ok(min)) => current < min,
                (_, Err(e)) | (Err(e), _) => return self.fail(e),
            },
            None => false,
        };

        let version = info.version.clone();
        self.progress.update(|p| {
            p.status = UpdateStatus::Available;
            p.message = format!("Version {version} is available");
            p.new_version = Some(version);
        });

        if below_floor {
            info!(%current, min = ?info.min_version, "Update requires a chained upgrade");
            Ok(UpdateCheck::ChainRequired(info))
        } else {
            Ok(UpdateCheck::Available(info))
        }
    }

    /// The chained path from `current` to `info`.
    ///
    /// # Errors
    ///
    /// [`UpgradeError::NoUpgradePath`] when the vendor publishes none, plus
    /// the errors of [`ReleaseChecker::get_upgrade_path`].
    pub async fn resolve_upgrade_path(&self, current: &str, info: &ReleaseInfo) -> Result<UpgradePath> {
        match self.checker.get_upgrade_path(current, &info.version).await {
            Ok(Some(path)) => Ok(path),
            Ok(None) => self.fail(UpgradeError::NoUpgradePath {
                from: current.to_string(),
                to: info.version.clone(),
            }),
            Err(e) => self.fail(e),
        }
    }

    /// Download and verify `info`, asking `confirm` when trust came from the
    /// fallback policy.
    ///
    /// # Errors
    ///
    /// - download errors from [`FileDownloader::download`]
    /// - [`UpgradeError::SignatureInvalid`] if verification fails
    /// - [`UpgradeError::UserCancelled`] if `confirm` refuses
    pub async fn download_and_verify<F>(&self, info: &ReleaseInfo, mut confirm: F) -> Result<ApprovedUpdate>
    where
        F: FnMut(&ReleaseInfo) -> bool,
    {
        let fingerprints = self.trust.effective_fingerprints(&info.fingerprints).to_vec();
        let (staged, verification) = self
            .fetch_verified(&info.download_url, &info.version, &fingerprints)
            .await?;

        if verification.needs_confirm {
            self.progress.update(|p| {
                p.status = UpdateStatus::Ready;
                p.message = verification.message.clone();
                p.needs_confirm = true;
            });

            if !confirm(info) {
                info!(version = %info.version, "Update declined");
                remove_staged(&staged).await;
                return self.fail(UpgradeError::UserCancelled {
                    reached: self.current_version.clone(),
                });
            }
        }

        self.progress.update(|p| {
            p.status = UpdateStatus::Ready;
            p.message = format!("Version {} is ready to install", info.version);
        });

        Ok(ApprovedUpdate {
            staged,
            version: info.version.clone(),
            verification,
        })
    }

    async fn fetch_verified(
        &self,
        url: &str,
        version: &str,
        fingerprints: &[String],
    ) -> Result<(PathBuf, VerifyResult)> {
        if let Err(e) = fs::create_dir_all(&self.scratch_dir).await {
            return self.fail(UpgradeError::fs(
                format!("creating {}", self.scratch_dir.display()),
                &e,
            ));
        }

        let name = self
            .updater
            .executable()
            .file_stem()
            .map_or_else(|| "update".to_string(), |s| s.to_string_lossy().into_owned());
        let dest = self.scratch_dir.join(format!("{name}-{version}.exe"));

        let token = {
            let mut guard = self.lock_cancel();
            if guard.is_cancelled() {
                *guard = CancelToken::new();
            }
            guard.clone()
        };

        self.progress.update(|p| {
            p.status = UpdateStatus::Downloading;
            p.message = format!("Downloading {version}");
            p.new_version = Some(version.to_string());
            p.downloaded = 0;
            p.total = None;
            p.percent = None;
            p.needs_confirm = false;
        });

        let progress = Arc::clone(&self.progress);
        if let Err(e) = self
            .downloader
            .download(url, &dest, &token, |report| progress.record_download(report))
            .await
        {
            return self.fail(e);
        }

        self.progress.set_status(UpdateStatus::Verifying, "Verifying signature");
        let verification = match self
            .verifier
            .verify(&dest, fingerprints, self.trust.fallback.as_ref())
            .await
        {
            Ok(result) => result,
            Err(e) => {
                remove_staged(&dest).await;
                return self.fail(e);
            }
        };

        if !verification.valid {
            remove_staged(&dest).await;
            return self.fail(UpgradeError::SignatureInvalid(verification.message));
        }

        Ok((dest, verification))
    }

    /// Install an approved update.
    ///
    /// # Errors
    ///
    /// The apply error; [`UpgradeError::RollbackFailed`] if restoring the
    /// previous executable failed as well.
    pub async fn apply_update(&self, approved: ApprovedUpdate) -> Result<UpdatePlan> {
        self.progress.set_status(
            UpdateStatus::Applying,
            format!("Installing {}", approved.version),
        );

        let plan = match self.updater.prepare_update(&approved.staged, &approved.version).await {
            Ok(plan) => plan,
            Err(e) => {
                remove_staged(&approved.staged).await;
                return self.fail(e);
            }
        };

        if let Err(apply) = self.updater.apply_update(&plan).await {
            let err = self.recover(&plan, apply).await;
            remove_staged(&approved.staged).await;
            return self.fail(err);
        }

        if let Err(e) = self.updater.cleanup(&plan).await {
            warn!("Cleanup after update failed: {e}");
        }

        let version = plan.target_version.clone();
        self.progress.update(|p| {
            p.status = UpdateStatus::Success;
            p.message = format!("Updated to {version}; restart the agent to finish");
            p.can_rollback = true;
        });
        info!(version = %plan.target_version, "Upgrade complete");
        Ok(plan)
    }

    async fn recover(&self, plan: &UpdatePlan, apply: UpgradeError) -> UpgradeError {
        if matches!(apply, UpgradeError::RollbackFailed { .. }) {
            return apply;
        }
        // The swap is undone when the backup is gone again.
        if !fs::try_exists(&plan.backup).await.unwrap_or(false) {
            return apply;
        }

        warn!("Apply failed with the backup still aside, rolling back: {apply}");
        match self.updater.rollback(plan).await {
            Ok(()) => apply,
            Err(rollback) => UpgradeError::RollbackFailed {
                apply: apply.to_string(),
                rollback: rollback.to_string(),
            },
        }
    }

    /// Apply the next step of `path` after `current`.
    ///
    /// Steps at or below `current` were applied by an earlier run and are
    /// skipped. One step is applied per call because each needs a restart.
    ///
    /// # Errors
    ///
    /// - [`UpgradeError::UserCancelled`] if `confirm` refuses the step
    /// - [`UpgradeError::ConfirmationRequired`] if the step is only trusted by
    ///   the fallback policy
    /// - the errors of download, verification and apply
    pub async fn chain_upgrade<F>(&self, path: &UpgradePath, current: &str, mut confirm: F) -> Result<ChainOutcome>
    where
        F: FnMut(&UpgradeStep, usize, usize) -> bool,
    {
        let installed = Version::parse(current)?;
        let total = path.steps.len();

        let mut pending = Vec::new();
        for (index, step) in path.steps.iter().enumerate() {
            if Version::parse(&step.version)? > installed {
                pending.push((index, step));
            } else {
                debug!(version = %step.version, "Chain step already applied");
            }
        }

        let Some(&(index, step)) = pending.first() else {
            return Ok(ChainOutcome::Completed {
                reached: current.to_string(),
            });
        };

        if !confirm(step, index, total) {
            info!(version = %step.version, "Chain step declined");
            return self.fail(UpgradeError::UserCancelled {
                reached: current.to_string(),
            });
        }

        let fingerprints = self.trust.effective_fingerprints(&step.fingerprints).to_vec();
        let (staged, verification) = self
            .fetch_verified(&step.download_url, &step.version, &fingerprints)
            .await?;

        if verification.needs_confirm {
            remove_staged(&staged).await;
            return self.fail(UpgradeError::ConfirmationRequired {
                version: step.version.clone(),
            });
        }

        self.apply_update(ApprovedUpdate {
            staged,
            version: step.version.clone(),
            verification,
        })
        .await?;

        let remaining = pending.len() - 1;
        info!(version = %step.version, remaining, "Chain step applied");
        Ok(if remaining > 0 {
            ChainOutcome::RestartRequired {
                reached: step.version.clone(),
                remaining,
            }
        } else {
            ChainOutcome::Completed {
                reached: step.version.clone(),
            }
        })
    }

    /// The newest backup of the executable, if any.
    ///
    /// # Errors
    ///
    /// See [`SelfUpdater::latest_backup`].
    pub async fn latest_backup(&self) -> Result<Option<PathBuf>> {
        self.updater.latest_backup().await
    }

    /// Restore the newest backup of the executable.
    ///
    /// # Errors
    ///
    /// See [`SelfUpdater::rollback_to_latest`].
    pub async fn rollback_latest(&self) -> Result<PathBuf> {
        match self.updater.rollback_to_latest().await {
            Ok(path) => {
                self.progress.set_status(UpdateStatus::Idle, "Previous version restored");
                Ok(path)
            }
            Err(e) => self.fail(e),
        }
    }
}

async fn remove_staged(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed staged file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove staged file {}: {e}", path.display()),
    }
}
