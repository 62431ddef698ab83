//! Self-update of the certdeploy agent.
//!
//! The update feed is treated as hostile input and the running executable
//! cannot be overwritten in place, so every step either validates before it
//! acts or keeps a way back.
//!
//! # Architecture Overview
//!
//! - **[`ReleaseChecker`]**: queries the release feed and the upgrade-path service
//! - **[`FileDownloader`]**: streams an asset to disk behind a transport policy
//! - **[`SignatureVerifier`]**: checks the publisher signature against the trust policy
//! - **[`SelfUpdater`]**: backup, apply, rollback and cleanup of the executable
//! - **[`Upgrader`]**: the orchestrator tying them together
//!
//! ## Update Process Flow
//!
//! ```text
//! 1. Check
//!    ├── Fetch the feed (size-capped), filter by channel
//!    └── Compare with the installed version; honour skipped version and floor
//!
//! 2. Download
//!    ├── https only (http for loopback)
//!    └── Write <dest>.tmp, fsync, rename into place
//!
//! 3. Verify
//!    ├── Platform signature check
//!    ├── Fingerprint allow-list, else organization/country/CA fallback
//!    └── Fallback trust needs a human confirmation
//!
//! 4. Apply
//!    ├── [install lock] current exe -> backup/<exe>.<timestamp>.bak
//!    ├── Verified binary -> current exe path
//!    └── Failure: backup moved back
//!
//! 5. Cleanup
//!    └── Keep only the newest backup
//! ```
//!
//! ## Chained upgrades
//!
//! A release may declare `min_version`. Installs below it get
//! [`UpdateCheck::ChainRequired`] and must walk the vendor's upgrade path one
//! step per process run:
//!
//! ```rust,no_run
//! use certdeploy_updater::config::UpgradeConfig;
//! use certdeploy_updater::upgrade::{ChainOutcome, SelfUpdater, UpdateCheck, Upgrader};
//!
//! # async fn example() -> certdeploy_updater::core::Result<()> {
//! let mut upgrader = Upgrader::new("1.4.0", UpgradeConfig::default(), SelfUpdater::for_current_exe()?)?;
//! if let UpdateCheck::ChainRequired(info) = upgrader.check_for_update("1.4.0").await? {
//!     let path = upgrader.resolve_upgrade_path("1.4.0", &info).await?;
//!     match upgrader.chain_upgrade(&path, "1.4.0", |_step, _i, _n| true).await? {
//!         ChainOutcome::RestartRequired { reached, .. } => println!("restart to continue from {reached}"),
//!         ChainOutcome::Completed { reached } => println!("now at {reached}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod authenticode;
pub mod backup;
pub mod cancel;
pub mod download;
pub mod lock;
pub mod metadata;
pub mod progress;
pub mod release;
pub mod self_updater;
pub mod upgrader;
pub mod verification;


pub use authenticode::AuthenticodeInspector;
pub use backup::BackupStore;
pub use cancel::CancelToken;
pub use download::{DownloadProgress, FileDownloader, validate_download_url};
pub use lock::UpgradeLock;
pub use metadata::{ReleaseMetadata, clean_release_notes, parse_metadata};
pub use progress::{ProgressCallback, UpdateProgress, UpdateStatus};
pub use release::{ReleaseChecker, ReleaseInfo, UpgradePath, UpgradeStep};
pub use self_updater::{RetryPolicy, SelfUpdater, UpdatePlan, schedule_delete_on_reboot};
pub use upgrader::{ApprovedUpdate, ChainOutcome, UpdateCheck, Upgrader};
pub use verification::{
    CodeSignatureInspector, SignatureStatus, SignatureVerifier, SignerCertificate, VerifyResult,
    certificate_fingerprint,
};
