//! Self-update client for the certdeploy Windows certificate-deployment agent.
//!
//! The agent runs unattended on customer machines and replaces its own
//! executable when the vendor publishes a new build. Every build must carry
//! a valid publisher signature whose certificate the agent trusts before
//! anything on disk changes.
//!
//! # Architecture
//!
//! - [`version`]: ordering of dotted release versions with pre-release tags
//! - [`config`]: persisted `[upgrade]` settings and the build-time trust policy
//! - [`upgrade`]: release feed, downloader, signature verification, the
//!   executable swap with backup and rollback, and the [`upgrade::Upgrader`]
//!   orchestrator tying them together
//! - [`core`]: the [`core::UpgradeError`] taxonomy and user-facing error rendering
//! - [`cli`]: the `certdeploy-updater upgrade` command
//!
//! # Upgrade flow
//!
//! ```text
//! check feed ──> newer? ──no──> up to date
//!                  │
//!                 yes ──> min_version above installed? ──yes──> upgrade path, one step per restart
//!                  │
//!             download ──> verify signature ──> confirm if fallback trust ──> swap with backup
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use certdeploy_updater::config::UpgradeConfig;
//! use certdeploy_updater::upgrade::{SelfUpdater, UpdateCheck, Upgrader};
//!
//! # async fn example() -> certdeploy_updater::core::Result<()> {
//! let mut upgrader = Upgrader::new("1.4.2", UpgradeConfig::default(), SelfUpdater::for_current_exe()?)?;
//! if let UpdateCheck::Available(info) = upgrader.check_for_update("1.4.2").await? {
//!     let approved = upgrader.download_and_verify(&info, |_| false).await?;
//!     upgrader.apply_update(approved).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod constants;
pub mod core;
pub mod upgrade;
pub mod version;

// test_utils module is available for both unit tests and integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
