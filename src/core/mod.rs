//! Core types shared by every part of the updater
//!
//! # Error Management
//!
//! The updater separates errors for code from errors for people:
//! - **Strongly-typed errors** ([`UpgradeError`]) returned by every fallible
//!   operation of the upgrade subsystem, classified with
//!   [`UpgradeError::is_policy`] and [`UpgradeError::is_retryable`]
//! - **User-friendly contexts** ([`ErrorContext`]) rendered at the CLI edge,
//!   carrying details and an actionable suggestion
//!
//! ```rust,no_run
//! use certdeploy_updater::core::{UpgradeError, user_friendly_error};
//!
//! fn check() -> anyhow::Result<()> {
//!     Err(UpgradeError::Busy("install lock held".into()).into())
//! }
//!
//! if let Err(e) = check() {
//!     user_friendly_error(e).display();
//! }
//! ```

pub mod error;

pub use error::{ErrorContext, Result, UpgradeError, user_friendly_error};
