//! Error handling for the updater
//!
//! The error system follows two rules:
//! 1. **Strongly-typed errors** inside the library, so the orchestrator can
//!    react differently to a network blip, a hostile feed and a half-applied
//!    install.
//! 2. **User-friendly messages** at the CLI edge, with an actionable
//!    suggestion where one exists.
//!
//! # Error Categories
//!
//! - **Transport**: [`UpgradeError::Network`], [`UpgradeError::Cancelled`]
//! - **Feed content**: [`UpgradeError::Format`]
//! - **Policy**: [`UpgradeError::Policy`], [`UpgradeError::NoUpgradePath`]
//! - **Trust**: [`UpgradeError::SignatureInvalid`], [`UpgradeError::ConfirmationRequired`]
//! - **Consent**: [`UpgradeError::UserCancelled`]
//! - **Installation**: [`UpgradeError::Filesystem`], [`UpgradeError::RollbackFailed`],
//!   [`UpgradeError::Busy`]
//! - **Configuration**: [`UpgradeError::Config`]
//!
//! A fallback-trusted signature that still needs a human decision is *not*
//! an error; it is reported through
//! [`VerifyResult::needs_confirm`](crate::upgrade::VerifyResult::needs_confirm).
//!
//! # Examples
//!
//! ```rust,no_run
//! use certdeploy_updater::core::{UpgradeError, user_friendly_error};
//!
//! let err = UpgradeError::Policy("insecure download URL: http://example.com/a.exe".into());
//! assert!(err.is_policy());
//!
//! let ctx = user_friendly_error(anyhow::Error::from(err));
//! ctx.display();
//! ```

use colored::Colorize;
use std::fmt;
use thiserror::Error;

/// The error type of every fallible operation in the upgrade subsystem.
///
/// Variants carry owned strings rather than source errors so results can be
/// cloned into progress snapshots and reported more than once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum UpgradeError {
    /// The release feed or a download source could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// The feed, its embedded metadata or an upgrade path was malformed.
    #[error("invalid release data: {0}")]
    Format(String),

    /// A request violated the transport or upgrade policy.
    #[error("policy violation: {0}")]
    Policy(String),

    /// The installed version is below the release floor and the vendor
    /// publishes no chained path from it.
    #[error("no upgrade path from {from} to {to}; download the installer from the vendor site")]
    NoUpgradePath {
        /// Installed version.
        from: String,
        /// Release that declared the floor.
        to: String,
    },

    /// The downloaded binary failed signature verification.
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    /// Verification only succeeded through the fallback trust path, in a
    /// context where nobody can be asked to confirm it.
    #[error("update {version} is only trusted by organization/issuer checks and needs manual confirmation")]
    ConfirmationRequired {
        /// Version whose signature needs confirmation.
        version: String,
    },

    /// The user declined an upgrade step.
    #[error("upgrade cancelled by user (installed version: {reached})")]
    UserCancelled {
        /// Version that is installed after the cancellation.
        reached: String,
    },

    /// A download was cancelled or ran past its deadline.
    #[error("download cancelled: {0}")]
    Cancelled(String),

    /// A file operation on the installation failed.
    #[error("file system error: {0}")]
    Filesystem(String),

    /// Applying failed and restoring the previous executable failed as well.
    #[error("update failed: {apply}; rollback also failed: {rollback}")]
    RollbackFailed {
        /// The error that triggered the rollback.
        apply: String,
        /// The error raised while rolling back.
        rollback: String,
    },

    /// Another upgrade attempt holds the install lock.
    #[error("another upgrade is in progress: {0}")]
    Busy(String),

    /// The persisted configuration could not be read or written.
    #[error("configuration error: {0}")]
    Config(String),

    /// A background task of the updater panicked or was aborted.
    #[error("internal error: {0}")]
    Internal(String),
}

impl UpgradeError {
    /// Build a [`UpgradeError::Filesystem`] from an I/O error and what we
    /// were doing when it happened.
    pub fn fs(operation: impl fmt::Display, err: &std::io::Error) -> Self {
        Self::Filesystem(format!("{operation}: {err}"))
    }

    /// Whether the error is a policy refusal that must be shown verbatim.
    #[must_use]
    pub const fn is_policy(&self) -> bool {
        matches!(self, Self::Policy(_) | Self::NoUpgradePath { .. })
    }

    /// Whether an external scheduler may retry the attempt later.
    ///
    /// Nothing inside this crate retries network failures on its own.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Cancelled(_) | Self::Busy(_))
    }

    /// Whether the installation may be left inconsistent and needs a human.
    #[must_use]
    pub const fn needs_manual_intervention(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }

    /// A short message suitable for a notification or status line.
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::Network(_) => "Could not reach the update server. Check the network connection.",
            Self::Format(_) => "The update server returned data that could not be understood.",
            Self::Policy(_) => "The update was refused by the security policy.",
            Self::NoUpgradePath { .. } => {
                "This version is too old to update automatically. Download the installer from the vendor site."
            }
            Self::SignatureInvalid(_) => {
                "The downloaded update is not signed by a trusted publisher and was discarded."
            }
            Self::ConfirmationRequired { .. } => {
                "The update needs to be confirmed manually before it can be installed."
            }
            Self::UserCancelled { .. } => "The update was cancelled.",
            Self::Cancelled(_) => "The download was cancelled or timed out.",
            Self::Filesystem(_) => "The update could not be installed; the previous version was kept.",
            Self::RollbackFailed { .. } => {
                "The update failed and the previous version could not be restored. Reinstall the agent."
            }
            Self::Busy(_) => "Another update is already running.",
            Self::Config(_) => "The updater configuration could not be read or written.",
            Self::Internal(_) => "The updater failed unexpectedly; nothing was installed.",
        }
    }
}

impl From<std::io::Error> for UpgradeError {
    fn from(err: std::io::Error) -> Self {
        Self::Filesystem(err.to_string())
    }
}

impl From<reqwest::Error> for UpgradeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Cancelled(format!("request timed out: {err}"))
        } else if err.is_decode() {
            Self::Format(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for UpgradeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Format(err.to_string())
    }
}

impl From<toml::de::Error> for UpgradeError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for UpgradeError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result alias used across the upgrade subsystem.
pub type Result<T> = std::result::Result<T, UpgradeError>;

/// An error message enriched with details and a suggestion for the CLI.
#[derive(Debug)]
pub struct ErrorContext {
    /// The rendered error.
    pub message: String,
    /// What the user can do about it.
    pub suggestion: Option<String>,
    /// Extra background, shown below the error.
    pub details: Option<String>,
}

impl ErrorContext {
    /// Wrap a rendered error message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            suggestion: None,
            details: None,
        }
    }

    /// Attach a suggestion.
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Attach details.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Print the error to stderr with colors.
    pub fn display(&self) {
        eprintln!("{}: {}", "error".red().bold(), self.message);

        if let Some(details) = &self.details {
            eprintln!("{}: {}", "details".yellow(), details);
        }

        if let Some(suggestion) = &self.suggestion {
            eprintln!("{}: {}", "suggestion".green(), suggestion);
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;

        if let Some(details) = &self.details {
            write!(f, "\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

impl std::error::Error for ErrorContext {}

/// Convert any error into an [`ErrorContext`] with a suggestion.
///
/// [`UpgradeError`]s anywhere in the `anyhow` chain get a tailored
/// suggestion; other errors are rendered with their full context chain.
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    let chain = format!("{error:#}");

    let Some(upgrade_error) = error.chain().find_map(|e| e.downcast_ref::<UpgradeError>()) else {
        let denied = error
            .downcast_ref::<std::io::Error>()
            .is_some_and(|e| e.kind() == std::io::ErrorKind::PermissionDenied);
        if denied {
            return ErrorContext::new(chain)
                .with_suggestion("Run the updater from an elevated (Administrator) prompt");
        }
        return ErrorContext::new(chain);
    };

    let ctx = ErrorContext::new(chain).with_details(upgrade_error.user_message());
    match upgrade_error {
        UpgradeError::Network(_) | UpgradeError::Cancelled(_) => {
            ctx.with_suggestion("Check proxy and firewall settings, then retry later")
        }
        UpgradeError::NoUpgradePath { .. } => ctx.with_suggestion(
            "Download the latest installer from the vendor site and reinstall the agent",
        ),
        UpgradeError::SignatureInvalid(_) => ctx.with_suggestion(
            "Do not install this build; report the release to the vendor security contact",
        ),
        UpgradeError::ConfirmationRequired { .. } => {
            ctx.with_suggestion("Run `certdeploy-updater upgrade` interactively to review the publisher")
        }
        UpgradeError::RollbackFailed { .. } => ctx.with_suggestion(
            "Restore the newest file from the `backup` directory next to the agent executable",
        ),
        UpgradeError::Busy(_) => ctx.with_suggestion("Wait for the running update to finish"),
        UpgradeError::Config(_) => {
            ctx.with_suggestion("Check the [upgrade] table of the agent configuration file")
        }
        _ => ctx,
    }
}
