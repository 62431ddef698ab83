//! Persisted self-update settings.
//!
//! These live in the `[upgrade]` table of the agent configuration file:
//!
//! ```toml
//! [upgrade]
//! enabled = true
//! channel = "stable"
//! check_interval_hours = 24
//! last_check = "2026-10-01T08:30:00Z"
//! skipped_version = "3.2.0"
//! release_url = "https://api.github.com/repos/certdeploy/certdeploy-agent/releases/latest"
//! ```

use crate::config::AgentConfig;
use crate::constants::{DEFAULT_CHECK_INTERVAL_HOURS, DEFAULT_RELEASE_URL, EXECUTABLE_SUFFIX};
use crate::core::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Release channel an agent follows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Only final releases.
    #[default]
    Stable,
    /// Final releases and pre-releases.
    Beta,
}

impl Channel {
    /// Whether a release flagged or tagged as a pre-release is acceptable.
    #[must_use]
    pub const fn accepts_prerelease(self) -> bool {
        matches!(self, Self::Beta)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => f.write_str("stable"),
            Self::Beta => f.write_str("beta"),
        }
    }
}

impl FromStr for Channel {
    type Err = crate::core::UpgradeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stable" => Ok(Self::Stable),
            "beta" => Ok(Self::Beta),
            other => Err(crate::core::UpgradeError::Config(format!("unknown channel '{other}'"))),
        }
    }
}

const fn default_enabled() -> bool {
    true
}

const fn default_check_interval_hours() -> u64 {
    DEFAULT_CHECK_INTERVAL_HOURS
}

fn default_release_url() -> String {
    DEFAULT_RELEASE_URL.to_string()
}

fn default_asset_suffix() -> String {
    EXECUTABLE_SUFFIX.to_string()
}

/// Self-update settings of the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeConfig {
    /// Whether periodic update checks run at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Release channel to follow.
    #[serde(default)]
    pub channel: Channel,

    /// Minimum hours between two automatic checks.
    #[serde(default = "default_check_interval_hours")]
    pub check_interval_hours: u64,

    /// RFC 3339 time of the last successful feed round trip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check: Option<String>,

    /// A version the user chose not to install.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_version: Option<String>,

    /// Release feed endpoint.
    #[serde(default = "default_release_url")]
    pub release_url: String,

    /// Base URL of the upgrade-path service, when it is not next to the feed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_path_url: Option<String>,

    /// Name suffix identifying the installable asset of a release.
    #[serde(default = "default_asset_suffix")]
    pub asset_suffix: String,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            channel: Channel::default(),
            check_interval_hours: default_check_interval_hours(),
            last_check: None,
            skipped_version: None,
            release_url: default_release_url(),
            upgrade_path_url: None,
            asset_suffix: default_asset_suffix(),
        }
    }
}

impl UpgradeConfig {
    /// Whether an automatic check is due at `now`.
    ///
    /// Never when disabled. Always when no check was recorded or the stored
    /// timestamp does not parse.
    #[must_use]
    pub fn should_check_at(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }

        let Some(last) = self.last_check.as_deref() else {
            return true;
        };

        match DateTime::parse_from_rfc3339(last) {
            Ok(last) => {
                let elapsed = now.signed_duration_since(last.with_timezone(&Utc));
                let interval = i64::try_from(self.check_interval_hours)
                    .ok()
                    .and_then(chrono::Duration::try_hours)
                    .unwrap_or(chrono::Duration::MAX);
                elapsed >= interval
            }
            Err(e) => {
                tracing::debug!("Ignoring unparsable last_check '{last}': {e}");
                true
            }
        }
    }

    /// Record `now` as the last check time.
    pub fn record_check(&mut self, now: DateTime<Utc>) {
        self.last_check = Some(now.to_rfc3339());
    }

    /// Load the `[upgrade]` table from an agent configuration file, or the
    /// defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Config`](crate::core::UpgradeError::Config) if
    /// the file exists but cannot be read or parsed.
    pub async fn load_from(path: &Path) -> Result<Self> {
        Ok(AgentConfig::load_or_default(path).await?.upgrade)
    }

    /// Write these settings into the `[upgrade]` table of an agent
    /// configuration file, preserving every other table.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Config`](crate::core::UpgradeError::Config) if
    /// the existing file cannot be parsed or the new one cannot be written.
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        let mut agent = AgentConfig::load_or_default(path).await?;
        agent.upgrade = self.clone();
        agent.save_to(path).await
    }
}
