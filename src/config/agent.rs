//! The agent configuration file.
//!
//! The updater owns only the `[upgrade]` table; every other table belongs to
//! the agent and is carried through load/save untouched.

use crate::config::UpgradeConfig;
use crate::core::{Result, UpgradeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Environment variable overriding the configuration file location.
pub const CONFIG_PATH_ENV: &str = "CERTDEPLOY_CONFIG_PATH";

/// Agent configuration file contents as seen by the updater.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Self-update settings.
    #[serde(default)]
    pub upgrade: UpgradeConfig,

    /// Tables owned by the agent.
    #[serde(flatten)]
    pub other: toml::Table,
}

impl AgentConfig {
    /// Default configuration file location.
    ///
    /// `CERTDEPLOY_CONFIG_PATH` when set, otherwise
    /// `<config dir>/certdeploy/config.toml`.
    ///
    /// # Errors
    ///
    /// Returns an error if no platform configuration directory exists.
    pub fn default_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
            return Ok(PathBuf::from(path));
        }

        let dir = dirs::config_dir().ok_or_else(|| {
            UpgradeError::Config("unable to determine the configuration directory".to_string())
        })?;
        Ok(dir.join("certdeploy").join("config.toml"))
    }

    /// Load from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Config`] if the file cannot be read or is not
    /// valid TOML.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            UpgradeError::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        toml::from_str(&content)
            .map_err(|e| UpgradeError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Load from `path`, or return defaults when it does not exist.
    ///
    /// # Errors
    ///
    /// Same as [`AgentConfig::load_from`] for an existing file.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::load_from(path).await
        } else {
            tracing::debug!("No configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save to `path`, creating parent directories. The file is made
    /// owner-only on Unix.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Config`] if serialization or any write fails.
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                UpgradeError::Config(format!(
                    "failed to create config directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let content = toml::to_string_pretty(self)?;

        fs::write(path, content).await.map_err(|e| {
            UpgradeError::Config(format!("failed to write {}: {e}", path.display()))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let mut perms = fs::metadata(path)
                .await
                .map_err(|e| UpgradeError::Config(format!("failed to stat {}: {e}", path.display())))?
                .permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms).await.map_err(|e| {
                UpgradeError::Config(format!(
                    "failed to set permissions on {}: {e}",
                    path.display()
                ))
            })?;
        }

        Ok(())
    }
}
