//! Command-line interface for the updater.
//!
//! The binary exposes a single `upgrade` command that drives the
//! [`Upgrader`](crate::upgrade::Upgrader) interactively:
//!
//! ```bash
//! certdeploy-updater upgrade --check          # Report whether an update exists
//! certdeploy-updater upgrade --status         # Show version, channel and backups
//! certdeploy-updater upgrade                  # Download, verify and install
//! certdeploy-updater upgrade --yes            # Same, without the install prompt
//! certdeploy-updater upgrade --rollback       # Restore the previous executable
//! certdeploy-updater upgrade --skip 1.4.0     # Never offer 1.4.0 again
//! certdeploy-updater upgrade --channel beta   # Follow pre-releases
//! ```
//!
//! Global flags control logging (`--verbose`, `--quiet`), progress bars
//! (`--no-progress`) and the agent configuration file (`--config`).

mod progress;
pub mod upgrade;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Settings derived from the global flags, passed to every command.
///
/// Tests build one directly instead of parsing arguments.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    /// Log level for this crate; `None` logs errors only.
    pub log_level: Option<String>,

    /// Disable progress bars.
    pub no_progress: bool,

    /// Agent configuration file overriding the default location.
    pub config_path: Option<PathBuf>,
}

impl CliConfig {
    /// Defaults: `warn` logging, progress bars on, default config path.
    #[must_use]
    pub fn new() -> Self {
        Self {
            log_level: Some("warn".to_string()),
            ..Self::default()
        }
    }

    /// Install the global `tracing` subscriber.
    ///
    /// `RUST_LOG` wins over the configured level unless `--verbose` asked for
    /// `debug`. Logs go to stderr so they never mix with command output.
    pub fn init_logging(&self) {
        let level = self.log_level.as_deref().unwrap_or("error");
        let fallback = || EnvFilter::new(format!("certdeploy_updater={level}"));
        let filter = if level == "debug" {
            fallback()
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback())
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    }
}

/// Self-update client for the certdeploy agent.
#[derive(Parser, Debug)]
#[command(
    name = "certdeploy-updater",
    about = "Keep the certdeploy agent up to date",
    version,
    long_about = "Checks the vendor release feed, downloads and verifies signed agent builds, \
                  and replaces the installed executable with rollback support."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show debug output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to the agent configuration file
    ///
    /// Defaults to `$CERTDEPLOY_CONFIG_PATH`, else the platform config
    /// directory (`certdeploy/config.toml`).
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Disable progress bars
    #[arg(long, global = true)]
    no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check for, install or roll back agent updates
    Upgrade(upgrade::UpgradeArgs),
}

impl Cli {
    /// Run the parsed command.
    ///
    /// # Errors
    ///
    /// Returns the command's error with context for display.
    pub async fn execute(self) -> Result<()> {
        let config = self.build_config();
        config.init_logging();
        self.execute_with_config(config).await
    }

    /// Translate global flags into a [`CliConfig`].
    #[must_use]
    pub fn build_config(&self) -> CliConfig {
        let log_level = if self.verbose {
            Some("debug".to_string())
        } else if self.quiet {
            None
        } else {
            Some("warn".to_string())
        };

        CliConfig {
            log_level,
            no_progress: self.no_progress || self.quiet,
            config_path: self.config.clone(),
        }
    }

    /// Run the command with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns the command's error with context for display.
    pub async fn execute_with_config(self, config: CliConfig) -> Result<()> {
        match self.command {
            Commands::Upgrade(args) => upgrade::execute(args, &config).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_config_levels() {
        let cli = Cli::parse_from(["certdeploy-updater", "--verbose", "upgrade", "--check"]);
        assert_eq!(cli.build_config().log_level.as_deref(), Some("debug"));

        let cli = Cli::parse_from(["certdeploy-updater", "upgrade", "--quiet"]);
        let config = cli.build_config();
        assert_eq!(config.log_level, None);
        assert!(config.no_progress);

        let cli = Cli::parse_from(["certdeploy-updater", "upgrade", "-c", "/tmp/agent.toml"]);
        let config = cli.build_config();
        assert_eq!(config.log_level.as_deref(), Some("warn"));
        assert_eq!(config.config_path, Some(PathBuf::from("/tmp/agent.toml")));
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        let result = Cli::try_parse_from(["certdeploy-updater", "-v", "-q", "upgrade"]);
        assert!(result.is_err());
    }
}
