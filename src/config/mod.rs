//! Configuration for the updater
//!
//! Two layers with very different trust levels:
//!
//! 1. **Agent configuration file** ([`AgentConfig`], [`UpgradeConfig`]):
//!    user-writable TOML holding the `[upgrade]` table (channel, interval,
//!    last check, skipped version, feed URLs)
//! 2. **Trust policy** ([`TrustPolicy`]): compiled into the binary, never
//!    loaded from disk
//!
//! # Location
//!
//! `CERTDEPLOY_CONFIG_PATH` when set, otherwise
//! - Windows: `%APPDATA%\certdeploy\config.toml`
//! - Linux: `~/.config/certdeploy/config.toml`
//! - macOS: `~/Library/Application Support/certdeploy/config.toml`

mod agent;
mod trust;
mod upgrade;

pub use agent::{AgentConfig, CONFIG_PATH_ENV};
pub use trust::{FallbackPolicy, TrustPolicy, split_list};
pub use upgrade::{Channel, UpgradeConfig};
