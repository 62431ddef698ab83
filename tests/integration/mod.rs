//! Integration test suite for certdeploy-updater
//!
//! End-to-end tests against an in-process HTTP server
//! ([`certdeploy_updater::test_utils::TestServer`]). They bind loopback ports
//! only and run in CI on every commit.
//!
//! # Running Integration Tests
//!
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//!
//! - **cli**: the `upgrade` command run as a subprocess
//! - **download**: streaming, truncation, cancellation, timeouts, URL policy
//! - **feed**: release feed selection and the upgrade-path service
//! - **install**: executable swap, backups, the install lock and rollback

mod cli;
mod download;
mod feed;
mod install;
