//! certdeploy-updater entry point
//!
//! Parses the command line, runs the command and renders failures with
//! suggestions. See [`certdeploy_updater::cli`] for the commands.

use anyhow::Result;
use certdeploy_updater::cli;
use certdeploy_updater::core::user_friendly_error;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // Set up colored output for Windows
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    match cli.execute().await {
        Ok(()) => Ok(()),
        Err(e) => {
            user_friendly_error(e).display();
            std::process::exit(1);
        }
    }
}
