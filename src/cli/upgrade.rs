//! The `upgrade` command.
//!
//! Without flags it performs a full upgrade: check the feed, download the
//! new build, verify its publisher signature, ask for confirmation and swap
//! the executable. When the new release requires a newer installed version
//! than the current one, it walks the published upgrade path one step per
//! run; the agent must be restarted between steps.
//!
//! # Examples
//!
//! ```bash
//! certdeploy-updater upgrade --check
//! certdeploy-updater upgrade --yes
//! certdeploy-updater upgrade --rollback
//! certdeploy-updater --config C:\ProgramData\certdeploy\config.toml upgrade --status
//! ```
//!
//! `--yes` answers the install prompt. A build trusted only through the
//! organization, country and issuer checks is always confirmed on stdin, and
//! refused when no answer can be read.

use super::CliConfig;
use super::progress::UpgradeBar;
use crate::config::{AgentConfig, Channel};
use crate::core::UpgradeError;
use crate::upgrade::{ChainOutcome, ReleaseInfo, SelfUpdater, UpdateCheck, UpgradeStep, Upgrader};
use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::debug;

/// Check for, install or roll back agent updates.
#[derive(Parser, Debug)]
pub struct UpgradeArgs {
    /// Only report whether an update is available
    #[arg(long, conflicts_with_all = ["status", "rollback", "skip"])]
    pub check: bool,

    /// Show the installed version, channel and backup state
    #[arg(short, long, conflicts_with_all = ["rollback", "skip"])]
    pub status: bool,

    /// Restore the executable saved by the last upgrade
    #[arg(long, conflicts_with = "skip")]
    pub rollback: bool,

    /// Install without asking
    #[arg(short, long)]
    pub yes: bool,

    /// Never offer VERSION again
    #[arg(long, value_name = "VERSION")]
    pub skip: Option<String>,

    /// Switch release channel (persisted)
    #[arg(long, value_enum)]
    pub channel: Option<Channel>,

    /// Executable to upgrade instead of this one
    #[arg(long, value_name = "PATH", hide = true)]
    pub executable: Option<PathBuf>,

    /// Installed version to report instead of this build's
    #[arg(long, value_name = "VERSION", hide = true)]
    pub current_version: Option<String>,
}

/// Run the `upgrade` command.
///
/// # Errors
///
/// Configuration, network, verification and install failures, with context.
pub async fn execute(args: UpgradeArgs, cli: &CliConfig) -> Result<()> {
    let config_path = match &cli.config_path {
        Some(path) => path.clone(),
        None => AgentConfig::default_path()?,
    };
    debug!(path = %config_path.display(), "Using agent configuration");

    let mut config = crate::config::UpgradeConfig::load_from(&config_path)
        .await
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let channel_changed = args.channel.is_some_and(|c| c != config.channel);
    if let Some(channel) = args.channel {
        config.channel = channel;
    }

    let updater = match &args.executable {
        Some(path) => SelfUpdater::new(path),
        None => SelfUpdater::for_current_exe()?,
    };
    let current = args
        .current_version
        .clone()
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

    let upgrader = Upgrader::new(current, config, updater)?.with_config_path(&config_path);

    if channel_changed {
        upgrader
            .config()
            .save_to(&config_path)
            .await
            .context("Failed to save channel")?;
        println!("Following the {} channel", upgrader.config().channel.to_string().cyan());
    }

    if args.rollback {
        return handle_rollback(&upgrader).await;
    }
    if let Some(version) = &args.skip {
        return skip_version(upgrader, version).await;
    }
    if args.status {
        return show_status(&upgrader).await;
    }

    let bar = UpgradeBar::new(!cli.no_progress);
    upgrader.set_progress_callback({
        let bar = bar.clone();
        move |progress| bar.update(&progress)
    });

    let result = run(upgrader, &args).await;
    bar.clear();
    result
}

async fn run(mut upgrader: Upgrader, args: &UpgradeArgs) -> Result<()> {
    let current = upgrader.current_version().to_string();
    let check = upgrader
        .check_for_update(&current)
        .await
        .context("Failed to check for updates")?;
    match check {
        UpdateCheck::UpToDate => {
            println!("{}", format!("You are on the latest version ({current})").green());
            Ok(())
        }
        UpdateCheck::Available(info) if args.check => {
            print_release(&current, &info);
            println!("Run `certdeploy-updater upgrade` to install it");
            Ok(())
        }
        UpdateCheck::ChainRequired(info) if args.check => {
            print_release(&current, &info);
            println!(
                "{}",
                format!(
                    "This release requires {} or later; it is installed in steps",
                    info.min_version.as_deref().unwrap_or_default()
                )
                .yellow()
            );
            Ok(())
        }
        UpdateCheck::Available(info) => install_direct(&upgrader, &current, &info, args.yes).await,
        UpdateCheck::ChainRequired(info) => install_chain(&upgrader, &current, &info, args.yes).await,
    }
}

fn print_release(current: &str, info: &ReleaseInfo) {
    println!(
        "{}",
        format!("Update available: {current} -> {}", info.version).green()
    );
    if let Some(date) = info.release_date {
        println!("Released {}", date.format("%Y-%m-%d"));
    }
    if !info.release_notes.is_empty() {
        println!();
        println!("{}", info.release_notes);
        println!();
    }
}

async fn install_direct(upgrader: &Upgrader, current: &str, info: &ReleaseInfo, yes: bool) -> Result<()> {
    print_release(current, info);
    if !yes && !prompt(&format!("Install version {}?", info.version)) {
        println!("{}", "Upgrade cancelled.".yellow());
        return Ok(());
    }

    let approved = match upgrader
        .download_and_verify(info, |offered| confirm_fallback(upgrader, &offered.version))
        .await
    {
        Ok(approved) => approved,
        Err(UpgradeError::UserCancelled { .. }) => {
            println!("{}", "Upgrade cancelled.".yellow());
            return Ok(());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to download version {}", info.version));
        }
    };

    let plan = upgrader
        .apply_update(approved)
        .await
        .with_context(|| format!("Failed to install version {}", info.version))?;

    println!("{}", format!("Upgraded to {}", plan.target_version).green().bold());
    println!("Previous executable saved to {}", plan.backup.display());
    println!("Restart the agent to run the new version.");
    Ok(())
}

async fn install_chain(upgrader: &Upgrader, current: &str, info: &ReleaseInfo, yes: bool) -> Result<()> {
    print_release(current, info);
    let path = upgrader.resolve_upgrade_path(current, info).await?;

    println!("Upgrade path from {current}:");
    for (i, step) in path.steps.iter().enumerate() {
        println!("  {}. {}", i + 1, step.version);
    }

    let ask = |step: &UpgradeStep, index: usize, total: usize| {
        if yes {
            return true;
        }
        if !step.release_notes.is_empty() {
            println!("{}", step.release_notes);
        }
        prompt(&format!("Install step {}/{total} ({})?", index + 1, step.version))
    };

    let outcome = match upgrader.chain_upgrade(&path, current, ask).await {
        Ok(outcome) => outcome,
        Err(UpgradeError::UserCancelled { reached }) => {
            println!("{}", format!("Upgrade stopped at {reached}.").yellow());
            return Ok(());
        }
        Err(e) => return Err(e).context("Chained upgrade failed"),
    };

    match outcome {
        ChainOutcome::RestartRequired { reached, remaining } => {
            println!("{}", format!("Upgraded to {reached}").green().bold());
            println!(
                "Restart the agent and run `certdeploy-updater upgrade` again; {remaining} step(s) left."
            );
        }
        ChainOutcome::Completed { reached } => {
            println!("{}", format!("Upgraded to {reached}").green().bold());
            println!("Restart the agent to run the new version.");
        }
    }
    Ok(())
}

fn confirm_fallback(upgrader: &Upgrader, version: &str) -> bool {
    let progress = upgrader.progress();
    println!();
    println!("{}", "The publisher signature needs manual confirmation.".yellow().bold());
    println!("{}", progress.message);
    prompt(&format!("Trust this signer and install {version}?"))
}

async fn handle_rollback(upgrader: &Upgrader) -> Result<()> {
    println!("{}", "Rolling back to previous version...".yellow());
    let restored = upgrader
        .rollback_latest()
        .await
        .context("Failed to restore from backup")?;
    println!("{}", "Successfully rolled back to previous version".green());
    debug!(backup = %restored.display(), "Restored backup");
    Ok(())
}

async fn skip_version(mut upgrader: Upgrader, version: &str) -> Result<()> {
    upgrader
        .skip_version(version)
        .await
        .context("Failed to save skipped version")?;
    println!("Version {} will not be offered again", version.cyan());
    Ok(())
}

async fn show_status(upgrader: &Upgrader) -> Result<()> {
    let config = upgrader.config();
    println!("{} {}", "Installed version:".bold(), upgrader.current_version());
    println!("{} {}", "Channel:".bold(), config.channel);
    println!(
        "{} {}",
        "Automatic checks:".bold(),
        if config.enabled {
            format!("every {}h", config.check_interval_hours)
        } else {
            "disabled".to_string()
        }
    );
    println!(
        "{} {}",
        "Last check:".bold(),
        config.last_check.as_deref().unwrap_or("never")
    );
    if let Some(skipped) = &config.skipped_version {
        println!("{} {skipped}", "Skipped version:".bold());
    }
    if upgrader.should_check_update() {
        println!("{}", "A check is due.".cyan());
    }

    match upgrader.latest_backup().await {
        Ok(Some(backup)) => println!("{} {}", "Rollback available:".bold(), backup.display()),
        Ok(None) => println!("{} none", "Rollback available:".bold()),
        Err(e) => debug!("Unable to list backups: {e}"),
    }
    Ok(())
}

/// Ask a yes/no question on stdin. End of input or a read error counts as no.
///
/// Runs under `block_in_place`; callers include synchronous approval callbacks.
fn prompt(question: &str) -> bool {
    match tokio::task::block_in_place(|| read_answer(question, &mut io::stdin().lock())) {
        Ok(answer) => answer,
        Err(e) => {
            debug!("Could not read an answer, treating it as no: {e}");
            false
        }
    }
}

fn read_answer(question: &str, input: &mut impl BufRead) -> io::Result<bool> {
    print!("{} ", format!("{question} [y/N]:").green());
    io::stdout().flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    let answer = answer.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}
