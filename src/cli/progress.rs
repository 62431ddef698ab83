//! Terminal rendering of upgrade progress.

use crate::upgrade::{UpdateProgress, UpdateStatus};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn download_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:.bold.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        .map_or_else(|_| ProgressStyle::default_bar(), |s| s.progress_chars("━╸━"))
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{prefix:.bold} {spinner:.cyan} {msg}")
        .map_or_else(
            |_| ProgressStyle::default_spinner(),
            |s| s.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        )
}

fn label(status: UpdateStatus) -> &'static str {
    match status {
        UpdateStatus::Checking => "Checking",
        UpdateStatus::Downloading => "Downloading",
        UpdateStatus::Verifying => "Verifying",
        UpdateStatus::Applying => "Installing",
        _ => "",
    }
}

/// Mirrors [`UpdateProgress`] snapshots onto an indicatif bar.
///
/// A bar lives only while work is running; states that hand control back
/// to the user (available, ready, success, failed) clear it so prompts and
/// results print cleanly.
#[derive(Clone)]
pub struct UpgradeBar {
    enabled: bool,
    current: Arc<Mutex<Option<ProgressBar>>>,
}

impl UpgradeBar {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: enabled && std::io::stdout().is_terminal(),
            current: Arc::default(),
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        let mut guard = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let bar = guard.get_or_insert_with(|| {
            let bar = ProgressBar::new_spinner();
            bar.set_style(spinner_style());
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });
        f(bar);
    }

    /// Render one snapshot.
    pub fn update(&self, progress: &UpdateProgress) {
        if !self.enabled {
            return;
        }

        match progress.status {
            UpdateStatus::Downloading => self.with_bar(|bar| {
                if let Some(total) = progress.total {
                    if bar.length() != Some(total) {
                        bar.disable_steady_tick();
                        bar.set_style(download_style());
                        bar.set_length(total);
                    }
                }
                bar.set_prefix(label(progress.status));
                bar.set_position(progress.downloaded);
            }),
            UpdateStatus::Checking | UpdateStatus::Verifying | UpdateStatus::Applying => {
                self.with_bar(|bar| {
                    bar.set_style(spinner_style());
                    bar.enable_steady_tick(Duration::from_millis(100));
                    bar.set_prefix(label(progress.status));
                    bar.set_message(progress.message.clone());
                });
            }
            _ => self.clear(),
        }
    }

    /// Remove the current bar, if any.
    pub fn clear(&self) {
        let taken = match self.current.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(bar) = taken {
            bar.finish_and_clear();
        }
    }
}
