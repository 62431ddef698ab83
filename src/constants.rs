//! Global constants used throughout the updater.
//!
//! Timeouts, size caps, retry parameters and defaults that are shared by
//! more than one module live here so the numbers are discoverable in one
//! place.

use std::time::Duration;

/// Timeout for a single release-feed or upgrade-path request (30 seconds).
pub const FEED_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum accepted size of a release-feed or upgrade-path response (1 MiB).
///
/// Feed bodies are buffered in memory before parsing, so a hostile or
/// misconfigured server must not be able to make us allocate without bound.
pub const MAX_FEED_RESPONSE_BYTES: usize = 1024 * 1024;

/// Timeout for a complete binary download (30 minutes).
///
/// Generous because agents often sit behind slow or metered links.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Minimum interval between two download progress callbacks (100ms).
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Suffix appended to a download destination while it is being written.
pub const DOWNLOAD_TEMP_SUFFIX: &str = ".tmp";

/// File suffix of installable release assets.
pub const EXECUTABLE_SUFFIX: &str = ".exe";

/// Name of the directory, next to the executable, that holds backups.
pub const BACKUP_DIR_NAME: &str = "backup";

/// Extension of backup files.
pub const BACKUP_EXTENSION: &str = "bak";

/// `chrono` format of the timestamp embedded in backup file names.
///
/// Fixed width and most-significant-first, so numeric order is chronological.
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";

/// Number of digits produced by [`BACKUP_TIMESTAMP_FORMAT`].
pub const BACKUP_TIMESTAMP_LEN: usize = 17;

/// Number of backups kept by cleanup.
pub const BACKUPS_TO_KEEP: usize = 1;

/// Name of the lock file that serializes installs across processes.
pub const INSTALL_LOCK_NAME: &str = ".install.lock";

/// Timeout for acquiring the install lock (10 seconds).
///
/// Short on purpose: a second upgrade attempt should give up quickly rather
/// than queue behind the first.
pub const INSTALL_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum backoff delay for exponential backoff (500ms).
pub const MAX_BACKOFF_DELAY_MS: u64 = 500;

/// Starting delay for exponential backoff (10ms).
pub const STARTING_BACKOFF_DELAY_MS: u64 = 10;

/// Default number of attempts for restoring a locked executable.
pub const DEFAULT_RESTORE_ATTEMPTS: usize = 3;

/// Default first delay between restore attempts (1 second).
pub const DEFAULT_RESTORE_DELAY: Duration = Duration::from_secs(1);

/// Default hours between automatic update checks.
pub const DEFAULT_CHECK_INTERVAL_HOURS: u64 = 24;

/// Release feed used when the config file does not name one.
pub const DEFAULT_RELEASE_URL: &str =
    "https://api.github.com/repos/certdeploy/certdeploy-agent/releases/latest";

/// User agent sent with every feed and download request.
pub const USER_AGENT: &str = concat!("certdeploy-updater/", env!("CARGO_PKG_VERSION"));
