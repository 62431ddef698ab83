//! Streaming downloads with progress and a transport policy.
//!
//! The body is written to `<dest>.tmp` and renamed over `dest` only after it
//! is complete and synced, so `dest` never holds a partial file. Any failure,
//! cancellation or timeout deletes the temporary file.

use crate::constants::{DOWNLOAD_TEMP_SUFFIX, DOWNLOAD_TIMEOUT, PROGRESS_INTERVAL, USER_AGENT};
use crate::core::{Result, UpgradeError};
use crate::upgrade::cancel::CancelToken;
use reqwest::Url;
use reqwest::redirect::{Attempt, Policy};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const MAX_REDIRECTS: usize = 10;
const SPEED_SAMPLES: usize = 20;

/// A download progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes written so far.
    pub downloaded: u64,
    /// Total size, when the server declared one.
    pub total: Option<u64>,
    /// Recent throughput in bytes per second.
    pub speed: u64,
}

impl DownloadProgress {
    /// Completion percentage, when the total is known.
    #[must_use]
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            #[allow(clippy::cast_precision_loss)]
            Some(total) => Some((self.downloaded as f64 / total as f64 * 100.0).min(100.0)),
        }
    }
}

/// Check that `url` may be downloaded from.
///
/// `https` is always allowed; `http` only for loopback hosts (`localhost`,
/// `127.0.0.0/8`, `::1`).
///
/// # Errors
///
/// Returns [`UpgradeError::Policy`] for anything else, including URLs that do
/// not parse.
pub fn validate_download_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url)
        .map_err(|e| UpgradeError::Policy(format!("invalid download URL '{url}': {e}")))?;
    check_url_policy(&parsed)?;
    Ok(parsed)
}

fn check_url_policy(url: &Url) -> Result<()> {
    match url.scheme() {
        "https" => Ok(()),
        "http" if is_loopback(url) => Ok(()),
        _ => Err(UpgradeError::Policy(format!("insecure download URL: {url}"))),
    }
}

fn is_loopback(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback(),
        Err(_) => host.eq_ignore_ascii_case("localhost"),
    }
}

fn redirect_policy(attempt: Attempt<'_>) -> reqwest::redirect::Action {
    if attempt.previous().len() >= MAX_REDIRECTS {
        return attempt.error("too many redirects");
    }
    match check_url_policy(attempt.url()) {
        Ok(()) => attempt.follow(),
        Err(e) => attempt.error(e.to_string()),
    }
}

/// Temporary path used while downloading to `dest`.
#[must_use]
pub fn temp_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(DOWNLOAD_TEMP_SUFFIX);
    PathBuf::from(name)
}

struct ProgressTracker {
    downloaded: u64,
    total: Option<u64>,
    samples: VecDeque<(Instant, u64)>,
    last_emit: Instant,
    interval: Duration,
}

impl ProgressTracker {
    fn new(total: Option<u64>, interval: Duration) -> Self {
        let now = Instant::now();
        let mut samples = VecDeque::with_capacity(SPEED_SAMPLES + 1);
        samples.push_back((now, 0));
        Self {
            downloaded: 0,
            total,
            samples,
            last_emit: now,
            interval,
        }
    }

    fn advance(&mut self, bytes: usize) {
        self.downloaded += bytes as u64;
        self.samples.push_back((Instant::now(), self.downloaded));
        if self.samples.len() > SPEED_SAMPLES {
            self.samples.pop_front();
        }
    }

    fn speed(&self) -> u64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0;
        };
        let elapsed = last.0.duration_since(first.0).as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let speed = (last.1.saturating_sub(first.1) as f64 / elapsed) as u64;
        speed
    }

    fn poll(&mut self) -> Option<DownloadProgress> {
        let now = Instant::now();
        if now.duration_since(self.last_emit) >= self.interval {
            self.last_emit = now;
            Some(self.snapshot())
        } else {
            None
        }
    }

    fn snapshot(&self) -> DownloadProgress {
        DownloadProgress {
            downloaded: self.downloaded,
            total: self.total,
            speed: self.speed(),
        }
    }
}

/// Streams remote assets to disk.
#[derive(Debug, Clone)]
pub struct FileDownloader {
    client: reqwest::Client,
    timeout: Duration,
    progress_interval: Duration,
}

impl FileDownloader {
    /// A downloader with the default timeout.
    ///
    /// Redirects are followed only to URLs that pass
    /// [`validate_download_url`].
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Network`] if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(Policy::custom(redirect_policy))
            .build()
            .map_err(|e| UpgradeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout: DOWNLOAD_TIMEOUT,
            progress_interval: PROGRESS_INTERVAL,
        })
    }

    /// Override the overall download deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Download `url` into `dest`, returning the number of bytes written.
    ///
    /// `on_progress` is called at most once per progress interval while the
    /// body streams, and exactly once more with the final count.
    ///
    /// # Errors
    ///
    /// - [`UpgradeError::Policy`] if the URL fails the transport policy
    /// - [`UpgradeError::Network`] on transport failure, a non-success status or
    ///   a body shorter than its declared length
    /// - [`UpgradeError::Cancelled`] if `cancel` fires or the deadline passes
    /// - [`UpgradeError::Filesystem`] if the file cannot be written or moved
    pub async fn download<F>(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> Result<u64>
    where
        F: FnMut(DownloadProgress),
    {
        let url = validate_download_url(url)?;
        let tmp = temp_path(dest);
        info!(%url, dest = %dest.display(), "Downloading");

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(UpgradeError::Cancelled("download cancelled".to_string())),
            timed = tokio::time::timeout(self.timeout, self.stream_to(&url, &tmp, &mut on_progress)) => {
                timed.unwrap_or_else(|_| {
                    Err(UpgradeError::Cancelled(format!(
                        "download did not finish within {}s",
                        self.timeout.as_secs()
                    )))
                })
            }
        };

        let result = match result {
            Ok(bytes) => finalize(&tmp, dest).await.map(|()| bytes),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!("Download of {url} failed: {e}");
            remove_if_exists(&tmp).await;
        }
        result
    }

    async fn stream_to<F>(&self, url: &Url, tmp: &Path, on_progress: &mut F) -> Result<u64>
    where
        F: FnMut(DownloadProgress),
    {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| UpgradeError::Network(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpgradeError::Network(format!("download returned HTTP {status}")));
        }

        let total = response.content_length();
        let mut file = create_private(tmp).await?;
        let mut tracker = ProgressTracker::new(total, self.progress_interval);

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| UpgradeError::Network(format!("download interrupted: {e}")))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| UpgradeError::fs(format!("writing {}", tmp.display()), &e))?;
            tracker.advance(chunk.len());
            if let Some(progress) = tracker.poll() {
                on_progress(progress);
            }
        }

        if let Some(total) = total {
            if tracker.downloaded < total {
                return Err(UpgradeError::Network(format!(
                    "download truncated: received {} of {total} bytes",
                    tracker.downloaded
                )));
            }
        }

        file.flush()
            .await
            .map_err(|e| UpgradeError::fs(format!("flushing {}", tmp.display()), &e))?;
        file.sync_all()
            .await
            .map_err(|e| UpgradeError::fs(format!("syncing {}", tmp.display()), &e))?;
        drop(file);

        on_progress(tracker.snapshot());
        debug!(bytes = tracker.downloaded, "Download complete");
        Ok(tracker.downloaded)
    }
}

async fn create_private(path: &Path) -> Result<fs::File> {
    remove_if_exists(path).await;

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    options
        .open(path)
        .await
        .map_err(|e| UpgradeError::fs(format!("creating {}", path.display()), &e))
}

async fn finalize(tmp: &Path, dest: &Path) -> Result<()> {
    if fs::try_exists(dest).await.unwrap_or(false) {
        fs::remove_file(dest)
            .await
            .map_err(|e| UpgradeError::fs(format!("removing {}", dest.display()), &e))?;
    }
    fs::rename(tmp, dest)
        .await
        .map_err(|e| UpgradeError::fs(format!("moving download to {}", dest.display()), &e))
}

async fn remove_if_exists(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {e}", path.display()),
    }
}
