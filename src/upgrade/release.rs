//! Release feed queries.
//!
//! [`ReleaseChecker`] talks to a GitHub-Releases-compatible JSON feed and to
//! the upgrade-path service that publishes chained upgrades for installs too
//! old to jump straight to the newest release.
//!
//! Feed bodies are attacker-controlled input: they are read with a hard size
//! cap before parsing, and every field is validated before it reaches a
//! [`ReleaseInfo`].

use crate::config::{Channel, UpgradeConfig};
use crate::constants::{EXECUTABLE_SUFFIX, FEED_TIMEOUT, MAX_FEED_RESPONSE_BYTES, USER_AGENT};
use crate::core::{Result, UpgradeError};
use crate::upgrade::metadata::{ReleaseMetadata, clean_release_notes};
use crate::version::Version;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tracing::{debug, info, warn};

/// A release selected from the feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseInfo {
    /// Version without the leading `v`.
    pub version: String,
    /// Channel the release belongs to.
    pub channel: Channel,
    /// Publication time, when the feed supplied a valid one.
    pub release_date: Option<DateTime<Utc>>,
    /// Download URL of the executable asset.
    pub download_url: String,
    /// Asset size in bytes as declared by the feed.
    pub file_size: u64,
    /// Asset file name.
    pub asset_name: String,
    /// Release title.
    pub title: String,
    /// Release notes with the metadata marker removed.
    pub release_notes: String,
    /// Lowest installed version this release may be applied over directly.
    pub min_version: Option<String>,
    /// Server-supplied signer fingerprints.
    pub fingerprints: Vec<String>,
}

/// One step of a chained upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpgradeStep {
    /// Version installed by this step.
    pub version: String,
    /// Download URL of the step's executable.
    pub download_url: String,
    /// Declared size in bytes.
    #[serde(default)]
    pub file_size: u64,
    /// Server-supplied signer fingerprints for this step.
    #[serde(default, deserialize_with = "deserialize_fingerprints")]
    pub fingerprints: Vec<String>,
    /// Notes shown when asking for confirmation.
    #[serde(default)]
    pub release_notes: String,
}

/// An ordered chain of upgrades. Each step needs a process restart before
/// the next one can be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradePath {
    /// Version the path starts from.
    pub from: String,
    /// Version the path ends at.
    pub to: String,
    /// Steps in application order, strictly increasing.
    pub steps: Vec<UpgradeStep>,
}

impl UpgradePath {
    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the path has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct FeedAsset {
    name: String,
    #[serde(default)]
    size: u64,
    browser_download_url: String,
}

#[derive(Debug, Deserialize)]
struct FeedRelease {
    tag_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    assets: Vec<FeedAsset>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Feed {
    Many(Vec<FeedRelease>),
    One(Box<FeedRelease>),
}

#[derive(Debug, Deserialize)]
struct PathResponse {
    #[serde(default)]
    steps: Vec<UpgradeStep>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FingerprintList {
    List(Vec<String>),
    Joined(String),
}

fn deserialize_fingerprints<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<FingerprintList> = Option::deserialize(deserializer)?;
    Ok(match raw {
        None => Vec::new(),
        Some(FingerprintList::List(list)) => list
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(FingerprintList::Joined(joined)) => crate::config::split_list(&joined),
    })
}

/// Client for the release feed and the upgrade-path service.
#[derive(Debug, Clone)]
pub struct ReleaseChecker {
    client: reqwest::Client,
    release_url: String,
    upgrade_path_url: Option<String>,
    asset_suffix: String,
}

impl ReleaseChecker {
    /// Create a checker for `release_url`.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Network`] if the HTTP client cannot be built.
    pub fn new(release_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(FEED_TIMEOUT)
            .build()
            .map_err(|e| UpgradeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            release_url: release_url.into(),
            upgrade_path_url: None,
            asset_suffix: EXECUTABLE_SUFFIX.to_string(),
        })
    }

    /// Create a checker from the persisted settings.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Network`] if the HTTP client cannot be built.
    pub fn from_config(config: &UpgradeConfig) -> Result<Self> {
        Ok(Self::new(config.release_url.clone())?
            .with_upgrade_path_url(config.upgrade_path_url.clone())
            .with_asset_suffix(config.asset_suffix.clone()))
    }

    /// Override the upgrade-path service base URL.
    #[must_use]
    pub fn with_upgrade_path_url(mut self, url: Option<String>) -> Self {
        self.upgrade_path_url = url.filter(|u| !u.trim().is_empty());
        self
    }

    /// Override the asset name suffix.
    #[must_use]
    pub fn with_asset_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.asset_suffix = suffix.into();
        self
    }

    /// The feed URL.
    #[must_use]
    pub fn release_url(&self) -> &str {
        &self.release_url
    }

    /// Query the feed for a release newer than `current`.
    ///
    /// Returns `None` when the newest release on `channel` is not newer than
    /// `current` or is the `skipped` version.
    ///
    /// # Errors
    ///
    /// - [`UpgradeError::Network`] on transport failure or a non-success status
    /// - [`UpgradeError::Format`] on an oversized or unparseable feed, an
    ///   unparseable `current`, or a selected release without an executable asset
    pub async fn check_update(
        &self,
        channel: Channel,
        current: &str,
        skipped: Option<&str>,
    ) -> Result<Option<ReleaseInfo>> {
        debug!(url = %self.release_url, %channel, %current, "Checking release feed");

        let (status, body) = self.fetch_capped(&self.release_url, &[]).await?;
        if !status.is_success() {
            return Err(UpgradeError::Network(format!(
                "release feed returned HTTP {status}"
            )));
        }

        let feed: Feed = serde_json::from_slice(&body)
            .map_err(|e| UpgradeError::Format(format!("invalid release feed: {e}")))?;
        let releases = match feed {
            Feed::Many(list) => list,
            Feed::One(release) => vec![*release],
        };

        let selected = select_release(releases, channel, current, skipped, &self.asset_suffix)?;
        match &selected {
            Some(info) => info!(version = %info.version, "Update available"),
            None => debug!("No newer release on the {channel} channel"),
        }
        Ok(selected)
    }

    /// Ask the upgrade-path service for a chain from `current` to `target`.
    ///
    /// `404` or an empty step list give `None`.
    ///
    /// # Errors
    ///
    /// - [`UpgradeError::Network`] on transport failure or another non-success status
    /// - [`UpgradeError::Format`] on an unparseable body or a chain whose
    ///   versions are not strictly increasing from `current`
    pub async fn get_upgrade_path(&self, current: &str, target: &str) -> Result<Option<UpgradePath>> {
        let url = format!("{}/upgrade-path", self.upgrade_path_base()?);
        debug!(%url, %current, %target, "Requesting upgrade path");

        let (status, body) = self.fetch_capped(&url, &[("from", current), ("to", target)]).await?;
        if status == StatusCode::NOT_FOUND {
            info!(%current, %target, "No upgrade path published");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(UpgradeError::Network(format!(
                "upgrade-path service returned HTTP {status}"
            )));
        }

        let response: PathResponse = serde_json::from_slice(&body)
            .map_err(|e| UpgradeError::Format(format!("invalid upgrade path: {e}")))?;
        if response.steps.is_empty() {
            return Ok(None);
        }

        validate_steps(current, &response.steps)?;
        Ok(Some(UpgradePath {
            from: current.to_string(),
            to: target.to_string(),
            steps: response.steps,
        }))
    }

    /// Base URL of the upgrade-path service.
    ///
    /// The configured override, else the release URL cut at its `releases`
    /// segment, else the release URL without its last path segment.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Format`] if the release URL does not parse.
    pub fn upgrade_path_base(&self) -> Result<String> {
        if let Some(url) = &self.upgrade_path_url {
            return Ok(url.trim_end_matches('/').to_string());
        }

        let mut url = reqwest::Url::parse(&self.release_url)
            .map_err(|e| UpgradeError::Format(format!("invalid release URL: {e}")))?;
        let segments: Vec<String> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();

        let keep = segments
            .iter()
            .position(|s| s == "releases")
            .unwrap_or_else(|| segments.len().saturating_sub(1));
        url.set_path(&segments[..keep].join("/"));
        url.set_query(None);
        url.set_fragment(None);

        Ok(url.as_str().trim_end_matches('/').to_string())
    }

    async fn fetch_capped(&self, url: &str, query: &[(&str, &str)]) -> Result<(StatusCode, Vec<u8>)> {
        let mut response = self
            .client
            .get(url)
            .query(query)
            .header(ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| UpgradeError::Network(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if let Some(len) = response.content_length() {
            if len > MAX_FEED_RESPONSE_BYTES as u64 {
                return Err(UpgradeError::Format(format!(
                    "response from {url} is {len} bytes, limit is {MAX_FEED_RESPONSE_BYTES}"
                )));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| UpgradeError::Network(format!("reading {url} failed: {e}")))?
        {
            if body.len() + chunk.len() > MAX_FEED_RESPONSE_BYTES {
                return Err(UpgradeError::Format(format!(
                    "response from {url} exceeds {MAX_FEED_RESPONSE_BYTES} bytes"
                )));
            }
            body.extend_from_slice(&chunk);
        }

        Ok((status, body))
    }
}

fn select_release(
    releases: Vec<FeedRelease>,
    channel: Channel,
    current: &str,
    skipped: Option<&str>,
    asset_suffix: &str,
) -> Result<Option<ReleaseInfo>> {
    let current = Version::parse(current)?;

    let newest = releases
        .into_iter()
        .filter(|r| !r.draft)
        .filter_map(|r| match Version::parse(&r.tag_name) {
            Ok(v) => Some((v, r)),
            Err(e) => {
                debug!("Skipping release with unparsable tag '{}': {e}", r.tag_name);
                None
            }
        })
        .filter(|(v, r)| channel.accepts_prerelease() || !(r.prerelease || v.is_prerelease()))
        .max_by(|(a, _), (b, _)| a.cmp(b));

    let Some((version, release)) = newest else {
        return Ok(None);
    };

    if version <= current {
        return Ok(None);
    }

    if let Some(skipped) = skipped {
        let is_skipped = Version::parse(skipped).map_or(skipped == version.as_str(), |s| s == version);
        if is_skipped {
            info!(version = %version, "Newest release is the skipped version");
            return Ok(None);
        }
    }

    let suffix = asset_suffix.to_ascii_lowercase();
    let asset = release
        .assets
        .iter()
        .find(|a| a.name.to_ascii_lowercase().ends_with(&suffix))
        .ok_or_else(|| {
            UpgradeError::Format(format!(
                "release {version} has no asset ending in '{asset_suffix}'"
            ))
        })?;

    let notes = release.body.as_deref().unwrap_or_default();
    let metadata = ReleaseMetadata::parse(notes);

    let release_date = release.published_at.as_deref().and_then(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| warn!("Ignoring invalid published_at '{s}': {e}"))
            .ok()
    });

    let channel = if release.prerelease || version.is_prerelease() {
        Channel::Beta
    } else {
        Channel::Stable
    };

    Ok(Some(ReleaseInfo {
        version: version.to_string(),
        channel,
        release_date,
        download_url: asset.browser_download_url.clone(),
        file_size: asset.size,
        asset_name: asset.name.clone(),
        title: release.name.clone().unwrap_or_else(|| release.tag_name.clone()),
        release_notes: clean_release_notes(notes),
        min_version: metadata.min_version().map(str::to_string),
        fingerprints: metadata.fingerprints(),
    }))
}

fn validate_steps(current: &str, steps: &[UpgradeStep]) -> Result<()> {
    let mut previous = Version::parse(current)?;
    for step in steps {
        let version = Version::parse(&step.version)
            .map_err(|e| UpgradeError::Format(format!("invalid upgrade step: {e}")))?;
        if version <= previous {
            return Err(UpgradeError::Format(format!(
                "upgrade path is not increasing: {} follows {}",
                step.version, previous
            )));
        }
        previous = version;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(tag: &str, prerelease: bool) -> FeedRelease {
        FeedRelease {
            tag_name: tag.to_string(),
            name: Some(format!("Agent {tag}")),
            body: Some(format!(
                "Notes for {tag}\n<!-- metadata: min_version=1.5.0; fingerprints=AA,BB -->"
            )),
            prerelease,
            draft: false,
            published_at: Some("2026-02-01T10:00:00Z".to_string()),
            assets: vec![
                FeedAsset {
                    name: "checksums.txt".to_string(),
                    size: 10,
                    browser_download_url: "https://example.com/checksums.txt".to_string(),
                },
                FeedAsset {
                    name: format!("certdeploy-agent-{tag}.EXE"),
                    size: 4096,
                    browser_download_url: format!("https://example.com/{tag}.exe"),
                },
            ],
        }
    }

    #[test]
    fn test_select_newest_stable() {
        let releases = vec![release("v2.0.0", false), release("v2.1.0-beta.1", false), release("v1.9.0", false)];
        let info = select_release(releases, Channel::Stable, "1.8.0", None, ".exe").unwrap().unwrap();

        assert_eq!(info.version, "2.0.0");
        assert_eq!(info.channel, Channel::Stable);
        assert_eq!(info.file_size, 4096);
        assert_eq!(info.download_url, "https://example.com/v2.0.0.exe");
        assert_eq!(info.min_version.as_deref(), Some("1.5.0"));
        assert_eq!(info.fingerprints, vec!["AA", "BB"]);
        assert_eq!(info.release_notes, "Notes for v2.0.0");
        assert!(info.release_date.is_some());
    }

    #[test]
    fn test_stable_ignores_prerelease_flag() {
        let releases = vec![release("v3.0.0", true), release("v2.0.0", false)];
        let info = select_release(releases, Channel::Stable, "1.0.0", None, ".exe").unwrap().unwrap();
        assert_eq!(info.version, "2.0.0");
    }

    #[test]
    fn test_beta_accepts_prerelease() {
        let releases = vec![release("v2.1.0-beta.1", false), release("v2.0.0", false)];
        let info = select_release(releases, Channel::Beta, "2.0.0", None, ".exe").unwrap().unwrap();
        assert_eq!(info.version, "2.1.0-beta.1");
        assert_eq!(info.channel, Channel::Beta);
    }

    #[test]
    fn test_not_newer_or_skipped() {
        let same = select_release(vec![release("v2.0.0", false)], Channel::Stable, "2.0", None, ".exe").unwrap();
        assert!(same.is_none());

        let skipped =
            select_release(vec![release("v2.0.0", false)], Channel::Stable, "1.0.0", Some("v2.0.0"), ".exe")
                .unwrap();
        assert!(skipped.is_none());
    }

    #[test]
    fn test_drafts_ignored() {
        let mut draft = release("v9.0.0", false);
        draft.draft = true;
        let info = select_release(vec![draft, release("v2.0.0", false)], Channel::Beta, "1.0.0", None, ".exe")
            .unwrap()
            .unwrap();
        assert_eq!(info.version, "2.0.0");
    }

    #[test]
    fn test_missing_asset_is_format_error() {
        let mut rel = release("v2.0.0", false);
        rel.assets.retain(|a| !a.name.to_ascii_lowercase().ends_with(".exe"));
        let err = select_release(vec![rel], Channel::Stable, "1.0.0", None, ".exe").unwrap_err();
        assert!(matches!(err, UpgradeError::Format(_)));
    }

    #[test]
    fn test_bad_current_version() {
        let err = select_release(vec![release("v2.0.0", false)], Channel::Stable, "garbage", None, ".exe")
            .unwrap_err();
        assert!(matches!(err, UpgradeError::Format(_)));
    }

    #[test]
    fn test_validate_steps() {
        let step = |v: &str| UpgradeStep {
            version: v.to_string(),
            download_url: format!("https://example.com/{v}.exe"),
            file_size: 1,
            fingerprints: vec![],
            release_notes: String::new(),
        };

        assert!(validate_steps("1.0.0", &[step("2.0.0"), step("3.0.0")]).is_ok());
        assert!(validate_steps("1.0.0", &[step("3.0.0"), step("2.0.0")]).is_err());
        assert!(validate_steps("2.0.0", &[step("2.0.0")]).is_err());
    }

    #[test]
    fn test_step_fingerprints_accept_both_shapes() {
        let list: UpgradeStep = serde_json::from_str(
            r#"{"version":"2.0","download_url":"https://x/a.exe","fingerprints":["AA"," BB "]}"#,
        )
        .unwrap();
        assert_eq!(list.fingerprints, vec!["AA", "BB"]);

        let joined: UpgradeStep = serde_json::from_str(
            r#"{"version":"2.0","download_url":"https://x/a.exe","fingerprints":"AA, BB,"}"#,
        )
        .unwrap();
        assert_eq!(joined.fingerprints, vec!["AA", "BB"]);

        let missing: UpgradeStep =
            serde_json::from_str(r#"{"version":"2.0","download_url":"https://x/a.exe"}"#).unwrap();
        assert!(missing.fingerprints.is_empty());
    }

    #[test]
    fn test_upgrade_path_base() {
        let checker =
            ReleaseChecker::new("https://api.github.com/repos/certdeploy/agent/releases/latest").unwrap();
        assert_eq!(
            checker.upgrade_path_base().unwrap(),
            "https://api.github.com/repos/certdeploy/agent"
        );

        let checker = ReleaseChecker::new("http://127.0.0.1:8080/feed.json").unwrap();
        assert_eq!(checker.upgrade_path_base().unwrap(), "http://127.0.0.1:8080");

        let checker = checker.with_upgrade_path_url(Some("https://updates.example.com/api/".to_string()));
        assert_eq!(checker.upgrade_path_base().unwrap(), "https://updates.example.com/api");
    }
}
