//! Version parsing and ordering for agent releases.
//!
//! Agent versions are not strict semver: the release segment has arbitrary
//! arity (`2.1`, `2.1.0.4`) with missing trailing components treated as zero,
//! and an optional pre-release tag follows the first `-` or `+`.
//!
//! # Ordering
//!
//! - Release segments compare numerically, component by component
//! - A tagged version orders before the same release without a tag
//! - Tags compare identifier by identifier: numeric identifiers numerically,
//!   numeric before alphanumeric, alphanumeric lexically, and a shorter tag
//!   before a longer one sharing its prefix
//!
//! ```text
//! 1.0.0-alpha < 1.0.0-alpha.1 < 1.0.0-beta < 1.0.0-rc.2 < 1.0.0-rc.10 < 1.0.0
//! ```
//!
//! # Examples
//!
//! ```rust,no_run
//! use certdeploy_updater::version::comparison::VersionComparator;
//!
//! # fn example() -> certdeploy_updater::core::Result<()> {
//! assert!(VersionComparator::is_newer("v2.1", "2.0.9")?);
//! assert!(!VersionComparator::is_newer("1.0.0-rc.1", "1.0.0")?);
//!
//! let versions = vec!["1.2.0".to_string(), "1.10.0".to_string(), "junk".to_string()];
//! assert_eq!(VersionComparator::latest(&versions).map(String::as_str), Some("1.10.0"));
//! # Ok(())
//! # }
//! ```

use crate::core::{Result, UpgradeError};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A parsed agent version.
///
/// Equality follows the ordering, so `1.2` and `1.2.0` are equal.
#[derive(Debug, Clone)]
pub struct Version {
    release: Vec<u64>,
    pre: Option<String>,
    text: String,
}

impl Version {
    /// Parse a version string, accepting and ignoring a leading `v` or `V`.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Format`] when the release segment is empty or
    /// has a non-numeric component, or when a separator has no tag after it.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let text = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        let (release_part, pre) = match text.find(['-', '+']) {
            Some(idx) => (&text[..idx], Some(&text[idx + 1..])),
            None => (text, None),
        };

        if release_part.is_empty() {
            return Err(UpgradeError::Format(format!("invalid version '{input}': empty release")));
        }

        let release = release_part
            .split('.')
            .map(|component| {
                if component.is_empty() || !component.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(UpgradeError::Format(format!(
                        "invalid version '{input}': bad component '{component}'"
                    )));
                }
                component.parse::<u64>().map_err(|_| {
                    UpgradeError::Format(format!("invalid version '{input}': component overflow"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if pre.is_some_and(str::is_empty) {
            return Err(UpgradeError::Format(format!("invalid version '{input}': empty tag")));
        }

        Ok(Self {
            release,
            pre: pre.map(str::to_string),
            text: text.to_string(),
        })
    }

    /// Whether the version carries a pre-release tag.
    #[must_use]
    pub const fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }

    /// The release segment components as written.
    #[must_use]
    pub fn release(&self) -> &[u64] {
        &self.release
    }

    /// The pre-release tag, if any.
    #[must_use]
    pub fn pre_release(&self) -> Option<&str> {
        self.pre.as_deref()
    }

    /// The version text without the leading `v`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl FromStr for Version {
    type Err = UpgradeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let width = self.release.len().max(other.release.len());
        for i in 0..width {
            let a = self.release.get(i).copied().unwrap_or(0);
            let b = other.release.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }

        match (&self.pre, &other.pre) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => compare_tags(a, b),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

fn compare_tags(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');

    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match compare_identifiers(x, y) {
                Ordering::Equal => {}
                ord => return ord,
            },
        }
    }
}

fn compare_identifiers(a: &str, b: &str) -> Ordering {
    let a_numeric = !a.is_empty() && a.bytes().all(|c| c.is_ascii_digit());
    let b_numeric = !b.is_empty() && b.bytes().all(|c| c.is_ascii_digit());

    match (a_numeric, b_numeric) {
        // Leading zeros stripped so "010" == "10"; length then decides magnitude.
        (true, true) => {
            let a = a.trim_start_matches('0');
            let b = b.trim_start_matches('0');
            a.len().cmp(&b.len()).then_with(|| a.cmp(b))
        }
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.cmp(b),
    }
}

/// Compare two version strings.
///
/// # Errors
///
/// Returns [`UpgradeError::Format`] if either side does not parse.
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering> {
    Ok(Version::parse(a)?.cmp(&Version::parse(b)?))
}

/// Version comparison helpers over version strings.
pub struct VersionComparator;

impl VersionComparator {
    /// Compare two version strings. See [`compare_versions`].
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Format`] if either side does not parse.
    pub fn compare(a: &str, b: &str) -> Result<Ordering> {
        compare_versions(a, b)
    }

    /// Whether `candidate` is strictly newer than `current`.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Format`] if either side does not parse.
    pub fn is_newer(candidate: &str, current: &str) -> Result<bool> {
        Ok(compare_versions(candidate, current)? == Ordering::Greater)
    }

    /// All versions newer than `current`, newest first. Malformed entries
    /// are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Format`] if `current` does not parse.
    pub fn get_newer_versions<'a>(current: &str, versions: &'a [String]) -> Result<Vec<&'a String>> {
        let current = Version::parse(current)?;

        let mut newer: Vec<(&String, Version)> = versions
            .iter()
            .filter_map(|s| Version::parse(s).ok().map(|v| (s, v)))
            .filter(|(_, v)| *v > current)
            .collect();
        newer.sort_by(|(_, a), (_, b)| b.cmp(a));

        Ok(newer.into_iter().map(|(s, _)| s).collect())
    }

    /// The highest version in `versions`, ignoring malformed entries.
    #[must_use]
    pub fn latest(versions: &[String]) -> Option<&String> {
        versions
            .iter()
            .filter_map(|s| Version::parse(s).ok().map(|v| (s, v)))
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(s, _)| s)
    }
}
