//! Machine-readable metadata embedded in release notes.
//!
//! Release notes may carry one HTML comment on a single line:
//!
//! ```text
//! <!-- metadata: min_version=2.4.0; fingerprints=AB12...,CD34... -->
//! ```
//!
//! Feeds that HTML-escape the notes deliver it as `&lt;!-- ... --&gt;`; both
//! forms are recognized. Extraction and stripping share one pattern, so any
//! key returned by [`parse_metadata`] came from a span that
//! [`clean_release_notes`] removes.

use crate::config::split_list;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

const METADATA_PATTERN: &str = r"(?:<|&lt;)!--[ \t]*metadata:([^\n]*?)--(?:>|&gt;)";

fn metadata_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(METADATA_PATTERN).ok()).as_ref()
}

/// Extract `key=value` pairs from the first metadata marker in `notes`.
///
/// Keys and values are trimmed. Pairs without `=` or with an empty key are
/// skipped. Notes without a marker give an empty map.
#[must_use]
pub fn parse_metadata(notes: &str) -> BTreeMap<String, String> {
    let Some(caps) = metadata_regex().and_then(|re| re.captures(notes)) else {
        return BTreeMap::new();
    };
    let Some(body) = caps.get(1) else {
        return BTreeMap::new();
    };

    body.as_str()
        .split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Remove metadata markers from `notes` for display.
///
/// A line left blank by the removal is dropped entirely.
#[must_use]
pub fn clean_release_notes(notes: &str) -> String {
    let Some(re) = metadata_regex() else {
        return notes.to_string();
    };
    if !re.is_match(notes) {
        return notes.to_string();
    }

    let kept: Vec<String> = notes
        .lines()
        .filter_map(|line| {
            if !re.is_match(line) {
                return Some(line.to_string());
            }
            let stripped = re.replace_all(line, "");
            if stripped.trim().is_empty() {
                None
            } else {
                Some(stripped.trim_end().to_string())
            }
        })
        .collect();

    kept.join("\n").trim().to_string()
}

/// Typed view over the metadata of one release.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseMetadata {
    entries: BTreeMap<String, String>,
}

impl ReleaseMetadata {
    /// Parse the metadata marker of `notes`.
    #[must_use]
    pub fn parse(notes: &str) -> Self {
        Self {
            entries: parse_metadata(notes),
        }
    }

    /// Raw value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// The minimum installed version this release can be applied over.
    #[must_use]
    pub fn min_version(&self) -> Option<&str> {
        self.get("min_version").filter(|v| !v.is_empty())
    }

    /// Server-supplied signer fingerprints.
    #[must_use]
    pub fn fingerprints(&self) -> Vec<String> {
        self.get("fingerprints").map(split_list).unwrap_or_default()
    }

    /// Whether no metadata was present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
