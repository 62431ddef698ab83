//! Build-time trust policy for update signatures.
//!
//! The policy is compiled into the binary from environment variables present
//! at build time and is never read from or written to user-writable storage:
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `CERTDEPLOY_TRUSTED_FINGERPRINTS` | Comma-separated SHA-256 signer certificate fingerprints |
//! | `CERTDEPLOY_TRUSTED_ORG` | Expected signer organization (O) |
//! | `CERTDEPLOY_TRUSTED_COUNTRY` | Expected signer country (C) |
//! | `CERTDEPLOY_TRUSTED_CAS` | Comma-separated issuing CA names |
//!
//! The fallback policy is enabled only when organization, country and at
//! least one CA name are all configured.

use std::sync::OnceLock;

/// Identity checks used when a signer fingerprint is not allow-listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackPolicy {
    /// Exact organization (O) of the signer.
    pub organization: String,
    /// Exact country (C) of the signer.
    pub country: String,
    /// Issuer names; the signer's issuer must contain one of them.
    pub trusted_cas: Vec<String>,
}

/// Signature trust configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustPolicy {
    /// Allow-listed signer fingerprints. When non-empty this replaces any
    /// list the release feed supplies.
    pub fingerprints: Vec<String>,
    /// Multi-factor fallback, if configured.
    pub fallback: Option<FallbackPolicy>,
}

static BUILTIN: OnceLock<TrustPolicy> = OnceLock::new();

impl TrustPolicy {
    /// The policy compiled into this binary.
    pub fn builtin() -> &'static Self {
        BUILTIN.get_or_init(|| {
            Self::from_parts(
                option_env!("CERTDEPLOY_TRUSTED_FINGERPRINTS"),
                option_env!("CERTDEPLOY_TRUSTED_ORG"),
                option_env!("CERTDEPLOY_TRUSTED_COUNTRY"),
                option_env!("CERTDEPLOY_TRUSTED_CAS"),
            )
        })
    }

    /// Build a policy from raw configuration strings.
    #[must_use]
    pub fn from_parts(
        fingerprints: Option<&str>,
        organization: Option<&str>,
        country: Option<&str>,
        trusted_cas: Option<&str>,
    ) -> Self {
        let fingerprints = fingerprints.map(split_list).unwrap_or_default();
        let organization = organization.map(str::trim).unwrap_or_default();
        let country = country.map(str::trim).unwrap_or_default();
        let trusted_cas = trusted_cas.map(split_list).unwrap_or_default();

        let fallback = if organization.is_empty() || country.is_empty() || trusted_cas.is_empty() {
            None
        } else {
            Some(FallbackPolicy {
                organization: organization.to_string(),
                country: country.to_string(),
                trusted_cas,
            })
        };

        Self {
            fingerprints,
            fallback,
        }
    }

    /// The fingerprints to verify against: the compiled-in list when it is
    /// non-empty, otherwise `server`.
    #[must_use]
    pub fn effective_fingerprints<'a>(&'a self, server: &'a [String]) -> &'a [String] {
        if self.fingerprints.is_empty() {
            server
        } else {
            &self.fingerprints
        }
    }
}

/// Split a comma-separated list, trimming entries and dropping empties.
#[must_use]
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_parts_full() {
        let policy = TrustPolicy::from_parts(
            Some(" AA11 , ,BB22"),
            Some("Example Corp"),
            Some("US"),
            Some("DigiCert, Sectigo"),
        );
        assert_eq!(policy.fingerprints, vec!["AA11", "BB22"]);
        let fallback = policy.fallback.unwrap();
        assert_eq!(fallback.organization, "Example Corp");
        assert_eq!(fallback.trusted_cas, vec!["DigiCert", "Sectigo"]);
    }

    #[test]
    fn test_fallback_needs_every_factor() {
        let policy = TrustPolicy::from_parts(None, Some("Example Corp"), None, Some("DigiCert"));
        assert!(policy.fallback.is_none());
        assert!(policy.fingerprints.is_empty());
    }

    #[test]
    fn test_effective_fingerprints_replace_server_list() {
        let server = vec!["SERVER".to_string()];

        let empty = TrustPolicy::default();
        assert_eq!(empty.effective_fingerprints(&server), server.as_slice());

        let pinned = TrustPolicy::from_parts(Some("BUILD"), None, None, None);
        assert_eq!(pinned.effective_fingerprints(&server), ["BUILD".to_string()]);
    }
}
