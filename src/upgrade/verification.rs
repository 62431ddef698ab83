//! Publisher signature verification.
//!
//! A downloaded binary is trusted when the platform confirms its signature
//! and the signer certificate passes the [`TrustPolicy`](crate::config::TrustPolicy):
//!
//! 1. The signer fingerprint (uppercase hex SHA-256 of the certificate DER)
//!    is on the allow-list, or
//! 2. A fallback policy exists and the signer's organization, country and
//!    issuing CA all match it. Such a result is valid but carries
//!    `needs_confirm`, and must not be installed without a human saying yes.
//!
//! A signature the platform could not check cryptographically
//! ([`SignatureStatus::Unverified`]) goes through the same policy, but an
//! accepted result always carries `needs_confirm`.
//!
//! The platform work sits behind [`CodeSignatureInspector`]; everything else
//! here is plain policy and runs the same on every host.

use crate::config::FallbackPolicy;
use crate::core::{Result, UpgradeError};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identity of the certificate that signed a binary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignerCertificate {
    /// DER encoding of the leaf certificate.
    pub der: Vec<u8>,
    /// Subject common name (CN).
    pub subject: String,
    /// Subject organization (O).
    pub organization: String,
    /// Subject country (C).
    pub country: String,
    /// Issuer distinguished name.
    pub issuer: String,
}

/// Outcome of platform signature inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    /// The signature is structurally and cryptographically valid.
    Signed(SignerCertificate),
    /// The signature is well formed, but its digest and certificate chain
    /// were not checked on this platform. Never trusted without confirmation.
    Unverified(SignerCertificate),
    /// The file is unsigned or its signature does not validate.
    Invalid(String),
}

/// Platform signature inspection.
///
/// Implementations return `Err` only when the file cannot be examined at all
/// (missing, unreadable, not an executable image). A readable file with a bad
/// or absent signature is [`SignatureStatus::Invalid`].
pub trait CodeSignatureInspector: Send + Sync {
    /// Inspect the signature of the file at `path`.
    fn inspect(&self, path: &Path) -> Result<SignatureStatus>;
}

/// Result of one verification. Never mutated after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyResult {
    /// Whether the binary may be installed (after confirmation, if
    /// `needs_confirm`).
    pub valid: bool,
    /// Signer certificate fingerprint, when a signer was found.
    pub fingerprint: String,
    /// Signer common name.
    pub subject: String,
    /// Signer organization.
    pub organization: String,
    /// Signer country.
    pub country: String,
    /// Issuer distinguished name.
    pub issuer: String,
    /// The fingerprint was on the allow-list.
    pub fingerprint_match: bool,
    /// Trust came from the fallback policy.
    pub fallback_used: bool,
    /// A human must confirm before install.
    pub needs_confirm: bool,
    /// Human-readable summary.
    pub message: String,
}

impl VerifyResult {
    fn rejected(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

/// Uppercase hex SHA-256 of a DER-encoded certificate.
#[must_use]
pub fn certificate_fingerprint(der: &[u8]) -> String {
    hex::encode_upper(Sha256::digest(der))
}

/// Uppercase a fingerprint and drop `:` and whitespace separators.
#[must_use]
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Applies the trust policy on top of a [`CodeSignatureInspector`].
#[derive(Clone)]
pub struct SignatureVerifier {
    inspector: Arc<dyn CodeSignatureInspector>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier").finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    /// A verifier using `inspector`.
    pub fn new(inspector: Arc<dyn CodeSignatureInspector>) -> Self {
        Self { inspector }
    }

    /// A verifier using the platform Authenticode inspector.
    #[must_use]
    pub fn authenticode() -> Self {
        Self::new(Arc::new(crate::upgrade::authenticode::AuthenticodeInspector::new()))
    }

    /// Verify the binary at `path`.
    ///
    /// # Errors
    ///
    /// Only when the inspector cannot examine the file. An untrusted but
    /// well-formed file yields `Ok` with `valid: false`.
    pub async fn verify(
        &self,
        path: &Path,
        trusted_fingerprints: &[String],
        fallback: Option<&FallbackPolicy>,
    ) -> Result<VerifyResult> {
        debug!(path = %path.display(), "Verifying signature");

        let inspector = Arc::clone(&self.inspector);
        let owned = path.to_path_buf();
        let status = tokio::task::spawn_blocking(move || inspector.inspect(&owned))
            .await
            .map_err(|e| {
                warn!(path = %path.display(), "Signature inspection task failed: {e}");
                UpgradeError::Internal(format!("signature inspection of {} failed: {e}", path.display()))
            })??;

        let result = evaluate(status, trusted_fingerprints, fallback);
        if result.valid {
            info!(
                fingerprint = %result.fingerprint,
                fallback = result.fallback_used,
                "Signature accepted"
            );
        } else {
            warn!("Signature rejected: {}", result.message);
        }
        Ok(result)
    }
}

/// Apply the trust policy to an inspection outcome.
#[must_use]
pub fn evaluate(
    status: SignatureStatus,
    trusted_fingerprints: &[String],
    fallback: Option<&FallbackPolicy>,
) -> VerifyResult {
    let (signer, verified) = match status {
        SignatureStatus::Signed(signer) => (signer, true),
        SignatureStatus::Unverified(signer) => (signer, false),
        SignatureStatus::Invalid(reason) => {
            return VerifyResult::rejected(format!("invalid signature: {reason}"));
        }
    };

    let result = apply_policy(&signer, trusted_fingerprints, fallback);
    if verified || !result.valid {
        return result;
    }
    VerifyResult {
        needs_confirm: true,
        message: format!("{}; signature was not cryptographically verified", result.message),
        ..result
    }
}

fn apply_policy(
    signer: &SignerCertificate,
    trusted_fingerprints: &[String],
    fallback: Option<&FallbackPolicy>,
) -> VerifyResult {
    let fingerprint = certificate_fingerprint(&signer.der);
    let base = VerifyResult {
        fingerprint: fingerprint.clone(),
        subject: signer.subject.clone(),
        organization: signer.organization.clone(),
        country: signer.country.clone(),
        issuer: signer.issuer.clone(),
        ..VerifyResult::default()
    };

    let matched = trusted_fingerprints
        .iter()
        .any(|trusted| normalize_fingerprint(trusted) == fingerprint);
    if matched {
        return VerifyResult {
            valid: true,
            fingerprint_match: true,
            message: format!("signer {} is allow-listed", signer.subject),
            ..base
        };
    }

    let Some(policy) = fallback else {
        return VerifyResult {
            message: format!("signer fingerprint {fingerprint} is not in allow-list"),
            ..base
        };
    };

    if signer.organization != policy.organization {
        return VerifyResult {
            message: format!(
                "organization check failed: expected '{}', found '{}'",
                policy.organization, signer.organization
            ),
            ..base
        };
    }

    if signer.country != policy.country {
        return VerifyResult {
            message: format!(
                "country check failed: expected '{}', found '{}'",
                policy.country, signer.country
            ),
            ..base
        };
    }

    let issuer = signer.issuer.to_lowercase();
    let trusted_ca = policy.trusted_cas.iter().any(|ca| issuer.contains(&ca.to_lowercase()));
    if !trusted_ca {
        return VerifyResult {
            message: format!("issuer check failed: '{}' is not a trusted CA", signer.issuer),
            ..base
        };
    }

    VerifyResult {
        valid: true,
        fallback_used: true,
        needs_confirm: true,
        message: format!(
            "signer {} ({}) matched organization, country and issuer; confirmation required",
            signer.subject, signer.organization
        ),
        ..base
    }
}
