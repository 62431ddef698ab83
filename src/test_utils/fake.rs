//! A scriptable [`CodeSignatureInspector`].

use crate::core::{Result, UpgradeError};
use crate::upgrade::verification::{
    CodeSignatureInspector, SignatureStatus, SignerCertificate, certificate_fingerprint,
};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Reports a fixed [`SignatureStatus`], optionally chosen by file content.
///
/// The file must exist; a missing file is an error, like a real inspector.
#[derive(Debug)]
pub struct FakeInspector {
    default: SignatureStatus,
    by_content: Mutex<Vec<(Vec<u8>, SignatureStatus)>>,
    calls: AtomicUsize,
}

impl FakeInspector {
    /// Every file is signed by `signer`.
    #[must_use]
    pub fn signed(signer: SignerCertificate) -> Self {
        Self::with_default(SignatureStatus::Signed(signer))
    }

    /// Every file is unsigned.
    #[must_use]
    pub fn unsigned() -> Self {
        Self::with_default(SignatureStatus::Invalid("no signature present".to_string()))
    }

    fn with_default(default: SignatureStatus) -> Self {
        Self {
            default,
            by_content: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Report `status` for files whose bytes equal `content`.
    #[must_use]
    pub fn with_content(self, content: impl Into<Vec<u8>>, status: SignatureStatus) -> Self {
        if let Ok(mut map) = self.by_content.lock() {
            map.push((content.into(), status));
        }
        self
    }

    /// Number of inspections so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CodeSignatureInspector for FakeInspector {
    fn inspect(&self, path: &Path) -> Result<SignatureStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bytes = std::fs::read(path)
            .map_err(|e| UpgradeError::fs(format!("reading {}", path.display()), &e))?;

        let scripted = self.by_content.lock().ok().and_then(|map| {
            map.iter()
                .find(|(content, _)| *content == bytes)
                .map(|(_, status)| status.clone())
        });
        Ok(scripted.unwrap_or_else(|| self.default.clone()))
    }
}

/// A signer certificate for `organization`, issued by a DigiCert CA in `GB`.
///
/// The DER bytes are derived from the organization so that distinct
/// signers have distinct fingerprints.
#[must_use]
pub fn test_signer(organization: &str) -> SignerCertificate {
    SignerCertificate {
        der: format!("test certificate for {organization}").into_bytes(),
        subject: format!("{organization} Code Signing"),
        organization: organization.to_string(),
        country: "GB".to_string(),
        issuer: "CN=DigiCert Trusted G4 Code Signing RSA4096 SHA384 2021 CA1, O=DigiCert Inc, C=US"
            .to_string(),
    }
}

/// Fingerprint of `signer`, as it would appear in an allow-list.
#[must_use]
pub fn fingerprint_of(signer: &SignerCertificate) -> String {
    certificate_fingerprint(&signer.der)
}
