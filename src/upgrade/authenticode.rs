//! Authenticode inspection of PE images.
//!
//! The signature lives in the PE attribute certificate table (data directory
//! 4) as a `WIN_CERTIFICATE` wrapping a PKCS#7 `SignedData`. The signer is the
//! embedded certificate matching the issuer and serial of the first
//! `SignerInfo`.
//!
//! Parsing alone proves nothing about the file contents, so it yields
//! [`SignatureStatus::Unverified`]. On Windows the file is then checked with
//! `WinVerifyTrust`, which validates the digest and chain, and only a passing
//! file becomes [`SignatureStatus::Signed`]. Other hosts never produce
//! `Signed`, so their results always need a human confirmation.

use crate::core::{Result, UpgradeError};
use crate::upgrade::verification::{CodeSignatureInspector, SignatureStatus, SignerCertificate};
use cms::cert::CertificateChoices;
use cms::content_info::ContentInfo;
use cms::signed_data::{SignedData, SignerIdentifier};
use der::asn1::ObjectIdentifier;
use der::{Decode, Encode, SliceReader, Tag, Tagged};
use std::path::Path;
use tracing::debug;
use x509_cert::Certificate;
use x509_cert::name::Name;

const ID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");
const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const OID_COUNTRY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.6");
const OID_ORGANIZATION: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");

const PE32_MAGIC: u16 = 0x10b;
const PE32_PLUS_MAGIC: u16 = 0x20b;
const SECURITY_DIRECTORY: usize = 4;
const WIN_CERT_REVISION_2_0: u16 = 0x0200;
const WIN_CERT_TYPE_PKCS_SIGNED_DATA: u16 = 0x0002;
const WIN_CERT_HEADER_LEN: usize = 8;

/// Default [`CodeSignatureInspector`] for Windows executables.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthenticodeInspector;

impl AuthenticodeInspector {
    /// Create an inspector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl CodeSignatureInspector for AuthenticodeInspector {
    fn inspect(&self, path: &Path) -> Result<SignatureStatus> {
        let data = std::fs::read(path)
            .map_err(|e| UpgradeError::fs(format!("reading {}", path.display()), &e))?;

        let status = inspect_image(&data).map_err(|reason| {
            UpgradeError::SignatureInvalid(format!("{} is not a PE image: {reason}", path.display()))
        })?;

        #[cfg(windows)]
        let status = match status {
            SignatureStatus::Unverified(signer) => match win_trust::verify(path) {
                Ok(()) => SignatureStatus::Signed(signer),
                Err(reason) => SignatureStatus::Invalid(reason),
            },
            other => other,
        };

        Ok(status)
    }
}

/// Inspect the signature of an in-memory PE image.
///
/// The outer `Err` means the bytes are not a PE image; a PE image with a
/// missing or malformed signature is `Ok(SignatureStatus::Invalid)`. A well
/// formed signature is `Unverified`: nothing here checks its digest.
pub fn inspect_image(data: &[u8]) -> std::result::Result<SignatureStatus, String> {
    let Some((offset, size)) = security_directory(data)? else {
        return Ok(SignatureStatus::Invalid("file is not signed".to_string()));
    };

    let table = offset
        .checked_add(size)
        .and_then(|end| data.get(offset..end));
    let Some(table) = table else {
        return Ok(SignatureStatus::Invalid("certificate table is out of bounds".to_string()));
    };

    let Some(pkcs7) = find_signed_data(table) else {
        return Ok(SignatureStatus::Invalid("no PKCS#7 signature in certificate table".to_string()));
    };

    Ok(match signer_certificate(pkcs7) {
        Ok(signer) => SignatureStatus::Unverified(signer),
        Err(reason) => SignatureStatus::Invalid(reason),
    })
}

fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    let bytes = data.get(at..at.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    let bytes = data.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// File offset and size of the attribute certificate table, if present.
fn security_directory(data: &[u8]) -> std::result::Result<Option<(usize, usize)>, String> {
    if data.get(0..2) != Some(b"MZ".as_slice()) {
        return Err("missing MZ header".to_string());
    }
    let pe = read_u32(data, 0x3c).ok_or("truncated DOS header")? as usize;
    if data.get(pe..pe.saturating_add(4)) != Some(b"PE\0\0".as_slice()) {
        return Err("missing PE signature".to_string());
    }

    let optional = pe + 4 + 20;
    let magic = read_u16(data, optional).ok_or("truncated optional header")?;
    let (count_at, dirs_at) = match magic {
        PE32_MAGIC => (92, 96),
        PE32_PLUS_MAGIC => (108, 112),
        other => return Err(format!("unknown optional header magic {other:#x}")),
    };

    let count = read_u32(data, optional + count_at).ok_or("truncated optional header")? as usize;
    if count <= SECURITY_DIRECTORY {
        return Ok(None);
    }

    let entry = optional + dirs_at + SECURITY_DIRECTORY * 8;
    let offset = read_u32(data, entry).ok_or("truncated data directories")? as usize;
    let size = read_u32(data, entry + 4).ok_or("truncated data directories")? as usize;
    if offset == 0 || size == 0 {
        return Ok(None);
    }
    Ok(Some((offset, size)))
}

fn find_signed_data(mut table: &[u8]) -> Option<&[u8]> {
    while table.len() >= WIN_CERT_HEADER_LEN {
        let length = read_u32(table, 0)? as usize;
        let revision = read_u16(table, 4)?;
        let kind = read_u16(table, 6)?;
        if length < WIN_CERT_HEADER_LEN || length > table.len() {
            return None;
        }
        if revision == WIN_CERT_REVISION_2_0 && kind == WIN_CERT_TYPE_PKCS_SIGNED_DATA {
            return Some(&table[WIN_CERT_HEADER_LEN..length]);
        }
        let next = length.checked_add(7)? & !7;
        table = table.get(next..)?;
    }
    None
}

fn signer_certificate(pkcs7: &[u8]) -> std::result::Result<SignerCertificate, String> {
    // Certificate entries are padded to eight bytes, so trailing data is allowed.
    let mut reader = SliceReader::new(pkcs7).map_err(|e| format!("malformed signature: {e}"))?;
    let info = ContentInfo::decode(&mut reader).map_err(|e| format!("malformed signature: {e}"))?;
    if info.content_type != ID_SIGNED_DATA {
        return Err(format!("unexpected content type {}", info.content_type));
    }

    let content = info.content.to_der().map_err(|e| format!("malformed signature: {e}"))?;
    let signed = SignedData::from_der(&content).map_err(|e| format!("malformed SignedData: {e}"))?;

    let signer_info = signed.signer_infos.0.iter().next().ok_or("signature has no signer")?;
    let SignerIdentifier::IssuerAndSerialNumber(id) = &signer_info.sid else {
        return Err("unsupported signer identifier".to_string());
    };

    let certificates = signed.certificates.as_ref().ok_or("signature carries no certificates")?;
    let leaf: &Certificate = certificates
        .0
        .iter()
        .find_map(|choice| match choice {
            CertificateChoices::Certificate(cert)
                if cert.tbs_certificate.issuer == id.issuer
                    && cert.tbs_certificate.serial_number == id.serial_number =>
            {
                Some(cert)
            }
            _ => None,
        })
        .ok_or("signer certificate not found")?;

    let der = leaf.to_der().map_err(|e| format!("cannot encode signer certificate: {e}"))?;
    let subject = &leaf.tbs_certificate.subject;
    let signer = SignerCertificate {
        der,
        subject: attribute(subject, OID_COMMON_NAME),
        organization: attribute(subject, OID_ORGANIZATION),
        country: attribute(subject, OID_COUNTRY),
        issuer: leaf.tbs_certificate.issuer.to_string(),
    };
    debug!(subject = %signer.subject, issuer = %signer.issuer, "Found signer certificate");
    Ok(signer)
}

fn attribute(name: &Name, oid: ObjectIdentifier) -> String {
    name.0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .find(|atv| atv.oid == oid)
        .map(|atv| {
            let bytes = atv.value.value();
            match atv.value.tag() {
                Tag::BmpString => {
                    let units: Vec<u16> = bytes
                        .chunks_exact(2)
                        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                        .collect();
                    String::from_utf16_lossy(&units)
                }
                _ => String::from_utf8_lossy(bytes).into_owned(),
            }
        })
        .unwrap_or_default()
}

#[cfg(windows)]
mod win_trust {
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;
    use windows_sys::Win32::Security::WinTrust::{
        WINTRUST_ACTION_GENERIC_VERIFY_V2, WINTRUST_DATA, WINTRUST_FILE_INFO, WTD_CACHE_ONLY_URL_RETRIEVAL,
        WTD_CHOICE_FILE, WTD_REVOKE_NONE, WTD_STATEACTION_CLOSE, WTD_STATEACTION_VERIFY, WTD_UI_NONE,
        WinVerifyTrust,
    };

    /// Run `WinVerifyTrust` without UI or network revocation checks.
    pub(super) fn verify(path: &Path) -> Result<(), String> {
        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(std::iter::once(0)).collect();

        // SAFETY: all-zero is a valid bit pattern for these plain C structs.
        let mut file_info: WINTRUST_FILE_INFO = unsafe { std::mem::zeroed() };
        file_info.cbStruct = std::mem::size_of::<WINTRUST_FILE_INFO>() as u32;
        file_info.pcwszFilePath = wide.as_ptr();

        // SAFETY: as above.
        let mut data: WINTRUST_DATA = unsafe { std::mem::zeroed() };
        data.cbStruct = std::mem::size_of::<WINTRUST_DATA>() as u32;
        data.dwUIChoice = WTD_UI_NONE;
        data.fdwRevocationChecks = WTD_REVOKE_NONE;
        data.dwUnionChoice = WTD_CHOICE_FILE;
        data.Anonymous.pFile = &mut file_info;
        data.dwStateAction = WTD_STATEACTION_VERIFY;
        data.dwProvFlags = WTD_CACHE_ONLY_URL_RETRIEVAL;

        let mut action = WINTRUST_ACTION_GENERIC_VERIFY_V2;
        // SAFETY: `data`, `file_info` and `wide` outlive both calls.
        let status = unsafe {
            WinVerifyTrust(
                std::ptr::null_mut(),
                &mut action,
                std::ptr::from_mut(&mut data).cast(),
            )
        };

        data.dwStateAction = WTD_STATEACTION_CLOSE;
        // SAFETY: releases the state allocated by the verify call above.
        unsafe {
            WinVerifyTrust(
                std::ptr::null_mut(),
                &mut action,
                std::ptr::from_mut(&mut data).cast(),
            );
        }

        if status == 0 {
            Ok(())
        } else {
            Err(format!("WinVerifyTrust failed with status {:#010x}", status as u32))
        }
    }
}
