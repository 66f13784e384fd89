//! Transparency-log-backed certificate verification.
//!
//! Verifies a cosign-style bundle: the short-lived signing certificate must
//! chain to the configured transparency-log root, and the signature must
//! verify against the certificate's key. Log inclusion proofs are produced
//! by the signing tooling and are not re-checked here.

use super::{Verification, VerifyError};
use crate::keyring::KeyMaterial;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use tracing::debug;
use x509_parser::prelude::*;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Bundle {
    base64_signature: String,
    /// Base64-encoded PEM certificate.
    cert: String,
    #[serde(default)]
    rekor_log_index: Option<u64>,
}

/// Verifies a decoded bundle over `message` against the transparency-log
/// root certificates.
pub fn verify(
    message: &[u8],
    bundle: &[u8],
    roots: &[KeyMaterial],
) -> Result<Verification, VerifyError> {
    let bundle: Bundle = serde_json::from_slice(bundle)
        .map_err(|e| VerifyError::Verification(format!("malformed signature bundle: {e}")))?;

    let cert_pem = BASE64
        .decode(bundle.cert.trim())
        .map_err(|e| VerifyError::Verification(format!("malformed bundle certificate: {e}")))?;
    let leaf_der = super::x509::pem_certs(&cert_pem)
        .into_iter()
        .next()
        .ok_or_else(|| VerifyError::Verification("unreadable bundle certificate".to_string()))?;
    let (_, leaf) = X509Certificate::from_der(&leaf_der)
        .map_err(|e| VerifyError::Verification(format!("malformed bundle certificate: {e}")))?;

    let root_location = find_root(&leaf, roots).ok_or_else(|| {
        VerifyError::Verification("certificate does not chain to a transparency-log root".to_string())
    })?;

    let sig = BASE64
        .decode(bundle.base64_signature.trim())
        .map_err(|e| VerifyError::Verification(format!("malformed bundle signature: {e}")))?;
    super::x509::verify_with_spki(leaf.public_key(), message, &sig)?;

    if let Some(index) = bundle.rekor_log_index {
        debug!(log_index = index, "Verified transparency-log bundle");
    }

    Ok(Verification {
        signer: super::x509::signer_from_cert(&leaf, &leaf_der),
        key_paths: vec![root_location],
    })
}

fn find_root(leaf: &X509Certificate<'_>, roots: &[KeyMaterial]) -> Option<String> {
    for material in roots {
        for root_der in super::x509::pem_certs(&material.bytes) {
            let Ok((_, root)) = X509Certificate::from_der(&root_der) else {
                continue;
            };
            if leaf.issuer() != root.subject() {
                continue;
            }
            if leaf.verify_signature(Some(root.public_key())).is_ok() {
                return Some(material.location.clone());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_bundle_is_an_error() {
        let err = verify(b"msg", b"not json", &[]).unwrap_err();
        assert!(matches!(err, VerifyError::Verification(_)));
    }

    #[test]
    fn bundle_without_trusted_root_is_rejected() {
        let bundle = serde_json::json!({
            "base64Signature": BASE64.encode(b"sig"),
            "cert": BASE64.encode(b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n"),
        });
        let err = verify(b"msg", serde_json::to_vec(&bundle).unwrap().as_slice(), &[]).unwrap_err();
        assert!(matches!(err, VerifyError::Verification(_)));
    }
}
