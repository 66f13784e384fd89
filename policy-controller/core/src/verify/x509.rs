//! X509 certificate-chain signature verification.

use super::{Verification, VerifyError};
use crate::keyring::KeyMaterial;
use crate::signer::Signer;
use ring::signature::{self, UnparsedPublicKey};
use tracing::debug;
use x509_parser::prelude::*;

/// rsaEncryption
const OID_RSA: &str = "1.2.840.113549.1.1.1";
/// id-ecPublicKey
const OID_EC: &str = "1.2.840.10045.2.1";

/// Counts the certificates in a PEM or DER blob.
pub fn count_certs(bytes: &[u8]) -> usize {
    pem_certs(bytes).len()
}

/// Extracts DER certificate blobs from a PEM bundle (or a bare DER cert).
pub fn pem_certs(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut ders = Vec::new();
    for pem in Pem::iter_from_buffer(bytes).flatten() {
        if pem.label == "CERTIFICATE" && X509Certificate::from_der(&pem.contents).is_ok() {
            ders.push(pem.contents.clone());
        }
    }
    if ders.is_empty() && X509Certificate::from_der(bytes).is_ok() {
        ders.push(bytes.to_vec());
    }
    ders
}

/// Verifies `signature` over `message` with the leaf certificate, requiring
/// the leaf to chain to one of the configured CA certificates.
pub fn verify(
    message: &[u8],
    sig: &[u8],
    certificate: &[u8],
    ca_materials: &[KeyMaterial],
) -> Result<Verification, VerifyError> {
    let leaf_der = pem_certs(certificate)
        .into_iter()
        .next()
        .ok_or_else(|| VerifyError::Verification("unreadable signer certificate".to_string()))?;
    let (_, leaf) = X509Certificate::from_der(&leaf_der)
        .map_err(|e| VerifyError::Verification(format!("malformed signer certificate: {e}")))?;

    let issuer_location = find_issuer(&leaf, ca_materials)
        .ok_or_else(|| VerifyError::Verification("untrusted certificate chain".to_string()))?;

    verify_with_spki(leaf.public_key(), message, sig)?;

    Ok(Verification {
        signer: signer_from_cert(&leaf, &leaf_der),
        key_paths: vec![issuer_location],
    })
}

/// Returns the location of the first CA certificate that signed `leaf`.
fn find_issuer(leaf: &X509Certificate<'_>, ca_materials: &[KeyMaterial]) -> Option<String> {
    for material in ca_materials {
        for ca_der in pem_certs(&material.bytes) {
            let Ok((_, ca)) = X509Certificate::from_der(&ca_der) else {
                continue;
            };
            if leaf.issuer() != ca.subject() {
                continue;
            }
            match leaf.verify_signature(Some(ca.public_key())) {
                Ok(()) => return Some(material.location.clone()),
                Err(error) => {
                    debug!(location = %material.location, %error, "Issuer check failed");
                }
            }
        }
    }
    None
}

/// Verifies a raw signature against a subject public key.
pub(super) fn verify_with_spki(
    spki: &SubjectPublicKeyInfo<'_>,
    message: &[u8],
    sig: &[u8],
) -> Result<(), VerifyError> {
    let oid = spki.algorithm.algorithm.to_id_string();
    let alg: &dyn signature::VerificationAlgorithm = match oid.as_str() {
        OID_RSA => &signature::RSA_PKCS1_2048_8192_SHA256,
        OID_EC => &signature::ECDSA_P256_SHA256_ASN1,
        other => {
            return Err(VerifyError::Verification(format!(
                "unsupported public key algorithm: {other}"
            )))
        }
    };
    UnparsedPublicKey::new(alg, spki.subject_public_key.data.as_ref())
        .verify(message, sig)
        .map_err(|_| VerifyError::Verification("signature mismatch".to_string()))
}

pub(super) fn signer_from_cert(cert: &X509Certificate<'_>, der: &[u8]) -> Signer {
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    let email = subject_email(cert).unwrap_or_default();
    let digest = ring::digest::digest(&ring::digest::SHA256, der);
    Signer {
        email,
        common_name,
        fingerprint: hex::encode(digest.as_ref()).to_uppercase(),
    }
}

/// Prefers a SAN rfc822 address, falling back to the subject email attribute.
fn subject_email(cert: &X509Certificate<'_>) -> Option<String> {
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::RFC822Name(email) = name {
                return Some(email.to_string());
            }
        }
    }
    cert.subject()
        .iter_email()
        .next()
        .and_then(|e| e.as_str().ok())
        .map(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_is_not_a_certificate() {
        assert_eq!(count_certs(b"garbage"), 0);
        assert!(pem_certs(b"-----BEGIN CERTIFICATE-----\nnope\n-----END CERTIFICATE-----\n").is_empty());
    }

    #[test]
    fn unreadable_signer_certificate_fails() {
        let err = verify(b"msg", b"sig", b"garbage", &[]).unwrap_err();
        assert!(matches!(err, VerifyError::Verification(_)));
    }
}
