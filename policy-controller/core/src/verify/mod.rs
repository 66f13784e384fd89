//! Cryptographic verification, keyed by sign type and credential family.

pub mod pgp;
pub mod tlog;
pub mod x509;

use crate::context::ResourceContext;
use crate::keyring::LoadedKeys;
use crate::resolve::{GeneralSignature, SignaturePayload};
use crate::signer::Signer;
use thiserror::Error;

/// A successful verification: the recovered signer and the key locations
/// that verified it.
#[derive(Clone, Debug)]
pub struct Verification {
    pub signer: Signer,
    pub key_paths: Vec<String>,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("failed to verify signature; {0}")]
    Verification(String),

    #[error("signature verified but no signer identity was recovered")]
    SignerNotRecovered,

    #[error("signed message does not match the requested object")]
    MessageMismatch,
}

/// Verifies a resolved signature against the loaded key material.
///
/// A signature is verified against exactly the credential family its payload
/// shape implies: a transparency-log bundle, an explicit certificate, or a
/// PGP keyring, in that order of specificity. The three families are never
/// tried against one another.
pub fn verify(
    signature: &GeneralSignature,
    resource: &ResourceContext,
    keys: &LoadedKeys,
) -> Result<Verification, VerifyError> {
    match &signature.payload {
        SignaturePayload::Resource(payload) => {
            if signature.match_required && !message_matches(&payload.message, resource) {
                return Err(VerifyError::MessageMismatch);
            }
            if let Some(bundle) = &payload.tlog_bundle {
                tlog::verify(&payload.message, bundle, &keys.tlog)
            } else if let Some(certificate) = &payload.certificate {
                x509::verify(&payload.message, &payload.signature, certificate, &keys.x509)
            } else {
                pgp::verify(&payload.message, &payload.signature, &keys.pgp)
            }
        }
        SignaturePayload::Helm(payload) => {
            // Helm provenance carries an armored PGP block over the release
            // record; the release metadata is not matched against the live
            // object here.
            let blocks = extract_armored_signatures(&payload.metadata);
            let block = blocks
                .first()
                .ok_or_else(|| VerifyError::Verification("release metadata carries no signature".to_string()))?;
            pgp::verify(&payload.release, block, &keys.pgp)
        }
    }
}

/// Checks that the signed message describes the requested object.
///
/// The message may hold several YAML documents; it matches when any document
/// claims the request's apiVersion, kind, name, and namespace.
pub fn message_matches(message: &[u8], resource: &ResourceContext) -> bool {
    let text = match std::str::from_utf8(message) {
        Ok(t) => t,
        Err(_) => return false,
    };
    for doc in split_yaml_documents(text) {
        let value: serde_yaml::Value = match serde_yaml::from_str(doc) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let get = |path: &[&str]| {
            let mut cur = &value;
            for p in path {
                match cur.get(*p) {
                    Some(v) => cur = v,
                    None => return "",
                }
            }
            cur.as_str().unwrap_or("")
        };
        let claimed_ns = get(&["metadata", "namespace"]);
        if get(&["kind"]) == resource.kind
            && get(&["apiVersion"]) == resource.group_version()
            && get(&["metadata", "name"]) == resource.name
            && (claimed_ns.is_empty() || claimed_ns == resource.namespace)
        {
            return true;
        }
    }
    false
}

fn split_yaml_documents(text: &str) -> impl Iterator<Item = &str> {
    text.split("\n---").map(|d| d.trim_start_matches("---"))
}

/// Extracts ASCII-armored PGP signature blocks from a binary blob.
fn extract_armored_signatures(data: &[u8]) -> Vec<Vec<u8>> {
    const BEGIN: &[u8] = b"-----BEGIN PGP SIGNATURE-----";
    const END: &[u8] = b"-----END PGP SIGNATURE-----";

    let mut sigs = Vec::new();
    let mut i = 0;
    while let Some(begin) = find_subslice(data, BEGIN, i) {
        let Some(end) = find_subslice(data, END, begin) else {
            break;
        };
        let end_pos = end + END.len();
        sigs.push(data[begin..end_pos].to_vec());
        i = end_pos;
    }
    sigs
}

fn find_subslice(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if needle.is_empty() || start >= haystack.len() {
        return None;
    }
    haystack[start..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| start + pos)
}
