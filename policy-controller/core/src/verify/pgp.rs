//! OpenPGP signature verification.

use super::{Verification, VerifyError};
use crate::keyring::KeyMaterial;
use crate::signer::Signer;
use sequoia_openpgp as openpgp;

use openpgp::cert::prelude::*;
use openpgp::parse::stream::*;
use openpgp::parse::Parse;
use openpgp::policy::StandardPolicy;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// Counts the certificates a keyring blob parses into.
pub fn count_certs(bytes: &[u8]) -> usize {
    match CertParser::from_bytes(bytes) {
        Ok(parser) => parser.flatten().count(),
        Err(_) => 0,
    }
}

struct Helper {
    certs: Vec<Cert>,
    signer_cert: Rc<RefCell<Option<Cert>>>,
}

impl VerificationHelper for Helper {
    fn get_certs(&mut self, _ids: &[openpgp::KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        Ok(self.certs.clone())
    }

    fn check(&mut self, structure: MessageStructure<'_>) -> openpgp::Result<()> {
        for layer in structure.into_iter() {
            if let MessageLayer::SignatureGroup { results } = layer {
                let mut last_error = None;
                for result in results {
                    match result {
                        Ok(good) => {
                            *self.signer_cert.borrow_mut() = Some(good.ka.cert().cert().clone());
                            return Ok(());
                        }
                        Err(e) => {
                            last_error = Some(e);
                        }
                    }
                }
                if let Some(e) = last_error {
                    return Err(openpgp::Error::from(e).into());
                }
            }
        }
        Err(openpgp::Error::InvalidOperation("No valid signature".into()).into())
    }
}

/// Verifies a detached signature against every configured keyring.
///
/// Returns the recovered signer plus the locations whose keys verified it.
pub fn verify(
    message: &[u8],
    signature: &[u8],
    keyrings: &[KeyMaterial],
) -> Result<Verification, VerifyError> {
    if signature.is_empty() {
        return Err(VerifyError::Verification("empty signature".to_string()));
    }

    let policy = StandardPolicy::new();
    let mut signer: Option<Signer> = None;
    let mut verified_paths = Vec::new();
    let mut last_error: Option<String> = None;

    for keyring in keyrings {
        let certs: Vec<Cert> = match CertParser::from_bytes(&keyring.bytes) {
            Ok(parser) => parser.flatten().collect(),
            Err(error) => {
                debug!(location = %keyring.location, %error, "Unreadable keyring");
                continue;
            }
        };
        if certs.is_empty() {
            continue;
        }

        let signer_cert: Rc<RefCell<Option<Cert>>> = Rc::new(RefCell::new(None));
        let helper = Helper {
            certs,
            signer_cert: signer_cert.clone(),
        };

        let verifier = DetachedVerifierBuilder::from_bytes(signature)
            .and_then(|b| b.with_policy(&policy, None, helper));
        let mut verifier = match verifier {
            Ok(v) => v,
            Err(error) => {
                last_error = Some(error.to_string());
                continue;
            }
        };

        match verifier.verify_bytes(message) {
            Ok(()) => {
                let cert = signer_cert.borrow().clone();
                match cert {
                    Some(cert) => {
                        if signer.is_none() {
                            signer = Some(signer_from_cert(&cert));
                        }
                        verified_paths.push(keyring.location.clone());
                    }
                    None => {
                        last_error = Some("signer certificate not resolved".to_string());
                    }
                }
            }
            Err(error) => {
                debug!(location = %keyring.location, %error, "Signature did not verify");
                last_error = Some(error.to_string());
            }
        }
    }

    match signer {
        Some(signer) => Ok(Verification {
            signer,
            key_paths: verified_paths,
        }),
        None => match last_error {
            Some(reason) => Err(VerifyError::Verification(reason)),
            None => Err(VerifyError::SignerNotRecovered),
        },
    }
}

fn signer_from_cert(cert: &Cert) -> Signer {
    let uid = cert
        .userids()
        .next()
        .map(|u| String::from_utf8_lossy(u.userid().value()).to_string())
        .unwrap_or_default();
    let (common_name, email) = split_uid(&uid);
    Signer {
        email,
        common_name,
        fingerprint: cert.fingerprint().to_string(),
    }
}

/// Splits a `Name <addr>` user id into its name and email parts.
fn split_uid(uid: &str) -> (String, String) {
    if let (Some(open), Some(close)) = (uid.find('<'), uid.rfind('>')) {
        if open < close {
            let name = uid[..open].trim().to_string();
            let email = uid[open + 1..close].trim().to_string();
            return (name, email);
        }
    }
    if uid.contains('@') {
        (String::new(), uid.trim().to_string())
    } else {
        (uid.trim().to_string(), String::new())
    }
}
