use crate::config::KeyConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// The three mutually exclusive trust mechanisms a signature can be
/// verified against.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialFamily {
    Pgp,
    X509,
    TransparencyLog,
}

#[derive(Debug, Error)]
pub enum KeySourceError {
    #[error("key material not found at {0}")]
    NotFound(String),

    #[error("failed to read key material from {location}: {source}")]
    Transport {
        location: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Provides raw key material for a configured credential location.
///
/// Implementations must distinguish "not found" from transport/auth
/// failures; the latter are infrastructure faults, not missing keys.
#[async_trait::async_trait]
pub trait KeySource: Send + Sync {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, KeySourceError>;
}

/// Reads key material from the local filesystem.
#[derive(Clone, Debug, Default)]
pub struct FileKeySource;

#[async_trait::async_trait]
impl KeySource for FileKeySource {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, KeySourceError> {
        match tokio::fs::read(location).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KeySourceError::NotFound(location.to_string()))
            }
            Err(e) => Err(KeySourceError::Transport {
                location: location.to_string(),
                source: e.into(),
            }),
        }
    }
}

/// Ordered candidate key locations per credential family.
#[derive(Clone, Debug, Default)]
pub struct CandidateKeys {
    pub pgp: Vec<String>,
    pub x509: Vec<String>,
    pub tlog: Vec<String>,
}

impl CandidateKeys {
    pub fn from_configs(configs: &[KeyConfig]) -> Self {
        let mut candidates = Self::default();
        for config in configs {
            let target = match config.family {
                CredentialFamily::Pgp => &mut candidates.pgp,
                CredentialFamily::X509 => &mut candidates.x509,
                CredentialFamily::TransparencyLog => &mut candidates.tlog,
            };
            target.extend(config.locations.iter().cloned());
        }
        candidates
    }

    pub fn configured_count(&self) -> usize {
        self.pgp.len() + self.x509.len() + self.tlog.len()
    }
}

/// Key bytes successfully fetched for one configured location.
#[derive(Clone, Debug)]
pub struct KeyMaterial {
    pub location: String,
    pub bytes: Vec<u8>,
}

/// The outcome of attempting to load every configured candidate location.
#[derive(Debug, Default)]
pub struct LoadedKeys {
    pub pgp: Vec<KeyMaterial>,
    pub x509: Vec<KeyMaterial>,
    pub tlog: Vec<KeyMaterial>,
    configured: usize,
    valid: usize,
}

impl LoadedKeys {
    /// True when candidates were configured but none yielded a usable key.
    ///
    /// This condition is evaluated before cryptographic verification and
    /// surfaced whenever verification does not itself recover a signer.
    pub fn keyring_missing(&self) -> bool {
        self.configured > 0 && self.valid == 0
    }

    pub fn valid_count(&self) -> usize {
        self.valid
    }
}

/// Loads every candidate location through `source`.
///
/// When a `secondary` source is configured (running outside a cluster, keys
/// materialized from secrets), it is consulted for locations the primary
/// source does not have. A location counts as valid only if its bytes parse
/// into at least one usable key or certificate for its family.
///
/// Missing or unparseable material is a configuration fault and is skipped;
/// a transport failure is an infrastructure fault and aborts the load so the
/// caller can surface an error instead of a denial.
pub async fn load(
    candidates: &CandidateKeys,
    source: &dyn KeySource,
    secondary: Option<&dyn KeySource>,
) -> Result<LoadedKeys, KeySourceError> {
    let mut loaded = LoadedKeys {
        configured: candidates.configured_count(),
        ..Default::default()
    };

    for (family, locations) in [
        (CredentialFamily::Pgp, &candidates.pgp),
        (CredentialFamily::X509, &candidates.x509),
        (CredentialFamily::TransparencyLog, &candidates.tlog),
    ] {
        for location in locations {
            let bytes = match fetch_with_fallback(source, secondary, location).await? {
                Some(bytes) => bytes,
                None => continue,
            };
            let usable = match family {
                CredentialFamily::Pgp => crate::verify::pgp::count_certs(&bytes),
                CredentialFamily::X509 => crate::verify::x509::count_certs(&bytes),
                CredentialFamily::TransparencyLog => crate::verify::x509::count_certs(&bytes),
            };
            if usable == 0 {
                debug!(%location, ?family, "Key location yielded no usable keys");
                continue;
            }
            loaded.valid += 1;
            let material = KeyMaterial {
                location: location.clone(),
                bytes,
            };
            match family {
                CredentialFamily::Pgp => loaded.pgp.push(material),
                CredentialFamily::X509 => loaded.x509.push(material),
                CredentialFamily::TransparencyLog => loaded.tlog.push(material),
            }
        }
    }

    Ok(loaded)
}

async fn fetch_with_fallback(
    source: &dyn KeySource,
    secondary: Option<&dyn KeySource>,
    location: &str,
) -> Result<Option<Vec<u8>>, KeySourceError> {
    match source.fetch(location).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(KeySourceError::NotFound(_)) => match secondary {
            Some(fallback) => match fallback.fetch(location).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(KeySourceError::NotFound(_)) => {
                    debug!(%location, "No key material found");
                    Ok(None)
                }
                Err(error) => {
                    warn!(%location, %error, "Secondary key source failed");
                    Err(error)
                }
            },
            None => {
                debug!(%location, "No key material found");
                Ok(None)
            }
        },
        Err(error) => {
            warn!(%location, %error, "Failed to load key material");
            Err(error)
        }
    }
}
