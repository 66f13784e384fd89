//! The top-level evaluation entry points: `SignatureEvaluator` and the
//! decision composition in [`decide`].

use crate::bypass::{self, Bypass};
use crate::config::{EngineConfig, SignerPolicy};
use crate::context::{AdmissionAttributes, ResourceContext};
use crate::decision::{self, DecisionResult, DecisionType};
use crate::keyring::{self, CandidateKeys, KeySource};
use crate::resolve::{self, ReleaseReader, SignatureStore};
use crate::signer::{self, Signer};
use crate::verify;
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A failed check, carrying the catalog code alongside the composed reason.
#[derive(Clone, Debug)]
pub struct CheckError {
    pub reason_code: usize,
    pub reason: String,
}

/// The immutable outcome of one signature evaluation.
#[derive(Clone, Debug, Default)]
pub struct SignatureEvalResult {
    pub allow: bool,
    /// True once verification was actually attempted.
    pub checked: bool,
    pub signer: Option<Signer>,
    pub signer_name: Option<String>,
    /// Serialized form of the rule that authorized the signer.
    pub matched_signer_rule: Option<String>,
    pub error: Option<CheckError>,
    /// Echo of the resolved signature's provenance identifier.
    pub provenance: Option<String>,
}

impl SignatureEvalResult {
    fn denied(reason_code: usize, reason: String, provenance: Option<String>) -> Self {
        Self {
            allow: false,
            checked: true,
            error: Some(CheckError { reason_code, reason }),
            provenance,
            ..Default::default()
        }
    }
}

/// The resolve-and-verify capability.
///
/// Kept as a seam so the decision engine can be exercised with doubles
/// instead of real cryptographic material.
#[async_trait::async_trait]
pub trait SignatureEvaluator: Send + Sync {
    async fn eval(
        &self,
        resource: &ResourceContext,
        store: Option<&dyn SignatureStore>,
        policy: &SignerPolicy,
    ) -> Result<SignatureEvalResult>;
}

/// The production evaluator: resolves a signature, loads candidate keys,
/// verifies, and matches the recovered signer against policy.
pub struct ConcreteSignatureEvaluator {
    config: Arc<EngineConfig>,
    key_source: Arc<dyn KeySource>,
    /// Secret-backed fallback used when running outside a cluster.
    secondary_key_source: Option<Arc<dyn KeySource>>,
    releases: Option<Arc<dyn ReleaseReader>>,
}

impl ConcreteSignatureEvaluator {
    pub fn new(config: Arc<EngineConfig>, key_source: Arc<dyn KeySource>) -> Self {
        Self {
            config,
            key_source,
            secondary_key_source: None,
            releases: None,
        }
    }

    pub fn with_secondary_key_source(mut self, source: Arc<dyn KeySource>) -> Self {
        self.secondary_key_source = Some(source);
        self
    }

    pub fn with_release_reader(mut self, releases: Arc<dyn ReleaseReader>) -> Self {
        self.releases = Some(releases);
        self
    }
}

#[async_trait::async_trait]
impl SignatureEvaluator for ConcreteSignatureEvaluator {
    async fn eval(
        &self,
        resource: &ResourceContext,
        store: Option<&dyn SignatureStore>,
        policy: &SignerPolicy,
    ) -> Result<SignatureEvalResult> {
        let reference = resource.resource_ref();

        let releases = if self.config.helm_plugin_enabled {
            self.releases.as_deref()
        } else {
            None
        };
        let resolved = resolve::resolve(&reference, resource, store, releases).await?;
        let Some(signature) = resolved else {
            debug!(kind = %resource.kind, name = %resource.name, "No signature found");
            return Ok(SignatureEvalResult::denied(
                decision::REASON_NO_SIG,
                decision::reason(decision::REASON_NO_SIG).message.to_string(),
                None,
            ));
        };
        let provenance = signature.provenance.clone();

        let candidates = CandidateKeys::from_configs(&self.config.key_configs);
        // An unreachable key source is an infrastructure fault, not a denial.
        let keys = keyring::load(
            &candidates,
            &*self.key_source,
            self.secondary_key_source.as_deref(),
        )
        .await?;
        // Keyring validity is decided before verification so a keyring
        // problem is reported whenever verification cannot produce a signer,
        // and never masks a successful verification.
        let keyring_missing = keys.keyring_missing();

        let verification = match verify::verify(&signature, resource, &keys) {
            Ok(v) => v,
            Err(error) => {
                if keyring_missing {
                    return Ok(SignatureEvalResult::denied(
                        decision::REASON_NO_VALID_KEYRING,
                        decision::reason(decision::REASON_NO_VALID_KEYRING)
                            .message
                            .to_string(),
                        provenance,
                    ));
                }
                let reason = format!(
                    "{}; {}",
                    decision::reason(decision::REASON_INVALID_SIG).message,
                    error
                );
                return Ok(SignatureEvalResult::denied(
                    decision::REASON_INVALID_SIG,
                    reason,
                    provenance,
                ));
            }
        };

        let signer = verification.signer;
        match signer::match_signer(policy, &resource.namespace, &signer, &verification.key_paths) {
            Some(rule) => {
                info!(signer = %signer.name(), rule = %rule.name, "Signer authorized");
                let matched = serde_json::to_string(rule).ok();
                Ok(SignatureEvalResult {
                    allow: true,
                    checked: true,
                    signer_name: Some(signer.name().to_string()),
                    signer: Some(signer),
                    matched_signer_rule: matched,
                    error: None,
                    provenance,
                })
            }
            None => {
                let reason = format!(
                    "{}; this resource is signed by {}",
                    decision::reason(decision::REASON_NO_MATCH_SIGNER).message,
                    signer.name_with_fingerprint()
                );
                Ok(SignatureEvalResult {
                    signer_name: Some(signer.name().to_string()),
                    signer: Some(signer),
                    error: Some(CheckError {
                        reason_code: decision::REASON_NO_MATCH_SIGNER,
                        reason,
                    }),
                    checked: true,
                    allow: false,
                    matched_signer_rule: None,
                    provenance,
                })
            }
        }
    }
}

/// Composes the bypass checks and signature evaluation into the terminal
/// decision. Bypass outcomes skip the evaluator entirely.
pub async fn decide(
    resource: &ResourceContext,
    attrs: &AdmissionAttributes,
    config: &EngineConfig,
    policy: &SignerPolicy,
    evaluator: &dyn SignatureEvaluator,
    store: Option<&dyn SignatureStore>,
) -> DecisionResult {
    let mut result = DecisionResult::undetermined();

    if let Some(bypass) = bypass::check(resource, attrs, config, policy) {
        let code = match bypass {
            Bypass::Unprocessed => decision::REASON_UNPROCESSED,
            Bypass::OutOfScopeNamespace => decision::REASON_OUT_OF_SCOPE,
            Bypass::PrivilegedRequester => decision::REASON_PRIVILEGED,
            Bypass::DryRun => decision::REASON_DRY_RUN,
            Bypass::BreakGlass => decision::REASON_BREAK_GLASS,
        };
        debug!(?bypass, user = %attrs.user_name, "Bypassing signature verification");
        result.conclude(
            DecisionType::Allow,
            false,
            code,
            decision::reason(code).message,
        );
        return result;
    }

    match evaluator.eval(resource, store, policy).await {
        Ok(eval) => {
            if eval.allow {
                result.conclude(
                    DecisionType::Allow,
                    true,
                    decision::REASON_VALID_SIG,
                    decision::reason(decision::REASON_VALID_SIG).message,
                );
            } else {
                let (code, message) = match &eval.error {
                    Some(e) => (e.reason_code, e.reason.clone()),
                    None => (
                        decision::REASON_INTERNAL,
                        decision::reason(decision::REASON_INTERNAL).message.to_string(),
                    ),
                };
                if config.detect_mode {
                    info!(%message, "Detection mode: reporting denial but admitting");
                    result.conclude(
                        DecisionType::Allow,
                        false,
                        decision::REASON_DETECTION,
                        format!(
                            "{}; original result: {message}",
                            decision::reason(decision::REASON_DETECTION).message
                        ),
                    );
                } else {
                    result.conclude(DecisionType::Deny, false, code, message);
                }
                result.set_denied_by(policy.name.clone());
            }
        }
        Err(error) => {
            // Infrastructure faults are not authorization failures.
            warn!(%error, "Signature evaluation could not complete");
            result.conclude(
                DecisionType::Error,
                false,
                decision::REASON_INTERNAL,
                format!(
                    "{}; {error}",
                    decision::reason(decision::REASON_INTERNAL).message
                ),
            );
        }
    }

    result
}

/// [`decide`], bounded by the caller's deadline. Hitting the deadline aborts
/// key loading/verification and surfaces an Error, not a Deny.
#[allow(clippy::too_many_arguments)]
pub async fn decide_with_deadline(
    resource: &ResourceContext,
    attrs: &AdmissionAttributes,
    config: &EngineConfig,
    policy: &SignerPolicy,
    evaluator: &dyn SignatureEvaluator,
    store: Option<&dyn SignatureStore>,
    deadline: std::time::Duration,
) -> DecisionResult {
    match tokio::time::timeout(
        deadline,
        decide(resource, attrs, config, policy, evaluator, store),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            warn!(?deadline, "Evaluation deadline elapsed");
            let mut result = DecisionResult::undetermined();
            result.conclude(
                DecisionType::Error,
                false,
                decision::REASON_ABORTED,
                decision::reason(decision::REASON_ABORTED).message,
            );
            result
        }
    }
}
