#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod bypass;
pub mod config;
pub mod context;
pub mod decision;
pub mod evaluate;
pub mod keyring;
mod pattern;
pub mod resolve;
pub mod signer;
pub mod verify;

pub use self::{
    bypass::Bypass,
    config::{EngineConfig, KeyConfig, SignerPolicy, SignerRule},
    context::{AdmissionAttributes, ResourceContext, ResourceRef, ResourceScope},
    decision::{DecisionResult, DecisionType},
    evaluate::{ConcreteSignatureEvaluator, SignatureEvalResult, SignatureEvaluator},
    keyring::{CredentialFamily, FileKeySource, KeySource},
    pattern::{exact_match, match_pattern, match_pattern_array},
    resolve::{GeneralSignature, ReleaseReader, SignatureStore},
    signer::Signer,
};

pub const POLICY_CONTROLLER_NAME: &str = "signet.dev/policy-controller";
