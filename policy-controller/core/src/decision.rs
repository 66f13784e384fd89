//! The terminal decision record and the fixed reason-code catalog.

use serde::Serialize;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum DecisionType {
    Undetermined,
    Allow,
    Deny,
    Error,
}

/// A stable reason-code entry. Codes are append-only: new conditions get new
/// codes, existing codes are never repurposed.
#[derive(Debug)]
pub struct ReasonCode {
    pub code: &'static str,
    pub message: &'static str,
}

pub const REASON_INTERNAL: usize = 0;
pub const REASON_UNPROCESSED: usize = 1;
pub const REASON_OUT_OF_SCOPE: usize = 2;
pub const REASON_PRIVILEGED: usize = 3;
pub const REASON_DRY_RUN: usize = 4;
pub const REASON_BREAK_GLASS: usize = 5;
pub const REASON_NO_SIG: usize = 6;
pub const REASON_NO_VALID_KEYRING: usize = 7;
pub const REASON_INVALID_SIG: usize = 8;
pub const REASON_NO_MATCH_SIGNER: usize = 9;
pub const REASON_VALID_SIG: usize = 10;
pub const REASON_DETECTION: usize = 11;
pub const REASON_ABORTED: usize = 12;

static CATALOG: &[ReasonCode] = &[
    ReasonCode {
        code: "internal-error",
        message: "an internal error occurred while processing the request",
    },
    ReasonCode {
        code: "unprocessed",
        message: "request matched an ignore rule and is not processed",
    },
    ReasonCode {
        code: "out-of-scope",
        message: "request namespace is out of the configured scope",
    },
    ReasonCode {
        code: "privileged-requester",
        message: "requests from controller and privileged accounts are always allowed",
    },
    ReasonCode {
        code: "dry-run",
        message: "dry-run requests are always allowed",
    },
    ReasonCode {
        code: "break-glass",
        message: "break-glass is active for this scope",
    },
    ReasonCode {
        code: "no-signature",
        message: "no signature found",
    },
    ReasonCode {
        code: "no-valid-keyring",
        message: "no valid keyring could be loaded from the configured key locations",
    },
    ReasonCode {
        code: "invalid-signature",
        message: "failed to verify signature",
    },
    ReasonCode {
        code: "signer-not-matched",
        message: "no configured signer matches this resource's signer",
    },
    ReasonCode {
        code: "valid-signature",
        message: "signed by an authorized signer",
    },
    ReasonCode {
        code: "detection",
        message: "denied request was allowed because detection mode is enabled",
    },
    ReasonCode {
        code: "aborted",
        message: "evaluation was aborted before completion",
    },
];

/// Looks a reason up in the fixed catalog; unknown codes map to the internal
/// error entry rather than panicking.
pub fn reason(code: usize) -> &'static ReasonCode {
    CATALOG.get(code).unwrap_or(&CATALOG[REASON_INTERNAL])
}

/// The terminal output of one admission evaluation.
///
/// Starts undetermined and transitions at most once to Allow, Deny, or
/// Error; later transitions are ignored so a decision can never revert.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionResult {
    #[serde(rename = "type")]
    decision: DecisionType,
    pub verified: bool,
    pub reason_code: usize,
    pub message: String,

    /// The policy that produced a denial, for downstream audit annotation.
    #[serde(skip)]
    denied_by: Option<String>,
}

impl DecisionResult {
    pub fn undetermined() -> Self {
        Self {
            decision: DecisionType::Undetermined,
            verified: false,
            reason_code: REASON_INTERNAL,
            message: String::new(),
            denied_by: None,
        }
    }

    /// Renders the terminal decision; a no-op once one has been rendered.
    pub fn conclude(
        &mut self,
        decision: DecisionType,
        verified: bool,
        reason_code: usize,
        message: impl Into<String>,
    ) -> &mut Self {
        if self.decision != DecisionType::Undetermined || decision == DecisionType::Undetermined {
            return self;
        }
        self.decision = decision;
        self.verified = verified;
        self.reason_code = reason_code;
        self.message = message.into();
        self
    }

    pub fn set_denied_by(&mut self, policy: impl Into<String>) {
        self.denied_by = Some(policy.into());
    }

    pub fn decision(&self) -> DecisionType {
        self.decision
    }

    pub fn denied_by(&self) -> Option<&str> {
        self.denied_by.as_deref()
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == DecisionType::Allow
    }

    pub fn is_denied(&self) -> bool {
        self.decision == DecisionType::Deny
    }

    pub fn is_undetermined(&self) -> bool {
        self.decision == DecisionType::Undetermined
    }

    pub fn is_error(&self) -> bool {
        self.decision == DecisionType::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_codes_are_stable() {
        assert_eq!(reason(REASON_NO_SIG).code, "no-signature");
        assert_eq!(reason(REASON_NO_VALID_KEYRING).code, "no-valid-keyring");
        assert_eq!(reason(REASON_NO_MATCH_SIGNER).code, "signer-not-matched");
        // Unknown codes map to the internal entry.
        assert_eq!(reason(9999).code, "internal-error");
    }

    #[test]
    fn decision_transitions_once() {
        let mut d = DecisionResult::undetermined();
        assert!(d.is_undetermined());

        d.conclude(DecisionType::Deny, false, REASON_NO_SIG, "no signature");
        assert!(d.is_denied());
        assert_eq!(d.reason_code, REASON_NO_SIG);

        // A second transition is ignored.
        d.conclude(DecisionType::Allow, true, REASON_VALID_SIG, "ok");
        assert!(d.is_denied());
        assert_eq!(d.reason_code, REASON_NO_SIG);
    }

    #[test]
    fn cannot_revert_to_undetermined() {
        let mut d = DecisionResult::undetermined();
        d.conclude(DecisionType::Allow, true, REASON_VALID_SIG, "ok");
        d.conclude(DecisionType::Undetermined, false, REASON_INTERNAL, "");
        assert!(d.is_allowed());
    }
}
