//! Audit event construction.
//!
//! Events carry a deterministic key so repeated identical outcomes aggregate
//! into one record downstream. Persistence is a collaborator concern.

use signet_policy_controller_core::{DecisionResult, POLICY_CONTROLLER_NAME};
use tracing::info;

/// One admission outcome, ready for an audit sink.
#[derive(Clone, Debug)]
pub struct AuditEvent {
    pub key: String,
    pub outcome: &'static str,
    pub reason_code: usize,
    pub message: String,
    pub denied_by: Option<String>,
}

impl AuditEvent {
    pub fn from_decision(
        result: &DecisionResult,
        operation: &str,
        kind: &str,
        name: &str,
    ) -> Self {
        let outcome = if result.is_allowed() {
            "allow"
        } else if result.is_denied() {
            "deny"
        } else {
            "error"
        };
        Self {
            key: event_key(outcome, operation, kind, name),
            outcome,
            reason_code: result.reason_code,
            message: result.message.clone(),
            denied_by: result.denied_by().map(str::to_string),
        }
    }
}

/// Builds the stable aggregation key for an admission outcome.
pub fn event_key(outcome: &str, operation: &str, kind: &str, name: &str) -> String {
    format!(
        "signet-{}-{}-{}-{}",
        outcome,
        operation.to_ascii_lowercase(),
        kind.to_ascii_lowercase(),
        name.to_ascii_lowercase()
    )
}

/// Receives audit events; implementations decide durability.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Emits audit events to the log stream.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

#[async_trait::async_trait]
impl AuditSink for LogSink {
    async fn record(&self, event: AuditEvent) {
        info!(
            controller = %POLICY_CONTROLLER_NAME,
            key = %event.key,
            outcome = %event.outcome,
            reason_code = event.reason_code,
            message = %event.message,
            denied_by = event.denied_by.as_deref().unwrap_or(""),
            "Admission audit",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic_and_lowercased() {
        let a = event_key("deny", "CREATE", "ConfigMap", "app-config");
        let b = event_key("deny", "CREATE", "ConfigMap", "app-config");
        assert_eq!(a, b);
        assert_eq!(a, "signet-deny-create-configmap-app-config");
    }
}
