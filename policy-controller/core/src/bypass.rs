//! Pre-verification gating: decides whether a request is in scope, already
//! decided, or must proceed to signature verification.

use crate::config::{EngineConfig, SignerPolicy};
use crate::context::{request_fields, AdmissionAttributes, ResourceContext};
use crate::pattern::{exact_match, match_pattern, match_pattern_array};

/// The garbage collector deletes dependents with its own identity.
const GARBAGE_COLLECTOR: &str = "system:serviceaccount:kube-system:generic-garbage-collector";

/// Platform-reserved service-account prefixes that are never verified.
const RESERVED_SERVICE_ACCOUNT_PREFIXES: &[&str] = &[
    "system:serviceaccount:kube-",
    "system:serviceaccount:openshift-",
    "system:serviceaccount:openshift:",
    "system:serviceaccount:open-cluster-",
    "system:serviceaccount:olm:",
];

// TODO: drop once the OLM account is carried in admin_user_patterns by the
// operator-generated config.
const LEGACY_OPERATOR_LIFECYCLE_ACCOUNT: &str =
    "system:serviceaccount:openshift-operator-lifecycle-manager:olm-operator-serviceaccount";

/// Why a request bypassed signature verification.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Bypass {
    /// Matched a configured ignore rule.
    Unprocessed,
    /// The namespace is outside the configured scope.
    OutOfScopeNamespace,
    /// The controller's own identities, platform accounts, or admins.
    PrivilegedRequester,
    DryRun,
    BreakGlass,
}

/// Runs the fixed-order bypass checks; the first that fires wins.
pub fn check(
    resource: &ResourceContext,
    attrs: &AdmissionAttributes,
    config: &EngineConfig,
    policy: &SignerPolicy,
) -> Option<Bypass> {
    if is_unprocessed(resource, attrs, config) {
        return Some(Bypass::Unprocessed);
    }
    if is_out_of_scope(resource, config) {
        return Some(Bypass::OutOfScopeNamespace);
    }
    if is_privileged_requester(attrs, config) {
        return Some(Bypass::PrivilegedRequester);
    }
    if attrs.dry_run {
        return Some(Bypass::DryRun);
    }
    if break_glass_active(resource, policy) {
        return Some(Bypass::BreakGlass);
    }
    None
}

fn is_unprocessed(
    resource: &ResourceContext,
    attrs: &AdmissionAttributes,
    config: &EngineConfig,
) -> bool {
    let fields = request_fields(resource, attrs);
    config.ignore.iter().any(|rule| rule.matches(&fields, attrs))
}

fn is_out_of_scope(resource: &ResourceContext, config: &EngineConfig) -> bool {
    match &config.in_scope_namespaces {
        Some(selector) => !resource.namespace.is_empty() && !selector.matches(&resource.namespace),
        None => false,
    }
}

fn is_privileged_requester(attrs: &AdmissionAttributes, config: &EngineConfig) -> bool {
    is_server_request(attrs, config)
        || is_operator_request(attrs, config)
        || is_garbage_collector_request(attrs)
        || is_reserved_service_account(attrs)
        || is_admin_request(attrs, config)
}

fn is_server_request(attrs: &AdmissionAttributes, config: &EngineConfig) -> bool {
    match_pattern(&config.server_user_name, &attrs.user_name)
}

fn is_operator_request(attrs: &AdmissionAttributes, config: &EngineConfig) -> bool {
    exact_match(&config.operator_service_account, &attrs.user_name)
}

fn is_garbage_collector_request(attrs: &AdmissionAttributes) -> bool {
    attrs.user_name == GARBAGE_COLLECTOR
}

fn is_reserved_service_account(attrs: &AdmissionAttributes) -> bool {
    RESERVED_SERVICE_ACCOUNT_PREFIXES
        .iter()
        .any(|prefix| attrs.user_name.starts_with(prefix))
}

fn is_admin_request(attrs: &AdmissionAttributes, config: &EngineConfig) -> bool {
    let group_matched = config
        .admin_group_patterns
        .iter()
        .any(|p| match_pattern_array(p, &attrs.user_groups));
    let user_matched = config
        .admin_user_patterns
        .iter()
        .any(|p| match_pattern(p, &attrs.user_name));
    group_matched || user_matched || attrs.user_name == LEGACY_OPERATOR_LIFECYCLE_ACCOUNT
}

fn break_glass_active(resource: &ResourceContext, policy: &SignerPolicy) -> bool {
    policy
        .break_glass
        .iter()
        .any(|c| c.applies_to(resource.scope, &resource.namespace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakGlassCondition, NamespaceSelector, RequestMatchRule};
    use serde_json::json;

    fn resource(namespace: &str) -> ResourceContext {
        ResourceContext::from_value(&json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": if namespace.is_empty() {
                json!({"name": "cm"})
            } else {
                json!({"name": "cm", "namespace": namespace})
            },
        }))
    }

    fn attrs(user: &str) -> AdmissionAttributes {
        AdmissionAttributes {
            operation: "CREATE".to_string(),
            user_name: user.to_string(),
            user_groups: vec![],
            dry_run: false,
        }
    }

    #[test]
    fn ignore_rule_fires_first() {
        let config = EngineConfig {
            ignore: vec![RequestMatchRule {
                namespace: Some("prod-a".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let got = check(&resource("prod-a"), &attrs("alice"), &config, &SignerPolicy::default());
        assert_eq!(got, Some(Bypass::Unprocessed));
    }

    #[test]
    fn out_of_scope_namespace() {
        let config = EngineConfig {
            in_scope_namespaces: Some(NamespaceSelector {
                include: vec!["prod-*".to_string()],
                exclude: vec![],
            }),
            ..Default::default()
        };
        assert_eq!(
            check(&resource("dev"), &attrs("alice"), &config, &SignerPolicy::default()),
            Some(Bypass::OutOfScopeNamespace)
        );
        assert_eq!(
            check(&resource("prod-a"), &attrs("alice"), &config, &SignerPolicy::default()),
            None
        );
    }

    #[test]
    fn operator_account_is_privileged() {
        let config = EngineConfig {
            operator_service_account: "system:serviceaccount:signet:signet-operator".to_string(),
            ..Default::default()
        };
        let got = check(
            &resource("prod-a"),
            &attrs("system:serviceaccount:signet:signet-operator"),
            &config,
            &SignerPolicy::default(),
        );
        assert_eq!(got, Some(Bypass::PrivilegedRequester));
    }

    #[test]
    fn reserved_prefixes_and_garbage_collector() {
        let config = EngineConfig::default();
        let policy = SignerPolicy::default();
        for user in [
            GARBAGE_COLLECTOR,
            "system:serviceaccount:kube-system:deployment-controller",
            "system:serviceaccount:olm:builder",
        ] {
            assert_eq!(
                check(&resource("prod-a"), &attrs(user), &config, &policy),
                Some(Bypass::PrivilegedRequester),
                "{user}"
            );
        }
    }

    #[test]
    fn admin_group_pattern() {
        let config = EngineConfig {
            admin_group_patterns: vec!["cluster-admins".to_string()],
            ..Default::default()
        };
        let mut a = attrs("alice");
        a.user_groups = vec!["cluster-admins".to_string()];
        assert_eq!(
            check(&resource("prod-a"), &a, &config, &SignerPolicy::default()),
            Some(Bypass::PrivilegedRequester)
        );
    }

    #[test]
    fn dry_run_allows_without_checking() {
        let mut a = attrs("alice");
        a.dry_run = true;
        assert_eq!(
            check(&resource("prod-a"), &a, &EngineConfig::default(), &SignerPolicy::default()),
            Some(Bypass::DryRun)
        );
    }

    #[test]
    fn break_glass_respects_scope() {
        let policy = SignerPolicy {
            break_glass: vec![BreakGlassCondition {
                scope: None,
                namespaces: vec!["prod-a".to_string()],
            }],
            ..Default::default()
        };
        let config = EngineConfig::default();
        assert_eq!(
            check(&resource("prod-a"), &attrs("alice"), &config, &policy),
            Some(Bypass::BreakGlass)
        );
        assert_eq!(check(&resource("prod-b"), &attrs("alice"), &config, &policy), None);
        // Namespaced break-glass never applies to cluster-scoped requests.
        assert_eq!(check(&resource(""), &attrs("alice"), &config, &policy), None);
    }

    #[test]
    fn plain_requests_fall_through() {
        assert_eq!(
            check(
                &resource("prod-a"),
                &attrs("alice"),
                &EngineConfig::default(),
                &SignerPolicy::default()
            ),
            None
        );
    }
}
