use crate::context::{AdmissionAttributes, ResourceScope};
use crate::keyring::CredentialFamily;
use crate::pattern::{match_pattern, match_pattern_array};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Read-only engine configuration.
///
/// Loaded once at startup and shared immutably across request evaluations.
/// Reload is an atomic swap of the whole structure, never in-place mutation.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// The namespace the controller itself runs in.
    pub namespace: String,

    /// Requests matching any of these rules are not processed at all.
    pub ignore: Vec<RequestMatchRule>,

    /// When set, only requests in matching namespaces are verified.
    pub in_scope_namespaces: Option<NamespaceSelector>,

    /// Username of the controller's own server service account.
    pub server_user_name: String,

    /// Username of the controller's operator service account.
    pub operator_service_account: String,

    /// Patterns identifying administrator usernames.
    pub admin_user_patterns: Vec<String>,

    /// Patterns identifying administrator groups.
    pub admin_group_patterns: Vec<String>,

    /// When enabled, denials are reported but the request is admitted.
    pub detect_mode: bool,

    /// Candidate verification key locations, per credential family.
    pub key_configs: Vec<KeyConfig>,

    /// Enables resolution of helm release records as signatures.
    pub helm_plugin_enabled: bool,
}

/// One credential family's configured key locations.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyConfig {
    pub family: CredentialFamily,
    pub locations: Vec<String>,
    /// Optional secret reference used to materialize key bytes when running
    /// outside a cluster.
    #[serde(default)]
    pub secret: Option<String>,
}

/// Pattern rule matched against normalized request fields.
///
/// Every populated field must match for the rule to fire; unset fields are
/// wildcards by omission.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestMatchRule {
    pub namespace: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub operation: Option<String>,
    pub username: Option<String>,
    pub usergroup: Option<String>,
}

impl RequestMatchRule {
    pub fn matches(&self, fields: &BTreeMap<&str, &str>, attrs: &AdmissionAttributes) -> bool {
        let field_ok = |key: &str, pattern: &Option<String>| match pattern {
            Some(p) => match_pattern(p, fields.get(key).copied().unwrap_or("")),
            None => true,
        };
        field_ok("namespace", &self.namespace)
            && field_ok("kind", &self.kind)
            && field_ok("name", &self.name)
            && field_ok("operation", &self.operation)
            && field_ok("username", &self.username)
            && match &self.usergroup {
                Some(p) => match_pattern_array(p, &attrs.user_groups),
                None => true,
            }
    }
}

/// Include/exclude namespace patterns.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NamespaceSelector {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl NamespaceSelector {
    pub fn matches(&self, namespace: &str) -> bool {
        let included = self.include.is_empty()
            || self.include.iter().any(|p| match_pattern(p, namespace));
        let excluded = self.exclude.iter().any(|p| match_pattern(p, namespace));
        included && !excluded
    }
}

/// Per-namespace signer authorization policy plus break-glass windows.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignerPolicy {
    pub name: String,
    pub signers: Vec<SignerRule>,
    pub break_glass: Vec<BreakGlassCondition>,
}

/// Authorizes signers within the rule's namespaces (or globally if unscoped).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignerRule {
    pub name: String,
    /// Namespace patterns this rule applies to; empty means cluster-wide.
    pub namespaces: Vec<String>,
    pub subjects: Vec<SubjectPattern>,
    /// Key-location patterns; the rule is satisfied when the signature was
    /// verified by a matching key.
    pub key_paths: Vec<String>,
}

/// Patterns matched against a recovered signer identity. All populated
/// fields must match.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubjectPattern {
    pub email: Option<String>,
    pub common_name: Option<String>,
    pub fingerprint: Option<String>,
}

/// An emergency bypass window scoped to namespaces or the whole cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakGlassCondition {
    /// `Namespaced`, `Cluster`, or unset (treated as namespaced).
    pub scope: Option<String>,
    pub namespaces: Vec<String>,
}

impl BreakGlassCondition {
    pub fn applies_to(&self, scope: ResourceScope, namespace: &str) -> bool {
        match scope {
            ResourceScope::Cluster => self.scope.as_deref() == Some("Cluster"),
            ResourceScope::Namespaced => {
                matches!(self.scope.as_deref(), None | Some("Namespaced"))
                    && self.namespaces.iter().any(|ns| ns == namespace)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_selector_include_exclude() {
        let sel = NamespaceSelector {
            include: vec!["prod-*".to_string()],
            exclude: vec!["prod-sandbox".to_string()],
        };
        assert!(sel.matches("prod-a"));
        assert!(!sel.matches("prod-sandbox"));
        assert!(!sel.matches("dev"));
    }

    #[test]
    fn empty_include_matches_all() {
        let sel = NamespaceSelector::default();
        assert!(sel.matches("anything"));
    }

    #[test]
    fn break_glass_scoping() {
        let cluster = BreakGlassCondition {
            scope: Some("Cluster".to_string()),
            namespaces: vec![],
        };
        assert!(cluster.applies_to(ResourceScope::Cluster, ""));
        assert!(!cluster.applies_to(ResourceScope::Namespaced, "prod-a"));

        let namespaced = BreakGlassCondition {
            scope: None,
            namespaces: vec!["prod-a".to_string()],
        };
        assert!(namespaced.applies_to(ResourceScope::Namespaced, "prod-a"));
        assert!(!namespaced.applies_to(ResourceScope::Namespaced, "prod-b"));
        assert!(!namespaced.applies_to(ResourceScope::Cluster, ""));
    }

    #[test]
    fn request_rule_requires_all_populated_fields() {
        let rule = RequestMatchRule {
            namespace: Some("kube-*".to_string()),
            kind: Some("ConfigMap".to_string()),
            ..Default::default()
        };
        let attrs = AdmissionAttributes::default();
        let mut fields = BTreeMap::new();
        fields.insert("namespace", "kube-system");
        fields.insert("kind", "ConfigMap");
        assert!(rule.matches(&fields, &attrs));

        fields.insert("kind", "Secret");
        assert!(!rule.matches(&fields, &attrs));
    }
}
