use anyhow::{Context, Result};
use bytes::Bytes;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Whether a resource lives in a namespace or at cluster scope.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceScope {
    Namespaced,
    Cluster,
}

impl fmt::Display for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespaced => "Namespaced".fmt(f),
            Self::Cluster => "Cluster".fmt(f),
        }
    }
}

/// Identifies a resource for signature lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

/// A normalized, query-friendly view of the resource under admission.
///
/// Built once per request and immutable afterwards. The scope tag is always
/// derived from namespace presence, so the two can never disagree.
#[derive(Clone, Debug)]
pub struct ResourceContext {
    pub scope: ResourceScope,
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    /// The serialized object as received.
    pub raw: Bytes,
    /// Annotations claimed by the object's metadata.
    pub annotations: BTreeMap<String, String>,
    /// Labels claimed by the object's metadata.
    pub labels: BTreeMap<String, String>,
}

impl ResourceContext {
    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        let obj: Value =
            serde_json::from_slice(raw).context("failed to parse resource document")?;
        Ok(Self::from_value(&obj))
    }

    /// Normalizes an arbitrary structured document.
    ///
    /// Missing optional fields become empty strings or empty maps; this never
    /// fails on absent metadata.
    pub fn from_value(obj: &Value) -> Self {
        let name = string_at(obj, &["name"])
            .or_else(|| string_at(obj, &["metadata", "name"]))
            .unwrap_or_default();
        let namespace = string_at(obj, &["namespace"])
            .or_else(|| string_at(obj, &["metadata", "namespace"]))
            .unwrap_or_default();
        let kind = string_at(obj, &["kind"]).unwrap_or_default();
        let api_version = string_at(obj, &["apiVersion"]).unwrap_or_default();
        let (group, version) = split_group_version(&api_version);

        let scope = if namespace.is_empty() {
            ResourceScope::Cluster
        } else {
            ResourceScope::Namespaced
        };

        let raw = serde_json::to_vec(obj).unwrap_or_default().into();

        Self {
            scope,
            group,
            version,
            kind,
            namespace,
            name,
            raw,
            annotations: string_map_at(obj, &["metadata", "annotations"]),
            labels: string_map_at(obj, &["metadata", "labels"]),
        }
    }

    /// Renders `group/version`, or just the version for the core group.
    pub fn group_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef {
            api_version: self.group_version(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }

    /// Explicit field-name-to-accessor table used by rule matching.
    ///
    /// Field names are fixed; adding a field here makes it matchable by
    /// ignore rules and attribute masks.
    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "scope" => Some(match self.scope {
                ResourceScope::Namespaced => "Namespaced",
                ResourceScope::Cluster => "Cluster",
            }),
            "group" => Some(&self.group),
            "version" => Some(&self.version),
            "kind" => Some(&self.kind),
            "namespace" => Some(&self.namespace),
            "name" => Some(&self.name),
            _ => None,
        }
    }

    pub fn fields(&self) -> BTreeMap<&'static str, &str> {
        const NAMES: &[&str] = &["scope", "group", "version", "kind", "namespace", "name"];
        NAMES
            .iter()
            .filter_map(|n| {
                // The table above covers every name listed here.
                self.field(n).map(|v| (*n, v))
            })
            .collect()
    }
}

/// Request attributes that accompany the resource through admission.
#[derive(Clone, Debug, Default)]
pub struct AdmissionAttributes {
    /// Uppercase operation name: `CREATE`, `UPDATE`, etc.
    pub operation: String,
    pub user_name: String,
    pub user_groups: Vec<String>,
    pub dry_run: bool,
}

/// Merges resource fields and request attributes for rule matching.
pub fn request_fields<'a>(
    resource: &'a ResourceContext,
    attrs: &'a AdmissionAttributes,
) -> BTreeMap<&'static str, &'a str> {
    let mut fields = resource.fields();
    fields.insert("operation", &attrs.operation);
    fields.insert("username", &attrs.user_name);
    fields
}

fn string_at(obj: &Value, path: &[&str]) -> Option<String> {
    let mut cur = obj;
    for p in path {
        cur = cur.get(p)?;
    }
    match cur {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn string_map_at(obj: &Value, path: &[&str]) -> BTreeMap<String, String> {
    let mut cur = obj;
    for p in path {
        match cur.get(p) {
            Some(v) => cur = v,
            None => return BTreeMap::new(),
        }
    }
    match cur.as_object() {
        Some(map) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
        None => BTreeMap::new(),
    }
}

fn split_group_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_namespaced_resource() {
        let obj = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "prod-a",
                "annotations": {"signet.dev/signature": "c2ln"},
                "labels": {"app": "web"},
            },
        });
        let resc = ResourceContext::from_value(&obj);
        assert_eq!(resc.scope, ResourceScope::Namespaced);
        assert_eq!(resc.group, "apps");
        assert_eq!(resc.version, "v1");
        assert_eq!(resc.kind, "Deployment");
        assert_eq!(resc.namespace, "prod-a");
        assert_eq!(resc.name, "web");
        assert_eq!(resc.group_version(), "apps/v1");
        assert_eq!(
            resc.annotations.get("signet.dev/signature").map(String::as_str),
            Some("c2ln")
        );
        assert_eq!(resc.labels.get("app").map(String::as_str), Some("web"));
    }

    #[test]
    fn cluster_scope_follows_namespace_absence() {
        let obj = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "prod-a"},
        });
        let resc = ResourceContext::from_value(&obj);
        assert_eq!(resc.scope, ResourceScope::Cluster);
        assert_eq!(resc.group, "");
        assert_eq!(resc.version, "v1");
        assert_eq!(resc.group_version(), "v1");
    }

    #[test]
    fn missing_fields_normalize_to_empty() {
        let resc = ResourceContext::from_value(&json!({}));
        assert_eq!(resc.name, "");
        assert_eq!(resc.namespace, "");
        assert_eq!(resc.kind, "");
        assert!(resc.annotations.is_empty());
        assert!(resc.labels.is_empty());
        assert_eq!(resc.scope, ResourceScope::Cluster);
    }

    #[test]
    fn top_level_name_takes_precedence() {
        let obj = json!({
            "name": "outer",
            "metadata": {"name": "inner"},
        });
        assert_eq!(ResourceContext::from_value(&obj).name, "outer");
    }

    #[test]
    fn field_table_is_stable() {
        let obj = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "ns1"},
        });
        let resc = ResourceContext::from_value(&obj);
        let fields = resc.fields();
        assert_eq!(fields.get("kind"), Some(&"ConfigMap"));
        assert_eq!(fields.get("namespace"), Some(&"ns1"));
        assert_eq!(fields.get("scope"), Some(&"Namespaced"));
        assert_eq!(resc.field("nonsense"), None);
    }
}
