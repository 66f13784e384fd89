//! Signature discovery across the heterogeneous signature sources.

use crate::context::{ResourceContext, ResourceRef};
use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Value;
use std::io::Read;
use tracing::debug;

pub const SIGNATURE_ANNOTATION: &str = "signet.dev/signature";
pub const MESSAGE_ANNOTATION: &str = "signet.dev/message";
pub const CERTIFICATE_ANNOTATION: &str = "signet.dev/certificate";
pub const BUNDLE_ANNOTATION: &str = "signet.dev/tlogBundle";
pub const MESSAGE_SCOPE_ANNOTATION: &str = "signet.dev/messageScope";
pub const MUTABLE_ATTRS_ANNOTATION: &str = "signet.dev/mutableAttrs";
pub const SIGN_TYPE_ANNOTATION: &str = "signet.dev/signatureType";

/// The kind of object a signature claims to cover.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SignType {
    Resource,
    ApplyingResource,
    Patch,
    Helm,
    Unknown,
}

impl SignType {
    fn parse(s: &str) -> Self {
        match s {
            "" | "Resource" => Self::Resource,
            "ApplyingResource" => Self::ApplyingResource,
            "Patch" => Self::Patch,
            "Helm" => Self::Helm,
            _ => Self::Unknown,
        }
    }
}

/// Payload of a resource-shaped signature (inline or stored record).
#[derive(Clone, Debug, Default)]
pub struct ResourcePayload {
    /// The decoded signed message. May be synthesized from the request when
    /// a message scope was declared without an explicit message.
    pub message: Vec<u8>,
    pub signature: Vec<u8>,
    pub certificate: Option<Vec<u8>>,
    pub tlog_bundle: Option<Vec<u8>>,
    pub message_scope: Option<String>,
    pub mutable_attrs: Option<String>,
}

/// Payload of a package-manager release record.
#[derive(Clone, Debug, Default)]
pub struct HelmPayload {
    /// The release record the provenance signature covers.
    pub release: Vec<u8>,
    /// Release/chart metadata, including the provenance block.
    pub metadata: Vec<u8>,
}

#[derive(Clone, Debug)]
pub enum SignaturePayload {
    Resource(ResourcePayload),
    Helm(HelmPayload),
}

/// The normalized result of signature resolution.
#[derive(Clone, Debug)]
pub struct GeneralSignature {
    pub sign_type: SignType,
    pub payload: SignaturePayload,
    /// Whether the message must be matched against the live object.
    pub match_required: bool,
    /// True when the message was synthesized from the request itself.
    pub scoped_signature: bool,
    /// Source record identifier, for audit correlation.
    pub provenance: Option<String>,
}

/// A stored signature record, as returned by the signature-list collaborator.
#[derive(Clone, Debug, Default)]
pub struct SignatureRecord {
    pub signature: String,
    pub message: String,
    pub certificate: String,
    pub tlog_bundle: String,
    pub message_scope: String,
    pub mutable_attrs: String,
    pub sign_type: String,
    pub uid: String,
}

/// Looks up stored signature records by resource reference.
#[async_trait::async_trait]
pub trait SignatureStore: Send + Sync {
    async fn find(&self, reference: &ResourceRef) -> Result<Option<SignatureRecord>>;
}

/// Reads package-manager release metadata for a resource, when applicable.
#[async_trait::async_trait]
pub trait ReleaseReader: Send + Sync {
    /// Returns `(release record, release metadata)` bytes, or `None` when
    /// the resource is not a release storage object.
    async fn release_metadata(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
        raw: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
}

/// Locates a candidate signature for the resource, first match wins.
///
/// Resolution order: inline annotation signature, stored signature record,
/// (reserved external store), package-manager release record. Failing to
/// resolve anything is not an error and yields `None`.
pub async fn resolve(
    reference: &ResourceRef,
    resource: &ResourceContext,
    store: Option<&dyn SignatureStore>,
    releases: Option<&dyn ReleaseReader>,
) -> Result<Option<GeneralSignature>> {
    // 1. Inline annotation signature.
    if let Some(sig) = resource.annotations.get(SIGNATURE_ANNOTATION) {
        if !sig.is_empty() {
            let annotation = |key: &str| resource.annotations.get(key).map(String::as_str).unwrap_or("");
            debug!(name = %reference.name, "Resolved inline annotation signature");
            return Ok(Some(resource_signature(
                &resource.raw,
                sig,
                annotation(MESSAGE_ANNOTATION),
                annotation(CERTIFICATE_ANNOTATION),
                annotation(BUNDLE_ANNOTATION),
                annotation(MESSAGE_SCOPE_ANNOTATION),
                annotation(MUTABLE_ATTRS_ANNOTATION),
                annotation(SIGN_TYPE_ANNOTATION),
                None,
            )));
        }
    }

    // 2. Stored signature record.
    if let Some(store) = store {
        if let Some(record) = store.find(reference).await? {
            debug!(name = %reference.name, uid = %record.uid, "Resolved stored signature record");
            return Ok(Some(resource_signature(
                &resource.raw,
                &record.signature,
                &record.message,
                &record.certificate,
                &record.tlog_bundle,
                &record.message_scope,
                &record.mutable_attrs,
                &record.sign_type,
                Some(record.uid),
            )));
        }
    }

    // 3. Reserved for an external signature store.

    // 4. Package-manager release record.
    if let Some(releases) = releases {
        if let Some((release, metadata)) = releases
            .release_metadata(
                &resource.namespace,
                &resource.kind,
                &resource.name,
                &resource.raw,
            )
            .await?
        {
            debug!(name = %reference.name, "Resolved release record signature");
            // The release record is looked up by the object's own identity,
            // so there is no separate signed message to match against it.
            return Ok(Some(GeneralSignature {
                sign_type: SignType::Helm,
                payload: SignaturePayload::Helm(HelmPayload { release, metadata }),
                match_required: false,
                scoped_signature: false,
                provenance: None,
            }));
        }
    }

    Ok(None)
}

#[allow(clippy::too_many_arguments)]
fn resource_signature(
    raw: &[u8],
    signature_b64: &str,
    message_b64: &str,
    certificate_b64: &str,
    bundle_b64: &str,
    message_scope: &str,
    mutable_attrs: &str,
    sign_type: &str,
    provenance: Option<String>,
) -> GeneralSignature {
    let mut message = decompress(decode(message_b64));
    let mut match_required = true;
    let mut scoped_signature = false;
    if message.is_empty() && !message_scope.is_empty() {
        // The signer declared which attributes are covered instead of
        // carrying the message verbatim: rebuild it from the request.
        message = synthesize_scoped_message(raw, message_scope, mutable_attrs);
        match_required = false;
        scoped_signature = true;
    }

    let certificate = decompress(decode(certificate_b64));
    let tlog_bundle = decompress(decode(bundle_b64));

    GeneralSignature {
        sign_type: SignType::parse(sign_type),
        payload: SignaturePayload::Resource(ResourcePayload {
            message,
            signature: decode(signature_b64),
            certificate: (!certificate.is_empty()).then_some(certificate),
            tlog_bundle: (!tlog_bundle.is_empty()).then_some(tlog_bundle),
            message_scope: (!message_scope.is_empty()).then(|| message_scope.to_string()),
            mutable_attrs: (!mutable_attrs.is_empty()).then(|| mutable_attrs.to_string()),
        }),
        match_required,
        scoped_signature,
        provenance,
    }
}

/// Base64-decodes leniently; undecodable input becomes empty bytes, which
/// downstream verification rejects.
fn decode(s: &str) -> Vec<u8> {
    if s.is_empty() {
        return Vec::new();
    }
    BASE64.decode(s.trim()).unwrap_or_default()
}

/// Gunzips the bytes when they carry the gzip magic, otherwise passes them
/// through unchanged.
fn decompress(bytes: Vec<u8>) -> Vec<u8> {
    if bytes.len() < 2 || bytes[0] != 0x1f || bytes[1] != 0x8b {
        return bytes;
    }
    let mut out = Vec::new();
    match flate2::read::GzDecoder::new(bytes.as_slice()).read_to_end(&mut out) {
        Ok(_) => out,
        Err(_) => bytes,
    }
}

/// Deterministically rebuilds the signed message from the raw object,
/// restricted to the declared scope paths with mutable attributes removed.
pub fn synthesize_scoped_message(raw: &[u8], scope: &str, mutable_attrs: &str) -> Vec<u8> {
    let mut obj: Value = serde_json::from_slice(raw).unwrap_or(Value::Null);
    for attr in split_paths(mutable_attrs) {
        remove_path(&mut obj, &attr);
    }

    let mut doc = serde_yaml::Mapping::new();
    for path in split_paths(scope) {
        let value = lookup_path(&obj, &path).cloned().unwrap_or(Value::Null);
        let yaml = serde_yaml::to_value(&value).unwrap_or(serde_yaml::Value::Null);
        doc.insert(serde_yaml::Value::String(path), yaml);
    }
    serde_yaml::to_vec(&serde_yaml::Value::Mapping(doc)).unwrap_or_default()
}

fn split_paths(spec: &str) -> Vec<String> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn lookup_path<'v>(obj: &'v Value, path: &str) -> Option<&'v Value> {
    let mut cur = obj;
    for part in path.split('.') {
        cur = cur.get(part)?;
    }
    Some(cur)
}

fn remove_path(obj: &mut Value, path: &str) {
    let Some((parent_path, leaf)) = path.rsplit_once('.') else {
        if let Some(map) = obj.as_object_mut() {
            map.remove(path);
        }
        return;
    };
    let mut cur = obj;
    for part in parent_path.split('.') {
        match cur.get_mut(part) {
            Some(v) => cur = v,
            None => return,
        }
    }
    if let Some(map) = cur.as_object_mut() {
        map.remove(leaf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StaticStore(Option<SignatureRecord>);

    #[async_trait::async_trait]
    impl SignatureStore for StaticStore {
        async fn find(&self, _reference: &ResourceRef) -> Result<Option<SignatureRecord>> {
            Ok(self.0.clone())
        }
    }

    fn resource_with_annotations(annotations: serde_json::Value) -> ResourceContext {
        ResourceContext::from_value(&json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "app-config",
                "namespace": "prod-a",
                "annotations": annotations,
            },
            "data": {"k": "v"},
        }))
    }

    #[tokio::test]
    async fn no_sources_resolves_to_none() {
        let resc = resource_with_annotations(json!({}));
        let resolved = resolve(&resc.resource_ref(), &resc, None, None).await.unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn annotation_signature_wins_over_store() {
        let resc = resource_with_annotations(json!({
            SIGNATURE_ANNOTATION: BASE64.encode(b"sigbytes"),
            MESSAGE_ANNOTATION: BASE64.encode(b"kind: ConfigMap"),
        }));
        let store = StaticStore(Some(SignatureRecord {
            signature: BASE64.encode(b"other"),
            uid: "record-1".to_string(),
            ..Default::default()
        }));
        let resolved = resolve(&resc.resource_ref(), &resc, Some(&store), None)
            .await
            .unwrap()
            .unwrap();
        assert!(resolved.provenance.is_none());
        let SignaturePayload::Resource(payload) = &resolved.payload else {
            panic!("expected resource payload");
        };
        assert_eq!(payload.signature, b"sigbytes");
        assert_eq!(payload.message, b"kind: ConfigMap");
        assert!(resolved.match_required);
        assert!(!resolved.scoped_signature);
    }

    #[tokio::test]
    async fn stored_record_carries_provenance() {
        let resc = resource_with_annotations(json!({}));
        let store = StaticStore(Some(SignatureRecord {
            signature: BASE64.encode(b"sigbytes"),
            message: BASE64.encode(b"kind: ConfigMap"),
            sign_type: "ApplyingResource".to_string(),
            uid: "record-1".to_string(),
            ..Default::default()
        }));
        let resolved = resolve(&resc.resource_ref(), &resc, Some(&store), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.provenance.as_deref(), Some("record-1"));
        assert_eq!(resolved.sign_type, SignType::ApplyingResource);
    }

    struct StaticReleases;

    #[async_trait::async_trait]
    impl ReleaseReader for StaticReleases {
        async fn release_metadata(
            &self,
            _namespace: &str,
            _kind: &str,
            _name: &str,
            _raw: &[u8],
        ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
            Ok(Some((b"release-record".to_vec(), b"release-meta".to_vec())))
        }
    }

    #[tokio::test]
    async fn release_record_resolves_as_helm_signature() {
        let resc = resource_with_annotations(json!({}));
        let resolved = resolve(&resc.resource_ref(), &resc, None, Some(&StaticReleases))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.sign_type, SignType::Helm);
        // Release lookup is keyed by object identity; no message match applies.
        assert!(!resolved.match_required);
        let SignaturePayload::Helm(payload) = &resolved.payload else {
            panic!("expected helm payload");
        };
        assert_eq!(payload.release, b"release-record");
    }

    #[tokio::test]
    async fn scoped_signature_synthesizes_message() {
        let resc = resource_with_annotations(json!({
            SIGNATURE_ANNOTATION: BASE64.encode(b"sigbytes"),
            MESSAGE_SCOPE_ANNOTATION: "data",
            MUTABLE_ATTRS_ANNOTATION: "metadata.annotations",
        }));
        let resolved = resolve(&resc.resource_ref(), &resc, None, None)
            .await
            .unwrap()
            .unwrap();
        assert!(resolved.scoped_signature);
        assert!(!resolved.match_required);
        let SignaturePayload::Resource(payload) = &resolved.payload else {
            panic!("expected resource payload");
        };
        let expected = synthesize_scoped_message(&resc.raw, "data", "metadata.annotations");
        assert_eq!(payload.message, expected);
        assert!(!payload.message.is_empty());
    }

    #[test]
    fn synthesis_is_deterministic_and_masks_mutable_attrs() {
        let raw = serde_json::to_vec(&json!({
            "kind": "ConfigMap",
            "metadata": {"name": "x", "resourceVersion": "42"},
            "data": {"a": "1", "b": "2"},
        }))
        .unwrap();
        let one = synthesize_scoped_message(&raw, "data,metadata", "metadata.resourceVersion");
        let two = synthesize_scoped_message(&raw, "data,metadata", "metadata.resourceVersion");
        assert_eq!(one, two);
        let text = String::from_utf8(one).unwrap();
        assert!(text.contains("data"));
        assert!(!text.contains("resourceVersion"));
    }

    #[test]
    fn decode_tolerates_garbage() {
        assert!(decode("!!!not-base64!!!").is_empty());
        assert_eq!(decode(""), Vec::<u8>::new());
    }

    #[test]
    fn decompress_passes_plain_bytes_through() {
        assert_eq!(decompress(b"plain".to_vec()), b"plain".to_vec());
    }

    #[test]
    fn decompress_gunzips() {
        use flate2::write::GzEncoder;
        use std::io::Write;
        let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"payload").unwrap();
        let gz = enc.finish().unwrap();
        assert_eq!(decompress(gz), b"payload".to_vec());
    }
}
