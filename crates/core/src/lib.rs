//! Object typing for the kinex backend: map storage keys to Kubernetes
//! kinds and extract the labels, selectable fields, owner references, and
//! finalizers that feed the metadata index tables.

#![forbid(unsafe_code)]

mod fields;

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

pub use fields::field_set;

/// Finalizer requesting foreground cascading deletion.
pub const FINALIZER_DELETE_DEPENDENTS: &str = "foregroundDeletion";
/// Finalizer requesting dependents be orphaned on deletion.
pub const FINALIZER_ORPHAN_DEPENDENTS: &str = "orphan";
/// Label opting an object into storage-side cascade handling.
pub const CACHE_SKIP_LABEL: &str = "skip-controller-manager-metadata-caching";

/// Errors from [`decode_object`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("object parse failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("value is not a JSON object")]
    NotAnObject,
}

/// Concrete kind selected by storage key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Pod,
    Event,
    Secret,
    Namespace,
    ReplicaSet,
    ReplicationController,
    Job,
    Node,
    CertificateSigningRequest,
    PartialObjectMetadata,
}

impl Kind {
    /// Exact-prefix dispatch from a storage key. Unknown prefixes fall back
    /// to [`Kind::PartialObjectMetadata`].
    pub fn for_key(key: &str) -> Kind {
        if key.starts_with("/registry/pods/") {
            Kind::Pod
        } else if key.starts_with("/registry/events/") {
            Kind::Event
        } else if key.starts_with("/registry/secrets/") {
            Kind::Secret
        } else if key.starts_with("/registry/namespaces/") {
            Kind::Namespace
        } else if key.starts_with("/registry/replicasets/") {
            Kind::ReplicaSet
        } else if key.starts_with("/registry/replicationcontrollers/") {
            Kind::ReplicationController
        } else if key.starts_with("/registry/jobs/") {
            Kind::Job
        } else if key.starts_with("/registry/minions/") {
            Kind::Node
        } else if key.starts_with("/registry/certificatesigningrequests/") {
            Kind::CertificateSigningRequest
        } else {
            Kind::PartialObjectMetadata
        }
    }
}

/// Owner reference carried on an object's metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub controller: Option<bool>,
    pub block_owner_deletion: Option<bool>,
}

impl OwnerRef {
    pub fn blocks_owner_deletion(&self) -> bool {
        self.block_owner_deletion.unwrap_or(false)
    }
}

/// A decoded revision value plus everything the index writer needs from it.
#[derive(Debug, Clone)]
pub struct DecodedObject {
    pub kind: Kind,
    pub raw: Value,
    pub labels: BTreeMap<String, String>,
    pub fields: BTreeMap<String, String>,
    pub owners: Vec<OwnerRef>,
}

impl DecodedObject {
    pub fn uid(&self) -> &str {
        uid_of(&self.raw)
    }

    pub fn finalizers(&self) -> Vec<String> {
        finalizers_of(&self.raw)
    }
}

/// Decode a stored value for `key` into its kind-specific metadata sets.
pub fn decode_object(key: &str, value: &[u8]) -> Result<DecodedObject, DecodeError> {
    let raw: Value = serde_json::from_slice(value)?;
    if !raw.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    let kind = Kind::for_key(key);
    let labels = labels_of(&raw);
    let fields = fields::field_set(kind, &raw);
    let owners = owners_of(&raw);
    Ok(DecodedObject { kind, raw, labels, fields, owners })
}

/// Labels from `metadata.labels`; an absent map yields the empty set.
pub fn labels_of(raw: &Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(map) = raw.pointer("/metadata/labels").and_then(|v| v.as_object()) {
        for (k, v) in map {
            if let Some(s) = v.as_str() {
                out.insert(k.clone(), s.to_string());
            }
        }
    }
    out
}

/// Owner references from `metadata.ownerReferences`.
pub fn owners_of(raw: &Value) -> Vec<OwnerRef> {
    raw.pointer("/metadata/ownerReferences")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

pub fn uid_of(raw: &Value) -> &str {
    raw.pointer("/metadata/uid").and_then(|v| v.as_str()).unwrap_or("")
}

pub fn finalizers_of(raw: &Value) -> Vec<String> {
    raw.pointer("/metadata/finalizers")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|f| f.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

pub fn deletion_timestamp(raw: &Value) -> Option<&str> {
    raw.pointer("/metadata/deletionTimestamp").and_then(|v| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_dispatch_is_prefix_exact() {
        assert_eq!(Kind::for_key("/registry/pods/default/web"), Kind::Pod);
        assert_eq!(Kind::for_key("/registry/minions/node1"), Kind::Node);
        assert_eq!(
            Kind::for_key("/registry/certificatesigningrequests/csr-1"),
            Kind::CertificateSigningRequest
        );
        // No substring matching: the prefix must anchor at the start.
        assert_eq!(Kind::for_key("/prefix/registry/pods/x"), Kind::PartialObjectMetadata);
        assert_eq!(Kind::for_key("/registry/podsecurity/x"), Kind::PartialObjectMetadata);
        assert_eq!(Kind::for_key("/registry/example.com/widgets/blue"), Kind::PartialObjectMetadata);
    }

    #[test]
    fn decode_extracts_labels_owners_finalizers() {
        let value = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "web",
                "namespace": "default",
                "uid": "u-1",
                "labels": {"app": "web", "tier": "frontend"},
                "finalizers": ["foregroundDeletion"],
                "ownerReferences": [
                    {"apiVersion": "apps/v1", "kind": "ReplicaSet", "name": "web-rs",
                     "uid": "u-rs", "controller": true, "blockOwnerDeletion": true}
                ]
            }
        });
        let obj = decode_object("/registry/pods/default/web", value.to_string().as_bytes()).unwrap();
        assert_eq!(obj.kind, Kind::Pod);
        assert_eq!(obj.uid(), "u-1");
        assert_eq!(obj.finalizers(), vec!["foregroundDeletion"]);
        assert_eq!(obj.labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(obj.labels.len(), 2);
        assert_eq!(obj.owners.len(), 1);
        assert_eq!(obj.owners[0].uid, "u-rs");
        assert!(obj.owners[0].blocks_owner_deletion());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_object("/registry/pods/default/web", b"not json").is_err());
        assert!(decode_object("/registry/pods/default/web", b"42").is_err());
        assert!(decode_object("/registry/pods/default/web", b"").is_err());
    }

    #[test]
    fn owner_ref_defaults_are_permissive() {
        let obj = decode_object(
            "/registry/pods/default/web",
            json!({"metadata": {"name": "web", "ownerReferences": [{"uid": "u-2"}]}})
                .to_string()
                .as_bytes(),
        )
        .unwrap();
        assert_eq!(obj.owners[0].uid, "u-2");
        assert!(!obj.owners[0].blocks_owner_deletion());
        assert_eq!(obj.owners[0].controller, None);
    }
}
