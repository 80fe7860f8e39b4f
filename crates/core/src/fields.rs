//! Per-kind selectable field extraction over raw JSON values.
//!
//! Keys mirror the Kubernetes field-selector contract for each built-in
//! kind. Absent fields surface the kind's zero value (`""`, `"0"`,
//! `"false"`) so every enumerated key is always present, matching what the
//! typed objects would carry.

use std::collections::BTreeMap;

use inflector::string::pluralize::to_plural;
use serde_json::Value;

use crate::Kind;

type FieldSet = BTreeMap<String, String>;

/// Selectable fields for `kind` extracted from the raw decoded value.
pub fn field_set(kind: Kind, raw: &Value) -> FieldSet {
    match kind {
        Kind::Pod => pod_fields(raw),
        Kind::Event => event_fields(raw),
        Kind::Secret => secret_fields(raw),
        Kind::Namespace => namespace_fields(raw),
        Kind::ReplicaSet | Kind::ReplicationController => replicas_fields(raw),
        Kind::Job => job_fields(raw),
        Kind::Node => node_fields(raw),
        Kind::CertificateSigningRequest => csr_fields(raw),
        Kind::PartialObjectMetadata => partial_fields(raw),
    }
}

fn str_at<'a>(raw: &'a Value, ptr: &str) -> &'a str {
    raw.pointer(ptr).and_then(|v| v.as_str()).unwrap_or("")
}

fn int_at(raw: &Value, ptr: &str) -> String {
    raw.pointer(ptr).and_then(|v| v.as_i64()).unwrap_or(0).to_string()
}

fn bool_at(raw: &Value, ptr: &str) -> String {
    raw.pointer(ptr).and_then(|v| v.as_bool()).unwrap_or(false).to_string()
}

fn base(raw: &Value) -> FieldSet {
    let mut fs = FieldSet::new();
    fs.insert("metadata.name".into(), str_at(raw, "/metadata/name").into());
    fs.insert("metadata.namespace".into(), str_at(raw, "/metadata/namespace").into());
    fs
}

fn pod_fields(raw: &Value) -> FieldSet {
    let mut fs = base(raw);
    fs.insert("spec.nodeName".into(), str_at(raw, "/spec/nodeName").into());
    fs.insert("spec.restartPolicy".into(), str_at(raw, "/spec/restartPolicy").into());
    fs.insert("spec.schedulerName".into(), str_at(raw, "/spec/schedulerName").into());
    fs.insert("spec.serviceAccountName".into(), str_at(raw, "/spec/serviceAccountName").into());
    fs.insert("spec.hostNetwork".into(), bool_at(raw, "/spec/hostNetwork"));
    fs.insert("status.phase".into(), str_at(raw, "/status/phase").into());
    fs.insert("status.podIP".into(), str_at(raw, "/status/podIP").into());
    fs.insert("status.nominatedNodeName".into(), str_at(raw, "/status/nominatedNodeName").into());
    fs
}

fn event_fields(raw: &Value) -> FieldSet {
    let mut fs = base(raw);
    fs.insert("involvedObject.kind".into(), str_at(raw, "/involvedObject/kind").into());
    fs.insert("involvedObject.namespace".into(), str_at(raw, "/involvedObject/namespace").into());
    fs.insert("involvedObject.name".into(), str_at(raw, "/involvedObject/name").into());
    fs.insert("involvedObject.uid".into(), str_at(raw, "/involvedObject/uid").into());
    fs.insert("involvedObject.apiVersion".into(), str_at(raw, "/involvedObject/apiVersion").into());
    fs.insert(
        "involvedObject.resourceVersion".into(),
        str_at(raw, "/involvedObject/resourceVersion").into(),
    );
    fs.insert("involvedObject.fieldPath".into(), str_at(raw, "/involvedObject/fieldPath").into());
    fs.insert("reason".into(), str_at(raw, "/reason").into());
    // Both selector keys expose the reporting controller.
    let reporting = str_at(raw, "/reportingComponent");
    fs.insert("reportingComponent".into(), reporting.into());
    fs.insert("source".into(), reporting.into());
    fs.insert("type".into(), str_at(raw, "/type").into());
    fs
}

fn secret_fields(raw: &Value) -> FieldSet {
    let mut fs = base(raw);
    fs.insert("type".into(), str_at(raw, "/type").into());
    fs
}

fn namespace_fields(raw: &Value) -> FieldSet {
    let mut fs = base(raw);
    fs.insert("status.phase".into(), str_at(raw, "/status/phase").into());
    fs
}

fn replicas_fields(raw: &Value) -> FieldSet {
    let mut fs = base(raw);
    fs.insert("status.replicas".into(), int_at(raw, "/status/replicas"));
    fs
}

fn job_fields(raw: &Value) -> FieldSet {
    let mut fs = base(raw);
    fs.insert("status.successful".into(), int_at(raw, "/status/succeeded"));
    fs
}

fn node_fields(raw: &Value) -> FieldSet {
    let mut fs = base(raw);
    fs.insert("spec.unschedulable".into(), bool_at(raw, "/spec/unschedulable"));
    fs
}

fn csr_fields(raw: &Value) -> FieldSet {
    let mut fs = base(raw);
    fs.insert("spec.signerName".into(), str_at(raw, "/spec/signerName").into());
    fs
}

fn partial_fields(raw: &Value) -> FieldSet {
    let mut fs = base(raw);

    let name = str_at(raw, "/metadata/name");
    let api_version = str_at(raw, "/apiVersion");
    if name.is_empty() || !api_version.contains('/') {
        return fs;
    }
    let Some((group, version)) = api_version.split_once('/') else {
        return fs;
    };
    let plural = to_plural(&str_at(raw, "/kind").to_lowercase());
    let Some(paths) = kinex_schema::selectable_fields(&format!("{version}.{group}/{plural}"))
    else {
        return fs;
    };
    for path in paths {
        // A registered path that resolves to nothing is simply omitted.
        if let Some(v) = kinex_schema::eval_path(raw, &path) {
            fs.insert(path, format_scalar(v));
        }
    }
    fs
}

fn format_scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
