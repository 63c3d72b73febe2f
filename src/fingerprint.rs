//! Component-wise content digests for method and metric definitions, and a
//! whole-object digest for datasets.
//!
//! Every digest is SHA-1 over a canonical JSON rendering: object keys are
//! sorted recursively, so two values hash the same iff they serialize the
//! same. A component whose content cannot be serialized (an anonymous
//! callable without source text) gets an opaque digest.

use crate::{
    dataset::Dataset,
    definition::{CallableRecord, MethodRecord, MetricRecord, ParamEntry, PostEntry},
};
use benchkeeper_protocol::{Component, ComponentDigest, Fingerprint};
use serde::Serialize;
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

pub fn digest_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha1::digest(bytes))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = Map::new();
            for (k, v) in entries {
                out.insert(k, canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Option<String> {
    let value = serde_json::to_value(value).ok()?;
    serde_json::to_string(&canonicalize(value)).ok()
}

pub fn digest_value<T: Serialize + ?Sized>(value: &T) -> ComponentDigest {
    canonical_json(value).map(|text| digest_bytes(text.as_bytes()))
}

fn callable_digest(callable: &CallableRecord) -> ComponentDigest {
    // Without source text the only identity left is the closure object.
    let source = callable.source.as_ref()?;
    digest_value(&(callable.name.as_str(), source.as_str()))
}

fn params_digest(params: &[ParamEntry]) -> ComponentDigest {
    let mut sorted: Vec<&ParamEntry> = params.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    digest_value(&sorted)
}

fn post_digest(post: &[PostEntry]) -> ComponentDigest {
    let mut parts = Vec::with_capacity(post.len());
    for entry in post {
        parts.push((entry.key.as_str(), callable_digest(&entry.function)?));
    }
    parts.sort();
    digest_value(&parts)
}

pub fn fingerprint_method(record: &MethodRecord) -> Fingerprint {
    let mut ret = Fingerprint::default();
    ret.insert(Component::Function, callable_digest(&record.function));
    ret.insert(Component::Params, params_digest(&record.params));
    ret.insert(Component::Meta, digest_value(&record.meta));
    ret.insert(Component::Post, post_digest(&record.post));
    ret.insert(Component::Version, digest_value(&record.version));
    ret
}

pub fn fingerprint_metric(record: &MetricRecord) -> Fingerprint {
    let mut ret = Fingerprint::default();
    ret.insert(Component::Function, callable_digest(&record.function));
    ret.insert(Component::Params, params_digest(&record.params));
    ret
}

/// Whole-object digest, used only for the informational dataset check.
pub fn fingerprint_dataset(dataset: &Dataset) -> String {
    let text = canonical_json(dataset).unwrap_or_default();
    digest_bytes(text.as_bytes())
}
