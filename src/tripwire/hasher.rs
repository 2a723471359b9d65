//! TL-014: BLAKE3 hashing for resolved inputs and file content.

use serde_json::Value;
use std::collections::BTreeMap;

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Hash a resource's kind and resolved inputs.
///
/// Inputs are serialized as canonical JSON (keys sorted at every level), so
/// declaration order never changes the hash.
pub fn hash_inputs(kind: &str, inputs: &BTreeMap<String, Value>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(kind.as_bytes());
    hasher.update(b"\0");
    for (field, value) in inputs {
        hasher.update(field.as_bytes());
        hasher.update(b"=");
        hasher.update(canonical_json(value).as_bytes());
        hasher.update(b"\n");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, canonical_json(v))).collect();
            let body = sorted
                .iter()
                .map(|(k, v)| format!("{}:{}", Value::String((*k).clone()), v))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", body)
        }
        Value::Array(items) => {
            let body = items
                .iter()
                .map(canonical_json)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{}]", body)
        }
        scalar => scalar.to_string(),
    }
}
