//! Deterministic JSON serialization used to fingerprint audit records.
//!
//! Object keys are sorted recursively before serialization so that two
//! semantically-equal JSON values (keys in different order) hash identically.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Re-serializes `value` with every object's keys sorted, recursively.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Hex-encoded SHA-256 hash of the canonical form of `value`.
///
/// Used for `payloadHash`, `requirementsHash`, and `paymentSignatureHash` on
/// resource call records: two JSON values that differ only in key order
/// produce the same hash.
pub fn hash_canonical_json(value: &Value) -> String {
    let canonical = canonicalize(value);
    let bytes = serde_json::to_vec(&canonical).expect("canonical JSON always serializes");
    let digest = Sha256::digest(&bytes);
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_independent_of_key_order() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(hash_canonical_json(&a), hash_canonical_json(&b));
    }

    #[test]
    fn hash_differs_on_value_change() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_ne!(hash_canonical_json(&a), hash_canonical_json(&b));
    }

    #[test]
    fn nested_objects_are_canonicalized() {
        let a = json!({"outer": {"z": 1, "a": 2}, "list": [{"y": 1, "x": 2}]});
        let b = json!({"list": [{"x": 2, "y": 1}], "outer": {"a": 2, "z": 1}});
        assert_eq!(hash_canonical_json(&a), hash_canonical_json(&b));
    }
}
