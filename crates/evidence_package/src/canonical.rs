//! Canonical JSON serialization.
//!
//! Two values with identical fields produce identical bytes no matter how
//! they were constructed: object keys are sorted recursively, array order is
//! kept, and the output is compact (no insignificant whitespace). Absent
//! optional fields must be skipped by the caller's `Serialize` impl so that
//! "absent" and "present but empty" stay distinguishable.

use serde::Serialize;
use serde_json::{Map, Value};

/// Recursively sort object keys.
///
/// Ordering must not depend on whether serde_json's `preserve_order`
/// feature is enabled somewhere in the dependency graph.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut items: Vec<_> = map.iter().collect();
            items.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (k, v) in items {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize).collect()),
        _ => value.clone(),
    }
}

/// Serialize any value to canonical JSON bytes
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_vec(&canonicalize(&value))
}
