//! Field introspection
//!
//! Lists the dot paths available to filter rules from a sample payload, so a
//! filter editor can offer field pickers. Array payloads are sampled from their
//! first record.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::value::kind_of;

/// Nesting depth explored below the record root
const MAX_DEPTH: usize = 8;

/// A field that filter rules can reference
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldInfo {
    /// Dot path, usable as `FilterRule.field`
    pub path: String,
    /// JSON kind of the first value seen
    pub kind: &'static str,
    /// First value seen, for display
    pub sample: Value,
}

/// Collect the field paths of a payload, sorted.
///
/// Nested objects are reported and descended into; arrays inside a record are
/// reported as single `array` fields.
pub fn available_fields(payload: &Value) -> Vec<FieldInfo> {
    let mut fields = BTreeMap::new();

    let record = match payload {
        Value::Array(records) => records.first(),
        other => Some(other),
    };
    if let Some(record) = record {
        collect(record, String::new(), 0, &mut fields);
    }

    fields.into_values().collect()
}

fn collect(value: &Value, prefix: String, depth: usize, out: &mut BTreeMap<String, FieldInfo>) {
    if !prefix.is_empty() {
        let sample = match value {
            Value::Object(_) => Value::Null,
            other => other.clone(),
        };
        out.insert(
            prefix.clone(),
            FieldInfo {
                path: prefix.clone(),
                kind: kind_of(value),
                sample,
            },
        );
    }

    if let Value::Object(map) = value {
        if depth >= MAX_DEPTH {
            return;
        }
        for (key, child) in map {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", prefix, key)
            };
            collect(child, path, depth + 1, out);
        }
    }
}
