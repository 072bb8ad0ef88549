//! JSON Value Helpers
//!
//! Dot-path traversal and the coercion rules shared by the filter evaluator,
//! the HTTP `dataPath` extraction and the transform interpreter.

use serde_json::Value;

/// Resolve a dot-separated path against a JSON value.
///
/// Object segments are looked up by key, numeric segments index into arrays.
/// An empty path resolves to the value itself. Any missing intermediate key
/// yields `None`.
pub fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(value);
    }

    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Coerce a value to a string for text comparisons.
///
/// Strings are returned as-is, numbers and booleans use their JSON spelling,
/// objects and arrays are serialized.
pub fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Coerce a value to a number.
///
/// Numbers and numeric strings coerce; everything else returns `None`.
pub fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
        }
        _ => None,
    }
}

/// Short type name used by field introspection.
pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
