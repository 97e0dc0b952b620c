//! Field coercion for source writes.
//!
//! Source records arrive as loosely typed maps (form posts, admin tools).
//! Before they reach the catalog every field is normalised:
//!
//! | field  | accepted input                       | stored as          |
//! |--------|--------------------------------------|--------------------|
//! | `_id`  | number or numeric string             | integer, truncated |
//! | `crbl` | number or numeric string             | integer, truncated |
//! | `g`    | comma-separated text or an array     | array of text      |
//! | other  | anything                             | text               |

use serde_json::{Map, Value};

use crate::error::{Result, StoreError};
use crate::types::SourceId;

/// Integer fields.
const INTEGER_FIELDS: [&str; 2] = ["_id", "crbl"];

/// Group tag field.
const GROUPS_FIELD: &str = "g";

/// Coerce every field of a source write.
pub fn coerce_fields(fields: Map<String, Value>) -> Result<Map<String, Value>> {
    fields
        .into_iter()
        .map(|(key, value)| {
            let coerced = coerce_field(&key, value)?;
            Ok((key, coerced))
        })
        .collect()
}

/// Coerce one field by name.
pub fn coerce_field(key: &str, value: Value) -> Result<Value> {
    if INTEGER_FIELDS.contains(&key) {
        return Ok(Value::from(to_integer(key, &value)?));
    }
    if key == GROUPS_FIELD {
        return Ok(Value::Array(split_groups(value).into_iter().map(Value::String).collect()));
    }
    Ok(to_text(value))
}

/// Source id out of a number or numeric string.
pub fn source_id(value: &Value) -> Result<SourceId> {
    to_integer("_id", value).map(SourceId)
}

/// Parse as float, then truncate toward zero.
fn to_integer(field: &str, value: &Value) -> Result<i64> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().map(|v| v as f64).or_else(|| n.as_f64()),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() && v.abs() < i64::MAX as f64 => Ok(v.trunc() as i64),
        _ => Err(StoreError::InvalidField {
            field: field.to_string(),
            reason: format!("expected a number, got {}", value),
        }),
    }
}

fn split_groups(value: Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match to_text(item) {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        other => vec![other.to_string()],
    }
}

/// Text form of a value. Null stays null.
fn to_text(value: Value) -> Value {
    match value {
        Value::Null | Value::String(_) => value,
        Value::Bool(b) => Value::String(b.to_string()),
        Value::Number(n) => Value::String(n.to_string()),
        other => Value::String(other.to_string()),
    }
}
