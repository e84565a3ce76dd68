use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Input column values for one row, keyed by column name.
///
/// A `BTreeMap` keeps iteration order deterministic, which matters for
/// rendering outputs and for stable test assertions.
pub type InputMap = BTreeMap<String, Value>;

/// Output values returned by a workflow invocation.
pub type OutputMap = BTreeMap<String, Value>;

/// A scalar cell value.
///
/// Rows come from tabular sources, so cells are scalars. Structured values
/// returned by a workflow are collapsed to their JSON text on conversion,
/// which keeps stored records encodable with a non-self-describing codec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Parse a raw cell into the narrowest matching variant.
    pub fn parse_cell(cell: &str) -> Value {
        let trimmed = cell.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return Value::Float(f);
        }
        match trimmed {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(cell.to_string()),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            // Arrays and objects are carried as their JSON text.
            other => Value::String(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Null => serde_json::Value::Null,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Null => Ok(()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Convert a map of scalar values to a JSON object.
pub fn map_to_json(map: &BTreeMap<String, Value>) -> serde_json::Value {
    serde_json::Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

/// Convert a JSON object into a scalar value map. Non-object values yield
/// a single-entry map under the given fallback key.
pub fn map_from_json(value: &serde_json::Value, fallback_key: &str) -> BTreeMap<String, Value> {
    match value {
        serde_json::Value::Object(fields) => fields
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect(),
        other => {
            let mut map = BTreeMap::new();
            map.insert(fallback_key.to_string(), Value::from_json(other));
            map
        }
    }
}
