//! Owned value tree
//!
//! `Value` is the materialized form of an encoded slice. Documents hold
//! their properties as a `Dict`; keys are unique and kept sorted so that
//! encoding is canonical regardless of insertion order.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use super::errors::{CodecError, CodecResult};

/// Dictionary of values, ordered by key
pub type Dict = BTreeMap<String, Value>;

/// Type of a value, without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    String,
    Binary,
    Array,
    Dict,
}

/// A structured value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Dict(Dict),
}

impl Value {
    /// Returns the kind of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::Binary(_) => ValueKind::Binary,
            Value::Array(_) => ValueKind::Array,
            Value::Dict(_) => ValueKind::Dict,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value as a float (integers are widened)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_dict_mut(&mut self) -> Option<&mut Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key if this is a dict
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

    /// Follows a dotted property path (`"address.city"`) through nested dicts
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(self, |current, segment| current.get(segment))
    }

    /// Converts a JSON value into a value tree
    ///
    /// Integers that fit in i64 stay integers; everything else numeric
    /// becomes a float.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Dict(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts to a plain JSON structure, failing past `max_depth` levels
    ///
    /// Binary renders as base64; non-finite floats render as null.
    pub fn to_plain(&self, max_depth: usize) -> CodecResult<serde_json::Value> {
        self.to_plain_at(0, max_depth)
    }

    fn to_plain_at(&self, depth: usize, max_depth: usize) -> CodecResult<serde_json::Value> {
        if depth > max_depth {
            return Err(CodecError::depth_exceeded(max_depth));
        }
        Ok(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Binary(b) => serde_json::Value::String(STANDARD.encode(b)),
            Value::Array(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|v| v.to_plain_at(depth + 1, max_depth))
                    .collect::<CodecResult<Vec<_>>>()?,
            ),
            Value::Dict(dict) => {
                let mut map = serde_json::Map::new();
                for (k, v) in dict {
                    map.insert(k.clone(), v.to_plain_at(depth + 1, max_depth)?);
                }
                serde_json::Value::Object(map)
            }
        })
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
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

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Dict> for Value {
    fn from(dict: Dict) -> Self {
        Value::Dict(dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_keeps_integers() {
        let v = Value::from_json(&json!({"n": 3, "f": 1.5, "big": 18446744073709551615u64}));
        assert_eq!(v.get("n"), Some(&Value::Int(3)));
        assert_eq!(v.get("f"), Some(&Value::Float(1.5)));
        assert_eq!(v.get("big").and_then(Value::as_f64), Some(18446744073709551615u64 as f64));
    }

    #[test]
    fn test_get_path() {
        let v = Value::from_json(&json!({"address": {"city": "Oslo"}}));
        assert_eq!(v.get_path("address.city").and_then(Value::as_str), Some("Oslo"));
        assert!(v.get_path("address.zip").is_none());
        assert!(v.get_path("address.city.x").is_none());
    }

    #[test]
    fn test_to_plain_binary_is_base64() {
        let v = Value::Binary(vec![1, 2, 3]);
        assert_eq!(v.to_plain(4).unwrap(), json!("AQID"));
    }

    #[test]
    fn test_to_plain_depth_limit() {
        let mut v = Value::Null;
        for _ in 0..10 {
            v = Value::Array(vec![v]);
        }
        assert!(v.to_plain(20).is_ok());
        let err = v.to_plain(5).unwrap_err();
        assert_eq!(err.code().code(), "AERO_CODEC_DEPTH_EXCEEDED");
    }
}
