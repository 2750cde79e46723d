//! BTreeMap-based index structures
//!
//! Indexes map composite keys (one component per indexed expression) to
//! the sorted set of document IDs holding those values.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::codec::{CodecResult, Value, ValueKind, ValueRef};

/// One component of an index key.
///
/// Ordering is deterministic: Null < Bool < Int < Float < String.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKey {
    Null,
    /// false < true
    Bool(bool),
    Int(i64),
    /// Stored as order-preserving bits
    Float(u64),
    String(String),
}

impl IndexKey {
    /// Key for a float; bits are rearranged so integer order matches
    /// numeric order
    pub fn from_float(v: f64) -> Self {
        let bits = v.to_bits();
        let ordered = if (bits >> 63) == 1 {
            !bits
        } else {
            bits ^ (1 << 63)
        };
        IndexKey::Float(ordered)
    }

    /// Key for a scalar value; arrays, dicts and binary are not indexed
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(IndexKey::Null),
            Value::Bool(b) => Some(IndexKey::Bool(*b)),
            Value::Int(i) => Some(IndexKey::Int(*i)),
            Value::Float(f) => Some(IndexKey::from_float(*f)),
            Value::String(s) => Some(IndexKey::String(s.clone())),
            Value::Binary(_) | Value::Array(_) | Value::Dict(_) => None,
        }
    }

    /// Key read straight from an encoded body
    pub fn from_encoded(value: &ValueRef<'_>) -> CodecResult<Option<Self>> {
        Ok(match value.kind()? {
            ValueKind::Null => Some(IndexKey::Null),
            ValueKind::Bool => Some(IndexKey::Bool(value.as_bool()?)),
            ValueKind::Int => Some(IndexKey::Int(value.as_i64()?)),
            ValueKind::Float => Some(IndexKey::from_float(value.as_f64()?)),
            ValueKind::String => Some(IndexKey::String(value.as_str()?.to_string())),
            ValueKind::Binary | ValueKind::Array | ValueKind::Dict => None,
        })
    }
}

/// Key with one component per index expression
pub type CompositeKey = Vec<IndexKey>;

#[derive(Debug, Clone, Default)]
pub struct IndexTree {
    tree: BTreeMap<CompositeKey, BTreeSet<String>>,
}

impl IndexTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: CompositeKey, doc_id: &str) {
        self.tree.entry(key).or_default().insert(doc_id.to_string());
    }

    /// Removes a document from a key, dropping the key once empty
    pub fn remove(&mut self, key: &CompositeKey, doc_id: &str) {
        if let Some(ids) = self.tree.get_mut(key) {
            ids.remove(doc_id);
            if ids.is_empty() {
                self.tree.remove(key);
            }
        }
    }

    /// Documents with exactly this key, sorted by ID
    pub fn lookup_eq(&self, key: &CompositeKey) -> Vec<String> {
        self.tree
            .get(key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Documents with keys in `[min, max]`, in key order
    ///
    /// Either bound may be open.
    pub fn lookup_range(&self, min: Option<&CompositeKey>, max: Option<&CompositeKey>) -> Vec<String> {
        let min_bound = min.map(Bound::Included).unwrap_or(Bound::Unbounded);
        let max_bound = max.map(Bound::Included).unwrap_or(Bound::Unbounded);
        if let (Some(lo), Some(hi)) = (min, max) {
            if lo > hi {
                return Vec::new();
            }
        }
        self.tree
            .range::<CompositeKey, _>((min_bound, max_bound))
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect()
    }

    /// Number of distinct keys
    pub fn key_count(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
