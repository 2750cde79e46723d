//! Index Manager for aerolite
//!
//! Holds every value index of a database. Definitions are persisted in the
//! journal; contents are derived from document bodies, rebuilt on open and
//! updated for each document touched by a commit.
//!
//! # API
//!
//! - `create(name, definition)` - Add or replace an index
//! - `delete(name)` - Drop an index
//! - `index_document(doc_id, body)` - Re-index one document (`None` removes it)
//! - `lookup_eq(name, values)` - Exact match lookup
//! - `lookup_range(name, min, max)` - Range lookup

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::codec::{Slice, Value};

use super::btree::{CompositeKey, IndexKey, IndexTree};
use super::errors::{IndexError, IndexResult};

/// A value index over one or more property paths
///
/// Paths use dots to reach nested properties (`"address.city"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub expressions: Vec<String>,
}

impl IndexDefinition {
    pub fn value<S: Into<String>>(expressions: impl IntoIterator<Item = S>) -> Self {
        Self {
            expressions: expressions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn validate(&self) -> IndexResult<()> {
        if self.expressions.is_empty() {
            return Err(IndexError::invalid_definition("index needs at least one expression"));
        }
        for expr in &self.expressions {
            if expr.is_empty() || expr.split('.').any(str::is_empty) {
                return Err(IndexError::invalid_definition(format!(
                    "invalid property path {:?}",
                    expr
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> IndexResult<Self> {
        serde_json::from_str(json).map_err(|e| IndexError::invalid_definition(e.to_string()))
    }
}

/// What `create` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Same name and definition already existed
    Unchanged,
    /// Same name, different definition
    Replaced,
}

#[derive(Debug, Clone)]
struct ValueIndex {
    definition: IndexDefinition,
    tree: IndexTree,
    /// Key each document is currently filed under
    doc_keys: HashMap<String, CompositeKey>,
}

impl ValueIndex {
    fn new(definition: IndexDefinition) -> Self {
        Self {
            definition,
            tree: IndexTree::new(),
            doc_keys: HashMap::new(),
        }
    }

    fn unindex(&mut self, doc_id: &str) {
        if let Some(old) = self.doc_keys.remove(doc_id) {
            self.tree.remove(&old, doc_id);
        }
    }

    fn index(&mut self, doc_id: &str, body: Option<&[u8]>) -> IndexResult<()> {
        self.unindex(doc_id);
        let Some(body) = body else {
            return Ok(());
        };
        let slice = Slice::new(body).map_err(|e| IndexError::corrupted(doc_id, e))?;
        let root = slice.root();

        let mut key = Vec::with_capacity(self.definition.expressions.len());
        for expr in &self.definition.expressions {
            let value = root.get_path(expr).map_err(|e| IndexError::corrupted(doc_id, e))?;
            let component = match value {
                Some(v) => IndexKey::from_encoded(&v).map_err(|e| IndexError::corrupted(doc_id, e))?,
                None => None,
            };
            match component {
                Some(c) => key.push(c),
                // documents missing an indexed property are not indexed
                None => return Ok(()),
            }
        }
        self.tree.insert(key.clone(), doc_id);
        self.doc_keys.insert(doc_id.to_string(), key);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndexManager {
    indexes: BTreeMap<String, ValueIndex>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an index, or replaces one with a different definition
    ///
    /// A new or replaced index starts empty; the caller fills it with
    /// `rebuild`.
    pub fn create(&mut self, name: &str, definition: IndexDefinition) -> IndexResult<CreateOutcome> {
        definition.validate()?;
        let outcome = match self.indexes.get(name) {
            Some(existing) if existing.definition == definition => return Ok(CreateOutcome::Unchanged),
            Some(_) => CreateOutcome::Replaced,
            None => CreateOutcome::Created,
        };
        self.indexes.insert(name.to_string(), ValueIndex::new(definition));
        Ok(outcome)
    }

    /// Drops an index; returns whether it existed
    pub fn delete(&mut self, name: &str) -> bool {
        self.indexes.remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }

    pub fn definition(&self, name: &str) -> Option<&IndexDefinition> {
        self.indexes.get(name).map(|i| &i.definition)
    }

    /// Re-files a document in every index; `None` removes it
    pub fn index_document(&mut self, doc_id: &str, body: Option<&[u8]>) -> IndexResult<()> {
        for index in self.indexes.values_mut() {
            index.index(doc_id, body)?;
        }
        Ok(())
    }

    /// Fills one index from scratch
    pub fn rebuild<'a>(
        &mut self,
        name: &str,
        documents: impl IntoIterator<Item = (&'a str, Option<&'a [u8]>)>,
    ) -> IndexResult<()> {
        let index = self
            .indexes
            .get_mut(name)
            .ok_or_else(|| IndexError::not_found(name))?;
        index.tree = IndexTree::new();
        index.doc_keys.clear();
        for (doc_id, body) in documents {
            index.index(doc_id, body)?;
        }
        Ok(())
    }

    /// Documents whose indexed values equal `values`
    pub fn lookup_eq(&self, name: &str, values: &[Value]) -> IndexResult<Vec<String>> {
        let index = self.indexes.get(name).ok_or_else(|| IndexError::not_found(name))?;
        let Some(key) = composite(values) else {
            return Ok(Vec::new());
        };
        Ok(index.tree.lookup_eq(&key))
    }

    /// Documents whose indexed values fall in `[min, max]`
    pub fn lookup_range(
        &self,
        name: &str,
        min: Option<&[Value]>,
        max: Option<&[Value]>,
    ) -> IndexResult<Vec<String>> {
        let index = self.indexes.get(name).ok_or_else(|| IndexError::not_found(name))?;
        let min = min.map(composite);
        let max = max.map(composite);
        if matches!(min, Some(None)) || matches!(max, Some(None)) {
            return Ok(Vec::new());
        }
        Ok(index.tree.lookup_range(min.flatten().as_ref(), max.flatten().as_ref()))
    }
}

fn composite(values: &[Value]) -> Option<CompositeKey> {
    values.iter().map(IndexKey::from_value).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use serde_json::json;

    fn body(json: serde_json::Value) -> Vec<u8> {
        encode(&Value::from_json(&json)).unwrap()
    }

    #[test]
    fn test_create_is_idempotent_by_definition() {
        let mut manager = IndexManager::new();
        let def = IndexDefinition::value(["name"]);
        assert_eq!(manager.create("by_name", def.clone()).unwrap(), CreateOutcome::Created);
        assert_eq!(manager.create("by_name", def).unwrap(), CreateOutcome::Unchanged);
        assert_eq!(
            manager.create("by_name", IndexDefinition::value(["age"])).unwrap(),
            CreateOutcome::Replaced
        );
        assert_eq!(manager.names(), vec!["by_name"]);
    }

    #[test]
    fn test_invalid_definition() {
        let mut manager = IndexManager::new();
        assert!(manager.create("x", IndexDefinition::value(Vec::<String>::new())).is_err());
        assert!(manager.create("x", IndexDefinition::value(["a..b"])).is_err());
    }

    #[test]
    fn test_index_and_reindex() {
        let mut manager = IndexManager::new();
        manager.create("by_city", IndexDefinition::value(["address.city"])).unwrap();

        let oslo = body(json!({"address": {"city": "Oslo"}}));
        manager.index_document("d1", Some(&oslo)).unwrap();
        assert_eq!(manager.lookup_eq("by_city", &[Value::from("Oslo")]).unwrap(), vec!["d1"]);

        let bergen = body(json!({"address": {"city": "Bergen"}}));
        manager.index_document("d1", Some(&bergen)).unwrap();
        assert!(manager.lookup_eq("by_city", &[Value::from("Oslo")]).unwrap().is_empty());
        assert_eq!(manager.lookup_eq("by_city", &[Value::from("Bergen")]).unwrap(), vec!["d1"]);

        manager.index_document("d1", None).unwrap();
        assert!(manager.lookup_eq("by_city", &[Value::from("Bergen")]).unwrap().is_empty());
    }

    #[test]
    fn test_missing_property_not_indexed() {
        let mut manager = IndexManager::new();
        manager.create("by_age", IndexDefinition::value(["age"])).unwrap();
        manager.index_document("d1", Some(&body(json!({"name": "x"})))).unwrap();
        assert!(manager.lookup_range("by_age", None, None).unwrap().is_empty());
    }

    #[test]
    fn test_composite_range() {
        let mut manager = IndexManager::new();
        manager.create("by_age", IndexDefinition::value(["age"])).unwrap();
        for (id, age) in [("a", 20), ("b", 30), ("c", 40)] {
            manager.index_document(id, Some(&body(json!({"age": age})))).unwrap();
        }
        let hits = manager
            .lookup_range("by_age", Some(&[Value::Int(25)]), Some(&[Value::Int(40)]))
            .unwrap();
        assert_eq!(hits, vec!["b", "c"]);
    }

    #[test]
    fn test_rebuild() {
        let mut manager = IndexManager::new();
        manager.create("by_name", IndexDefinition::value(["name"])).unwrap();
        let a = body(json!({"name": "A"}));
        manager
            .rebuild("by_name", vec![("a", Some(a.as_slice())), ("b", None)])
            .unwrap();
        assert_eq!(manager.lookup_eq("by_name", &[Value::from("A")]).unwrap(), vec!["a"]);
        assert!(manager.rebuild("missing", Vec::new()).is_err());
    }

    #[test]
    fn test_unknown_index() {
        let manager = IndexManager::new();
        assert!(manager.lookup_eq("nope", &[]).is_err());
    }
}
