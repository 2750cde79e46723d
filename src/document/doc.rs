//! Documents
//!
//! A `Document` is an owned, detachable copy of one revision. Loaded
//! documents keep their encoded body and decode fields on access; the
//! first mutation materializes the body into a `Dict`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::blob::BlobRef;
use crate::codec::{self, Dict, Slice, Value, ValueKind};

use super::errors::{DocumentError, DocumentResult};
use super::rev_tree::RevisionNode;
use super::revision::RevisionId;

/// Longest accepted document ID, in bytes
pub const MAX_ID_LEN: usize = 250;

#[derive(Debug, Clone)]
enum Body {
    Encoded(Arc<Vec<u8>>),
    Properties(Dict),
}

#[derive(Debug, Clone)]
pub struct Document {
    id: String,
    revision_id: Option<RevisionId>,
    sequence: u64,
    deleted: bool,
    expiration: Option<DateTime<Utc>>,
    body: Body,
}

impl Document {
    /// New, unsaved document with an empty body
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_properties(id, Dict::new())
    }

    /// New, unsaved document with a random ID
    pub fn generated() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn with_properties(id: impl Into<String>, properties: Dict) -> Self {
        Self {
            id: id.into(),
            revision_id: None,
            sequence: 0,
            deleted: false,
            expiration: None,
            body: Body::Properties(properties),
        }
    }

    /// New, unsaved document from a JSON object
    pub fn from_json(id: impl Into<String>, json: &serde_json::Value) -> DocumentResult<Self> {
        match Value::from_json(json) {
            Value::Dict(dict) => Ok(Self::with_properties(id, dict)),
            _ => Err(DocumentError::NotADict),
        }
    }

    pub(crate) fn from_revision(
        id: &str,
        node: &RevisionNode,
        sequence: u64,
        expiration: Option<DateTime<Utc>>,
    ) -> DocumentResult<Self> {
        let body = node.body.clone().ok_or_else(|| {
            DocumentError::InvalidRevision(format!("revision {} of {} has no body", node.rev_id, id))
        })?;
        if Slice::new(&body)?.root().kind()? != ValueKind::Dict {
            return Err(DocumentError::NotADict);
        }
        Ok(Self {
            id: id.to_string(),
            revision_id: Some(node.rev_id.clone()),
            sequence,
            deleted: node.deleted,
            expiration,
            body: Body::Encoded(body),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Revision this document was loaded at or last saved as
    pub fn revision_id(&self) -> Option<&RevisionId> {
        self.revision_id.as_ref()
    }

    /// Generation of the revision, 0 for an unsaved document
    pub fn generation(&self) -> u64 {
        self.revision_id.as_ref().map(RevisionId::generation).unwrap_or(0)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }

    /// Reads one top-level property
    pub fn get(&self, key: &str) -> DocumentResult<Option<Value>> {
        match &self.body {
            Body::Properties(dict) => Ok(dict.get(key).cloned()),
            Body::Encoded(bytes) => {
                let slice = Slice::new(bytes)?;
                Ok(slice.root().get(key)?.map(|v| v.to_value()).transpose()?)
            }
        }
    }

    /// Reads a nested property by dotted path
    pub fn get_path(&self, path: &str) -> DocumentResult<Option<Value>> {
        match &self.body {
            Body::Properties(dict) => {
                let (head, rest) = path.split_once('.').unwrap_or((path, ""));
                let Some(first) = dict.get(head) else {
                    return Ok(None);
                };
                if rest.is_empty() {
                    return Ok(Some(first.clone()));
                }
                Ok(first.get_path(rest).cloned())
            }
            Body::Encoded(bytes) => {
                let slice = Slice::new(bytes)?;
                Ok(slice.root().get_path(path)?.map(|v| v.to_value()).transpose()?)
            }
        }
    }

    pub fn contains(&self, key: &str) -> DocumentResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// A copy of all properties
    pub fn properties(&self) -> DocumentResult<Dict> {
        match &self.body {
            Body::Properties(dict) => Ok(dict.clone()),
            Body::Encoded(bytes) => match codec::decode(bytes)? {
                Value::Dict(dict) => Ok(dict),
                _ => Err(DocumentError::NotADict),
            },
        }
    }

    /// Mutable access to the properties, materializing the body if needed
    pub fn properties_mut(&mut self) -> DocumentResult<&mut Dict> {
        if let Body::Encoded(_) = self.body {
            self.body = Body::Properties(self.properties()?);
        }
        match &mut self.body {
            Body::Properties(dict) => Ok(dict),
            Body::Encoded(_) => Err(DocumentError::NotADict),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> DocumentResult<()> {
        self.properties_mut()?.insert(key.into(), value.into());
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> DocumentResult<Option<Value>> {
        Ok(self.properties_mut()?.remove(key))
    }

    /// Replaces all properties
    pub fn set_properties(&mut self, properties: Dict) {
        self.body = Body::Properties(properties);
    }

    /// Stores a blob reference under `key`
    pub fn set_blob(&mut self, key: impl Into<String>, blob: &BlobRef) -> DocumentResult<()> {
        self.set(key, blob.to_value())
    }

    /// Reads a blob reference stored under `key`
    pub fn blob(&self, key: &str) -> DocumentResult<Option<BlobRef>> {
        Ok(self.get(key)?.as_ref().and_then(BlobRef::from_value))
    }

    /// Every blob reference anywhere in the body
    pub fn blobs(&self) -> DocumentResult<Vec<BlobRef>> {
        let mut refs = Vec::new();
        BlobRef::collect(&Value::Dict(self.properties()?), &mut refs);
        Ok(refs)
    }

    /// Plain JSON rendering of the properties
    pub fn to_json(&self) -> DocumentResult<serde_json::Value> {
        Ok(Value::Dict(self.properties()?).to_plain(codec::MAX_DEPTH)?)
    }

    /// Canonical encoded body
    pub(crate) fn encoded_body(&self) -> DocumentResult<Arc<Vec<u8>>> {
        match &self.body {
            Body::Encoded(bytes) => Ok(bytes.clone()),
            Body::Properties(dict) => Ok(Arc::new(codec::encode(&Value::Dict(dict.clone()))?)),
        }
    }

    pub(crate) fn mark_saved(&mut self, rev: RevisionId, sequence: u64, deleted: bool) {
        self.revision_id = Some(rev);
        self.sequence = sequence;
        self.deleted = deleted;
    }
}

/// Checks that a document ID is usable
pub fn validate_id(id: &str) -> DocumentResult<()> {
    if id.is_empty() {
        return Err(DocumentError::InvalidId("document id is empty".to_string()));
    }
    if id.len() > MAX_ID_LEN {
        return Err(DocumentError::InvalidId(format!(
            "document id is {} bytes, limit is {}",
            id.len(),
            MAX_ID_LEN
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(DocumentError::InvalidId(format!("document id {:?} has control characters", id)));
    }
    Ok(())
}
