//! Snapshot - Stable read view
//!
//! A snapshot pins one published `DatabaseState`. Every read through it
//! sees the same commit, no matter how many transactions commit after it
//! was taken. Taking a snapshot never waits for the writer.

use std::sync::Arc;

use crate::database::DbResult;
use crate::document::{Document, RevisionId};

use super::commit_id::CommitId;
use super::state::DatabaseState;

#[derive(Debug, Clone)]
pub struct Snapshot {
    state: Arc<DatabaseState>,
}

impl Snapshot {
    pub(crate) fn new(state: Arc<DatabaseState>) -> Self {
        Self { state }
    }

    /// Last commit visible to this snapshot
    pub fn commit_id(&self) -> CommitId {
        self.state.last_commit()
    }

    pub fn last_sequence(&self) -> u64 {
        self.state.last_sequence()
    }

    /// Number of live documents
    pub fn count(&self) -> usize {
        self.state.live_count()
    }

    /// Current revision of a document; `None` if absent or deleted
    pub fn get_document(&self, doc_id: &str) -> DbResult<Option<Document>> {
        self.state.get_document(doc_id)
    }

    /// Current revision ID, including tombstones
    pub fn current_revision(&self, doc_id: &str) -> Option<RevisionId> {
        self.state
            .entry(doc_id)
            .and_then(|e| e.winner())
            .map(|w| w.rev_id.clone())
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.state.entry(doc_id).map(|e| !e.is_deleted()).unwrap_or(false)
    }

    /// IDs of live documents, sorted
    pub fn document_ids(&self) -> Vec<String> {
        self.state
            .entries()
            .filter(|(_, e)| !e.is_deleted())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, Value};
    use crate::storage::{JournalRecord, RevisionRecord};
    use serde_json::json;

    fn state_with(doc: &str, deleted: bool) -> DatabaseState {
        let body = encode(&Value::from_json(&json!({"k": "v"}))).unwrap();
        let rev = RevisionId::compute(None, deleted, &body);
        let mut state = DatabaseState::new();
        state
            .apply(&JournalRecord::Revision(RevisionRecord {
                doc_id: doc.into(),
                rev_id: rev.to_string(),
                parent: None,
                history: vec![],
                deleted,
                sequence: 1,
                from_remote: false,
                body: Some(body),
            }))
            .unwrap();
        state
    }

    #[test]
    fn test_snapshot_reads_live_document() {
        let snapshot = Snapshot::new(Arc::new(state_with("a", false)));
        let doc = snapshot.get_document("a").unwrap().unwrap();
        assert_eq!(doc.get("k").unwrap(), Some(Value::from("v")));
        assert_eq!(doc.sequence(), 1);
        assert!(snapshot.get_document("missing").unwrap().is_none());
        assert_eq!(snapshot.document_ids(), vec!["a"]);
    }

    #[test]
    fn test_tombstone_reads_as_absent() {
        let snapshot = Snapshot::new(Arc::new(state_with("a", true)));
        assert!(snapshot.get_document("a").unwrap().is_none());
        assert!(!snapshot.contains("a"));
        assert!(snapshot.current_revision("a").is_some());
        assert_eq!(snapshot.count(), 0);
    }
}
