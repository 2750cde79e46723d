//! Committed database state
//!
//! `DatabaseState` is the in-memory image of everything the journal holds.
//! Open rebuilds it by applying every committed batch in order; a
//! transaction builds the next state by applying its own records to a
//! private copy. Both go through `apply`, so replay reproduces exactly the
//! state that was live before a crash.
//!
//! # Invariants
//!
//! - A published state is never mutated; readers share it through `Arc`
//! - `by_sequence` holds one entry per document, at its latest local sequence
//! - `last_sequence` never decreases
//! - Index contents always reflect each document's winning revision

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::database::{DatabaseError, DbResult};
use crate::document::{Document, RevTree, RevisionId, RevisionNode};
use crate::index::{CreateOutcome, IndexDefinition, IndexManager};
use crate::storage::{JournalRecord, PurgeReason, RevisionRecord};

use super::commit_id::CommitId;

/// Everything known about one document
#[derive(Debug, Clone, Default)]
pub struct DocumentEntry {
    pub tree: RevTree,
    /// Latest local sequence of any of its revisions
    pub sequence: u64,
    /// Expiration as Unix milliseconds
    pub expiration: Option<i64>,
}

impl DocumentEntry {
    pub fn winner(&self) -> Option<&RevisionNode> {
        self.tree.winner()
    }

    /// A document with no live leaf reads as deleted
    pub fn is_deleted(&self) -> bool {
        self.winner().map(|w| w.deleted).unwrap_or(true)
    }

    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration.and_then(millis_to_time)
    }

    /// Whether the current revision arrived through replication
    pub fn was_pulled(&self) -> bool {
        self.winner().map(|w| w.from_remote).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseState {
    documents: BTreeMap<String, Arc<DocumentEntry>>,
    by_sequence: BTreeMap<u64, String>,
    expirations: BTreeSet<(i64, String)>,
    indexes: IndexManager,
    checkpoints: BTreeMap<String, String>,
    /// Pulled documents purged by expiration, to be fetched again
    refetch: BTreeSet<String>,
    /// Documents with more than one live leaf
    conflicted: BTreeSet<String>,
    last_sequence: u64,
    last_commit: u64,
    live_count: usize,
}

impl DatabaseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn last_commit(&self) -> CommitId {
        CommitId::new(self.last_commit)
    }

    /// Number of documents whose current revision is live
    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn entry(&self, doc_id: &str) -> Option<&Arc<DocumentEntry>> {
        self.documents.get(doc_id)
    }

    /// Current revision of a document; `None` if absent or deleted
    pub fn get_document(&self, doc_id: &str) -> DbResult<Option<Document>> {
        let Some(entry) = self.documents.get(doc_id) else {
            return Ok(None);
        };
        match entry.winner() {
            Some(winner) if !winner.deleted => Ok(Some(Document::from_revision(
                doc_id,
                winner,
                entry.sequence,
                entry.expiration(),
            )?)),
            _ => Ok(None),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &Arc<DocumentEntry>)> {
        self.documents.iter()
    }

    /// Documents changed after `since`, in sequence order
    pub fn sequences_after(&self, since: u64) -> impl Iterator<Item = (u64, &str)> {
        self.by_sequence
            .range(since.saturating_add(1)..)
            .map(|(seq, id)| (*seq, id.as_str()))
    }

    /// Documents whose expiration is at or before `now`
    pub fn expired_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = now.timestamp_millis();
        self.expirations
            .iter()
            .take_while(|(at, _)| *at <= cutoff)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Earliest pending expiration
    pub fn next_expiration(&self) -> Option<DateTime<Utc>> {
        self.expirations.iter().next().and_then(|(at, _)| millis_to_time(*at))
    }

    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    pub fn checkpoint(&self, id: &str) -> Option<&str> {
        self.checkpoints.get(id).map(String::as_str)
    }

    pub fn checkpoints(&self) -> impl Iterator<Item = (&String, &String)> {
        self.checkpoints.iter()
    }

    pub fn refetch_candidates(&self) -> Vec<String> {
        self.refetch.iter().cloned().collect()
    }

    pub fn conflicted_ids(&self) -> Vec<String> {
        self.conflicted.iter().cloned().collect()
    }

    /// Applies one journal record
    ///
    /// Returns the ID of the document the record changed, if any.
    pub fn apply(&mut self, record: &JournalRecord) -> DbResult<Option<String>> {
        match record {
            JournalRecord::Header { .. } => Ok(None),
            JournalRecord::Revision(rev) => {
                self.apply_revision(rev)?;
                Ok(Some(rev.doc_id.clone()))
            }
            JournalRecord::Purge { doc_id, reason } => {
                self.apply_purge(doc_id, *reason)?;
                Ok(Some(doc_id.clone()))
            }
            JournalRecord::Expiration { doc_id, expires_at } => {
                self.apply_expiration(doc_id, *expires_at);
                Ok(None)
            }
            JournalRecord::IndexCreate { name, definition } => {
                let definition = IndexDefinition::from_json(definition)?;
                if self.indexes.create(name, definition)? != CreateOutcome::Unchanged {
                    self.rebuild_index(name)?;
                }
                Ok(None)
            }
            JournalRecord::IndexDelete { name } => {
                self.indexes.delete(name);
                Ok(None)
            }
            JournalRecord::Checkpoint { checkpoint_id, body } => {
                self.checkpoints.insert(checkpoint_id.clone(), body.clone());
                Ok(None)
            }
            JournalRecord::Commit {
                commit_id,
                last_sequence,
            } => {
                self.last_commit = self.last_commit.max(*commit_id);
                self.last_sequence = self.last_sequence.max(*last_sequence);
                Ok(None)
            }
        }
    }

    fn apply_revision(&mut self, rev: &RevisionRecord) -> DbResult<()> {
        let rev_id = RevisionId::parse(&rev.rev_id)?;
        let parent = rev.parent.as_deref().map(RevisionId::parse).transpose()?;
        let history = rev
            .history
            .iter()
            .map(|h| RevisionId::parse(h))
            .collect::<Result<Vec<_>, _>>()?;
        let node = RevisionNode {
            rev_id,
            parent,
            deleted: rev.deleted,
            body: rev.body.clone().map(Arc::new),
            sequence: rev.sequence,
            from_remote: rev.from_remote,
        };

        let was_live = self.is_live(&rev.doc_id);
        let entry = Arc::make_mut(self.documents.entry(rev.doc_id.clone()).or_default());
        // ancestry pruned by an earlier compaction, here or on a peer
        let detached = match &node.parent {
            Some(p) => !entry.tree.contains(p),
            None => node.rev_id.generation() > 1,
        };
        if !history.is_empty() {
            entry.tree.insert_with_history(node, &history)?;
        } else if detached {
            entry.tree.insert_detached(node)?;
        } else {
            entry.tree.insert(node)?;
        }

        if rev.sequence > entry.sequence {
            if entry.sequence > 0 {
                self.by_sequence.remove(&entry.sequence);
            }
            entry.sequence = rev.sequence;
            self.by_sequence.insert(rev.sequence, rev.doc_id.clone());
        }
        let winner_body = entry
            .winner()
            .filter(|w| !w.deleted)
            .and_then(|w| w.body.clone());
        let conflicted = entry.tree.is_conflicted();

        self.last_sequence = self.last_sequence.max(rev.sequence);
        self.refetch.remove(&rev.doc_id);
        if conflicted {
            self.conflicted.insert(rev.doc_id.clone());
        } else {
            self.conflicted.remove(&rev.doc_id);
        }
        self.indexes
            .index_document(&rev.doc_id, winner_body.as_deref().map(Vec::as_slice))?;
        self.adjust_live_count(was_live, self.is_live(&rev.doc_id));
        Ok(())
    }

    fn apply_purge(&mut self, doc_id: &str, reason: PurgeReason) -> DbResult<()> {
        let was_live = self.is_live(doc_id);
        if let Some(entry) = self.documents.remove(doc_id) {
            self.by_sequence.remove(&entry.sequence);
            if let Some(at) = entry.expiration {
                self.expirations.remove(&(at, doc_id.to_string()));
            }
            self.indexes.index_document(doc_id, None)?;
        }
        self.conflicted.remove(doc_id);
        self.adjust_live_count(was_live, false);
        if reason == PurgeReason::ExpiredPulled {
            self.refetch.insert(doc_id.to_string());
        }
        Ok(())
    }

    fn apply_expiration(&mut self, doc_id: &str, expires_at: Option<i64>) {
        let Some(entry) = self.documents.get_mut(doc_id) else {
            return;
        };
        let entry = Arc::make_mut(entry);
        if let Some(old) = entry.expiration.take() {
            self.expirations.remove(&(old, doc_id.to_string()));
        }
        if let Some(at) = expires_at {
            entry.expiration = Some(at);
            self.expirations.insert((at, doc_id.to_string()));
        }
    }

    fn rebuild_index(&mut self, name: &str) -> DbResult<()> {
        let bodies: Vec<(&str, Option<&[u8]>)> = self
            .documents
            .iter()
            .map(|(id, entry)| {
                let body = entry
                    .winner()
                    .filter(|w| !w.deleted)
                    .and_then(|w| w.body.as_deref())
                    .map(Vec::as_slice);
                (id.as_str(), body)
            })
            .collect();
        self.indexes.rebuild(name, bodies)?;
        Ok(())
    }

    fn is_live(&self, doc_id: &str) -> bool {
        self.documents
            .get(doc_id)
            .map(|e| !e.is_deleted())
            .unwrap_or(false)
    }

    fn adjust_live_count(&mut self, was_live: bool, is_live: bool) {
        match (was_live, is_live) {
            (false, true) => self.live_count += 1,
            (true, false) => self.live_count = self.live_count.saturating_sub(1),
            _ => {}
        }
    }

    /// Replaces a document's revision tree after compaction
    pub(crate) fn replace_tree(&mut self, doc_id: &str, tree: RevTree) {
        if let Some(entry) = self.documents.get_mut(doc_id) {
            Arc::make_mut(entry).tree = tree;
        }
    }

    /// Records that reproduce this state in a fresh journal
    ///
    /// Every document is written as its surviving revisions, parents
    /// before children, so replaying the result rebuilds the same trees.
    pub(crate) fn to_records(&self) -> Vec<JournalRecord> {
        let mut records = Vec::new();
        for name in self.indexes.names() {
            if let Some(def) = self.indexes.definition(&name) {
                records.push(JournalRecord::IndexCreate {
                    definition: def.to_json(),
                    name,
                });
            }
        }
        for (doc_id, entry) in &self.documents {
            let mut nodes: Vec<&RevisionNode> = entry.tree.iter().collect();
            nodes.sort_by(|a, b| a.rev_id.cmp(&b.rev_id));
            for node in nodes {
                records.push(JournalRecord::Revision(RevisionRecord {
                    doc_id: doc_id.clone(),
                    rev_id: node.rev_id.to_string(),
                    parent: node.parent.as_ref().map(ToString::to_string),
                    history: Vec::new(),
                    deleted: node.deleted,
                    sequence: node.sequence,
                    from_remote: node.from_remote,
                    body: node.body.as_ref().map(|b| b.as_ref().clone()),
                }));
            }
            if entry.expiration.is_some() {
                records.push(JournalRecord::Expiration {
                    doc_id: doc_id.clone(),
                    expires_at: entry.expiration,
                });
            }
        }
        for doc_id in &self.refetch {
            records.push(JournalRecord::Purge {
                doc_id: doc_id.clone(),
                reason: PurgeReason::ExpiredPulled,
            });
        }
        for (id, body) in &self.checkpoints {
            records.push(JournalRecord::Checkpoint {
                checkpoint_id: id.clone(),
                body: body.clone(),
            });
        }
        records
    }

}

pub(crate) fn millis_to_time(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Maps a replay failure to corruption of the journal
pub(crate) fn replay_error(commit_id: u64, err: DatabaseError) -> DatabaseError {
    match err {
        DatabaseError::CorruptData(_) => err,
        other => DatabaseError::CorruptData(format!("replay of commit {}: {}", commit_id, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, Value};
    use serde_json::json;

    fn body(json: serde_json::Value) -> Vec<u8> {
        encode(&Value::from_json(&json)).unwrap()
    }

    fn revision(doc: &str, parent: Option<&RevisionId>, seq: u64, json: serde_json::Value) -> (RevisionId, JournalRecord) {
        let bytes = body(json);
        let rev = RevisionId::compute(parent, false, &bytes);
        let record = JournalRecord::Revision(RevisionRecord {
            doc_id: doc.into(),
            rev_id: rev.to_string(),
            parent: parent.map(ToString::to_string),
            history: vec![],
            deleted: false,
            sequence: seq,
            from_remote: false,
            body: Some(bytes),
        });
        (rev, record)
    }

    #[test]
    fn test_revisions_move_sequence() {
        let mut state = DatabaseState::new();
        let (r1, rec1) = revision("doc1", None, 1, json!({"name": "A"}));
        let (_, rec2) = revision("doc1", Some(&r1), 2, json!({"name": "B"}));
        state.apply(&rec1).unwrap();
        state.apply(&rec2).unwrap();

        assert_eq!(state.last_sequence(), 2);
        assert_eq!(state.live_count(), 1);
        let changed: Vec<_> = state.sequences_after(0).collect();
        assert_eq!(changed, vec![(2, "doc1")]);
        assert_eq!(state.entry("doc1").unwrap().winner().unwrap().rev_id.generation(), 2);
    }

    #[test]
    fn test_purge_removes_everything() {
        let mut state = DatabaseState::new();
        let (_, rec) = revision("doc1", None, 1, json!({"n": 1}));
        state.apply(&rec).unwrap();
        state
            .apply(&JournalRecord::Expiration {
                doc_id: "doc1".into(),
                expires_at: Some(1_000),
            })
            .unwrap();
        let purge = JournalRecord::Purge {
            doc_id: "doc1".into(),
            reason: PurgeReason::Manual,
        };
        state.apply(&purge).unwrap();
        state.apply(&purge).unwrap();

        assert!(state.entry("doc1").is_none());
        assert_eq!(state.live_count(), 0);
        assert!(state.next_expiration().is_none());
        assert_eq!(state.sequences_after(0).count(), 0);
    }

    #[test]
    fn test_conflicted_documents_tracked() {
        let mut state = DatabaseState::new();
        let (r1, rec1) = revision("doc1", None, 1, json!({"v": 1}));
        let (_, rec2a) = revision("doc1", Some(&r1), 2, json!({"v": "a"}));
        let (_, rec2b) = revision("doc1", Some(&r1), 3, json!({"v": "b"}));
        state.apply(&rec1).unwrap();
        state.apply(&rec2a).unwrap();
        assert!(state.conflicted_ids().is_empty());

        state.apply(&rec2b).unwrap();
        assert_eq!(state.conflicted_ids(), vec!["doc1"]);

        state
            .apply(&JournalRecord::Purge {
                doc_id: "doc1".into(),
                reason: PurgeReason::Manual,
            })
            .unwrap();
        assert!(state.conflicted_ids().is_empty());
    }

    #[test]
    fn test_expired_pulled_purge_marks_refetch() {
        let mut state = DatabaseState::new();
        state
            .apply(&JournalRecord::Purge {
                doc_id: "gone".into(),
                reason: PurgeReason::ExpiredPulled,
            })
            .unwrap();
        assert_eq!(state.refetch_candidates(), vec!["gone"]);

        let (_, rec) = revision("gone", None, 1, json!({}));
        state.apply(&rec).unwrap();
        assert!(state.refetch_candidates().is_empty());
    }

    #[test]
    fn test_index_follows_winner() {
        let mut state = DatabaseState::new();
        let (r1, rec1) = revision("d", None, 1, json!({"city": "Oslo"}));
        state.apply(&rec1).unwrap();
        state
            .apply(&JournalRecord::IndexCreate {
                name: "by_city".into(),
                definition: IndexDefinition::value(["city"]).to_json(),
            })
            .unwrap();
        assert_eq!(
            state.indexes().lookup_eq("by_city", &[Value::from("Oslo")]).unwrap(),
            vec!["d"]
        );

        let (_, rec2) = revision("d", Some(&r1), 2, json!({"city": "Rome"}));
        state.apply(&rec2).unwrap();
        assert!(state.indexes().lookup_eq("by_city", &[Value::from("Oslo")]).unwrap().is_empty());
    }

    #[test]
    fn test_to_records_reproduces_state() {
        let mut state = DatabaseState::new();
        let (r1, rec1) = revision("a", None, 1, json!({"v": 1}));
        let (_, rec2) = revision("a", Some(&r1), 2, json!({"v": 2}));
        let (_, rec3) = revision("b", None, 3, json!({"v": 3}));
        for r in [&rec1, &rec2, &rec3] {
            state.apply(r).unwrap();
        }
        state
            .apply(&JournalRecord::Checkpoint {
                checkpoint_id: "cp".into(),
                body: "{}".into(),
            })
            .unwrap();

        let mut rebuilt = DatabaseState::new();
        for r in state.to_records() {
            rebuilt.apply(&r).unwrap();
        }
        assert_eq!(rebuilt.live_count(), 2);
        assert_eq!(rebuilt.last_sequence(), 3);
        assert_eq!(rebuilt.checkpoint("cp"), Some("{}"));
        assert_eq!(
            rebuilt.entry("a").unwrap().tree,
            state.entry("a").unwrap().tree
        );
    }

    #[test]
    fn test_expired_at() {
        let mut state = DatabaseState::new();
        for (id, seq) in [("x", 1), ("y", 2)] {
            let (_, rec) = revision(id, None, seq, json!({}));
            state.apply(&rec).unwrap();
        }
        state
            .apply(&JournalRecord::Expiration { doc_id: "x".into(), expires_at: Some(1_000) })
            .unwrap();
        state
            .apply(&JournalRecord::Expiration { doc_id: "y".into(), expires_at: Some(5_000) })
            .unwrap();
        let now = millis_to_time(2_000).unwrap();
        assert_eq!(state.expired_at(now), vec!["x"]);
    }
}
