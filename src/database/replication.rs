//! Replication support
//!
//! The operations a replicator needs from a database: a change feed by
//! sequence, revision lookup and export with ancestry, atomic import of
//! remote revisions together with a checkpoint, and conflict resolution.
//!
//! # Invariants
//!
//! - Remote revisions are verified before anything is written; a bad
//!   revision rejects the whole batch
//! - A batch and its checkpoint commit in one transaction
//! - Resolving a conflict writes revisions whose IDs depend only on the
//!   revisions involved and the resolver's decision

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::{self, Value};
use crate::document::{
    validate_id, ConflictResolver, Document, Resolution, RevTree, Revision, RevisionId, RevisionNode,
};
use crate::notify::ChangeSource;
use crate::observability::{Event, Logger};

use super::database::Database;
use super::errors::{DatabaseError, DbResult};

/// One document in the change feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub sequence: u64,
    pub doc_id: String,
    /// Current revision
    pub rev_id: RevisionId,
    pub deleted: bool,
    /// Other leaves, tombstones included
    pub conflicts: Vec<RevisionId>,
}

impl ChangeEntry {
    /// Every leaf revision, current first
    pub fn leaf_revisions(&self) -> impl Iterator<Item = &RevisionId> {
        std::iter::once(&self.rev_id).chain(self.conflicts.iter())
    }
}

/// A revision with its body and ancestry, as sent between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionTransfer {
    pub doc_id: String,
    pub rev_id: RevisionId,
    /// Known ancestors, newest first
    pub history: Vec<RevisionId>,
    pub deleted: bool,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
    /// Sequence of the document on the sending side
    pub sequence: u64,
}

impl RevisionTransfer {
    /// Read-only document view, for filters
    pub fn to_document(&self) -> DbResult<Document> {
        let node = RevisionNode {
            rev_id: self.rev_id.clone(),
            parent: self.history.first().cloned(),
            deleted: self.deleted,
            body: Some(Arc::new(self.body.clone())),
            sequence: self.sequence,
            from_remote: true,
        };
        Ok(Document::from_revision(&self.doc_id, &node, self.sequence, None)?)
    }

    /// Checks the ID, body and revision digest
    fn verify(&self) -> DbResult<()> {
        validate_id(&self.doc_id)?;
        match codec::decode(&self.body)? {
            Value::Dict(_) => {}
            _ => {
                return Err(DatabaseError::InvalidArgument(format!(
                    "body of {} {} is not a dict",
                    self.doc_id, self.rev_id
                )))
            }
        }
        let parent = self.history.first();
        if parent.is_none() && self.rev_id.generation() > 1 {
            // ancestry compacted away on the sender; nothing to check against
            return Ok(());
        }
        let expected = RevisionId::compute(parent, self.deleted, &self.body);
        if expected != self.rev_id {
            return Err(DatabaseError::CorruptData(format!(
                "revision {} of {} does not match its content (expected {})",
                self.rev_id, self.doc_id, expected
            )));
        }
        Ok(())
    }
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Outcome of `apply_remote_revisions`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    /// Already present locally
    pub skipped: usize,
    /// Documents left with more than one live leaf
    pub conflicted: Vec<String>,
}

impl Database {
    /// Documents changed after `since`, oldest first
    pub fn changes_since(&self, since: u64, limit: usize) -> DbResult<Vec<ChangeEntry>> {
        self.ensure_open()?;
        let state = self.current_state();
        let mut out = Vec::new();
        for (sequence, doc_id) in state.sequences_after(since).take(limit) {
            let Some(entry) = state.entry(doc_id) else {
                continue;
            };
            let Some(winner) = entry.winner() else {
                continue;
            };
            let mut conflicts: Vec<RevisionId> = entry
                .tree
                .leaves()
                .into_iter()
                .filter(|leaf| leaf.rev_id != winner.rev_id)
                .map(|leaf| leaf.rev_id.clone())
                .collect();
            conflicts.sort_by(|a, b| b.cmp(a));
            out.push(ChangeEntry {
                sequence,
                doc_id: doc_id.to_string(),
                rev_id: winner.rev_id.clone(),
                deleted: winner.deleted,
                conflicts,
            });
        }
        Ok(out)
    }

    /// Whether `rev` (or something newer on its branch) is known locally
    ///
    /// A generation below everything still in the tree counts as known:
    /// it was pruned, which means a descendant is present.
    pub fn has_revision(&self, doc_id: &str, rev: &RevisionId) -> bool {
        let state = self.current_state();
        let Some(entry) = state.entry(doc_id) else {
            return false;
        };
        has_revision_in(&entry.tree, rev)
    }

    /// Exports a revision with its ancestry; `None` if it or its body is gone
    pub fn revision_transfer(&self, doc_id: &str, rev: &RevisionId) -> DbResult<Option<RevisionTransfer>> {
        self.ensure_open()?;
        let state = self.current_state();
        let Some(entry) = state.entry(doc_id) else {
            return Ok(None);
        };
        let Some(node) = entry.tree.get(rev) else {
            return Ok(None);
        };
        let Some(body) = &node.body else {
            return Ok(None);
        };
        let history = entry.tree.ancestry(rev).into_iter().skip(1).collect();
        Ok(Some(RevisionTransfer {
            doc_id: doc_id.to_string(),
            rev_id: rev.clone(),
            history,
            deleted: node.deleted,
            body: body.as_ref().clone(),
            sequence: entry.sequence,
        }))
    }

    /// Stores revisions received from a peer, with an optional checkpoint
    ///
    /// Everything, checkpoint included, commits in one transaction.
    pub fn apply_remote_revisions(
        &self,
        batch: &[RevisionTransfer],
        checkpoint: Option<(&str, &str)>,
    ) -> DbResult<ApplyReport> {
        for transfer in batch {
            transfer.verify()?;
        }

        let mut report = ApplyReport::default();
        self.in_transaction(|txn| {
            txn.set_source(ChangeSource::Replicated);
            for transfer in batch {
                let present = txn
                    .working()
                    .entry(&transfer.doc_id)
                    .and_then(|e| e.tree.get(&transfer.rev_id))
                    .map(|n| n.body.is_some())
                    .unwrap_or(false);
                if present {
                    report.skipped += 1;
                    continue;
                }
                txn.insert_remote_revision(
                    &transfer.doc_id,
                    &transfer.rev_id,
                    &transfer.history,
                    transfer.deleted,
                    transfer.body.clone(),
                )?;
                report.applied += 1;
                let conflicted = txn
                    .working()
                    .entry(&transfer.doc_id)
                    .map(|e| e.tree.is_conflicted())
                    .unwrap_or(false);
                if conflicted && !report.conflicted.contains(&transfer.doc_id) {
                    report.conflicted.push(transfer.doc_id.clone());
                }
            }
            if let Some((id, body)) = checkpoint {
                txn.set_checkpoint(id, body)?;
            }
            Ok(())
        })?;

        self.metrics().add_revisions_pulled(report.applied as u64);
        Ok(report)
    }

    pub fn get_checkpoint(&self, checkpoint_id: &str) -> DbResult<Option<String>> {
        self.ensure_open()?;
        Ok(self.current_state().checkpoint(checkpoint_id).map(str::to_string))
    }

    pub fn set_checkpoint(&self, checkpoint_id: &str, body: &str) -> DbResult<()> {
        self.in_transaction(|txn| txn.set_checkpoint(checkpoint_id, body))
    }

    /// Live leaf revisions of a conflicted document, highest first
    ///
    /// Empty when the document is not in conflict.
    pub fn conflicts(&self, doc_id: &str) -> DbResult<Vec<Revision>> {
        self.ensure_open()?;
        let state = self.current_state();
        let Some(entry) = state.entry(doc_id) else {
            return Ok(Vec::new());
        };
        if !entry.tree.is_conflicted() {
            return Ok(Vec::new());
        }
        let mut leaves: Vec<Revision> = entry
            .tree
            .live_leaves()
            .into_iter()
            .map(|n| to_revision(doc_id, n))
            .collect();
        leaves.sort_by(|a, b| b.rev_id.cmp(&a.rev_id));
        Ok(leaves)
    }

    /// Resolves every conflict on a document with `resolver`
    ///
    /// Returns whether anything was written.
    pub fn resolve_conflicts(&self, doc_id: &str, resolver: &dyn ConflictResolver) -> DbResult<bool> {
        let mut resolved = 0u64;
        self.in_transaction(|txn| {
            loop {
                let Some(entry) = txn.working().entry(doc_id).cloned() else {
                    return Ok(());
                };
                let Some((local, remote)) = pick_pair(&entry.tree) else {
                    return Ok(());
                };
                let ancestor = entry
                    .tree
                    .common_ancestor(&local.rev_id, &remote.rev_id)
                    .and_then(|rev| entry.tree.get(&rev))
                    .map(|n| to_revision(doc_id, n));
                let local = to_revision(doc_id, local);
                let remote = to_revision(doc_id, remote);

                let resolution = resolver.resolve(&local, &remote, ancestor.as_ref());
                let tombstone = codec::empty_dict();
                match resolution {
                    Resolution::KeepLocal => {
                        txn.insert_local_revision(doc_id, &remote.rev_id, true, tombstone)?;
                    }
                    Resolution::KeepRemote => {
                        txn.insert_local_revision(doc_id, &local.rev_id, true, tombstone)?;
                    }
                    Resolution::Merge(dict) => {
                        let body = codec::encode(&Value::Dict(dict))?;
                        let (higher, lower) = if local.rev_id > remote.rev_id {
                            (&local, &remote)
                        } else {
                            (&remote, &local)
                        };
                        txn.insert_local_revision(doc_id, &higher.rev_id, false, body)?;
                        txn.insert_local_revision(doc_id, &lower.rev_id, true, tombstone)?;
                    }
                    Resolution::Delete => {
                        txn.insert_local_revision(doc_id, &local.rev_id, true, tombstone.clone())?;
                        txn.insert_local_revision(doc_id, &remote.rev_id, true, tombstone)?;
                    }
                }
                resolved += 1;
                Logger::info(
                    Event::ConflictResolved.as_str(),
                    &[
                        ("database", self.name()),
                        ("doc_id", doc_id),
                        ("local", &local.rev_id.to_string()),
                        ("remote", &remote.rev_id.to_string()),
                    ],
                );
            }
        })?;
        for _ in 0..resolved {
            self.metrics().increment_conflicts_resolved();
        }
        Ok(resolved > 0)
    }

    /// Pulled documents purged by expiration that should be fetched again
    pub fn refetch_candidates(&self) -> Vec<String> {
        self.current_state().refetch_candidates()
    }

    /// Documents that currently have more than one live leaf
    pub fn conflicted_document_ids(&self) -> Vec<String> {
        self.current_state().conflicted_ids()
    }
}

pub(crate) fn has_revision_in(tree: &RevTree, rev: &RevisionId) -> bool {
    match tree.get(rev) {
        // an interior stub is covered by its descendants
        Some(node) => node.body.is_some() || !tree.is_leaf(rev),
        None => tree.min_generation().map(|g| rev.generation() < g).unwrap_or(false),
    }
}

/// The two live leaves to reconcile next
///
/// Prefers the highest local leaf against the highest pulled one, so each
/// side's own edit meets the peer's edit.
fn pick_pair(tree: &RevTree) -> Option<(&RevisionNode, &RevisionNode)> {
    let mut leaves = tree.live_leaves();
    if leaves.len() < 2 {
        return None;
    }
    leaves.sort_by(|a, b| b.rev_id.cmp(&a.rev_id));
    let local = leaves
        .iter()
        .copied()
        .find(|n| !n.from_remote)
        .unwrap_or(leaves[0]);
    let remote = leaves
        .iter()
        .copied()
        .find(|n| n.from_remote && n.rev_id != local.rev_id)
        .or_else(|| leaves.iter().copied().find(|n| n.rev_id != local.rev_id))?;
    Some((local, remote))
}

fn to_revision(doc_id: &str, node: &RevisionNode) -> Revision {
    Revision {
        doc_id: doc_id.to_string(),
        rev_id: node.rev_id.clone(),
        deleted: node.deleted,
        body: node.body.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ConcurrencyControl, DatabaseConfig, ErrorKind};
    use crate::document::DefaultConflictResolver;
    use serde_json::json;
    use tempfile::TempDir;

    fn open(temp: &TempDir, name: &str) -> Database {
        let config = DatabaseConfig {
            expiration_sweep_interval_secs: 0,
            ..DatabaseConfig::in_directory(temp.path())
        };
        Database::open_named(name, config).unwrap()
    }

    fn save(db: &Database, id: &str, body: serde_json::Value) -> Document {
        let mut doc = Document::from_json(id, &body).unwrap();
        db.save_document(&mut doc, ConcurrencyControl::FailOnConflict).unwrap();
        doc
    }

    fn update(db: &Database, id: &str, key: &str, value: &str) {
        let mut doc = db.get_document(id).unwrap().unwrap();
        doc.set(key, value).unwrap();
        db.save_document(&mut doc, ConcurrencyControl::FailOnConflict).unwrap();
    }

    /// Copies every leaf revision of every change from `from` into `to`
    fn sync(from: &Database, to: &Database) {
        let mut batch = Vec::new();
        for change in from.changes_since(0, usize::MAX).unwrap() {
            for rev in change.leaf_revisions() {
                if !to.has_revision(&change.doc_id, rev) {
                    batch.extend(from.revision_transfer(&change.doc_id, rev).unwrap());
                }
            }
        }
        to.apply_remote_revisions(&batch, None).unwrap();
    }

    #[test]
    fn test_changes_since_in_sequence_order() {
        let temp = TempDir::new().unwrap();
        let db = open(&temp, "a");
        save(&db, "one", json!({"v": 1}));
        save(&db, "two", json!({"v": 2}));
        update(&db, "one", "v", "again");

        let changes = db.changes_since(0, 10).unwrap();
        let ids: Vec<&str> = changes.iter().map(|c| c.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["two", "one"]);
        assert_eq!(changes[1].sequence, 3);
        assert_eq!(db.changes_since(2, 10).unwrap().len(), 1);
        assert_eq!(db.changes_since(0, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_transfer_roundtrip_keeps_revision_ids() {
        let temp = TempDir::new().unwrap();
        let a = open(&temp, "a");
        let b = open(&temp, "b");
        save(&a, "doc", json!({"name": "A"}));
        update(&a, "doc", "name", "B");

        sync(&a, &b);
        let original = a.get_document("doc").unwrap().unwrap();
        let copy = b.get_document("doc").unwrap().unwrap();
        assert_eq!(copy.revision_id(), original.revision_id());
        assert_eq!(copy.to_json().unwrap(), json!({"name": "B"}));

        // second sync is a no-op
        let before = b.last_sequence();
        sync(&a, &b);
        assert_eq!(b.last_sequence(), before);
    }

    #[test]
    fn test_tampered_body_rejected() {
        let temp = TempDir::new().unwrap();
        let a = open(&temp, "a");
        let b = open(&temp, "b");
        let doc = save(&a, "doc", json!({"name": "A"}));
        let mut transfer = a.revision_transfer("doc", doc.revision_id().unwrap()).unwrap().unwrap();
        transfer.body = codec::encode(&Value::from_json(&json!({"name": "Z"}))).unwrap();

        let err = b.apply_remote_revisions(&[transfer], Some(("cp", "{}"))).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(b.count(), 0);
        assert_eq!(b.get_checkpoint("cp").unwrap(), None);
    }

    #[test]
    fn test_unsorted_body_rejected_as_corrupt() {
        let temp = TempDir::new().unwrap();
        let b = open(&temp, "b");
        let mut body = codec::encode(&Value::from_json(&json!({"a": 1, "b": 2}))).unwrap();
        let ka = body.iter().position(|x| *x == b'a').unwrap();
        let kb = body.iter().position(|x| *x == b'b').unwrap();
        body.swap(ka, kb);
        let transfer = RevisionTransfer {
            doc_id: "doc".to_string(),
            rev_id: RevisionId::compute(None, false, &body),
            history: Vec::new(),
            deleted: false,
            body,
            sequence: 1,
        };

        let err = b.apply_remote_revisions(&[transfer], Some(("cp", "{}"))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptData);
        assert_eq!(b.count(), 0);
        assert_eq!(b.get_checkpoint("cp").unwrap(), None);
    }

    #[test]
    fn test_checkpoint_commits_with_batch() {
        let temp = TempDir::new().unwrap();
        let a = open(&temp, "a");
        let b = open(&temp, "b");
        let doc = save(&a, "doc", json!({"v": 1}));
        let transfer = a.revision_transfer("doc", doc.revision_id().unwrap()).unwrap().unwrap();
        b.apply_remote_revisions(&[transfer], Some(("cp", "{\"remote\":1}"))).unwrap();
        assert_eq!(b.get_checkpoint("cp").unwrap().as_deref(), Some("{\"remote\":1}"));
        assert_eq!(b.metrics().snapshot().revisions_pulled, 1);
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let temp = TempDir::new().unwrap();
        let a = open(&temp, "a");
        let b = open(&temp, "b");
        save(&a, "x", json!({"v": "1"}));
        sync(&a, &b);

        update(&a, "x", "v", "2a");
        update(&b, "x", "v", "2b");
        sync(&a, &b);
        sync(&b, &a);

        assert_eq!(a.conflicts("x").unwrap().len(), 2);
        assert_eq!(b.conflicts("x").unwrap().len(), 2);

        assert!(a.resolve_conflicts("x", &DefaultConflictResolver).unwrap());
        assert!(b.resolve_conflicts("x", &DefaultConflictResolver).unwrap());
        sync(&a, &b);
        sync(&b, &a);

        let da = a.get_document("x").unwrap().unwrap();
        let db = b.get_document("x").unwrap().unwrap();
        assert_eq!(da.revision_id(), db.revision_id());
        assert_eq!(da.to_json().unwrap(), db.to_json().unwrap());
        assert!(a.conflicts("x").unwrap().is_empty());
        assert_eq!(a.metrics().snapshot().conflicts_resolved, 1);
    }

    #[test]
    fn test_merge_resolution() {
        let temp = TempDir::new().unwrap();
        let a = open(&temp, "a");
        let b = open(&temp, "b");
        save(&a, "x", json!({"v": "1"}));
        sync(&a, &b);
        update(&a, "x", "left", "L");
        update(&b, "x", "right", "R");
        sync(&b, &a);

        let merge = |local: &Revision, remote: &Revision, _: Option<&Revision>| {
            let mut props = local.properties().unwrap().unwrap_or_default();
            for (k, v) in remote.properties().unwrap().unwrap_or_default() {
                props.entry(k).or_insert(v);
            }
            Resolution::Merge(props)
        };
        assert!(a.resolve_conflicts("x", &merge).unwrap());
        let doc = a.get_document("x").unwrap().unwrap();
        assert_eq!(doc.to_json().unwrap(), json!({"v": "1", "left": "L", "right": "R"}));
        assert_eq!(doc.generation(), 3);
    }

    #[test]
    fn test_has_revision_counts_pruned_generations() {
        let temp = TempDir::new().unwrap();
        let config = DatabaseConfig {
            expiration_sweep_interval_secs: 0,
            max_revision_tree_depth: 1,
            ..DatabaseConfig::in_directory(temp.path())
        };
        let db = Database::open_named("p", config).unwrap();
        let first = save(&db, "d", json!({"v": 0}));
        update(&db, "d", "v", "1");
        db.compact().unwrap();
        assert!(db.has_revision("d", first.revision_id().unwrap()));
        assert!(!db.has_revision("missing", first.revision_id().unwrap()));
    }
}
