//! Compaction
//!
//! Prunes every revision tree to the configured depth, drops the bodies of
//! interior revisions, rewrites the journal as a single committed batch
//! and deletes blobs that no surviving revision references.
//!
//! # Invariants
//!
//! - Current revisions, conflicting leaves and their bodies are kept
//! - The rewritten journal replays to exactly the published state
//! - Commit and sequence numbering continue from where they were

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError};

use serde::Serialize;

use crate::blob::BlobRef;
use crate::codec;
use crate::mvcc::DatabaseState;
use crate::observability::{Event, Logger, ObservationScope, COMPACTION};
use crate::storage::{JournalRecord, FORMAT_VERSION};

use super::database::Database;
use super::errors::{DatabaseError, DbResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub revisions_pruned: usize,
    pub bytes_released: usize,
    pub journal_bytes_before: u64,
    pub journal_bytes_after: u64,
    pub blobs_deleted: usize,
}

impl Database {
    /// Compacts the database in place
    ///
    /// Blocks writers for the duration of the journal rewrite; readers
    /// keep using the previous snapshot until the new one is published.
    pub fn compact(&self) -> DbResult<CompactionReport> {
        self.ensure_open()?;
        let scope = ObservationScope::new(COMPACTION, &[("database", self.name())]);
        match self.compact_inner() {
            Ok(report) => {
                self.metrics().increment_compactions();
                scope.complete(&[
                    ("blobs_deleted", &report.blobs_deleted.to_string()),
                    ("bytes_released", &report.bytes_released.to_string()),
                    ("journal_bytes_after", &report.journal_bytes_after.to_string()),
                    ("revisions_pruned", &report.revisions_pruned.to_string()),
                ]);
                Ok(report)
            }
            Err(e) => {
                scope.fail(&e.to_string());
                Err(e)
            }
        }
    }

    fn compact_inner(&self) -> DbResult<CompactionReport> {
        let mut report = CompactionReport::default();
        let max_depth = self.config().max_revision_tree_depth;

        let state = {
            let mut writer = self.inner().writer.lock().unwrap_or_else(PoisonError::into_inner);
            let journal = writer.journal.as_mut().ok_or(DatabaseError::Closed)?;
            report.journal_bytes_before = journal.current_offset();

            let mut state = (*self.current_state()).clone();
            let doc_ids: Vec<String> = state.entries().map(|(id, _)| id.clone()).collect();
            for doc_id in doc_ids {
                let Some(entry) = state.entry(&doc_id) else {
                    continue;
                };
                let mut tree = entry.tree.clone();
                let pruned = tree.prune(max_depth);
                let released = tree.drop_interior_bodies();
                if pruned > 0 || released > 0 {
                    report.revisions_pruned += pruned;
                    report.bytes_released += released;
                    state.replace_tree(&doc_id, tree);
                }
            }

            let mut records = vec![JournalRecord::Header {
                database_uuid: self.uuid(),
                format_version: FORMAT_VERSION,
            }];
            records.extend(state.to_records());
            records.push(JournalRecord::Commit {
                commit_id: state.last_commit().value(),
                last_sequence: state.last_sequence(),
            });
            report.journal_bytes_after = journal.rewrite(&records)?;

            let state = Arc::new(state);
            self.publish(state.clone());
            state
        };

        let referenced = referenced_blobs(&state)?;
        report.blobs_deleted = self.blob_store().collect_garbage(&referenced)?;
        if report.blobs_deleted > 0 {
            Logger::info(
                Event::BlobGarbageCollected.as_str(),
                &[
                    ("database", self.name()),
                    ("deleted", &report.blobs_deleted.to_string()),
                ],
            );
        }
        Ok(report)
    }
}

/// Digests referenced by any revision that still has a body
fn referenced_blobs(state: &DatabaseState) -> DbResult<BTreeSet<String>> {
    let mut blobs = Vec::new();
    for (_, entry) in state.entries() {
        for node in entry.tree.iter() {
            if let Some(body) = &node.body {
                BlobRef::collect(&codec::decode(body)?, &mut blobs);
            }
        }
    }
    Ok(blobs.into_iter().map(|b| b.digest).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ConcurrencyControl, DatabaseConfig};
    use crate::document::Document;
    use tempfile::TempDir;

    fn open(temp: &TempDir, depth: usize) -> Database {
        let config = DatabaseConfig {
            expiration_sweep_interval_secs: 0,
            max_revision_tree_depth: depth,
            ..DatabaseConfig::in_directory(temp.path())
        };
        Database::open(temp.path().join("db"), config).unwrap()
    }

    #[test]
    fn test_compaction_prunes_history() {
        let temp = TempDir::new().unwrap();
        let db = open(&temp, 3);
        let mut doc = Document::new("counter");
        for i in 0..10 {
            doc.set("n", i as i64).unwrap();
            db.save_document(&mut doc, ConcurrencyControl::FailOnConflict).unwrap();
        }
        let current = doc.revision_id().cloned();

        let report = db.compact().unwrap();
        assert_eq!(report.revisions_pruned, 7);
        assert!(report.journal_bytes_after < report.journal_bytes_before);

        let entry = db.current_state().entry("counter").unwrap().clone();
        assert_eq!(entry.tree.len(), 3);
        assert_eq!(db.get_document("counter").unwrap().unwrap().revision_id().cloned(), current);
        assert_eq!(db.metrics().snapshot().compactions, 1);
    }

    #[test]
    fn test_compacted_journal_replays() {
        let temp = TempDir::new().unwrap();
        let sequence;
        {
            let db = open(&temp, 2);
            let mut doc = Document::new("a");
            for i in 0..5 {
                doc.set("n", i as i64).unwrap();
                db.save_document(&mut doc, ConcurrencyControl::FailOnConflict).unwrap();
            }
            db.compact().unwrap();
            // writes after compaction keep numbering
            doc.set("n", 99i64).unwrap();
            db.save_document(&mut doc, ConcurrencyControl::FailOnConflict).unwrap();
            sequence = db.last_sequence();
            db.close().unwrap();
        }
        let db = open(&temp, 2);
        assert_eq!(db.last_sequence(), sequence);
        let doc = db.get_document("a").unwrap().unwrap();
        assert_eq!(doc.generation(), 6);
        assert_eq!(doc.sequence(), sequence);
    }

    #[test]
    fn test_unreferenced_blobs_collected() {
        let temp = TempDir::new().unwrap();
        let db = open(&temp, 5);
        let kept = db.save_blob(b"kept", None).unwrap();
        let orphan = db.save_blob(b"orphan", None).unwrap();
        let mut doc = Document::new("a");
        doc.set_blob("file", &kept).unwrap();
        db.save_document(&mut doc, ConcurrencyControl::FailOnConflict).unwrap();

        // freshly stored blobs survive one collection
        assert_eq!(db.compact().unwrap().blobs_deleted, 0);
        assert_eq!(db.compact().unwrap().blobs_deleted, 1);
        assert!(db.blob_content(&kept).is_ok());
        assert!(db.blob_content(&orphan).is_err());
    }
}
