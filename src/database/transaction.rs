//! Transactions
//!
//! A transaction owns the writer lock for its whole lifetime and builds the
//! next database state on a private copy of the current one. Nothing it
//! does is visible to readers until `commit` has appended its records and
//! the commit record to the journal, fsynced, and swapped the new state in.
//!
//! # Invariants
//!
//! - At most one transaction is open per database
//! - Records are applied to the working state as they are produced, so
//!   reads inside the transaction see its own writes
//! - The first failed operation poisons the transaction; commit then
//!   fails with `TransactionAborted` and writes nothing
//! - Dropping an uncommitted transaction aborts it

use std::collections::BTreeSet;
use std::sync::{Arc, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::codec;
use crate::document::{validate_id, Document, RevisionId};
use crate::index::IndexDefinition;
use crate::mvcc::{CommitId, DatabaseState};
use crate::notify::{ChangeSource, DatabaseChange};
use crate::observability::{Event, Logger};
use crate::storage::{JournalRecord, PurgeReason, RevisionRecord};

use super::database::{Database, WriterSlot};
use super::errors::{DatabaseError, DbResult};

/// How `save_document` treats a document changed since it was loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyControl {
    /// Fail with `Conflict` unless the document is saved on top of the
    /// revision it was loaded at
    #[default]
    FailOnConflict,
    /// Save as a child of whatever revision is current
    LastWriteWins,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    saved: u64,
    deleted: u64,
    purged: u64,
    expired: u64,
}

pub struct Transaction<'db> {
    db: &'db Database,
    writer: Option<MutexGuard<'db, WriterSlot>>,
    working: DatabaseState,
    records: Vec<JournalRecord>,
    changed: BTreeSet<String>,
    source: ChangeSource,
    failure: Option<String>,
    finished: bool,
    counts: Counts,
}

impl<'db> Transaction<'db> {
    pub(crate) fn begin(db: &'db Database) -> DbResult<Self> {
        let writer = db
            .inner()
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if writer.journal.is_none() {
            return Err(DatabaseError::Closed);
        }
        let working = (*db.current_state()).clone();
        Ok(Self {
            db,
            writer: Some(writer),
            working,
            records: Vec::new(),
            changed: BTreeSet::new(),
            source: ChangeSource::Local,
            failure: None,
            finished: false,
            counts: Counts::default(),
        })
    }

    pub(crate) fn set_source(&mut self, source: ChangeSource) {
        self.source = source;
    }

    /// State including this transaction's uncommitted writes
    pub(crate) fn working(&self) -> &DatabaseState {
        &self.working
    }

    pub fn database(&self) -> &Database {
        self.db
    }

    /// Whether an operation has failed and commit will be refused
    pub fn is_poisoned(&self) -> bool {
        self.failure.is_some()
    }

    /// Reads a document, including this transaction's own changes
    pub fn get_document(&self, doc_id: &str) -> DbResult<Option<Document>> {
        self.working.get_document(doc_id)
    }

    pub fn save_document(&mut self, doc: &mut Document, control: ConcurrencyControl) -> DbResult<()> {
        self.guard(|txn| {
            validate_id(doc.id())?;
            let body = doc.encoded_body()?;
            let current = txn
                .working
                .entry(doc.id())
                .and_then(|e| e.winner())
                .map(|w| (w.rev_id.clone(), w.deleted));

            let parent = match (control, current) {
                (ConcurrencyControl::FailOnConflict, None) => match doc.revision_id() {
                    None => None,
                    // loaded revision was purged underneath us
                    Some(loaded) => {
                        return Err(DatabaseError::Conflict {
                            doc_id: doc.id().to_string(),
                            expected: loaded.to_string(),
                            current: "none".to_string(),
                        })
                    }
                },
                (ConcurrencyControl::LastWriteWins, None) => None,
                (ConcurrencyControl::LastWriteWins, Some((current, _))) => Some(current),
                (ConcurrencyControl::FailOnConflict, Some((current, deleted))) => {
                    match doc.revision_id() {
                        Some(loaded) if *loaded == current => Some(current),
                        // a new document may replace a tombstone
                        None if deleted => Some(current),
                        loaded => {
                            return Err(DatabaseError::Conflict {
                                doc_id: doc.id().to_string(),
                                expected: loaded
                                    .map(ToString::to_string)
                                    .unwrap_or_else(|| "none".to_string()),
                                current: current.to_string(),
                            })
                        }
                    }
                }
            };

            let (rev, sequence) = txn.write_revision(doc.id(), parent, false, body.as_ref().clone())?;
            doc.mark_saved(rev, sequence, false);
            txn.counts.saved += 1;
            Ok(())
        })
    }

    /// Replaces the current revision with a tombstone
    pub fn delete_document(&mut self, doc_id: &str) -> DbResult<()> {
        self.guard(|txn| {
            let current = txn.current_live_revision(doc_id)?;
            txn.write_revision(doc_id, Some(current), true, codec::empty_dict())?;
            txn.counts.deleted += 1;
            Ok(())
        })
    }

    /// Removes a document and its whole history; absent IDs are ignored
    pub fn purge_document(&mut self, doc_id: &str) -> DbResult<()> {
        self.guard(|txn| {
            if txn.working.entry(doc_id).is_some() {
                txn.push(JournalRecord::Purge {
                    doc_id: doc_id.to_string(),
                    reason: PurgeReason::Manual,
                })?;
                txn.counts.purged += 1;
            }
            Ok(())
        })
    }

    pub fn set_document_expiration(&mut self, doc_id: &str, expiration: Option<DateTime<Utc>>) -> DbResult<()> {
        self.guard(|txn| {
            if txn.working.entry(doc_id).is_none() {
                return Err(DatabaseError::NotFound(format!("document {}", doc_id)));
            }
            txn.push(JournalRecord::Expiration {
                doc_id: doc_id.to_string(),
                expires_at: expiration.map(|at| at.timestamp_millis()),
            })
        })
    }

    /// Purges every document expired at `now`; returns how many
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> DbResult<usize> {
        self.guard(|txn| {
            let expired = txn.working.expired_at(now);
            for doc_id in &expired {
                let pulled = txn.working.entry(doc_id).map(|e| e.was_pulled()).unwrap_or(false);
                let reason = if pulled {
                    PurgeReason::ExpiredPulled
                } else {
                    PurgeReason::Expired
                };
                txn.push(JournalRecord::Purge {
                    doc_id: doc_id.clone(),
                    reason,
                })?;
            }
            txn.counts.expired += expired.len() as u64;
            Ok(expired.len())
        })
    }

    /// Creates or replaces an index; an identical definition is a no-op
    pub fn create_index(&mut self, name: &str, definition: IndexDefinition) -> DbResult<()> {
        self.guard(|txn| {
            definition.validate()?;
            if txn.working.indexes().definition(name) == Some(&definition) {
                return Ok(());
            }
            txn.push(JournalRecord::IndexCreate {
                name: name.to_string(),
                definition: definition.to_json(),
            })
        })
    }

    /// Drops an index; returns whether it existed
    pub fn delete_index(&mut self, name: &str) -> DbResult<bool> {
        self.guard(|txn| {
            if txn.working.indexes().definition(name).is_none() {
                return Ok(false);
            }
            txn.push(JournalRecord::IndexDelete { name: name.to_string() })?;
            Ok(true)
        })
    }

    pub(crate) fn set_checkpoint(&mut self, checkpoint_id: &str, body: &str) -> DbResult<()> {
        self.guard(|txn| {
            txn.push(JournalRecord::Checkpoint {
                checkpoint_id: checkpoint_id.to_string(),
                body: body.to_string(),
            })
        })
    }

    /// Stores a revision received from a peer, with its ancestry
    pub(crate) fn insert_remote_revision(
        &mut self,
        doc_id: &str,
        rev: &RevisionId,
        history: &[RevisionId],
        deleted: bool,
        body: Vec<u8>,
    ) -> DbResult<u64> {
        self.guard(|txn| {
            let sequence = txn.working.last_sequence() + 1;
            txn.push(JournalRecord::Revision(RevisionRecord {
                doc_id: doc_id.to_string(),
                rev_id: rev.to_string(),
                parent: history.first().map(ToString::to_string),
                history: history.iter().map(ToString::to_string).collect(),
                deleted,
                sequence,
                from_remote: true,
                body: Some(body),
            }))?;
            Ok(sequence)
        })
    }

    /// Stores a local revision as a child of `parent`
    pub(crate) fn insert_local_revision(
        &mut self,
        doc_id: &str,
        parent: &RevisionId,
        deleted: bool,
        body: Vec<u8>,
    ) -> DbResult<RevisionId> {
        self.guard(|txn| {
            let (rev, _) = txn.write_revision(doc_id, Some(parent.clone()), deleted, body)?;
            Ok(rev)
        })
    }

    /// Appends the transaction to the journal and publishes it
    pub fn commit(mut self) -> DbResult<CommitId> {
        self.finished = true;
        if let Some(reason) = self.failure.take() {
            Logger::warn(
                Event::TransactionAbort.as_str(),
                &[("database", self.db.name()), ("reason", &reason)],
            );
            return Err(DatabaseError::TransactionAborted(reason));
        }
        if self.records.is_empty() {
            return Ok(self.working.last_commit());
        }

        let commit_id = self.working.last_commit().next();
        let commit = JournalRecord::Commit {
            commit_id: commit_id.value(),
            last_sequence: self.working.last_sequence(),
        };
        self.working.apply(&commit)?;
        let mut batch = std::mem::take(&mut self.records);
        batch.push(commit);

        let mut writer = self.writer.take().ok_or(DatabaseError::Closed)?;
        let journal = writer.journal.as_mut().ok_or(DatabaseError::Closed)?;
        let bytes = journal.append(&batch)?;

        let state = Arc::new(std::mem::take(&mut self.working));
        let last_sequence = state.last_sequence();
        self.db.publish(state);

        let inner = self.db.inner();
        let change = DatabaseChange {
            doc_ids: std::mem::take(&mut self.changed).into_iter().collect(),
            source: self.source,
        };
        let changed_count = change.doc_ids.len();
        if changed_count > 0 {
            inner.changes.enqueue(change);
        }
        drop(writer);

        inner.metrics.record_commit(bytes);
        inner.metrics.add_documents_saved(self.counts.saved);
        inner.metrics.add_documents_deleted(self.counts.deleted);
        inner.metrics.add_documents_purged(self.counts.purged);
        inner.metrics.add_documents_expired(self.counts.expired);
        Logger::trace(
            Event::TransactionCommit.as_str(),
            &[
                ("commit_id", &commit_id.value().to_string()),
                ("database", self.db.name()),
                ("documents", &changed_count.to_string()),
                ("last_sequence", &last_sequence.to_string()),
            ],
        );

        inner.changes.flush();
        Ok(commit_id)
    }

    /// Discards every change made by this transaction
    pub fn abort(mut self) {
        self.finished = true;
        self.log_abort();
    }

    fn log_abort(&self) {
        if !self.records.is_empty() {
            Logger::trace(
                Event::TransactionAbort.as_str(),
                &[("database", self.db.name()), ("records", &self.records.len().to_string())],
            );
        }
    }

    /// Runs one operation, poisoning the transaction if it fails
    fn guard<T>(&mut self, op: impl FnOnce(&mut Self) -> DbResult<T>) -> DbResult<T> {
        if let Some(reason) = &self.failure {
            return Err(DatabaseError::TransactionAborted(reason.clone()));
        }
        let result = op(self);
        if let Err(e) = &result {
            self.failure = Some(e.to_string());
        }
        result
    }

    fn current_live_revision(&self, doc_id: &str) -> DbResult<RevisionId> {
        match self.working.entry(doc_id).and_then(|e| e.winner()) {
            Some(winner) if !winner.deleted => Ok(winner.rev_id.clone()),
            _ => Err(DatabaseError::NotFound(format!("document {}", doc_id))),
        }
    }

    fn write_revision(
        &mut self,
        doc_id: &str,
        parent: Option<RevisionId>,
        deleted: bool,
        body: Vec<u8>,
    ) -> DbResult<(RevisionId, u64)> {
        let rev = RevisionId::compute(parent.as_ref(), deleted, &body);
        let sequence = self.working.last_sequence() + 1;
        self.push(JournalRecord::Revision(RevisionRecord {
            doc_id: doc_id.to_string(),
            rev_id: rev.to_string(),
            parent: parent.as_ref().map(ToString::to_string),
            history: Vec::new(),
            deleted,
            sequence,
            from_remote: false,
            body: Some(body),
        }))?;
        Ok((rev, sequence))
    }

    fn push(&mut self, record: JournalRecord) -> DbResult<()> {
        if let Some(doc_id) = self.working.apply(&record)? {
            self.changed.insert(doc_id);
        }
        self.records.push(record);
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.log_abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::database::{DatabaseConfig, ErrorKind};
    use crate::notify::ChangeSource;
    use serde_json::json;
    use tempfile::TempDir;

    fn open(temp: &TempDir) -> Database {
        let config = DatabaseConfig {
            expiration_sweep_interval_secs: 0,
            ..DatabaseConfig::in_directory(temp.path())
        };
        Database::open(temp.path().join("db"), config).unwrap()
    }

    #[test]
    fn test_uncommitted_writes_are_invisible() {
        let temp = TempDir::new().unwrap();
        let db = open(&temp);

        let mut txn = db.begin_transaction().unwrap();
        let mut doc = Document::from_json("a", &json!({"n": 1})).unwrap();
        txn.save_document(&mut doc, ConcurrencyControl::FailOnConflict).unwrap();
        assert!(txn.get_document("a").unwrap().is_some());
        assert!(db.get_document("a").unwrap().is_none());

        txn.commit().unwrap();
        assert!(db.get_document("a").unwrap().is_some());
    }

    #[test]
    fn test_save_after_purge_needs_last_write_wins() {
        let temp = TempDir::new().unwrap();
        let db = open(&temp);
        let mut doc = Document::from_json("a", &json!({"n": 1})).unwrap();
        db.save_document(&mut doc, ConcurrencyControl::FailOnConflict).unwrap();
        doc.set("n", 2i64).unwrap();
        db.save_document(&mut doc, ConcurrencyControl::FailOnConflict).unwrap();

        let mut loaded = db.get_document("a").unwrap().unwrap();
        assert_eq!(loaded.generation(), 2);
        db.purge_document("a").unwrap();
        let sequence = db.last_sequence();

        loaded.set("n", 3i64).unwrap();
        let err = db
            .save_document(&mut loaded, ConcurrencyControl::FailOnConflict)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(db.get_document("a").unwrap().is_none());
        assert_eq!(db.last_sequence(), sequence);

        db.save_document(&mut loaded, ConcurrencyControl::LastWriteWins).unwrap();
        assert_eq!(loaded.generation(), 1);
        assert_eq!(db.get_document("a").unwrap().unwrap().get("n").unwrap(), Some(Value::Int(3)));
    }

    #[test]
    fn test_drop_aborts() {
        let temp = TempDir::new().unwrap();
        let db = open(&temp);
        {
            let mut txn = db.begin_transaction().unwrap();
            let mut doc = Document::new("a");
            txn.save_document(&mut doc, ConcurrencyControl::FailOnConflict).unwrap();
        }
        assert_eq!(db.count(), 0);
        assert_eq!(db.last_sequence(), 0);
    }

    #[test]
    fn test_failed_operation_poisons_commit() {
        let temp = TempDir::new().unwrap();
        let db = open(&temp);

        let mut txn = db.begin_transaction().unwrap();
        let mut doc = Document::new("a");
        txn.save_document(&mut doc, ConcurrencyControl::FailOnConflict).unwrap();
        assert!(txn.delete_document("missing").unwrap_err().is_not_found());
        assert!(txn.is_poisoned());

        let mut other = Document::new("b");
        let err = txn
            .save_document(&mut other, ConcurrencyControl::FailOnConflict)
            .unwrap_err();
        assert_eq!(err.kind(), crate::database::ErrorKind::TransactionAborted);

        let err = txn.commit().unwrap_err();
        assert_eq!(err.kind(), crate::database::ErrorKind::TransactionAborted);
        assert_eq!(db.count(), 0);
    }

    #[test]
    fn test_one_change_event_per_commit() {
        let temp = TempDir::new().unwrap();
        let db = open(&temp);
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let e = events.clone();
        let _token = db.add_change_listener(move |c| e.lock().unwrap().push(c.clone()));

        let mut txn = db.begin_transaction().unwrap();
        for id in ["b", "a"] {
            let mut doc = Document::new(id);
            txn.save_document(&mut doc, ConcurrencyControl::FailOnConflict).unwrap();
        }
        txn.commit().unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].doc_ids, vec!["a", "b"]);
        assert_eq!(events[0].source, ChangeSource::Local);
    }

    #[test]
    fn test_empty_commit_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let db = open(&temp);
        let before = db.metrics().snapshot().commits;
        db.begin_transaction().unwrap().commit().unwrap();
        assert_eq!(db.metrics().snapshot().commits, before);
    }
}
