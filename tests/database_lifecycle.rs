//! Database Lifecycle Tests
//!
//! Tests for:
//! - Saving, reloading and conflicting on documents
//! - Purge idempotence
//! - Journal torn tails and corruption on reopen
//! - Expiration, compaction and copies

use aerolite::database::{ConcurrencyControl, Database, DatabaseConfig, ErrorKind};
use aerolite::document::Document;
use aerolite::index::IndexDefinition;
use aerolite::storage::JOURNAL_FILE;
use aerolite::Value;
use chrono::{Duration, Utc};
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tempfile::TempDir;

// =============================================================================
// Test Utilities
// =============================================================================

fn config(temp: &TempDir) -> DatabaseConfig {
    DatabaseConfig {
        expiration_sweep_interval_secs: 0,
        ..DatabaseConfig::in_directory(temp.path())
    }
}

fn db_path(temp: &TempDir) -> PathBuf {
    temp.path().join("app.aerolite")
}

fn open(temp: &TempDir) -> Database {
    Database::open(db_path(temp), config(temp)).expect("open database")
}

fn save_json(db: &Database, id: &str, body: serde_json::Value) -> Document {
    let mut doc = Document::from_json(id, &body).unwrap();
    db.save_document(&mut doc, ConcurrencyControl::FailOnConflict).unwrap();
    doc
}

// =============================================================================
// Documents
// =============================================================================

#[test]
fn test_save_then_update_at_loaded_revision() {
    let temp = TempDir::new().unwrap();
    let db = open(&temp);

    let doc = save_json(&db, "doc1", json!({"name": "A"}));
    assert_eq!(doc.sequence(), 1);
    assert_eq!(doc.generation(), 1);

    let mut loaded = db.get_document("doc1").unwrap().unwrap();
    loaded.set("name", "B").unwrap();
    db.save_document(&mut loaded, ConcurrencyControl::FailOnConflict).unwrap();
    assert_eq!(loaded.generation(), 2);

    let current = db.get_document("doc1").unwrap().unwrap();
    assert_eq!(current.get("name").unwrap(), Some(Value::from("B")));
    assert_eq!(current.revision_id(), loaded.revision_id());
}

#[test]
fn test_stale_save_fails_and_leaves_storage_unchanged() {
    let temp = TempDir::new().unwrap();
    let db = open(&temp);
    save_json(&db, "doc", json!({"v": 1}));

    let mut stale = db.get_document("doc").unwrap().unwrap();
    let mut fresh = db.get_document("doc").unwrap().unwrap();
    fresh.set("v", 2i64).unwrap();
    db.save_document(&mut fresh, ConcurrencyControl::FailOnConflict).unwrap();

    let sequence = db.last_sequence();
    let journal_len = fs::metadata(db_path(&temp).join(JOURNAL_FILE)).unwrap().len();

    stale.set("v", 3i64).unwrap();
    let err = db
        .save_document(&mut stale, ConcurrencyControl::FailOnConflict)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(db.last_sequence(), sequence);
    assert_eq!(
        fs::metadata(db_path(&temp).join(JOURNAL_FILE)).unwrap().len(),
        journal_len
    );

    // last write wins builds on whatever is current
    db.save_document(&mut stale, ConcurrencyControl::LastWriteWins).unwrap();
    assert_eq!(stale.generation(), 3);
}

#[test]
fn test_delete_leaves_tombstone_and_purge_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let db = open(&temp);
    save_json(&db, "gone", json!({"v": 1}));

    db.delete_document("gone").unwrap();
    assert!(db.get_document("gone").unwrap().is_none());
    assert!(db.snapshot().current_revision("gone").is_some());

    db.purge_document("gone").unwrap();
    assert!(db.snapshot().current_revision("gone").is_none());
    let sequence = db.last_sequence();
    db.purge_document("gone").unwrap();
    assert_eq!(db.last_sequence(), sequence);
}

#[test]
fn test_transaction_commits_all_or_nothing() {
    let temp = TempDir::new().unwrap();
    let db = open(&temp);

    let result: Result<(), _> = db.in_transaction(|txn| {
        let mut a = Document::new("a");
        txn.save_document(&mut a, ConcurrencyControl::FailOnConflict)?;
        let mut bad = Document::new("");
        txn.save_document(&mut bad, ConcurrencyControl::FailOnConflict)
    });
    assert!(result.is_err());
    assert!(db.get_document("a").unwrap().is_none());

    db.in_transaction(|txn| {
        for id in ["a", "b"] {
            let mut doc = Document::new(id);
            txn.save_document(&mut doc, ConcurrencyControl::FailOnConflict)?;
        }
        Ok(())
    })
    .unwrap();
    assert_eq!(db.count(), 2);
}

// =============================================================================
// Journal Recovery
// =============================================================================

#[test]
fn test_torn_tail_is_discarded_on_reopen() {
    let temp = TempDir::new().unwrap();
    {
        let db = open(&temp);
        save_json(&db, "kept", json!({"v": 1}));
        db.close().unwrap();
    }

    // a frame that announces more bytes than were written
    let journal = db_path(&temp).join(JOURNAL_FILE);
    let clean_len = fs::metadata(&journal).unwrap().len();
    let mut file = OpenOptions::new().append(true).open(&journal).unwrap();
    file.write_all(&[200, 0, 0, 0, 1, 9, 9]).unwrap();
    drop(file);

    let db = open(&temp);
    assert!(db.get_document("kept").unwrap().is_some());
    assert_eq!(fs::metadata(&journal).unwrap().len(), clean_len);

    save_json(&db, "after", json!({"v": 2}));
    db.close().unwrap();
    let db = open(&temp);
    assert_eq!(db.count(), 2);
}

#[test]
fn test_flipped_byte_in_committed_record_fails_open() {
    let temp = TempDir::new().unwrap();
    {
        let db = open(&temp);
        save_json(&db, "a", json!({"v": 1}));
        save_json(&db, "b", json!({"v": 2}));
        db.close().unwrap();
    }

    let journal = db_path(&temp).join(JOURNAL_FILE);
    let mut bytes = fs::read(&journal).unwrap();
    // inside the header frame's payload, well before the end
    bytes[6] ^= 0xFF;
    fs::write(&journal, bytes).unwrap();

    let err = Database::open(db_path(&temp), config(&temp)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptData);
    assert!(err.is_fatal());
}

#[test]
fn test_identity_and_indexes_survive_reopen() {
    let temp = TempDir::new().unwrap();
    let uuid;
    {
        let db = open(&temp);
        uuid = db.uuid();
        db.create_index("by_city", IndexDefinition::value(["city"])).unwrap();
        save_json(&db, "p1", json!({"city": "Oslo"}));
        save_json(&db, "p2", json!({"city": "Lima"}));
        db.close().unwrap();
    }
    let db = open(&temp);
    assert_eq!(db.uuid(), uuid);
    assert_eq!(db.index_names(), vec!["by_city".to_string()]);
    assert_eq!(
        db.query_index("by_city", &[Value::from("Oslo")]).unwrap(),
        vec!["p1".to_string()]
    );
}

// =============================================================================
// Expiration, Compaction, Copy
// =============================================================================

#[test]
fn test_expired_documents_are_purged() {
    let temp = TempDir::new().unwrap();
    let db = open(&temp);
    save_json(&db, "session", json!({"token": "t"}));
    save_json(&db, "profile", json!({"name": "n"}));

    let past = Utc::now() - Duration::seconds(5);
    db.set_document_expiration("session", Some(past)).unwrap();
    assert_eq!(
        db.get_document_expiration("session").unwrap().map(|t| t.timestamp_millis()),
        Some(past.timestamp_millis())
    );

    assert_eq!(db.purge_expired(Utc::now()).unwrap(), 1);
    assert!(db.snapshot().current_revision("session").is_none());
    assert!(db.get_document("profile").unwrap().is_some());
    assert_eq!(db.purge_expired(Utc::now()).unwrap(), 0);
}

#[test]
fn test_compaction_keeps_current_content() {
    let temp = TempDir::new().unwrap();
    let db = Database::open(
        db_path(&temp),
        DatabaseConfig {
            max_revision_tree_depth: 4,
            ..config(&temp)
        },
    )
    .unwrap();
    let mut doc = Document::new("log");
    for i in 0..20 {
        doc.set("entry", i as i64).unwrap();
        db.save_document(&mut doc, ConcurrencyControl::FailOnConflict).unwrap();
    }

    let report = db.compact().unwrap();
    assert_eq!(report.revisions_pruned, 16);
    db.close().unwrap();

    let db = open(&temp);
    let doc = db.get_document("log").unwrap().unwrap();
    assert_eq!(doc.get("entry").unwrap(), Some(Value::from(19i64)));
    assert_eq!(doc.generation(), 20);
}

#[test]
fn test_copy_is_an_independent_database() {
    let temp = TempDir::new().unwrap();
    let db = open(&temp);
    save_json(&db, "a", json!({"v": 1}));

    let dest = temp.path().join("copy.aerolite");
    db.copy_to(&dest).unwrap();
    let copy = Database::open(&dest, config(&temp)).unwrap();
    assert_ne!(copy.uuid(), db.uuid());
    assert!(copy.get_document("a").unwrap().is_some());

    save_json(&copy, "b", json!({"v": 2}));
    assert!(db.get_document("b").unwrap().is_none());
    assert!(db.copy_to(&dest).is_err());
}
