//! Database handle
//!
//! `Database` is a cheap, cloneable handle. Reads take the current
//! snapshot and never wait for the writer; writes go through a
//! `Transaction`, which holds the single writer lock.
//!
//! # Layout
//!
//! ```text
//! <name>.aerolite/
//!   journal.log     committed transactions
//!   blobs/          attachment contents, one file per digest
//! ```
//!
//! # Open
//!
//! 1. Replay the journal; only committed batches are applied
//! 2. Truncate any torn tail
//! 3. Write a header if the journal is new
//! 4. Rebuild index contents as part of replay
//! 5. Start the expiration sweeper

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::blob::{BlobRef, BlobStore};
use crate::codec::Value;
use crate::document::Document;
use crate::index::IndexDefinition;
use crate::mvcc::{replay_error, DatabaseState, Snapshot};
use crate::notify::{DatabaseChange, DocumentChange, ListenerRegistry, ListenerToken};
use crate::observability::{Event, Logger, MetricsRegistry};
use crate::storage::{self, JournalRecord, JournalWriter, FORMAT_VERSION, JOURNAL_FILE};

use super::config::DatabaseConfig;
use super::errors::{DatabaseError, DbResult};
use super::expiration::Sweeper;
use super::transaction::{ConcurrencyControl, Transaction};

/// Directory extension of named databases
pub const DATABASE_EXTENSION: &str = "aerolite";

const BLOB_DIR: &str = "blobs";

pub(crate) struct WriterSlot {
    /// `None` once the database is closed
    pub(crate) journal: Option<JournalWriter>,
}

pub(crate) struct DatabaseInner {
    name: String,
    path: PathBuf,
    uuid: Uuid,
    config: DatabaseConfig,
    state: RwLock<Arc<DatabaseState>>,
    pub(crate) writer: Mutex<WriterSlot>,
    pub(crate) blobs: BlobStore,
    pub(crate) changes: ListenerRegistry<DatabaseChange>,
    pub(crate) metrics: Arc<MetricsRegistry>,
    closed: AtomicBool,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            sweeper.signal_stop();
        }
    }
}

#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("path", &self.inner.path)
            .field("uuid", &self.inner.uuid)
            .finish()
    }
}

impl Database {
    /// Opens (creating if needed) the database stored at `path`
    pub fn open(path: impl AsRef<Path>, config: DatabaseConfig) -> DbResult<Database> {
        config.validate()?;
        if config.encryption_key.is_some() {
            return Err(DatabaseError::Open(
                "encryption is not supported by this build".to_string(),
            ));
        }

        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)
            .map_err(|e| DatabaseError::Open(format!("cannot create {}: {}", path.display(), e)))?;
        let name = database_name(&path);
        let journal_path = path.join(JOURNAL_FILE);

        let replay = storage::replay(&journal_path).map_err(|e| {
            if e.is_fatal() {
                Logger::fatal(
                    Event::JournalCorruption.as_str(),
                    &[("database", &name), ("error", &e.to_string())],
                );
            }
            DatabaseError::from(e)
        })?;

        let mut state = DatabaseState::new();
        for batch in &replay.batches {
            for record in &batch.records {
                state
                    .apply(record)
                    .map_err(|e| replay_error(batch.commit_id, e))?;
            }
            state.apply(&JournalRecord::Commit {
                commit_id: batch.commit_id,
                last_sequence: batch.last_sequence,
            })?;
        }
        if replay.discarded_bytes > 0 {
            Logger::warn(
                Event::JournalTornTail.as_str(),
                &[
                    ("database", &name),
                    ("discarded_bytes", &replay.discarded_bytes.to_string()),
                ],
            );
        }

        let mut journal = JournalWriter::open(&journal_path, replay.valid_length)?;
        let uuid = match replay.database_uuid {
            Some(uuid) => uuid,
            None => {
                let uuid = Uuid::new_v4();
                journal.append(&[JournalRecord::Header {
                    database_uuid: uuid,
                    format_version: FORMAT_VERSION,
                }])?;
                uuid
            }
        };
        let blobs = BlobStore::open_local(path.join(BLOB_DIR))?;

        Logger::info(
            Event::JournalReplay.as_str(),
            &[
                ("batches", &replay.batches.len().to_string()),
                ("database", &name),
                ("last_sequence", &state.last_sequence().to_string()),
            ],
        );

        let db = Database {
            inner: Arc::new(DatabaseInner {
                name,
                path,
                uuid,
                state: RwLock::new(Arc::new(state)),
                writer: Mutex::new(WriterSlot {
                    journal: Some(journal),
                }),
                blobs,
                changes: ListenerRegistry::new(),
                metrics: Arc::new(MetricsRegistry::new()),
                closed: AtomicBool::new(false),
                sweeper: Mutex::new(None),
                config,
            }),
        };

        if db.inner.config.expiration_sweep_interval_secs > 0 {
            let sweeper = Sweeper::start(&db, db.inner.config.expiration_sweep_interval_secs)?;
            *db.inner.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(sweeper);
        }

        Logger::info(
            Event::DatabaseOpen.as_str(),
            &[
                ("database", db.name()),
                ("documents", &db.count().to_string()),
                ("path", &db.inner.path.display().to_string()),
            ],
        );
        Ok(db)
    }

    /// Opens `<config.directory>/<name>.aerolite`
    pub fn open_named(name: &str, config: DatabaseConfig) -> DbResult<Database> {
        let path = named_path(name, &config.directory)?;
        Database::open(path, config)
    }

    /// Whether a named database exists in `directory`
    pub fn exists(name: &str, directory: impl AsRef<Path>) -> bool {
        named_path(name, directory.as_ref())
            .map(|p| p.join(JOURNAL_FILE).is_file())
            .unwrap_or(false)
    }

    /// Deletes a named database that is not open
    pub fn delete_named(name: &str, directory: impl AsRef<Path>) -> DbResult<()> {
        let path = named_path(name, directory.as_ref())?;
        if !path.exists() {
            return Err(DatabaseError::NotFound(format!("database {}", name)));
        }
        fs::remove_dir_all(&path).map_err(|e| DatabaseError::Io(e.to_string()))?;
        Logger::info(Event::DatabaseDelete.as_str(), &[("database", name)]);
        Ok(())
    }

    pub(crate) fn inner(&self) -> &DatabaseInner {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<DatabaseInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<DatabaseInner>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Identity of this database, fixed at creation
    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> DbResult<()> {
        if self.is_closed() {
            Err(DatabaseError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn current_state(&self) -> Arc<DatabaseState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn publish(&self, state: Arc<DatabaseState>) {
        *self.inner.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// A consistent read view of the latest commit
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.current_state())
    }

    /// Number of live documents
    pub fn count(&self) -> usize {
        self.current_state().live_count()
    }

    pub fn last_sequence(&self) -> u64 {
        self.current_state().last_sequence()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.inner.metrics
    }

    pub(crate) fn blob_store(&self) -> &BlobStore {
        &self.inner.blobs
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    /// Current revision of a document; `None` if absent or deleted
    pub fn get_document(&self, doc_id: &str) -> DbResult<Option<Document>> {
        self.ensure_open()?;
        self.current_state().get_document(doc_id)
    }

    pub fn begin_transaction(&self) -> DbResult<Transaction<'_>> {
        self.ensure_open()?;
        Transaction::begin(self)
    }

    /// Runs `f` in a transaction, committing on `Ok` and aborting on `Err`
    pub fn in_transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> DbResult<T>,
    {
        let mut txn = self.begin_transaction()?;
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }

    /// Saves a document in its own transaction
    ///
    /// On success the document carries its new revision ID and sequence;
    /// on failure it is left as it was.
    pub fn save_document(&self, doc: &mut Document, control: ConcurrencyControl) -> DbResult<()> {
        let before = doc.clone();
        let result = self.in_transaction(|txn| txn.save_document(doc, control));
        if result.is_err() {
            *doc = before;
        }
        result
    }

    pub fn delete_document(&self, doc_id: &str) -> DbResult<()> {
        self.in_transaction(|txn| txn.delete_document(doc_id))
    }

    /// Removes a document and its history locally; never replicated
    pub fn purge_document(&self, doc_id: &str) -> DbResult<()> {
        self.in_transaction(|txn| txn.purge_document(doc_id))
    }

    pub fn set_document_expiration(&self, doc_id: &str, expiration: Option<DateTime<Utc>>) -> DbResult<()> {
        self.in_transaction(|txn| txn.set_document_expiration(doc_id, expiration))
    }

    pub fn get_document_expiration(&self, doc_id: &str) -> DbResult<Option<DateTime<Utc>>> {
        self.ensure_open()?;
        self.current_state()
            .entry(doc_id)
            .map(|e| e.expiration())
            .ok_or_else(|| DatabaseError::NotFound(format!("document {}", doc_id)))
    }

    /// Purges documents whose expiration is at or before `now`
    pub fn purge_expired(&self, now: DateTime<Utc>) -> DbResult<usize> {
        if self.current_state().expired_at(now).is_empty() {
            return Ok(0);
        }
        let purged = self.in_transaction(|txn| txn.purge_expired(now))?;
        if purged > 0 {
            Logger::info(
                Event::ExpirationSweep.as_str(),
                &[("database", self.name()), ("purged", &purged.to_string())],
            );
        }
        Ok(purged)
    }

    // ------------------------------------------------------------------
    // Indexes
    // ------------------------------------------------------------------

    pub fn create_index(&self, name: &str, definition: IndexDefinition) -> DbResult<()> {
        self.in_transaction(|txn| txn.create_index(name, definition))
    }

    pub fn delete_index(&self, name: &str) -> DbResult<bool> {
        self.in_transaction(|txn| txn.delete_index(name))
    }

    pub fn index_names(&self) -> Vec<String> {
        self.current_state().indexes().names()
    }

    /// IDs of documents whose indexed values equal `values`
    pub fn query_index(&self, name: &str, values: &[Value]) -> DbResult<Vec<String>> {
        self.ensure_open()?;
        Ok(self.current_state().indexes().lookup_eq(name, values)?)
    }

    /// IDs of documents whose indexed values fall in `[low, high]`
    pub fn query_index_range(
        &self,
        name: &str,
        low: Option<&[Value]>,
        high: Option<&[Value]>,
    ) -> DbResult<Vec<String>> {
        self.ensure_open()?;
        Ok(self.current_state().indexes().lookup_range(name, low, high)?)
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Calls `listener` once per commit, after the commit is durable
    pub fn add_change_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&DatabaseChange) + Send + Sync + 'static,
    {
        self.inner.changes.add(listener)
    }

    /// Calls `listener` for each commit that changes `doc_id`
    pub fn add_document_listener<F>(&self, doc_id: &str, listener: F) -> ListenerToken
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        let doc_id = doc_id.to_string();
        self.inner.changes.add(move |change: &DatabaseChange| {
            if change.contains(&doc_id) {
                listener(&DocumentChange {
                    doc_id: doc_id.clone(),
                    source: change.source,
                });
            }
        })
    }

    // ------------------------------------------------------------------
    // Blobs
    // ------------------------------------------------------------------

    /// Stores blob content; reference it from a document to keep it
    pub fn save_blob(&self, content: &[u8], content_type: Option<&str>) -> DbResult<BlobRef> {
        self.ensure_open()?;
        let blob = self.inner.blobs.store(content, content_type)?;
        self.inner.metrics.increment_blobs_stored();
        Ok(blob)
    }

    pub fn blob_content(&self, blob: &BlobRef) -> DbResult<Vec<u8>> {
        self.ensure_open()?;
        Ok(self.inner.blobs.load(&blob.digest)?)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Closes the database; every handle sees it closed
    ///
    /// Waits for an open transaction to finish. Closing twice is a no-op.
    pub fn close(&self) -> DbResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.stop();
        }
        self.inner
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .journal
            .take();
        Logger::info(Event::DatabaseClose.as_str(), &[("database", self.name())]);
        Ok(())
    }

    /// Closes the database and removes its files
    pub fn delete(&self) -> DbResult<()> {
        self.close()?;
        fs::remove_dir_all(&self.inner.path).map_err(|e| DatabaseError::Io(e.to_string()))?;
        Logger::info(Event::DatabaseDelete.as_str(), &[("database", self.name())]);
        Ok(())
    }

    /// Writes a consistent copy of this database to `dest`
    ///
    /// The copy gets a new UUID and no replication checkpoints, so
    /// replicators treat it as a different database.
    pub fn copy_to(&self, dest: impl AsRef<Path>) -> DbResult<()> {
        self.ensure_open()?;
        let dest = dest.as_ref();
        if dest.exists() {
            return Err(DatabaseError::InvalidArgument(format!(
                "{} already exists",
                dest.display()
            )));
        }

        // holding the writer keeps the state and blobs in step
        let _writer = self.inner.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let state = self.current_state();

        fs::create_dir_all(dest.join(BLOB_DIR)).map_err(|e| DatabaseError::Io(e.to_string()))?;
        let mut records = vec![JournalRecord::Header {
            database_uuid: Uuid::new_v4(),
            format_version: FORMAT_VERSION,
        }];
        records.extend(
            state
                .to_records()
                .into_iter()
                .filter(|r| !matches!(r, JournalRecord::Checkpoint { .. })),
        );
        records.push(JournalRecord::Commit {
            commit_id: state.last_commit().value(),
            last_sequence: state.last_sequence(),
        });
        storage::write_file(&dest.join(JOURNAL_FILE), &records)?;

        let target = BlobStore::open_local(dest.join(BLOB_DIR))?;
        for digest in self.inner.blobs.digests()? {
            let content = self.inner.blobs.load(&digest)?;
            target.store_expecting(&digest, &content)?;
        }

        Logger::info(
            Event::DatabaseCopy.as_str(),
            &[("database", self.name()), ("dest", &dest.display().to_string())],
        );
        Ok(())
    }
}

fn named_path(name: &str, directory: &Path) -> DbResult<PathBuf> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(DatabaseError::InvalidArgument(format!("invalid database name {:?}", name)));
    }
    Ok(directory.join(format!("{}.{}", name, DATABASE_EXTENSION)))
}

fn database_name(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match file_name.strip_suffix(&format!(".{}", DATABASE_EXTENSION)) {
        Some(stem) => stem.to_string(),
        None => file_name,
    }
}
