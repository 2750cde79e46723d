//! Journal storage for aerolite
//!
//! The journal is the single persistent record of a database: revisions,
//! purges, expirations, index definitions and replication checkpoints,
//! grouped into transactions closed by a commit record.
//!
//! # Design Principles
//!
//! - Append-only between compactions
//! - Checksum-verified on every read
//! - fsync before a commit is acknowledged
//! - Only committed batches are replayed
//! - Compaction replaces the file atomically
//!
//! # Crash behavior
//!
//! A crash mid-append leaves a torn tail, which replay ignores and the next
//! open truncates. Damage to committed data is fatal `AERO_DATA_CORRUPTION`.

mod errors;
mod reader;
mod record;
mod writer;

pub use errors::{StorageError, StorageErrorCode, StorageResult};
pub use reader::{replay, CommittedBatch, JournalReader, ReadOutcome, Replay};
pub use record::{JournalRecord, PurgeReason, RecordType, RevisionRecord, FORMAT_VERSION};
pub use writer::{write_file, JournalWriter, JOURNAL_FILE};
