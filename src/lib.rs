//! aerolite - An embedded document database with peer-to-peer sync
//!
//! Documents are schemaless dicts stored in a compact binary encoding and
//! versioned by revision trees. Every commit is appended to a checksummed
//! journal; readers see immutable snapshots. A replicator keeps a
//! database in sync with a peer, pushing and pulling revisions and the
//! blobs they reference.

pub mod blob;
pub mod codec;
pub mod database;
pub mod document;
pub mod error;
pub mod index;
pub mod mvcc;
pub mod notify;
pub mod observability;
pub mod replicator;
pub mod storage;

pub use blob::BlobRef;
pub use codec::{Dict, Value};
pub use database::{ConcurrencyControl, Database, DatabaseConfig, DatabaseError, DbResult, Transaction};
pub use document::{ConflictResolver, DefaultConflictResolver, Document, Resolution, Revision, RevisionId};
pub use notify::{ChangeSource, DatabaseChange, DocumentChange, ListenerToken};
pub use replicator::{
    Replicator, ReplicatorConfiguration, ReplicatorStatus, ReplicatorType, ReplicationError, ReplicationResult,
};
