//! Database
//!
//! The public storage API: open and lifecycle, transactions, documents,
//! indexes, expiration, compaction, listeners, blobs and the operations
//! replication is built on.
//!
//! # Design Principles
//!
//! - Readers never wait for writers
//! - One writer at a time, for the whole life of a transaction
//! - Nothing is visible until it is durable

mod compaction;
mod config;
#[allow(clippy::module_inception)]
mod database;
mod errors;
mod expiration;
mod replication;
mod transaction;

pub use compaction::CompactionReport;
pub use config::{DatabaseConfig, EncryptionKey};
pub use database::{Database, DATABASE_EXTENSION};
pub use errors::{DatabaseError, DbResult, ErrorKind};
pub use replication::{ApplyReport, ChangeEntry, RevisionTransfer};
pub use transaction::{ConcurrencyControl, Transaction};
