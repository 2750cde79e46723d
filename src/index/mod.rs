//! Value indexes for aerolite
//!
//! # Design Principles
//!
//! - Definitions are persistent, contents are derived
//! - Contents are rebuilt on open and maintained at commit
//! - Deterministic ordering (BTreeMap, sorted document IDs)
//! - Values are read lazily from encoded bodies
//!
//! Index lookups are the execution hook for a query layer; no query
//! language is parsed here.

mod btree;
mod errors;
mod manager;

pub use btree::{CompositeKey, IndexKey, IndexTree};
pub use errors::{IndexError, IndexErrorCode, IndexResult};
pub use manager::{CreateOutcome, IndexDefinition, IndexManager};
