//! Document & revision model
//!
//! Documents are versioned by a tree of revisions. Each save creates a
//! child of the current revision; replication may add sibling branches,
//! which makes the document conflicted until a resolver picks an outcome.

mod conflict;
mod doc;
mod errors;
mod rev_tree;
mod revision;

pub use conflict::{ConflictResolver, DefaultConflictResolver, Resolution, Revision};
pub use doc::{validate_id, Document, MAX_ID_LEN};
pub use errors::{DocumentError, DocumentResult};
pub use rev_tree::{InsertOutcome, RevTree, RevisionNode};
pub use revision::RevisionId;
