//! MVCC for aerolite
//!
//! Readers and the single writer never block each other. The committed
//! state is an immutable value; a commit publishes a new one by swapping
//! an `Arc`, and readers keep whatever state they started with.
//!
//! - `CommitId` - Totally ordered commit identity
//! - `DatabaseState` - Committed state, built by applying journal records
//! - `Snapshot` - Stable read view over one state

mod commit_id;
mod snapshot;
mod state;

pub use commit_id::CommitId;
pub use snapshot::Snapshot;
pub use state::{DatabaseState, DocumentEntry};

pub(crate) use state::replay_error;
