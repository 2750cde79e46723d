//! CommitId - Totally ordered commit identity
//!
//! - Totally orders all commits of one database
//! - Assigned by the single writer, recorded in the journal's commit record
//! - Survives replay unchanged
//! - Independent of wall-clock time

use std::fmt;

/// Identity of one committed transaction
///
/// Commit 0 is the empty database before any transaction.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CommitId(u64);

impl CommitId {
    /// State of a freshly created database
    pub const INITIAL: CommitId = CommitId(0);

    #[inline]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The commit that follows this one
    #[inline]
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "commit#{}", self.0)
    }
}
