//! Observability events for aerolite
//!
//! Every log line names one of these events. Events are explicit and typed.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Database lifecycle
    DatabaseOpen,
    DatabaseClose,
    DatabaseDelete,
    DatabaseCopy,

    // Journal
    JournalReplay,
    /// Uncommitted bytes dropped from the end of the journal
    JournalTornTail,
    /// Committed data failed verification (FATAL)
    JournalCorruption,

    // Transactions
    TransactionCommit,
    TransactionAbort,

    // Maintenance
    CompactionBegin,
    CompactionComplete,
    CompactionFailed,
    ExpirationSweep,
    BlobGarbageCollected,

    // Replication
    ReplicatorStateChange,
    ReplicatorRetry,
    ReplicatorStopped,
    CheckpointSaved,
    CheckpointReset,
    ConflictResolved,
    DocumentRejected,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::DatabaseOpen => "DATABASE_OPEN",
            Event::DatabaseClose => "DATABASE_CLOSE",
            Event::DatabaseDelete => "DATABASE_DELETE",
            Event::DatabaseCopy => "DATABASE_COPY",

            Event::JournalReplay => "JOURNAL_REPLAY",
            Event::JournalTornTail => "JOURNAL_TORN_TAIL",
            Event::JournalCorruption => "JOURNAL_CORRUPTION",

            Event::TransactionCommit => "TRANSACTION_COMMIT",
            Event::TransactionAbort => "TRANSACTION_ABORT",

            Event::CompactionBegin => "COMPACTION_BEGIN",
            Event::CompactionComplete => "COMPACTION_COMPLETE",
            Event::CompactionFailed => "COMPACTION_FAILED",
            Event::ExpirationSweep => "EXPIRATION_SWEEP",
            Event::BlobGarbageCollected => "BLOB_GC",

            Event::ReplicatorStateChange => "REPLICATOR_STATE_CHANGE",
            Event::ReplicatorRetry => "REPLICATOR_RETRY",
            Event::ReplicatorStopped => "REPLICATOR_STOPPED",
            Event::CheckpointSaved => "CHECKPOINT_SAVED",
            Event::CheckpointReset => "CHECKPOINT_RESET",
            Event::ConflictResolved => "CONFLICT_RESOLVED",
            Event::DocumentRejected => "DOCUMENT_REJECTED",
        }
    }

    /// Returns true if this event indicates data that can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::JournalCorruption)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_upper_snake() {
        let events = [
            Event::DatabaseOpen,
            Event::JournalTornTail,
            Event::TransactionCommit,
            Event::CompactionComplete,
            Event::BlobGarbageCollected,
            Event::ReplicatorRetry,
            Event::DocumentRejected,
        ];
        for event in events {
            let s = event.as_str();
            assert!(!s.is_empty());
            assert!(s.chars().all(|c| c.is_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_fatal_events() {
        assert!(Event::JournalCorruption.is_fatal());
        assert!(!Event::TransactionCommit.is_fatal());
    }
}
