//! Replicator status and listener events

use super::errors::ReplicationError;
use super::state::ReplicatorState;

/// Coarse activity, as reported to applications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivityLevel {
    #[default]
    Stopped,
    /// Waiting to retry, suspended or host unreachable
    Offline,
    Connecting,
    Idle,
    Busy,
}

impl ActivityLevel {
    pub fn from_state(state: &ReplicatorState, offline: bool) -> Self {
        match state {
            ReplicatorState::Stopped => Self::Stopped,
            _ if offline => Self::Offline,
            ReplicatorState::Connecting | ReplicatorState::Negotiating => Self::Connecting,
            ReplicatorState::Syncing => Self::Busy,
            ReplicatorState::Idle => Self::Idle,
            ReplicatorState::Failed(_) => Self::Offline,
        }
    }
}

/// Documents transferred against documents known to need transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub completed: u64,
    pub document_count: u64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplicatorStatus {
    pub activity: ActivityLevel,
    pub progress: Progress,
    /// Last error; cleared by the next successful cycle
    pub error: Option<ReplicationError>,
}

/// Posted to change listeners on every status update
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatorChange {
    pub status: ReplicatorStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatedDocument {
    pub doc_id: String,
    pub rev_id: String,
    pub deleted: bool,
    /// Why the document did not replicate, if it did not
    pub error: Option<ReplicationError>,
}

/// Posted to document listeners once per transferred batch
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentReplication {
    pub direction: Direction,
    pub documents: Vec<ReplicatedDocument>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_mapping() {
        assert_eq!(ActivityLevel::from_state(&ReplicatorState::Stopped, true), ActivityLevel::Stopped);
        assert_eq!(ActivityLevel::from_state(&ReplicatorState::Idle, true), ActivityLevel::Offline);
        assert_eq!(ActivityLevel::from_state(&ReplicatorState::Negotiating, false), ActivityLevel::Connecting);
        assert_eq!(ActivityLevel::from_state(&ReplicatorState::Syncing, false), ActivityLevel::Busy);
        assert_eq!(
            ActivityLevel::from_state(&ReplicatorState::Failed("x".into()), false),
            ActivityLevel::Offline
        );
    }
}
