//! Replicator state machine
//!
//! ```text
//! Stopped -> Connecting -> Negotiating -> Syncing <-> Idle
//!                 any active state -> Failed
//!                 Failed -> Idle (waiting to retry) -> Connecting
//!                 any state -> Stopped
//! ```
//!
//! Transitions are methods that consume the current state and either
//! return the next one or fail with `IllegalTransition`.

use super::errors::{ReplicationError, ReplicationResult};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReplicatorState {
    #[default]
    Stopped,

    /// Opening a connection to the peer
    Connecting,

    /// Exchanging identities and checkpoints
    Negotiating,

    /// Transferring revisions
    Syncing,

    /// Caught up, or waiting before a retry
    Idle,

    /// The last attempt failed with this reason
    Failed(String),
}

impl ReplicatorState {
    pub fn connect(self) -> ReplicationResult<Self> {
        match self {
            Self::Stopped | Self::Idle => Ok(Self::Connecting),
            other => Err(illegal(&other, "connecting")),
        }
    }

    pub fn negotiate(self) -> ReplicationResult<Self> {
        match self {
            Self::Connecting => Ok(Self::Negotiating),
            other => Err(illegal(&other, "negotiating")),
        }
    }

    pub fn sync(self) -> ReplicationResult<Self> {
        match self {
            Self::Negotiating | Self::Idle | Self::Syncing => Ok(Self::Syncing),
            other => Err(illegal(&other, "syncing")),
        }
    }

    pub fn idle(self) -> ReplicationResult<Self> {
        match self {
            Self::Syncing | Self::Failed(_) | Self::Idle => Ok(Self::Idle),
            other => Err(illegal(&other, "idle")),
        }
    }

    pub fn fail(self, reason: impl Into<String>) -> ReplicationResult<Self> {
        match self {
            Self::Connecting | Self::Negotiating | Self::Syncing | Self::Idle => Ok(Self::Failed(reason.into())),
            other => Err(illegal(&other, "failed")),
        }
    }

    /// Valid from any state
    pub fn stop(self) -> Self {
        Self::Stopped
    }

    /// Whether the replicator task is running
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Stopped)
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Connecting => "connecting",
            Self::Negotiating => "negotiating",
            Self::Syncing => "syncing",
            Self::Idle => "idle",
            Self::Failed(_) => "failed",
        }
    }
}

fn illegal(from: &ReplicatorState, to: &str) -> ReplicationError {
    ReplicationError::illegal_transition(format!("cannot go from {} to {}", from.state_name(), to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replicator::ReplicationErrorKind;

    #[test]
    fn test_happy_path() {
        let state = ReplicatorState::default()
            .connect()
            .and_then(ReplicatorState::negotiate)
            .and_then(ReplicatorState::sync)
            .and_then(ReplicatorState::idle)
            .and_then(ReplicatorState::sync)
            .unwrap();
        assert_eq!(state, ReplicatorState::Syncing);
        assert_eq!(state.stop(), ReplicatorState::Stopped);
    }

    #[test]
    fn test_retry_path() {
        let state = ReplicatorState::Syncing
            .fail("connection reset")
            .and_then(ReplicatorState::idle)
            .and_then(ReplicatorState::connect)
            .unwrap();
        assert_eq!(state, ReplicatorState::Connecting);
    }

    #[test]
    fn test_illegal_transitions() {
        let err = ReplicatorState::Stopped.sync().unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::IllegalTransition);
        assert!(ReplicatorState::Stopped.fail("x").is_err());
        assert!(ReplicatorState::Connecting.idle().is_err());
        assert!(ReplicatorState::Failed("x".into()).connect().is_err());
    }
}
