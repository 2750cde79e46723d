//! Replication error types
//!
//! - Only network failures are transient; everything else stops the
//!   replicator without retry
//! - Errors travel between peers as `{kind, message}`

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::database::DatabaseError;

/// Replication error type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationError {
    pub kind: ReplicationErrorKind,
    pub message: String,
}

/// Replication error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationErrorKind {
    /// Peer unreachable, connection dropped or timed out
    Network,

    /// Credentials rejected
    Auth,

    /// Server certificate does not match the pinned one
    TlsTrust,

    /// Malformed or unexpected message
    Protocol,

    /// A revision or blob failed verification
    CorruptData,

    /// The local database refused an operation
    Database,

    /// Invalid replicator configuration
    Configuration,

    /// Illegal state transition attempted
    IllegalTransition,
}

impl ReplicationError {
    pub fn new(kind: ReplicationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::Network, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::Auth, message)
    }

    pub fn tls_trust(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::TlsTrust, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::Protocol, message)
    }

    pub fn corrupt_data(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::CorruptData, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::Database, message)
    }

    pub fn configuration_error(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::Configuration, message)
    }

    pub fn illegal_transition(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::IllegalTransition, message)
    }

    /// Whether retrying later may succeed
    pub fn is_transient(&self) -> bool {
        self.kind == ReplicationErrorKind::Network
    }
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicationError({:?}): {}", self.kind, self.message)
    }
}

impl std::error::Error for ReplicationError {}

impl From<DatabaseError> for ReplicationError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::CorruptData(_) => Self::corrupt_data(err.to_string()),
            other => Self::database(other.to_string()),
        }
    }
}

/// Result type for replication operations
pub type ReplicationResult<T> = Result<T, ReplicationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_is_transient() {
        assert!(ReplicationError::network("reset").is_transient());
        assert!(!ReplicationError::auth("bad password").is_transient());
        assert!(!ReplicationError::tls_trust("pin").is_transient());
        assert!(!ReplicationError::corrupt_data("digest").is_transient());
        assert!(!ReplicationError::configuration_error("url").is_transient());
    }

    #[test]
    fn test_database_errors_map_by_kind() {
        let corrupt: ReplicationError = DatabaseError::CorruptData("crc".into()).into();
        assert_eq!(corrupt.kind, ReplicationErrorKind::CorruptData);
        let closed: ReplicationError = DatabaseError::Closed.into();
        assert_eq!(closed.kind, ReplicationErrorKind::Database);
    }

    #[test]
    fn test_wire_form() {
        let err = ReplicationError::auth("no");
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, r#"{"kind":"auth","message":"no"}"#);
    }
}
