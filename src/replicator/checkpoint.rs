//! Replication checkpoints
//!
//! A checkpoint records how far one replicator has got with one peer:
//! `local` is the last local sequence pushed, `remote` the last remote
//! sequence pulled. A copy is kept on each side. On start the copies are
//! compared field by field; a direction whose copies disagree (or whose
//! remote copy is missing or unreadable) starts again from zero.
//!
//! # Invariants
//!
//! - The ID depends only on what is replicated, not on when
//! - Within a run, neither field decreases

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::config::ReplicatorType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub local: u64,
    pub remote: u64,
}

impl Checkpoint {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// `None` if `body` is not a checkpoint
    pub fn from_json(body: &str) -> Option<Self> {
        serde_json::from_str(body).ok()
    }

    /// Reconciles the local and remote copies
    pub fn negotiate(local: Option<Checkpoint>, remote: Option<Checkpoint>) -> Checkpoint {
        let (Some(local), Some(remote)) = (local, remote) else {
            return Checkpoint::default();
        };
        Checkpoint {
            local: if local.local == remote.local { local.local } else { 0 },
            remote: if local.remote == remote.remote { local.remote } else { 0 },
        }
    }
}

/// Stable ID of the checkpoint for one replicator configuration
pub fn checkpoint_id(
    database_uuid: Uuid,
    endpoint: &str,
    replicator_type: ReplicatorType,
    channels: &[String],
    document_ids: &[String],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(database_uuid.as_bytes());
    hasher.update([0]);
    hasher.update(endpoint.as_bytes());
    hasher.update([0]);
    hasher.update(replicator_type.as_str().as_bytes());
    for list in [channels, document_ids] {
        let mut sorted: Vec<&String> = list.iter().collect();
        sorted.sort();
        hasher.update([0]);
        for item in sorted {
            hasher.update(item.as_bytes());
            hasher.update([1]);
        }
    }
    let hash = hasher.finalize();
    let hex: String = hash[..16].iter().map(|b| format!("{:02x}", b)).collect();
    format!("cp-{}", hex)
}
