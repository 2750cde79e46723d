//! Revision identifiers
//!
//! A revision ID is `generation-digest`. The generation counts the
//! revisions on the path from the root (root = 1); the digest is derived
//! from the canonical body, the parent revision and the deletion flag, so
//! two peers that make the same change to the same parent produce the
//! same ID without coordination.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::errors::{DocumentError, DocumentResult};

/// Number of SHA-256 bytes kept in the digest
const DIGEST_BYTES: usize = 16;

/// Revision identifier
///
/// Ordering is by generation, then by digest (lexical), which is also
/// the default conflict tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId {
    generation: u64,
    digest: String,
}

impl RevisionId {
    /// Computes the ID of a new revision
    pub fn compute(parent: Option<&RevisionId>, deleted: bool, canonical_body: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical_body);
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update([deleted as u8]);
        let hash = hasher.finalize();

        let digest = hash[..DIGEST_BYTES]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();

        Self {
            generation: parent.map(|p| p.generation + 1).unwrap_or(1),
            digest,
        }
    }

    /// Parses `generation-digest`
    pub fn parse(s: &str) -> DocumentResult<Self> {
        let (generation, digest) = s
            .split_once('-')
            .ok_or_else(|| DocumentError::InvalidRevision(format!("missing '-' in {:?}", s)))?;
        let generation: u64 = generation
            .parse()
            .map_err(|_| DocumentError::InvalidRevision(format!("bad generation in {:?}", s)))?;
        if generation == 0 || digest.is_empty() {
            return Err(DocumentError::InvalidRevision(format!("malformed revision {:?}", s)));
        }
        Ok(Self {
            generation,
            digest: digest.to_string(),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl TryFrom<String> for RevisionId {
    type Error = DocumentError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        RevisionId::parse(&s)
    }
}

impl From<RevisionId> for String {
    fn from(rev: RevisionId) -> Self {
        rev.to_string()
    }
}
