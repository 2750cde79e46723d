//! # Blob Store Errors

use thiserror::Error;

/// Result type for blob operations
pub type BlobResult<T> = Result<T, BlobError>;

/// Blob store errors
#[derive(Debug, Clone, Error)]
pub enum BlobError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid blob digest: {0}")]
    InvalidDigest(String),

    #[error("Blob content does not match digest {expected} (found {actual})")]
    DigestMismatch { expected: String, actual: String },

    #[error("I/O error: {0}")]
    IoError(String),
}

impl BlobError {
    /// Stored content that no longer hashes to its digest is corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, BlobError::DigestMismatch { .. })
    }
}
