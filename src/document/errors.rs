//! Document model errors

use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid revision: {0}")]
    InvalidRevision(String),

    #[error("invalid document id: {0}")]
    InvalidId(String),

    #[error("document body must be a dict")]
    NotADict,
}

impl DocumentError {
    /// Corrupt encoded bytes are fatal; everything else is a caller error
    pub fn is_fatal(&self) -> bool {
        matches!(self, DocumentError::Codec(e) if e.is_fatal())
    }
}

pub type DocumentResult<T> = Result<T, DocumentError>;
