//! Database errors
//!
//! Lower layers report coded errors; they are folded into one enum here so
//! callers can match on what happened without knowing which layer failed.

use thiserror::Error;

use crate::blob::BlobError;
use crate::codec::CodecError;
use crate::document::DocumentError;
use crate::index::{IndexError, IndexErrorCode};
use crate::storage::{StorageError, StorageErrorCode};

/// Coarse classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    CorruptData,
    Open,
    InvalidArgument,
    TransactionAborted,
    Closed,
    Io,
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict saving '{doc_id}': loaded at {expected}, current is {current}")]
    Conflict {
        doc_id: String,
        expected: String,
        current: String,
    },

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("cannot open database: {0}")]
    Open(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("database is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),
}

impl DatabaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DatabaseError::NotFound(_) => ErrorKind::NotFound,
            DatabaseError::Conflict { .. } => ErrorKind::Conflict,
            DatabaseError::CorruptData(_) => ErrorKind::CorruptData,
            DatabaseError::Open(_) => ErrorKind::Open,
            DatabaseError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            DatabaseError::TransactionAborted(_) => ErrorKind::TransactionAborted,
            DatabaseError::Closed => ErrorKind::Closed,
            DatabaseError::Io(_) => ErrorKind::Io,
        }
    }

    /// Corruption is never retried or hidden
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::CorruptData
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<StorageError> for DatabaseError {
    fn from(e: StorageError) -> Self {
        if e.is_fatal() {
            DatabaseError::CorruptData(e.to_string())
        } else if e.code() == StorageErrorCode::AeroStorageClosed {
            DatabaseError::Closed
        } else {
            DatabaseError::Io(e.to_string())
        }
    }
}

impl From<CodecError> for DatabaseError {
    fn from(e: CodecError) -> Self {
        if e.is_corruption() {
            DatabaseError::CorruptData(e.to_string())
        } else {
            DatabaseError::InvalidArgument(e.to_string())
        }
    }
}

impl From<DocumentError> for DatabaseError {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::Codec(c) => c.into(),
            other => DatabaseError::InvalidArgument(other.to_string()),
        }
    }
}

impl From<IndexError> for DatabaseError {
    fn from(e: IndexError) -> Self {
        match e.code() {
            IndexErrorCode::AeroIndexNotFound => DatabaseError::NotFound(e.to_string()),
            IndexErrorCode::AeroIndexInvalidDefinition => DatabaseError::InvalidArgument(e.to_string()),
            IndexErrorCode::AeroDataCorruption => DatabaseError::CorruptData(e.to_string()),
        }
    }
}

impl From<BlobError> for DatabaseError {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::NotFound(d) => DatabaseError::NotFound(format!("blob {}", d)),
            BlobError::InvalidDigest(d) => DatabaseError::InvalidArgument(format!("blob digest {}", d)),
            e @ BlobError::DigestMismatch { .. } => DatabaseError::CorruptData(e.to_string()),
            BlobError::IoError(m) => DatabaseError::Io(m),
        }
    }
}

pub type DbResult<T> = Result<T, DatabaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_corruption_maps_to_corrupt_data() {
        let err: DatabaseError = StorageError::data_corruption("checksum mismatch").into();
        assert!(err.is_fatal());
        assert_eq!(err.kind(), ErrorKind::CorruptData);
    }

    #[test]
    fn test_codec_type_mismatch_is_not_fatal() {
        let err: DatabaseError = CodecError::type_mismatch("string", "Int").into();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_index_not_found() {
        let err: DatabaseError = IndexError::not_found("x").into();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_blob_mismatch_is_corruption() {
        let err: DatabaseError = BlobError::DigestMismatch {
            expected: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert!(err.is_fatal());
    }
}
