//! Journal error types
//!
//! Error codes:
//! - AERO_STORAGE_IO_ERROR (ERROR severity)
//! - AERO_STORAGE_WRITE_FAILED (ERROR severity)
//! - AERO_STORAGE_READ_FAILED (ERROR severity)
//! - AERO_STORAGE_CLOSED (ERROR severity)
//! - AERO_DATA_CORRUPTION (FATAL severity)

use std::fmt;
use std::io;

use crate::error::Severity;

/// Journal error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorCode {
    /// Filesystem failure outside a read or write (create, rename, truncate)
    AeroStorageIoError,
    /// Append or fsync failed
    AeroStorageWriteFailed,
    /// Reading the journal failed
    AeroStorageReadFailed,
    /// Writer refuses appends after a rollback it could not complete
    AeroStorageClosed,
    /// Checksum or structural failure of committed data
    AeroDataCorruption,
}

impl StorageErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            StorageErrorCode::AeroStorageIoError => "AERO_STORAGE_IO_ERROR",
            StorageErrorCode::AeroStorageWriteFailed => "AERO_STORAGE_WRITE_FAILED",
            StorageErrorCode::AeroStorageReadFailed => "AERO_STORAGE_READ_FAILED",
            StorageErrorCode::AeroStorageClosed => "AERO_STORAGE_CLOSED",
            StorageErrorCode::AeroDataCorruption => "AERO_DATA_CORRUPTION",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            StorageErrorCode::AeroDataCorruption => Severity::Fatal,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for StorageErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Journal error with context
#[derive(Debug)]
pub struct StorageError {
    code: StorageErrorCode,
    message: String,
    details: Option<String>,
    source: Option<io::Error>,
}

impl StorageError {
    fn new(code: StorageErrorCode, message: impl Into<String>, source: Option<io::Error>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            source,
        }
    }

    /// Create, rename, truncate or sync of the journal file failed
    pub fn io_error(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(StorageErrorCode::AeroStorageIoError, message, Some(source))
    }

    pub fn write_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(StorageErrorCode::AeroStorageWriteFailed, message, Some(source))
    }

    pub fn read_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(StorageErrorCode::AeroStorageReadFailed, message, Some(source))
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(StorageErrorCode::AeroStorageClosed, message, None)
    }

    /// Committed data failed verification (FATAL)
    pub fn data_corruption(message: impl Into<String>) -> Self {
        Self::new(StorageErrorCode::AeroDataCorruption, message, None)
    }

    /// A damaged frame followed by more data (FATAL)
    pub fn corruption_at_offset(offset: u64, reason: impl Into<String>) -> Self {
        Self {
            details: Some(format!("journal offset {}", offset)),
            ..Self::data_corruption(reason)
        }
    }

    pub fn code(&self) -> StorageErrorCode {
        self.code
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity(), self.code, self.message)?;
        match &self.details {
            Some(details) => write!(f, " ({})", details),
            None => Ok(()),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for journal operations
pub type StorageResult<T> = Result<T, StorageError>;
