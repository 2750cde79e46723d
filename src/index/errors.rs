//! Index error types
//!
//! Error codes:
//! - AERO_INDEX_NOT_FOUND (ERROR)
//! - AERO_INDEX_INVALID_DEFINITION (ERROR)
//! - AERO_DATA_CORRUPTION (FATAL)

use std::fmt;

use crate::error::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexErrorCode {
    /// No index with the requested name
    AeroIndexNotFound,
    /// Definition cannot be used to build an index
    AeroIndexInvalidDefinition,
    /// A document body could not be read while indexing it
    AeroDataCorruption,
}

impl IndexErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            IndexErrorCode::AeroIndexNotFound => "AERO_INDEX_NOT_FOUND",
            IndexErrorCode::AeroIndexInvalidDefinition => "AERO_INDEX_INVALID_DEFINITION",
            IndexErrorCode::AeroDataCorruption => "AERO_DATA_CORRUPTION",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            IndexErrorCode::AeroDataCorruption => Severity::Fatal,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for IndexErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Clone)]
pub struct IndexError {
    code: IndexErrorCode,
    message: String,
}

impl IndexError {
    pub fn not_found(name: &str) -> Self {
        Self {
            code: IndexErrorCode::AeroIndexNotFound,
            message: format!("index '{}' does not exist", name),
        }
    }

    pub fn invalid_definition(message: impl Into<String>) -> Self {
        Self {
            code: IndexErrorCode::AeroIndexInvalidDefinition,
            message: message.into(),
        }
    }

    pub fn corrupted(doc_id: &str, reason: impl fmt::Display) -> Self {
        Self {
            code: IndexErrorCode::AeroDataCorruption,
            message: format!("cannot index document '{}': {}", doc_id, reason),
        }
    }

    pub fn code(&self) -> IndexErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_fatal(&self) -> bool {
        self.code.severity() == Severity::Fatal
    }
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code.severity(), self.code.code(), self.message)
    }
}

impl std::error::Error for IndexError {}

pub type IndexResult<T> = Result<T, IndexError>;
