//! Codec error types
//!
//! Error codes:
//! - AERO_CORRUPT_DATA (FATAL severity)
//! - AERO_CODEC_TYPE_MISMATCH (ERROR severity)
//! - AERO_CODEC_DEPTH_EXCEEDED (ERROR severity)
//! - AERO_CODEC_TOO_LARGE (ERROR severity)

use std::fmt;

use crate::error::Severity;

/// Codec-specific error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecErrorCode {
    /// Encoded bytes are malformed
    AeroCorruptData,
    /// Value accessed as the wrong type
    AeroCodecTypeMismatch,
    /// Nesting deeper than the allowed limit
    AeroCodecDepthExceeded,
    /// A string, binary or container does not fit the u32 length fields
    AeroCodecTooLarge,
}

impl CodecErrorCode {
    /// Returns the string code
    pub fn code(&self) -> &'static str {
        match self {
            CodecErrorCode::AeroCorruptData => "AERO_CORRUPT_DATA",
            CodecErrorCode::AeroCodecTypeMismatch => "AERO_CODEC_TYPE_MISMATCH",
            CodecErrorCode::AeroCodecDepthExceeded => "AERO_CODEC_DEPTH_EXCEEDED",
            CodecErrorCode::AeroCodecTooLarge => "AERO_CODEC_TOO_LARGE",
        }
    }

    /// Returns the severity level for this error
    pub fn severity(&self) -> Severity {
        match self {
            CodecErrorCode::AeroCorruptData => Severity::Fatal,
            CodecErrorCode::AeroCodecTypeMismatch => Severity::Error,
            CodecErrorCode::AeroCodecDepthExceeded => Severity::Error,
            CodecErrorCode::AeroCodecTooLarge => Severity::Error,
        }
    }
}

impl fmt::Display for CodecErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Codec error with context
#[derive(Debug, Clone, PartialEq)]
pub struct CodecError {
    code: CodecErrorCode,
    message: String,
    offset: Option<usize>,
}

impl CodecError {
    /// Malformed input (FATAL)
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self {
            code: CodecErrorCode::AeroCorruptData,
            message: message.into(),
            offset: None,
        }
    }

    /// Malformed input at a byte offset (FATAL)
    pub fn corrupt_at(offset: usize, message: impl Into<String>) -> Self {
        Self {
            code: CodecErrorCode::AeroCorruptData,
            message: message.into(),
            offset: Some(offset),
        }
    }

    /// Value was not of the requested type
    pub fn type_mismatch(expected: &str, found: impl fmt::Debug) -> Self {
        Self {
            code: CodecErrorCode::AeroCodecTypeMismatch,
            message: format!("expected {}, found {:?}", expected, found),
            offset: None,
        }
    }

    /// Nesting exceeded `max_depth`
    pub fn depth_exceeded(max_depth: usize) -> Self {
        Self {
            code: CodecErrorCode::AeroCodecDepthExceeded,
            message: format!("value nesting exceeds maximum depth of {}", max_depth),
            offset: None,
        }
    }

    /// Value too large for the encoding
    pub fn too_large(message: impl Into<String>) -> Self {
        Self {
            code: CodecErrorCode::AeroCodecTooLarge,
            message: message.into(),
            offset: None,
        }
    }

    /// Returns the error code
    pub fn code(&self) -> CodecErrorCode {
        self.code
    }

    /// Returns the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the byte offset the error was detected at, if known
    pub fn offset(&self) -> Option<usize> {
        self.offset
    }

    /// Returns the severity level
    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// Returns whether the input bytes are corrupt
    pub fn is_corruption(&self) -> bool {
        self.code == CodecErrorCode::AeroCorruptData
    }

    /// Returns whether this error is fatal
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )?;
        if let Some(offset) = self.offset {
            write!(f, " (byte_offset: {})", offset)?;
        }
        Ok(())
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;
