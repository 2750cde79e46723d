//! Severity shared by the coded error types of the lower layers
//!
//! Codec, storage and index errors carry an `AERO_*` code and a severity.
//! `Fatal` marks integrity failures that must never be retried or hidden.

use std::fmt;

/// Severity levels for coded errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation fails, the database stays usable
    Error,
    /// Data integrity is compromised
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}
