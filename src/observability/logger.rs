//! Structured JSON logger for aerolite
//!
//! - One log line = one event, rendered as a JSON object
//! - Keys are sorted, so identical events render identically
//! - Explicit severity levels
//! - Lines are handed to `tracing` under the `aerolite` target; the
//!   embedding application decides where they go

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Target every aerolite log line is emitted under
pub const LOG_TARGET: &str = "aerolite";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Debug-level detail
    Trace = 0,
    /// Normal operations
    Info = 1,
    /// Recoverable issues
    Warn = 2,
    /// Operation failures
    Error = 3,
    /// Data can no longer be trusted
    Fatal = 4,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub struct Logger;

impl Logger {
    /// Log an event with the given severity and fields
    pub fn log(severity: Severity, event: &str, fields: &[(&str, &str)]) {
        let line = render_line(severity, event, fields, Utc::now());
        match severity {
            Severity::Trace => tracing::trace!(target: LOG_TARGET, "{}", line),
            Severity::Info => tracing::info!(target: LOG_TARGET, "{}", line),
            Severity::Warn => tracing::warn!(target: LOG_TARGET, "{}", line),
            Severity::Error | Severity::Fatal => tracing::error!(target: LOG_TARGET, "{}", line),
        }
    }

    pub fn trace(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Trace, event, fields);
    }

    pub fn info(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Info, event, fields);
    }

    pub fn warn(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Warn, event, fields);
    }

    pub fn error(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Error, event, fields);
    }

    pub fn fatal(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Fatal, event, fields);
    }
}

/// Renders one log line
///
/// `event`, `severity` and `timestamp` are reserved; a field with one of
/// those names is ignored.
pub fn render_line(
    severity: Severity,
    event: &str,
    fields: &[(&str, &str)],
    timestamp: DateTime<Utc>,
) -> String {
    let mut object = Map::new();
    for (key, value) in fields {
        object.insert((*key).to_string(), Value::String((*value).to_string()));
    }
    object.insert("event".to_string(), Value::String(event.to_string()));
    object.insert("severity".to_string(), Value::String(severity.as_str().to_string()));
    object.insert(
        "timestamp".to_string(),
        Value::String(timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    Value::Object(object).to_string()
}
