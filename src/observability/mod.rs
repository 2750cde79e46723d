//! Observability subsystem for aerolite
//!
//! - Structured logging (JSON lines through `tracing`)
//! - Counters per database
//! - Lifecycle events
//!
//! # Principles
//!
//! 1. Observability is read-only
//! 2. No side effects on execution
//! 3. Deterministic output for identical events
//!
//! # Usage
//!
//! ```ignore
//! use aerolite::observability::{Event, Logger, MetricsRegistry};
//!
//! Logger::info(Event::TransactionCommit.as_str(), &[("sequence", "42")]);
//!
//! let metrics = MetricsRegistry::new();
//! metrics.record_commit(128);
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{render_line, Logger, Severity, LOG_TARGET};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::{ObservationScope, ScopeEvents, COMPACTION};
