//! ObservationScope for begin/complete logging around long operations
//!
//! - Logs the begin event on creation
//! - Logs the complete event, with elapsed time, on `complete`
//! - Logs the failed event on `fail`, or when dropped unfinished

use std::time::Instant;

use super::events::Event;
use super::logger::Logger;

/// Events logged by one scope
#[derive(Debug, Clone, Copy)]
pub struct ScopeEvents {
    pub begin: Event,
    pub complete: Event,
    pub failed: Event,
}

/// Compaction's scope events
pub const COMPACTION: ScopeEvents = ScopeEvents {
    begin: Event::CompactionBegin,
    complete: Event::CompactionComplete,
    failed: Event::CompactionFailed,
};

pub struct ObservationScope {
    events: ScopeEvents,
    fields: Vec<(String, String)>,
    start: Instant,
    finished: bool,
}

impl ObservationScope {
    pub fn new(events: ScopeEvents, fields: &[(&str, &str)]) -> Self {
        Logger::info(events.begin.as_str(), fields);
        Self {
            events,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            start: Instant::now(),
            finished: false,
        }
    }

    /// Milliseconds since the scope began
    pub fn elapsed_ms(&self) -> u128 {
        self.start.elapsed().as_millis()
    }

    pub fn complete(mut self, extra: &[(&str, &str)]) {
        self.finished = true;
        let elapsed = self.elapsed_ms().to_string();
        let mut fields = self.field_refs();
        fields.extend(extra.iter().copied());
        fields.push(("elapsed_ms", &elapsed));
        Logger::info(self.events.complete.as_str(), &fields);
    }

    pub fn fail(mut self, reason: &str) {
        self.finished = true;
        let mut fields = self.field_refs();
        fields.push(("reason", reason));
        Logger::error(self.events.failed.as_str(), &fields);
    }

    fn field_refs(&self) -> Vec<(&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }
}

impl Drop for ObservationScope {
    fn drop(&mut self) {
        if !self.finished {
            let mut fields = self.field_refs();
            fields.push(("reason", "abandoned"));
            Logger::warn(self.events.failed.as_str(), &fields);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_complete() {
        let scope = ObservationScope::new(COMPACTION, &[("database", "db")]);
        scope.complete(&[("revisions_pruned", "3")]);
    }

    #[test]
    fn test_scope_fail() {
        ObservationScope::new(COMPACTION, &[]).fail("disk full");
    }

    #[test]
    fn test_scope_drop_without_complete() {
        let scope = ObservationScope::new(COMPACTION, &[]);
        assert!(scope.elapsed_ms() < 60_000);
        drop(scope);
    }
}
