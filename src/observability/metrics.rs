//! Metrics registry for aerolite
//!
//! - Counters only
//! - Monotonic increase
//! - One registry per open database, reset when it is reopened
//! - Thread-safe, lock-free

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters of one database and its replicators
///
/// Relaxed ordering throughout; counters are not used for synchronization.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    commits: AtomicU64,
    journal_bytes: AtomicU64,
    documents_saved: AtomicU64,
    documents_deleted: AtomicU64,
    documents_purged: AtomicU64,
    documents_expired: AtomicU64,
    conflicts_resolved: AtomicU64,
    revisions_pushed: AtomicU64,
    revisions_pulled: AtomicU64,
    blobs_stored: AtomicU64,
    compactions: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one durable commit of `bytes` journal bytes
    pub fn record_commit(&self, bytes: u64) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.journal_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_documents_saved(&self, n: u64) {
        self.documents_saved.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_documents_deleted(&self, n: u64) {
        self.documents_deleted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_documents_purged(&self, n: u64) {
        self.documents_purged.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_documents_expired(&self, n: u64) {
        self.documents_expired.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_conflicts_resolved(&self) {
        self.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_revisions_pushed(&self, n: u64) {
        self.revisions_pushed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_revisions_pulled(&self, n: u64) {
        self.revisions_pulled.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_blobs_stored(&self) {
        self.blobs_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_compactions(&self) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            journal_bytes: self.journal_bytes.load(Ordering::Relaxed),
            documents_saved: self.documents_saved.load(Ordering::Relaxed),
            documents_deleted: self.documents_deleted.load(Ordering::Relaxed),
            documents_purged: self.documents_purged.load(Ordering::Relaxed),
            documents_expired: self.documents_expired.load(Ordering::Relaxed),
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
            revisions_pushed: self.revisions_pushed.load(Ordering::Relaxed),
            revisions_pulled: self.revisions_pulled.load(Ordering::Relaxed),
            blobs_stored: self.blobs_stored.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        }
    }

    /// All counters as one JSON object
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_default()
    }
}

/// A point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub commits: u64,
    pub journal_bytes: u64,
    pub documents_saved: u64,
    pub documents_deleted: u64,
    pub documents_purged: u64,
    pub documents_expired: u64,
    pub conflicts_resolved: u64,
    pub revisions_pushed: u64,
    pub revisions_pulled: u64,
    pub blobs_stored: u64,
    pub compactions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry_has_zero_values() {
        assert_eq!(MetricsRegistry::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_record_commit() {
        let registry = MetricsRegistry::new();
        registry.record_commit(100);
        registry.record_commit(50);
        let snap = registry.snapshot();
        assert_eq!(snap.commits, 2);
        assert_eq!(snap.journal_bytes, 150);
    }

    #[test]
    fn test_concurrent_increments() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = registry.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        r.add_revisions_pulled(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.snapshot().revisions_pulled, 8000);
    }

    #[test]
    fn test_to_json() {
        let registry = MetricsRegistry::new();
        registry.increment_compactions();
        let parsed: serde_json::Value = serde_json::from_str(&registry.to_json()).unwrap();
        assert_eq!(parsed["compactions"], 1);
    }
}
