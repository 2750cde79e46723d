//! Background expiration sweeper
//!
//! One named thread per open database. It holds only a weak handle, so it
//! never keeps a database alive, and exits when signalled or when the
//! database is gone.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;

use crate::observability::{Event, Logger};

use super::database::{Database, DatabaseInner};
use super::errors::{DatabaseError, DbResult};

pub(crate) struct Sweeper {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    pub(crate) fn start(db: &Database, interval_secs: u64) -> DbResult<Self> {
        let weak = db.downgrade();
        let interval = Duration::from_secs(interval_secs);
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(format!("aerolite-expiry-{}", db.name()))
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !sweep_once(&weak) {
                            return;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            })
            .map_err(|e| DatabaseError::Open(format!("cannot start expiration sweeper: {}", e)))?;
        Ok(Self { stop, handle })
    }

    /// Asks the thread to exit without waiting for it
    pub(crate) fn signal_stop(&self) {
        let _ = self.stop.send(());
    }

    /// Asks the thread to exit and waits for it
    pub(crate) fn stop(self) {
        self.signal_stop();
        if self.handle.thread().id() != thread::current().id() {
            let _ = self.handle.join();
        }
    }
}

/// Returns false once the database is gone or closed
fn sweep_once(weak: &Weak<DatabaseInner>) -> bool {
    let Some(inner) = weak.upgrade() else {
        return false;
    };
    let db = Database::from_inner(inner);
    if db.is_closed() {
        return false;
    }
    if let Err(e) = db.purge_expired(Utc::now()) {
        if matches!(e, DatabaseError::Closed) {
            return false;
        }
        Logger::error(
            Event::ExpirationSweep.as_str(),
            &[("database", db.name()), ("error", &e.to_string())],
        );
    }
    true
}

#[cfg(test)]
mod tests {
    use crate::database::{ConcurrencyControl, Database, DatabaseConfig};
    use crate::document::Document;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn test_sweeper_purges_expired_documents() {
        let temp = TempDir::new().unwrap();
        let config = DatabaseConfig {
            expiration_sweep_interval_secs: 1,
            ..DatabaseConfig::in_directory(temp.path())
        };
        let db = Database::open_named("sweep", config).unwrap();
        let mut doc = Document::new("short-lived");
        db.save_document(&mut doc, ConcurrencyControl::FailOnConflict).unwrap();
        db.set_document_expiration("short-lived", Some(Utc::now() - ChronoDuration::seconds(1)))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while db.get_document("short-lived").unwrap().is_some() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
        }
        assert!(db.get_document("short-lived").unwrap().is_none());
        assert_eq!(db.metrics().snapshot().documents_expired, 1);
        db.close().unwrap();
    }

    #[test]
    fn test_sweeper_does_not_keep_database_alive() {
        let temp = TempDir::new().unwrap();
        let config = DatabaseConfig {
            expiration_sweep_interval_secs: 1,
            ..DatabaseConfig::in_directory(temp.path())
        };
        let db = Database::open_named("dropped", config).unwrap();
        let weak = db.downgrade();
        drop(db);
        assert!(weak.upgrade().is_none());
    }
}
