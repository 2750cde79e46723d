//! Replicator
//!
//! Runs one replication configuration as a tokio task: connect, negotiate
//! the checkpoint, then push and pull concurrently until caught up. A
//! one-shot replicator stops after the first cycle that moves nothing; a
//! continuous one goes idle and syncs again on local commits and on every
//! heartbeat.
//!
//! # Invariants
//!
//! - Every state change is logged and reported to change listeners
//! - Transient failures retry with backoff; anything else stops the task
//! - A stop lets the running cycle finish within the grace period
//! - The checkpoint never moves past a revision that was not transferred

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::notify::{ChangeSource, DatabaseChange, ListenerRegistry, ListenerToken};
use crate::observability::{Event, Logger};

use super::backoff::Backoff;
use super::checkpoint::{checkpoint_id, Checkpoint};
use super::config::ReplicatorConfiguration;
use super::errors::{ReplicationError, ReplicationResult};
use super::filter::{admit, in_document_ids, Admission, DocumentFlags};
use super::session::SyncContext;
use super::state::ReplicatorState;
use super::status::{ActivityLevel, DocumentReplication, Progress, ReplicatorChange, ReplicatorStatus};
use super::transport::{ConnectRequest, Transport};

/// State shared between the handle and the running task
pub(crate) struct Shared {
    pub(crate) config: ReplicatorConfiguration,
    pub(crate) checkpoint_id: String,
    transport: Arc<dyn Transport>,
    state: Mutex<ReplicatorState>,
    status: watch::Sender<ReplicatorStatus>,
    changes: ListenerRegistry<ReplicatorChange>,
    documents: ListenerRegistry<DocumentReplication>,
    /// Local commits waiting to be pushed
    wake: Arc<Notify>,
    /// Suspension or reachability changed
    control: Notify,
    stop: watch::Sender<bool>,
    suspended: AtomicBool,
    reachable: AtomicBool,
    offline: AtomicBool,
    /// The task is running, possibly before its first connection
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn state(&self) -> ReplicatorState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn transition<F>(&self, f: F) -> ReplicationResult<()>
    where
        F: FnOnce(ReplicatorState) -> ReplicationResult<ReplicatorState>,
    {
        let next = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let next = f(state.clone())?;
            if next == *state {
                return Ok(());
            }
            *state = next.clone();
            next
        };
        Logger::info(
            Event::ReplicatorStateChange.as_str(),
            &[("endpoint", self.config.endpoint.as_str()), ("state", next.state_name())],
        );
        self.publish(|_| {});
        Ok(())
    }

    /// Transition on a path that carries on either way; a refused one is
    /// logged and the state is left as it was
    fn transition_or_warn<F>(&self, f: F)
    where
        F: FnOnce(ReplicatorState) -> ReplicationResult<ReplicatorState>,
    {
        if let Err(err) = self.transition(f) {
            Logger::warn(
                Event::ReplicatorStateChange.as_str(),
                &[("endpoint", self.config.endpoint.as_str()), ("error", &err.message)],
            );
        }
    }

    fn set_offline(&self, offline: bool) {
        if self.offline.swap(offline, Ordering::SeqCst) != offline {
            self.publish(|_| {});
        }
    }

    fn paused(&self) -> bool {
        self.suspended.load(Ordering::SeqCst) || !self.reachable.load(Ordering::SeqCst)
    }

    /// Applies `update`, refreshes the activity level and notifies listeners
    fn publish<F>(&self, update: F)
    where
        F: FnOnce(&mut ReplicatorStatus),
    {
        let offline = self.offline.load(Ordering::SeqCst);
        let activity = if offline && self.running.load(Ordering::SeqCst) {
            ActivityLevel::Offline
        } else {
            ActivityLevel::from_state(&self.state(), offline)
        };
        let mut snapshot = None;
        self.status.send_modify(|status| {
            update(status);
            status.activity = activity;
            snapshot = Some(status.clone());
        });
        if let Some(status) = snapshot {
            self.changes.post(ReplicatorChange { status });
        }
    }

    pub(crate) fn add_progress(&self, completed: u64, discovered: u64) {
        self.publish(|status| {
            status.progress.completed += completed;
            status.progress.document_count += discovered;
        });
    }

    pub(crate) fn post_documents(&self, event: DocumentReplication) {
        self.documents.post(event);
    }
}

/// Handle to one replication configuration
///
/// Dropping the handle signals the task to stop.
pub struct Replicator {
    shared: Arc<Shared>,
}

impl fmt::Debug for Replicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replicator")
            .field("endpoint", &self.shared.config.endpoint.as_str())
            .field("checkpoint_id", &self.shared.checkpoint_id)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl Replicator {
    pub fn new(config: ReplicatorConfiguration, transport: Arc<dyn Transport>) -> ReplicationResult<Self> {
        config.validate()?;
        let checkpoint_id = checkpoint_id(
            config.database.uuid(),
            config.endpoint.as_str(),
            config.replicator_type,
            &config.channels,
            &config.document_ids,
        );
        let (status, _) = watch::channel(ReplicatorStatus::default());
        let (stop, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                checkpoint_id,
                transport,
                state: Mutex::new(ReplicatorState::Stopped),
                status,
                changes: ListenerRegistry::new(),
                documents: ListenerRegistry::new(),
                wake: Arc::new(Notify::new()),
                control: Notify::new(),
                stop,
                suspended: AtomicBool::new(false),
                reachable: AtomicBool::new(true),
                offline: AtomicBool::new(false),
                running: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &ReplicatorConfiguration {
        &self.shared.config
    }

    /// ID under which both sides store this configuration's checkpoint
    pub fn checkpoint_id(&self) -> &str {
        &self.shared.checkpoint_id
    }

    pub fn state(&self) -> ReplicatorState {
        self.shared.state()
    }

    pub fn status(&self) -> ReplicatorStatus {
        self.shared.status.borrow().clone()
    }

    /// Starts the replication task on the current tokio runtime
    ///
    /// Does nothing if the task is already running. With
    /// `reset_checkpoint` the stored checkpoint is ignored and everything
    /// is compared again from the beginning.
    pub fn start(&self, reset_checkpoint: bool) -> ReplicationResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ReplicationError::configuration_error("a replicator must be started inside a tokio runtime"))?;
        if self.shared.config.database.is_closed() {
            return Err(ReplicationError::configuration_error("database is closed"));
        }
        let mut task = self.shared.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return Ok(());
        }
        self.shared.stop.send_replace(false);
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.publish(|status| {
            status.progress = Progress::default();
            status.error = None;
        });
        *task = Some(runtime.spawn(run(self.shared.clone(), reset_checkpoint)));
        Ok(())
    }

    /// Stops the task and waits for it to finish
    pub async fn stop(&self) {
        self.shared.stop.send_replace(true);
        self.join().await;
    }

    /// Waits for the task to end on its own, as a one-shot replicator does
    pub async fn wait_until_stopped(&self) -> ReplicatorStatus {
        self.join().await;
        self.status()
    }

    /// Waits until the status satisfies `predicate`, or `timeout` passes
    pub async fn wait_for_status<P>(&self, timeout: Duration, predicate: P) -> Option<ReplicatorStatus>
    where
        P: Fn(&ReplicatorStatus) -> bool,
    {
        let mut rx = self.shared.status.subscribe();
        let wait = async {
            loop {
                {
                    let status = rx.borrow_and_update();
                    if predicate(&status) {
                        return Some(status.clone());
                    }
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    async fn join(&self) {
        let handle = self.shared.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                Logger::error(
                    Event::ReplicatorStopped.as_str(),
                    &[("endpoint", self.shared.config.endpoint.as_str()), ("error", &e.to_string())],
                );
            }
        }
    }

    pub fn add_change_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&ReplicatorChange) + Send + Sync + 'static,
    {
        self.shared.changes.add(listener)
    }

    pub fn add_document_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&DocumentReplication) + Send + Sync + 'static,
    {
        self.shared.documents.add(listener)
    }

    /// Local documents with changes this replicator has not pushed yet
    pub fn pending_document_ids(&self) -> ReplicationResult<BTreeSet<String>> {
        let config = &self.shared.config;
        if !config.replicator_type.pushes() {
            return Err(ReplicationError::configuration_error(
                "pending documents are only tracked when pushing",
            ));
        }
        let db = &config.database;
        let since = db
            .get_checkpoint(&self.shared.checkpoint_id)?
            .and_then(|body| Checkpoint::from_json(&body))
            .map(|cp| cp.local)
            .unwrap_or(0);

        let mut pending = BTreeSet::new();
        for change in db.changes_since(since, usize::MAX)? {
            let admission = match db.revision_transfer(&change.doc_id, &change.rev_id)? {
                Some(transfer) => admit(
                    &transfer.to_document()?,
                    DocumentFlags { deleted: change.deleted },
                    &config.document_ids,
                    &config.channels,
                    config.push_filter.as_deref(),
                ),
                None if in_document_ids(&change.doc_id, &config.document_ids) => Admission::Accept,
                None => Admission::Skip,
            };
            if admission == Admission::Accept {
                pending.insert(change.doc_id);
            }
        }
        Ok(pending)
    }

    pub fn is_document_pending(&self, doc_id: &str) -> ReplicationResult<bool> {
        Ok(self.pending_document_ids()?.contains(doc_id))
    }

    /// Suspends or resumes network activity, as when an app is backgrounded
    pub fn set_suspended(&self, suspended: bool) {
        self.shared.suspended.store(suspended, Ordering::SeqCst);
        self.shared.control.notify_one();
    }

    /// Reports a reachability change for the peer's host
    ///
    /// Becoming reachable cancels any pending retry delay.
    pub fn set_host_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
        self.shared.control.notify_one();
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.shared.stop.send_replace(true);
    }
}

enum SessionEnd {
    Finished,
    Paused,
}

async fn run(shared: Arc<Shared>, reset_checkpoint: bool) {
    let wake = shared.wake.clone();
    let token = shared.config.database.add_change_listener(move |change: &DatabaseChange| {
        if change.source == ChangeSource::Local {
            wake.notify_one();
        }
    });
    let mut stop = shared.stop.subscribe();

    let outcome = supervise(&shared, &mut stop, reset_checkpoint).await;
    token.remove();

    shared.offline.store(false, Ordering::SeqCst);
    shared.running.store(false, Ordering::SeqCst);
    let endpoint = shared.config.endpoint.as_str();
    let previous = std::mem::take(&mut *shared.state.lock().unwrap_or_else(PoisonError::into_inner));
    if previous.is_active() {
        Logger::info(
            Event::ReplicatorStateChange.as_str(),
            &[("endpoint", endpoint), ("state", ReplicatorState::Stopped.state_name())],
        );
    }
    shared.publish(|_| {});
    match outcome {
        Ok(()) => Logger::info(
            Event::ReplicatorStopped.as_str(),
            &[
                ("completed", &shared.status.borrow().progress.completed.to_string()),
                ("endpoint", endpoint),
            ],
        ),
        Err(e) => Logger::error(
            Event::ReplicatorStopped.as_str(),
            &[("endpoint", endpoint), ("error", &e.to_string())],
        ),
    }
}

/// Runs sessions until done, retrying transient failures
async fn supervise(
    shared: &Arc<Shared>,
    stop: &mut watch::Receiver<bool>,
    mut reset_checkpoint: bool,
) -> ReplicationResult<()> {
    let config = &shared.config;
    let mut backoff = Backoff::new(config.effective_max_attempts(), config.max_attempt_wait_time);
    loop {
        if *stop.borrow() {
            return Ok(());
        }
        if shared.paused() {
            shared.set_offline(true);
            tokio::select! {
                _ = stopped(stop) => return Ok(()),
                _ = shared.control.notified() => {
                    backoff.reset();
                    continue;
                }
            }
        }
        shared.set_offline(false);

        let error = match session(shared, stop, &mut backoff, &mut reset_checkpoint).await {
            Ok(SessionEnd::Finished) => return Ok(()),
            Ok(SessionEnd::Paused) => continue,
            Err(error) => error,
        };
        shared.transition_or_warn(|state| state.fail(error.to_string()));
        shared.publish(|status| status.error = Some(error.clone()));
        if !error.is_transient() {
            return Err(error);
        }
        let Some(delay) = backoff.next_delay() else {
            return Err(error);
        };
        Logger::warn(
            Event::ReplicatorRetry.as_str(),
            &[
                ("attempt", &backoff.attempts().to_string()),
                ("delay_ms", &delay.as_millis().to_string()),
                ("endpoint", config.endpoint.as_str()),
                ("error", &error.message),
            ],
        );
        shared.set_offline(true);
        shared.transition_or_warn(ReplicatorState::idle);
        tokio::select! {
            _ = stopped(stop) => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
            _ = shared.control.notified() => backoff.reset(),
        }
    }
}

/// One connection's worth of work
async fn session(
    shared: &Arc<Shared>,
    stop: &mut watch::Receiver<bool>,
    backoff: &mut Backoff,
    reset_checkpoint: &mut bool,
) -> ReplicationResult<SessionEnd> {
    let config = &shared.config;
    shared.transition(ReplicatorState::connect)?;
    let request = ConnectRequest {
        endpoint: config.endpoint.clone(),
        authenticator: config.authenticator.clone(),
        pinned_server_certificate: config.pinned_server_certificate.clone(),
        headers: config.headers.clone(),
    };
    let conn = tokio::select! {
        conn = shared.transport.connect(request) => conn?,
        _ = stopped(stop) => return Ok(SessionEnd::Finished),
    };

    shared.transition(ReplicatorState::negotiate)?;
    let ctx = tokio::select! {
        ctx = SyncContext::open(shared.clone(), conn, *reset_checkpoint) => ctx?,
        _ = stopped(stop) => return Ok(SessionEnd::Finished),
    };
    *reset_checkpoint = false;

    loop {
        shared.transition(ReplicatorState::sync)?;
        let Some(transferred) = run_cycle(&ctx, stop).await? else {
            return Ok(SessionEnd::Finished);
        };
        backoff.reset();
        shared.publish(|status| status.error = None);
        if transferred > 0 {
            continue;
        }
        if !config.continuous {
            return Ok(SessionEnd::Finished);
        }

        shared.transition(ReplicatorState::idle)?;
        tokio::select! {
            _ = stopped(stop) => return Ok(SessionEnd::Finished),
            _ = shared.control.notified() => {
                if shared.paused() {
                    return Ok(SessionEnd::Paused);
                }
            }
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(config.heartbeat) => {}
        }
    }
}

/// Runs a cycle; `None` if a stop arrived, after the grace period at most
async fn run_cycle(ctx: &SyncContext, stop: &mut watch::Receiver<bool>) -> ReplicationResult<Option<u64>> {
    let cycle = ctx.cycle();
    tokio::pin!(cycle);
    tokio::select! {
        result = &mut cycle => result.map(Some),
        _ = stopped(stop) => {
            match tokio::time::timeout(ctx.config().stop_grace_period, &mut cycle).await {
                Ok(result) => result.map(|_| None),
                Err(_) => {
                    Logger::warn(
                        Event::ReplicatorStopped.as_str(),
                        &[
                            ("endpoint", ctx.config().endpoint.as_str()),
                            ("reason", "grace period elapsed"),
                        ],
                    );
                    Ok(None)
                }
            }
        }
    }
}

/// Resolves once a stop has been requested
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
