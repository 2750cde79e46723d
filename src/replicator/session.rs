//! One connected sync session
//!
//! Holds the connection and the checkpoint for the life of a connection.
//! The pusher and the puller share it and run concurrently; checkpoint
//! saves are serialized through an async lock so the two directions never
//! overwrite each other's progress.

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::blob::BlobRef;
use crate::codec;
use crate::database::{Database, DbResult};
use crate::observability::{Event, Logger};

use super::checkpoint::Checkpoint;
use super::config::ReplicatorConfiguration;
use super::errors::{ReplicationError, ReplicationResult};
use super::protocol::{unexpected, Request, Response, PROTOCOL_VERSION};
use super::replicator::Shared;
use super::transport::Connection;
use super::{puller, pusher};

pub(crate) struct SyncContext {
    pub(crate) shared: Arc<Shared>,
    pub(crate) conn: Arc<dyn Connection>,
    checkpoint: AsyncMutex<Checkpoint>,
}

impl SyncContext {
    /// Greets the peer and settles the starting checkpoint
    pub(crate) async fn open(
        shared: Arc<Shared>,
        conn: Arc<dyn Connection>,
        reset_checkpoint: bool,
    ) -> ReplicationResult<Self> {
        match conn
            .request(Request::Hello {
                protocol_version: PROTOCOL_VERSION,
                client_id: shared.config.database.uuid().to_string(),
            })
            .await?
        {
            Response::Hello { protocol_version, .. } if protocol_version == PROTOCOL_VERSION => {}
            other => return Err(unexpected("hello", &other)),
        }

        let checkpoint_id = shared.checkpoint_id.clone();
        let checkpoint = if reset_checkpoint {
            Logger::info(
                Event::CheckpointReset.as_str(),
                &[("checkpoint_id", &checkpoint_id), ("reason", "requested")],
            );
            Checkpoint::default()
        } else {
            let id = checkpoint_id.clone();
            let local = blocking(&shared.config.database, move |db| db.get_checkpoint(&id))
                .await?
                .and_then(|body| Checkpoint::from_json(&body));
            let remote = match conn
                .request(Request::GetCheckpoint {
                    checkpoint_id: checkpoint_id.clone(),
                })
                .await?
            {
                Response::Checkpoint { body } => body.and_then(|b| Checkpoint::from_json(&b)),
                other => return Err(unexpected("get_checkpoint", &other)),
            };
            let negotiated = Checkpoint::negotiate(local, remote);
            if local.is_some() && Some(negotiated) != local {
                Logger::warn(
                    Event::CheckpointReset.as_str(),
                    &[
                        ("checkpoint_id", &checkpoint_id),
                        ("local", &negotiated.local.to_string()),
                        ("reason", "copies disagree"),
                        ("remote", &negotiated.remote.to_string()),
                    ],
                );
            }
            negotiated
        };

        Ok(Self {
            shared,
            conn,
            checkpoint: AsyncMutex::new(checkpoint),
        })
    }

    pub(crate) fn config(&self) -> &ReplicatorConfiguration {
        &self.shared.config
    }

    pub(crate) fn db(&self) -> &Database {
        &self.shared.config.database
    }

    pub(crate) fn checkpoint_id(&self) -> &str {
        &self.shared.checkpoint_id
    }

    pub(crate) async fn checkpoint(&self) -> Checkpoint {
        *self.checkpoint.lock().await
    }

    /// Runs one push and one pull pass concurrently
    ///
    /// Returns the number of revisions transferred in either direction.
    pub(crate) async fn cycle(&self) -> ReplicationResult<u64> {
        let kind = self.config().replicator_type;
        let push = async {
            if kind.pushes() {
                pusher::push(self).await
            } else {
                Ok(0)
            }
        };
        let pull = async {
            if kind.pulls() {
                puller::pull(self).await
            } else {
                Ok(0)
            }
        };
        let (pushed, pulled) = tokio::try_join!(push, pull)?;
        Ok(pushed + pulled)
    }

    /// Records push progress locally, then on the peer
    pub(crate) async fn advance_local(&self, sequence: u64) -> ReplicationResult<()> {
        let mut checkpoint = self.checkpoint.lock().await;
        if sequence <= checkpoint.local {
            return Ok(());
        }
        let next = Checkpoint {
            local: sequence,
            ..*checkpoint
        };
        let id = self.checkpoint_id().to_string();
        let body = next.to_json();
        let local_body = body.clone();
        blocking(self.db(), move |db| db.set_checkpoint(&id, &local_body)).await?;
        self.store_remote_copy(body).await?;
        *checkpoint = next;
        log_saved(self.checkpoint_id(), &next);
        Ok(())
    }

    /// Records pull progress
    ///
    /// `commit` receives the new checkpoint body and must store it in the
    /// same local transaction as the revisions it covers.
    pub(crate) async fn advance_remote<T, F>(&self, sequence: u64, commit: F) -> ReplicationResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database, Option<(String, String)>) -> DbResult<T> + Send + 'static,
    {
        let mut checkpoint = self.checkpoint.lock().await;
        let next = Checkpoint {
            remote: sequence.max(checkpoint.remote),
            ..*checkpoint
        };
        let moved = next != *checkpoint;
        let record = moved.then(|| (self.checkpoint_id().to_string(), next.to_json()));
        let result = blocking(self.db(), move |db| commit(db, record)).await?;
        if moved {
            *checkpoint = next;
            self.store_remote_copy(next.to_json()).await?;
            log_saved(self.checkpoint_id(), &next);
        }
        Ok(result)
    }

    async fn store_remote_copy(&self, body: String) -> ReplicationResult<()> {
        match self
            .conn
            .request(Request::SetCheckpoint {
                checkpoint_id: self.checkpoint_id().to_string(),
                body,
            })
            .await?
        {
            Response::Ok => Ok(()),
            other => Err(unexpected("set_checkpoint", &other)),
        }
    }
}

fn log_saved(checkpoint_id: &str, checkpoint: &Checkpoint) {
    Logger::trace(
        Event::CheckpointSaved.as_str(),
        &[
            ("checkpoint_id", checkpoint_id),
            ("local", &checkpoint.local.to_string()),
            ("remote", &checkpoint.remote.to_string()),
        ],
    );
}

/// Runs database work off the async workers
pub(crate) async fn blocking<T, F>(db: &Database, f: F) -> ReplicationResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> DbResult<T> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| ReplicationError::database(format!("database task failed: {}", e)))?
        .map_err(ReplicationError::from)
}

/// Blob references in a codec-encoded body
pub(crate) fn blobs_in(body: &[u8]) -> ReplicationResult<Vec<BlobRef>> {
    let value = codec::decode(body).map_err(|e| ReplicationError::corrupt_data(e.to_string()))?;
    let mut refs = Vec::new();
    BlobRef::collect(&value, &mut refs);
    Ok(refs)
}
