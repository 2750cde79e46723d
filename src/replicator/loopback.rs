//! In-process transport
//!
//! `PeerHandler` serves a local database as a passive peer: it answers
//! protocol requests but never initiates anything. `LoopbackTransport`
//! routes endpoints to handlers and passes every message through the JSON
//! framing, so a loopback session exercises the same encoding a network
//! transport would.
//!
//! Handlers can be made unreachable, can inject transient failures, and
//! check credentials and pinned certificates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use subtle::ConstantTimeEq;

use crate::database::{Database, DatabaseError};

use super::config::Authenticator;
use super::errors::{ReplicationError, ReplicationResult};
use super::protocol::{
    decode_request, decode_response, encode_request, encode_response, Request, Response, RevisionRequest,
    PROTOCOL_VERSION,
};
use super::transport::{ConnectRequest, Connection, Transport};

/// Prefix of checkpoints a peer stores on behalf of its clients
const PEER_CHECKPOINT_PREFIX: &str = "peer/";

pub struct PeerHandler {
    db: Database,
    basic: Option<(String, String)>,
    sessions: Vec<String>,
    client_identities: Vec<String>,
    certificate: Option<Vec<u8>>,
    reachable: AtomicBool,
    /// Injected transient failures still to serve
    failures: AtomicU32,
    requests: AtomicU64,
}

impl PeerHandler {
    /// A peer serving `db` to anyone
    pub fn new(db: Database) -> Self {
        Self {
            db,
            basic: None,
            sessions: Vec::new(),
            client_identities: Vec::new(),
            certificate: None,
            reachable: AtomicBool::new(true),
            failures: AtomicU32::new(0),
            requests: AtomicU64::new(0),
        }
    }

    /// Requires these credentials (or an accepted session)
    pub fn require_basic(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic = Some((username.into(), password.into()));
        self
    }

    pub fn accept_session(mut self, session_id: impl Into<String>) -> Self {
        self.sessions.push(session_id.into());
        self
    }

    pub fn accept_client_certificate(mut self, identity: impl Into<String>) -> Self {
        self.client_identities.push(identity.into());
        self
    }

    /// Certificate presented to `wss://` clients
    pub fn with_certificate(mut self, certificate: Vec<u8>) -> Self {
        self.certificate = Some(certificate);
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Makes the next `n` connects or requests fail with a network error
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Requests served so far
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> ReplicationResult<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ReplicationError::network("host unreachable"));
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ReplicationError::network("connection reset by peer"));
        }
        Ok(())
    }

    fn check_certificate(&self, request: &ConnectRequest) -> ReplicationResult<()> {
        if !request.endpoint.is_secure() {
            return Ok(());
        }
        let Some(presented) = &self.certificate else {
            return Err(ReplicationError::tls_trust("peer presented no certificate"));
        };
        if let Some(pinned) = &request.pinned_server_certificate {
            if !bool::from(pinned.as_slice().ct_eq(presented.as_slice())) {
                return Err(ReplicationError::tls_trust("server certificate does not match the pinned certificate"));
            }
        }
        Ok(())
    }

    fn authenticate(&self, request: &ConnectRequest) -> ReplicationResult<()> {
        let open = self.basic.is_none() && self.sessions.is_empty() && self.client_identities.is_empty();
        if open {
            return Ok(());
        }
        let accepted = match &request.authenticator {
            Some(Authenticator::Basic { username, password }) => match &self.basic {
                Some((user, pass)) => {
                    let user_ok = username.as_bytes().ct_eq(user.as_bytes());
                    let pass_ok = password.as_bytes().ct_eq(pass.as_bytes());
                    bool::from(user_ok & pass_ok)
                }
                None => false,
            },
            Some(Authenticator::Session { session_id, .. }) => self
                .sessions
                .iter()
                .any(|s| bool::from(s.as_bytes().ct_eq(session_id.as_bytes()))),
            Some(Authenticator::Certificate { identity }) => self.client_identities.iter().any(|i| i == identity),
            None => false,
        };
        if accepted {
            Ok(())
        } else {
            Err(ReplicationError::auth("credentials rejected"))
        }
    }

    /// Answers one request
    pub fn handle(&self, request: Request) -> Response {
        self.requests.fetch_add(1, Ordering::SeqCst);
        match self.dispatch(request) {
            Ok(response) => response,
            Err(error) => Response::Error { error },
        }
    }

    fn dispatch(&self, request: Request) -> ReplicationResult<Response> {
        let db = &self.db;
        match request {
            Request::Hello { protocol_version, .. } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(ReplicationError::protocol(format!(
                        "unsupported protocol version {}",
                        protocol_version
                    )));
                }
                Ok(Response::Hello {
                    protocol_version: PROTOCOL_VERSION,
                    server_id: db.uuid().to_string(),
                })
            }
            Request::GetCheckpoint { checkpoint_id } => Ok(Response::Checkpoint {
                body: db.get_checkpoint(&peer_checkpoint(&checkpoint_id))?,
            }),
            Request::SetCheckpoint { checkpoint_id, body } => {
                db.set_checkpoint(&peer_checkpoint(&checkpoint_id), &body)?;
                Ok(Response::Ok)
            }
            Request::Changes { since, limit } => Ok(Response::Changes {
                entries: db.changes_since(since, limit)?,
                last_sequence: db.last_sequence(),
            }),
            Request::ProposeRevisions { revisions } => Ok(Response::Missing {
                revisions: revisions
                    .into_iter()
                    .filter(|r| !db.has_revision(&r.doc_id, &r.rev_id))
                    .collect(),
            }),
            Request::PushRevisions { revisions } => {
                db.apply_remote_revisions(&revisions, None)?;
                Ok(Response::Ok)
            }
            Request::GetRevisions { revisions } => {
                let mut out = Vec::with_capacity(revisions.len());
                for RevisionRequest { doc_id, rev_id } in revisions {
                    out.extend(db.revision_transfer(&doc_id, &rev_id)?);
                }
                Ok(Response::Revisions { revisions: out })
            }
            Request::GetDocuments { doc_ids } => {
                let snapshot = db.snapshot();
                let mut out = Vec::with_capacity(doc_ids.len());
                for doc_id in doc_ids {
                    if let Some(rev) = snapshot.current_revision(&doc_id) {
                        out.extend(db.revision_transfer(&doc_id, &rev)?);
                    }
                }
                Ok(Response::Revisions { revisions: out })
            }
            Request::HasBlobs { digests } => {
                let mut missing = Vec::new();
                for digest in digests {
                    if !db.blob_store().contains(&digest).map_err(DatabaseError::from)? {
                        missing.push(digest);
                    }
                }
                Ok(Response::MissingBlobs { digests: missing })
            }
            Request::PutBlob { digest, content } => {
                db.blob_store()
                    .store_expecting(&digest, &content)
                    .map_err(DatabaseError::from)?;
                Ok(Response::Ok)
            }
            Request::GetBlob { digest } => Ok(Response::Blob {
                content: db.blob_store().load(&digest).map_err(DatabaseError::from)?,
            }),
        }
    }
}

fn peer_checkpoint(checkpoint_id: &str) -> String {
    format!("{}{}", PEER_CHECKPOINT_PREFIX, checkpoint_id)
}

/// Routes endpoints to in-process peers
#[derive(Default)]
pub struct LoopbackTransport {
    peers: Mutex<HashMap<String, Arc<PeerHandler>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `peer` at `endpoint`
    pub fn register(&self, endpoint: &str, peer: Arc<PeerHandler>) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.to_string(), peer);
    }

    fn peer(&self, endpoint: &str) -> Option<Arc<PeerHandler>> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned()
    }
}

impl Transport for LoopbackTransport {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'_, ReplicationResult<Arc<dyn Connection>>> {
        async move {
            let peer = self
                .peer(request.endpoint.as_str())
                .ok_or_else(|| ReplicationError::network(format!("no route to {}", request.endpoint)))?;
            peer.check_available()?;
            peer.check_certificate(&request)?;
            peer.authenticate(&request)?;
            Ok(Arc::new(LoopbackConnection { peer }) as Arc<dyn Connection>)
        }
        .boxed()
    }
}

struct LoopbackConnection {
    peer: Arc<PeerHandler>,
}

impl Connection for LoopbackConnection {
    fn request(&self, request: Request) -> BoxFuture<'_, ReplicationResult<Response>> {
        async move {
            let frame = encode_request(&request)?;
            let peer = self.peer.clone();
            let reply = tokio::task::spawn_blocking(move || -> ReplicationResult<Vec<u8>> {
                peer.check_available()?;
                let response = peer.handle(decode_request(&frame)?);
                encode_response(&response)
            })
            .await
            .map_err(|e| ReplicationError::network(format!("peer task failed: {}", e)))??;
            decode_response(&reply)?.into_result()
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ConcurrencyControl, DatabaseConfig};
    use crate::document::Document;
    use crate::replicator::config::Endpoint;
    use crate::replicator::ReplicationErrorKind;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn database(temp: &TempDir) -> Database {
        let config = DatabaseConfig {
            expiration_sweep_interval_secs: 0,
            ..DatabaseConfig::in_directory(temp.path())
        };
        Database::open_named("peer", config).unwrap()
    }

    fn connect_request(url: &str, authenticator: Option<Authenticator>) -> ConnectRequest {
        ConnectRequest {
            endpoint: Endpoint::parse(url).unwrap(),
            authenticator,
            pinned_server_certificate: None,
            headers: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let temp = TempDir::new().unwrap();
        let db = database(&temp);
        let mut doc = Document::new("a");
        db.save_document(&mut doc, ConcurrencyControl::FailOnConflict).unwrap();

        let transport = LoopbackTransport::new();
        let peer = Arc::new(PeerHandler::new(db));
        transport.register("ws://peer/db", peer.clone());
        let conn = transport.connect(connect_request("ws://peer/db", None)).await.unwrap();

        match conn.request(Request::Changes { since: 0, limit: 10 }).await.unwrap() {
            Response::Changes { entries, last_sequence } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(last_sequence, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(peer.request_count(), 1);
    }

    #[tokio::test]
    async fn test_basic_auth() {
        let temp = TempDir::new().unwrap();
        let transport = LoopbackTransport::new();
        transport.register(
            "ws://peer/db",
            Arc::new(PeerHandler::new(database(&temp)).require_basic("user", "secret")),
        );
        let good = Authenticator::Basic {
            username: "user".into(),
            password: "secret".into(),
        };
        let bad = Authenticator::Basic {
            username: "user".into(),
            password: "guess".into(),
        };
        assert!(transport.connect(connect_request("ws://peer/db", Some(good))).await.is_ok());
        let err = transport
            .connect(connect_request("ws://peer/db", Some(bad)))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, ReplicationErrorKind::Auth);
        let err = transport.connect(connect_request("ws://peer/db", None)).await.err().unwrap();
        assert_eq!(err.kind, ReplicationErrorKind::Auth);
    }

    #[tokio::test]
    async fn test_pinned_certificate() {
        let temp = TempDir::new().unwrap();
        let transport = LoopbackTransport::new();
        transport.register(
            "wss://peer/db",
            Arc::new(PeerHandler::new(database(&temp)).with_certificate(b"server-cert".to_vec())),
        );
        let mut request = connect_request("wss://peer/db", None);
        request.pinned_server_certificate = Some(b"server-cert".to_vec());
        assert!(transport.connect(request.clone()).await.is_ok());

        request.pinned_server_certificate = Some(b"other-cert".to_vec());
        let err = transport.connect(request).await.err().unwrap();
        assert_eq!(err.kind, ReplicationErrorKind::TlsTrust);
    }

    #[tokio::test]
    async fn test_unreachable_and_injected_failures() {
        let temp = TempDir::new().unwrap();
        let transport = LoopbackTransport::new();
        let peer = Arc::new(PeerHandler::new(database(&temp)));
        transport.register("ws://peer/db", peer.clone());

        peer.set_reachable(false);
        let err = transport.connect(connect_request("ws://peer/db", None)).await.err().unwrap();
        assert!(err.is_transient());
        peer.set_reachable(true);

        peer.fail_next(1);
        assert!(transport.connect(connect_request("ws://peer/db", None)).await.is_err());
        assert!(transport.connect(connect_request("ws://peer/db", None)).await.is_ok());

        let err = transport.connect(connect_request("ws://nowhere/db", None)).await.err().unwrap();
        assert!(err.is_transient());
    }
}
