//! Replicator
//!
//! Synchronizes one database with a peer over a request/response
//! protocol. Push and pull each keep a position in a shared checkpoint
//! that both sides store; a session resumes from it after a restart.
//!
//! - Revisions carry their ancestry, so either side can graft them
//! - Blobs travel before the revisions that reference them
//! - Concurrent edits become conflicts, resolved on the active side
//! - Network errors retry with backoff; authentication and trust
//!   errors stop the replicator

mod backoff;
mod checkpoint;
mod config;
mod errors;
mod filter;
mod loopback;
mod protocol;
mod puller;
mod pusher;
#[allow(clippy::module_inception)]
mod replicator;
mod session;
mod state;
mod status;
mod transport;

pub use backoff::{Backoff, BASE_DELAY};
pub use checkpoint::{checkpoint_id, Checkpoint};
pub use config::{
    Authenticator, Endpoint, ReplicatorConfiguration, ReplicatorSettings, ReplicatorType, DEFAULT_ONE_SHOT_ATTEMPTS,
};
pub use errors::{ReplicationError, ReplicationErrorKind, ReplicationResult};
pub use filter::{document_channels, in_channels, in_document_ids, DocumentFlags, ReplicationFilter, CHANNELS_PROPERTY};
pub use loopback::{LoopbackTransport, PeerHandler};
pub use protocol::{
    decode_request, decode_response, encode_request, encode_response, Request, Response, RevisionRequest,
    PROTOCOL_VERSION,
};
pub use replicator::Replicator;
pub use state::ReplicatorState;
pub use status::{
    ActivityLevel, Direction, DocumentReplication, Progress, ReplicatedDocument, ReplicatorChange, ReplicatorStatus,
};
pub use transport::{ConnectRequest, Connection, Transport};
