//! Transport abstraction
//!
//! A transport opens connections to an endpoint; a connection carries
//! request/response exchanges. Connections are shared by the pusher and
//! the puller, which run concurrently.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::config::{Authenticator, Endpoint};
use super::errors::ReplicationResult;
use super::protocol::{Request, Response};

/// Everything a transport needs to open a connection
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub endpoint: Endpoint,
    pub authenticator: Option<Authenticator>,
    pub pinned_server_certificate: Option<Vec<u8>>,
    pub headers: BTreeMap<String, String>,
}

pub trait Connection: Send + Sync {
    /// Sends one request and waits for its response
    ///
    /// Error responses from the peer come back as `Err`.
    fn request(&self, request: Request) -> BoxFuture<'_, ReplicationResult<Response>>;
}

pub trait Transport: Send + Sync {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'_, ReplicationResult<Arc<dyn Connection>>>;
}
