//! Replication protocol messages
//!
//! One request gets one response. Messages are framed as JSON objects
//! tagged by `type`; revision bodies stay codec-encoded inside them
//! (base64 in the JSON).

use serde::{Deserialize, Serialize};

use crate::database::{ChangeEntry, RevisionTransfer};
use crate::document::RevisionId;

use super::errors::{ReplicationError, ReplicationErrorKind, ReplicationResult};

/// Protocol revision spoken by this build
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRequest {
    pub doc_id: String,
    pub rev_id: RevisionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Opens a session
    Hello { protocol_version: u32, client_id: String },

    GetCheckpoint { checkpoint_id: String },

    SetCheckpoint { checkpoint_id: String, body: String },

    /// Peer changes after `since`
    Changes { since: u64, limit: usize },

    /// Which of these revisions the peer lacks
    ProposeRevisions { revisions: Vec<RevisionRequest> },

    /// Revisions for the peer to store
    PushRevisions { revisions: Vec<RevisionTransfer> },

    /// Revisions to send back
    GetRevisions { revisions: Vec<RevisionRequest> },

    /// Current revisions of whole documents
    GetDocuments { doc_ids: Vec<String> },

    /// Which of these blobs the peer lacks
    HasBlobs { digests: Vec<String> },

    PutBlob {
        digest: String,
        #[serde(with = "content_base64")]
        content: Vec<u8>,
    },

    GetBlob { digest: String },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::GetCheckpoint { .. } => "get_checkpoint",
            Request::SetCheckpoint { .. } => "set_checkpoint",
            Request::Changes { .. } => "changes",
            Request::ProposeRevisions { .. } => "propose_revisions",
            Request::PushRevisions { .. } => "push_revisions",
            Request::GetRevisions { .. } => "get_revisions",
            Request::GetDocuments { .. } => "get_documents",
            Request::HasBlobs { .. } => "has_blobs",
            Request::PutBlob { .. } => "put_blob",
            Request::GetBlob { .. } => "get_blob",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Hello { protocol_version: u32, server_id: String },

    Checkpoint { body: Option<String> },

    Changes { entries: Vec<ChangeEntry>, last_sequence: u64 },

    Missing { revisions: Vec<RevisionRequest> },

    Revisions { revisions: Vec<RevisionTransfer> },

    MissingBlobs { digests: Vec<String> },

    Blob {
        #[serde(with = "content_base64")]
        content: Vec<u8>,
    },

    Ok,

    Error { error: ReplicationError },
}

impl Response {
    pub fn error(kind: ReplicationErrorKind, message: impl Into<String>) -> Self {
        Response::Error {
            error: ReplicationError::new(kind, message),
        }
    }

    /// Turns an error response into `Err`
    pub fn into_result(self) -> ReplicationResult<Response> {
        match self {
            Response::Error { error } => Err(error),
            other => Ok(other),
        }
    }
}

pub fn encode_request(request: &Request) -> ReplicationResult<Vec<u8>> {
    serde_json::to_vec(request).map_err(|e| ReplicationError::protocol(format!("encode request: {}", e)))
}

pub fn decode_request(frame: &[u8]) -> ReplicationResult<Request> {
    serde_json::from_slice(frame).map_err(|e| ReplicationError::protocol(format!("decode request: {}", e)))
}

pub fn encode_response(response: &Response) -> ReplicationResult<Vec<u8>> {
    serde_json::to_vec(response).map_err(|e| ReplicationError::protocol(format!("encode response: {}", e)))
}

pub fn decode_response(frame: &[u8]) -> ReplicationResult<Response> {
    serde_json::from_slice(frame).map_err(|e| ReplicationError::protocol(format!("decode response: {}", e)))
}

/// Builds a protocol error for a response of the wrong type
pub fn unexpected(request: &str, response: &Response) -> ReplicationError {
    ReplicationError::protocol(format!("unexpected response to {}: {:?}", request, response))
}

mod content_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_framing() {
        let request = Request::PutBlob {
            digest: "sha256-abc".into(),
            content: vec![0, 1, 2, 255],
        };
        let frame = encode_request(&request).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(json["type"], "put_blob");
        assert_eq!(json["content"], "AAEC/w==");
        assert_eq!(decode_request(&frame).unwrap(), request);
    }

    #[test]
    fn test_error_response() {
        let frame = encode_response(&Response::error(ReplicationErrorKind::Auth, "denied")).unwrap();
        let err = decode_response(&frame).unwrap().into_result().unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::Auth);
        assert_eq!(err.message, "denied");
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        let err = decode_response(b"{\"type\":\"nope\"}").unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::Protocol);
    }
}
