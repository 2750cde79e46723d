//! Replication filters
//!
//! A filter sees each document about to be pushed or applied after a pull
//! and decides whether it crosses. Rejection is an outcome, not an error:
//! the document is skipped and the checkpoint stays behind it.
//!
//! Channel and document ID restrictions are part of the checkpoint's
//! identity, so documents outside them are passed over for good instead.

use crate::codec::Value;
use crate::document::Document;

/// Property holding a document's channel names
pub const CHANNELS_PROPERTY: &str = "channels";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DocumentFlags {
    pub deleted: bool,
}

pub trait ReplicationFilter: Send + Sync {
    fn accept(&self, doc: &Document, flags: DocumentFlags) -> bool;
}

impl<F> ReplicationFilter for F
where
    F: Fn(&Document, DocumentFlags) -> bool + Send + Sync,
{
    fn accept(&self, doc: &Document, flags: DocumentFlags) -> bool {
        self(doc, flags)
    }
}

/// Channels a document is assigned to
///
/// The `channels` property may be a single string or an array of strings.
pub fn document_channels(doc: &Document) -> Vec<String> {
    match doc.get(CHANNELS_PROPERTY) {
        Ok(Some(Value::String(name))) => vec![name],
        Ok(Some(Value::Array(items))) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Whether a document passes a channel restriction
///
/// An empty restriction passes everything. Tombstones carry no channels
/// and always pass, so deletions reach every peer that saw the document.
pub fn in_channels(doc: &Document, flags: DocumentFlags, channels: &[String]) -> bool {
    if channels.is_empty() || flags.deleted {
        return true;
    }
    document_channels(doc).iter().any(|c| channels.contains(c))
}

/// Whether a document ID passes a document ID restriction
pub fn in_document_ids(doc_id: &str, document_ids: &[String]) -> bool {
    document_ids.is_empty() || document_ids.iter().any(|id| id == doc_id)
}

/// How a document fares against a replicator's restrictions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Accept,
    /// Outside the channel or ID restriction
    Skip,
    /// Refused by the user filter; the checkpoint must not pass it
    Reject,
}

pub(crate) fn admit(
    doc: &Document,
    flags: DocumentFlags,
    document_ids: &[String],
    channels: &[String],
    filter: Option<&dyn ReplicationFilter>,
) -> Admission {
    if !in_document_ids(doc.id(), document_ids) || !in_channels(doc, flags, channels) {
        return Admission::Skip;
    }
    match filter {
        Some(filter) if !filter.accept(doc, flags) => Admission::Reject,
        _ => Admission::Accept,
    }
}
