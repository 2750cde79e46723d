//! Conflict resolution
//!
//! A resolver sees the two competing leaf revisions and, when known, their
//! common ancestor, and decides what the document should become. The
//! database applies the decision so that every peer running the same
//! resolver on the same revisions produces the same revision IDs.

use std::sync::Arc;

use crate::codec::{self, Dict, Value};

use super::errors::{DocumentError, DocumentResult};
use super::revision::RevisionId;

/// Immutable snapshot of one revision handed to resolvers and filters
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub doc_id: String,
    pub rev_id: RevisionId,
    pub deleted: bool,
    pub body: Option<Arc<Vec<u8>>>,
}

impl Revision {
    pub fn generation(&self) -> u64 {
        self.rev_id.generation()
    }

    /// Decoded body; `None` if the body was compacted away
    pub fn properties(&self) -> DocumentResult<Option<Dict>> {
        match &self.body {
            None => Ok(None),
            Some(bytes) => match codec::decode(bytes)? {
                Value::Dict(dict) => Ok(Some(dict)),
                _ => Err(DocumentError::NotADict),
            },
        }
    }
}

/// Outcome chosen by a resolver
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
    /// New content written as a child of the higher of the two revisions
    Merge(Dict),
    /// Both sides are replaced by a tombstone
    Delete,
}

pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, local: &Revision, remote: &Revision, ancestor: Option<&Revision>) -> Resolution;
}

impl<F> ConflictResolver for F
where
    F: Fn(&Revision, &Revision, Option<&Revision>) -> Resolution + Send + Sync,
{
    fn resolve(&self, local: &Revision, remote: &Revision, ancestor: Option<&Revision>) -> Resolution {
        self(local, remote, ancestor)
    }
}

/// Higher generation wins; equal generations are broken by the lexical
/// order of the revision IDs
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConflictResolver;

impl ConflictResolver for DefaultConflictResolver {
    fn resolve(&self, local: &Revision, remote: &Revision, _ancestor: Option<&Revision>) -> Resolution {
        if remote.rev_id > local.rev_id {
            Resolution::KeepRemote
        } else {
            Resolution::KeepLocal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(id: &str) -> Revision {
        Revision {
            doc_id: "x".into(),
            rev_id: RevisionId::parse(id).unwrap(),
            deleted: false,
            body: None,
        }
    }

    #[test]
    fn test_default_prefers_higher_generation() {
        let resolver = DefaultConflictResolver;
        assert_eq!(resolver.resolve(&rev("3-aa"), &rev("2-ff"), None), Resolution::KeepLocal);
        assert_eq!(resolver.resolve(&rev("2-ff"), &rev("3-aa"), None), Resolution::KeepRemote);
    }

    #[test]
    fn test_default_tie_break_is_symmetric() {
        let resolver = DefaultConflictResolver;
        let a = rev("2-aaaa");
        let b = rev("2-bbbb");
        // both peers pick 2-bbbb whichever side they see it from
        assert_eq!(resolver.resolve(&a, &b, None), Resolution::KeepRemote);
        assert_eq!(resolver.resolve(&b, &a, None), Resolution::KeepLocal);
    }

    #[test]
    fn test_closure_resolver() {
        let resolver = |_: &Revision, _: &Revision, _: Option<&Revision>| Resolution::Delete;
        assert_eq!(resolver.resolve(&rev("1-a"), &rev("1-b"), None), Resolution::Delete);
    }

    #[test]
    fn test_properties_of_compacted_revision() {
        assert_eq!(rev("1-a").properties().unwrap(), None);
    }
}
