//! Revision tree
//!
//! Every document keeps the tree of its revisions. Leaves are revisions
//! with no children; more than one live (non-deleted) leaf means the
//! document is conflicted.
//!
//! # Invariants
//!
//! - A child's generation is exactly its parent's generation + 1
//! - Revision IDs are unique within a tree; re-inserting one is a no-op
//! - Leaves always keep their bodies; only interior revisions lose them
//!   during compaction
//! - The winner is deterministic: live leaves beat tombstones, then the
//!   highest revision ID wins

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::errors::{DocumentError, DocumentResult};
use super::revision::RevisionId;

/// One revision in the tree
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionNode {
    pub rev_id: RevisionId,
    pub parent: Option<RevisionId>,
    pub deleted: bool,
    /// Canonical encoded body; `None` for compacted or grafted ancestors
    pub body: Option<Arc<Vec<u8>>>,
    /// Local sequence at which this revision was stored (0 for stubs)
    pub sequence: u64,
    /// Whether the revision arrived through replication
    pub from_remote: bool,
}

impl RevisionNode {
    /// A body-less ancestor known only by ID
    pub fn stub(rev_id: RevisionId, parent: Option<RevisionId>) -> Self {
        Self {
            rev_id,
            parent,
            deleted: false,
            body: None,
            sequence: 0,
            from_remote: true,
        }
    }
}

/// Result of inserting a revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RevTree {
    nodes: BTreeMap<RevisionId, RevisionNode>,
}

impl RevTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, rev: &RevisionId) -> bool {
        self.nodes.contains_key(rev)
    }

    pub fn get(&self, rev: &RevisionId) -> Option<&RevisionNode> {
        self.nodes.get(rev)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RevisionNode> {
        self.nodes.values()
    }

    /// Inserts a revision whose parent (if any) is already in the tree
    ///
    /// A revision whose parent was pruned away is accepted as long as its
    /// generation is above every pruned generation.
    pub fn insert(&mut self, node: RevisionNode) -> DocumentResult<InsertOutcome> {
        if let Some(existing) = self.nodes.get_mut(&node.rev_id) {
            // A stub can be filled in once the body is known
            if existing.body.is_none() && node.body.is_some() {
                existing.body = node.body;
                existing.deleted = node.deleted;
            }
            return Ok(InsertOutcome::AlreadyPresent);
        }

        match &node.parent {
            Some(parent) => {
                if node.rev_id.generation() != parent.generation() + 1 {
                    return Err(DocumentError::InvalidRevision(format!(
                        "{} cannot be a child of {}",
                        node.rev_id, parent
                    )));
                }
                if !self.nodes.contains_key(parent) && !self.is_pruned_ancestor(parent) {
                    return Err(DocumentError::InvalidRevision(format!(
                        "parent {} of {} is unknown",
                        parent, node.rev_id
                    )));
                }
            }
            None => {
                if node.rev_id.generation() != 1 {
                    return Err(DocumentError::InvalidRevision(format!(
                        "root revision {} must be generation 1",
                        node.rev_id
                    )));
                }
            }
        }

        self.nodes.insert(node.rev_id.clone(), node);
        Ok(InsertOutcome::Inserted)
    }

    /// Inserts a revision together with its ancestry
    ///
    /// `history` lists ancestors newest first (`history[0]` is the parent).
    /// Ancestors missing from the tree are grafted in as stubs.
    pub fn insert_with_history(
        &mut self,
        mut node: RevisionNode,
        history: &[RevisionId],
    ) -> DocumentResult<InsertOutcome> {
        if self.nodes.contains_key(&node.rev_id) {
            return self.insert(node);
        }

        let mut expected = node.rev_id.generation();
        for ancestor in history {
            if ancestor.generation() + 1 != expected {
                return Err(DocumentError::InvalidRevision(format!(
                    "history of {} skips a generation at {}",
                    node.rev_id, ancestor
                )));
            }
            expected = ancestor.generation();
        }

        // Walk from the oldest unknown ancestor towards the new revision
        let known = history
            .iter()
            .position(|rev| self.nodes.contains_key(rev))
            .unwrap_or(history.len());
        for i in (0..known).rev() {
            let parent = history.get(i + 1).cloned();
            let stub = RevisionNode::stub(history[i].clone(), parent);
            self.insert_unchecked(stub);
        }

        if let Some(parent) = history.first() {
            node.parent = Some(parent.clone());
        }
        self.insert(node)
    }

    /// Inserts a revision whose ancestors are no longer in the tree
    ///
    /// Used when reloading a compacted tree; the generation must still
    /// follow the stated parent.
    pub fn insert_detached(&mut self, node: RevisionNode) -> DocumentResult<InsertOutcome> {
        if self.nodes.contains_key(&node.rev_id) {
            return self.insert(node);
        }
        if let Some(parent) = &node.parent {
            if node.rev_id.generation() != parent.generation() + 1 {
                return Err(DocumentError::InvalidRevision(format!(
                    "{} cannot be a child of {}",
                    node.rev_id, parent
                )));
            }
        }
        self.insert_unchecked(node);
        Ok(InsertOutcome::Inserted)
    }

    fn insert_unchecked(&mut self, node: RevisionNode) {
        self.nodes.entry(node.rev_id.clone()).or_insert(node);
    }

    fn is_pruned_ancestor(&self, rev: &RevisionId) -> bool {
        self.nodes
            .values()
            .any(|n| n.parent.as_ref() == Some(rev) && !self.nodes.contains_key(rev))
            || self.min_generation().map(|g| rev.generation() < g).unwrap_or(false)
    }

    /// Lowest generation still present
    pub fn min_generation(&self) -> Option<u64> {
        self.nodes.keys().map(RevisionId::generation).min()
    }

    /// Revisions with no children
    pub fn leaves(&self) -> Vec<&RevisionNode> {
        let parents: BTreeSet<&RevisionId> =
            self.nodes.values().filter_map(|n| n.parent.as_ref()).collect();
        self.nodes
            .values()
            .filter(|n| !parents.contains(&n.rev_id))
            .collect()
    }

    pub fn is_leaf(&self, rev: &RevisionId) -> bool {
        self.nodes.contains_key(rev) && !self.nodes.values().any(|n| n.parent.as_ref() == Some(rev))
    }

    /// Leaves that are not tombstones
    pub fn live_leaves(&self) -> Vec<&RevisionNode> {
        self.leaves().into_iter().filter(|n| !n.deleted).collect()
    }

    /// The current revision
    pub fn winner(&self) -> Option<&RevisionNode> {
        self.leaves()
            .into_iter()
            .max_by(|a, b| (!a.deleted, &a.rev_id).cmp(&(!b.deleted, &b.rev_id)))
    }

    pub fn is_conflicted(&self) -> bool {
        self.live_leaves().len() > 1
    }

    /// The revision followed by its known ancestors, newest first
    pub fn ancestry(&self, rev: &RevisionId) -> Vec<RevisionId> {
        let mut out = Vec::new();
        let mut current = self.nodes.get(rev);
        while let Some(node) = current {
            out.push(node.rev_id.clone());
            current = node.parent.as_ref().and_then(|p| self.nodes.get(p));
        }
        out
    }

    /// Nearest revision that is an ancestor of (or equal to) both
    pub fn common_ancestor(&self, a: &RevisionId, b: &RevisionId) -> Option<RevisionId> {
        let a_line: BTreeSet<RevisionId> = self.ancestry(a).into_iter().collect();
        self.ancestry(b).into_iter().find(|rev| a_line.contains(rev))
    }

    /// Highest local sequence of any revision
    pub fn max_sequence(&self) -> u64 {
        self.nodes.values().map(|n| n.sequence).max().unwrap_or(0)
    }

    /// Keeps only the newest `max_depth` revisions of every branch
    ///
    /// Returns the number of revisions removed.
    pub fn prune(&mut self, max_depth: usize) -> usize {
        let max_depth = max_depth.max(1);
        let keep: BTreeSet<RevisionId> = self
            .leaves()
            .iter()
            .flat_map(|leaf| self.ancestry(&leaf.rev_id).into_iter().take(max_depth))
            .collect();
        let before = self.nodes.len();
        self.nodes.retain(|rev, _| keep.contains(rev));
        before - self.nodes.len()
    }

    /// Drops the bodies of interior revisions
    ///
    /// Returns the number of bytes released.
    pub fn drop_interior_bodies(&mut self) -> usize {
        let parents: BTreeSet<RevisionId> =
            self.nodes.values().filter_map(|n| n.parent.clone()).collect();
        let mut released = 0;
        for node in self.nodes.values_mut() {
            if parents.contains(&node.rev_id) {
                if let Some(body) = node.body.take() {
                    released += body.len();
                }
            }
        }
        released
    }
}
