//! Pull direction
//!
//! Reads the peer's change feed from the checkpoint, fetches the leaf
//! revisions not known locally, admits them through the filters, brings
//! in their blobs and stores each batch together with the advanced
//! checkpoint. Conflicts left behind are resolved straight away, and any
//! still open from an interrupted pass are resolved before the next one.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::database::{ApplyReport, Database, DbResult, RevisionTransfer};
use crate::document::{ConflictResolver, DefaultConflictResolver};
use crate::observability::{Event, Logger};

use super::errors::ReplicationResult;
use super::filter::{admit, in_document_ids, Admission, DocumentFlags};
use super::protocol::{unexpected, Request, Response, RevisionRequest};
use super::session::{blobs_in, blocking, SyncContext};
use super::status::{Direction, DocumentReplication, ReplicatedDocument};

/// Pulls everything after the remote checkpoint; returns revisions stored
pub(crate) async fn pull(ctx: &SyncContext) -> ReplicationResult<u64> {
    let mut pulled = resolve_pending(ctx).await?;
    if !ctx.config().disable_auto_purge {
        pulled += refetch_purged(ctx).await?;
    }

    let batch_size = ctx.config().batch_size;
    let mut cursor = ctx.checkpoint().await.remote;
    let mut pinned = false;

    loop {
        let entries = match ctx.conn.request(Request::Changes { since: cursor, limit: batch_size }).await? {
            Response::Changes { entries, .. } => entries,
            other => return Err(unexpected("changes", &other)),
        };
        let Some(last) = entries.last().map(|e| e.sequence) else {
            break;
        };
        ctx.shared.add_progress(0, entries.len() as u64);

        let document_ids = ctx.config().document_ids.clone();
        let candidates = entries.clone();
        let wanted: Vec<RevisionRequest> = blocking(ctx.db(), move |db| {
            Ok(candidates
                .iter()
                .filter(|e| in_document_ids(&e.doc_id, &document_ids))
                .flat_map(|e| {
                    e.leaf_revisions()
                        .filter(|rev| !db.has_revision(&e.doc_id, rev))
                        .map(|rev| RevisionRequest {
                            doc_id: e.doc_id.clone(),
                            rev_id: rev.clone(),
                        })
                        .collect::<Vec<_>>()
                })
                .collect())
        })
        .await?;

        let transfers = if wanted.is_empty() {
            Vec::new()
        } else {
            match ctx.conn.request(Request::GetRevisions { revisions: wanted }).await? {
                Response::Revisions { revisions } => revisions,
                other => return Err(unexpected("get_revisions", &other)),
            }
        };

        let (accepted, rejected) = admit_transfers(ctx, transfers).await?;
        let mut safe = None;
        for entry in &entries {
            if rejected.contains(&entry.doc_id) {
                pinned = true;
            }
            if !pinned {
                safe = Some(entry.sequence);
            }
        }

        fetch_blobs(ctx, &accepted).await?;
        let documents = replicated(&accepted);
        let resolver = resolver(ctx);
        let report = ctx
            .advance_remote(safe.unwrap_or(0), move |db, record| {
                if accepted.is_empty() && record.is_none() {
                    return Ok(ApplyReport::default());
                }
                let checkpoint = record.as_ref().map(|(id, body)| (id.as_str(), body.as_str()));
                store(db, &accepted, checkpoint, resolver.as_ref())
            })
            .await?;

        pulled += report.applied as u64;
        if report.applied > 0 {
            ctx.shared.post_documents(DocumentReplication {
                direction: Direction::Pull,
                documents,
            });
        }
        ctx.shared.add_progress(entries.len() as u64, 0);
        cursor = last;
    }
    Ok(pulled)
}

/// Fetches again the current revisions of pulled documents that expired
/// locally
async fn refetch_purged(ctx: &SyncContext) -> ReplicationResult<u64> {
    let document_ids = ctx.config().document_ids.clone();
    let doc_ids: Vec<String> = blocking(ctx.db(), |db| Ok(db.refetch_candidates()))
        .await?
        .into_iter()
        .filter(|id| in_document_ids(id, &document_ids))
        .collect();
    if doc_ids.is_empty() {
        return Ok(0);
    }

    let transfers = match ctx.conn.request(Request::GetDocuments { doc_ids }).await? {
        Response::Revisions { revisions } => revisions,
        other => return Err(unexpected("get_documents", &other)),
    };
    let (accepted, _) = admit_transfers(ctx, transfers).await?;
    if accepted.is_empty() {
        return Ok(0);
    }
    fetch_blobs(ctx, &accepted).await?;
    let documents = replicated(&accepted);
    let resolver = resolver(ctx);
    let report = blocking(ctx.db(), move |db| store(db, &accepted, None, resolver.as_ref())).await?;
    if report.applied > 0 {
        ctx.shared.post_documents(DocumentReplication {
            direction: Direction::Pull,
            documents,
        });
    }
    Ok(report.applied as u64)
}

/// Resolves documents left in conflict, for instance by a pass whose
/// resolution failed after its revisions were stored
async fn resolve_pending(ctx: &SyncContext) -> ReplicationResult<u64> {
    let document_ids = ctx.config().document_ids.clone();
    let resolver = resolver(ctx);
    blocking(ctx.db(), move |db| {
        let mut resolved = 0u64;
        for doc_id in db.conflicted_document_ids() {
            if in_document_ids(&doc_id, &document_ids) && db.resolve_conflicts(&doc_id, resolver.as_ref())? {
                resolved += 1;
            }
        }
        Ok(resolved)
    })
    .await
}

fn store(
    db: &Database,
    batch: &[RevisionTransfer],
    checkpoint: Option<(&str, &str)>,
    resolver: &dyn ConflictResolver,
) -> DbResult<ApplyReport> {
    let report = db.apply_remote_revisions(batch, checkpoint)?;
    for doc_id in &report.conflicted {
        db.resolve_conflicts(doc_id, resolver)?;
    }
    Ok(report)
}

fn resolver(ctx: &SyncContext) -> Arc<dyn ConflictResolver> {
    ctx.config()
        .conflict_resolver
        .clone()
        .unwrap_or_else(|| Arc::new(DefaultConflictResolver) as Arc<dyn ConflictResolver>)
}

/// Splits fetched revisions into those to store and the IDs of documents
/// the pull filter refused
async fn admit_transfers(
    ctx: &SyncContext,
    transfers: Vec<RevisionTransfer>,
) -> ReplicationResult<(Vec<RevisionTransfer>, BTreeSet<String>)> {
    let config = ctx.config();
    let document_ids = config.document_ids.clone();
    let channels = config.channels.clone();
    let filter = config.pull_filter.clone();
    let (accepted, rejected) = blocking(ctx.db(), move |_| {
        let mut verdicts = Vec::with_capacity(transfers.len());
        for transfer in transfers {
            let doc = transfer.to_document()?;
            let admission = admit(
                &doc,
                DocumentFlags {
                    deleted: transfer.deleted,
                },
                &document_ids,
                &channels,
                filter.as_deref(),
            );
            verdicts.push((transfer, admission));
        }
        let rejected: BTreeSet<String> = verdicts
            .iter()
            .filter(|(_, a)| *a == Admission::Reject)
            .map(|(t, _)| t.doc_id.clone())
            .collect();
        let accepted = verdicts
            .into_iter()
            .filter(|(t, a)| *a == Admission::Accept && !rejected.contains(&t.doc_id))
            .map(|(t, _)| t)
            .collect();
        Ok((accepted, rejected))
    })
    .await?;

    for doc_id in &rejected {
        Logger::info(
            Event::DocumentRejected.as_str(),
            &[("direction", "pull"), ("doc_id", doc_id)],
        );
    }
    Ok((accepted, rejected))
}

/// Downloads referenced blobs that are not stored locally
async fn fetch_blobs(ctx: &SyncContext, transfers: &[RevisionTransfer]) -> ReplicationResult<()> {
    let mut digests = BTreeSet::new();
    for transfer in transfers {
        digests.extend(blobs_in(&transfer.body)?.into_iter().map(|b| b.digest));
    }
    for digest in digests {
        let key = digest.clone();
        if blocking(ctx.db(), move |db| Ok(db.blob_store().contains(&key)?)).await? {
            continue;
        }
        let content = match ctx.conn.request(Request::GetBlob { digest: digest.clone() }).await? {
            Response::Blob { content } => content,
            other => return Err(unexpected("get_blob", &other)),
        };
        blocking(ctx.db(), move |db| Ok(db.blob_store().store_expecting(&digest, &content)?)).await?;
    }
    Ok(())
}

fn replicated(transfers: &[RevisionTransfer]) -> Vec<ReplicatedDocument> {
    transfers
        .iter()
        .map(|t| ReplicatedDocument {
            doc_id: t.doc_id.clone(),
            rev_id: t.rev_id.to_string(),
            deleted: t.deleted,
            error: None,
        })
        .collect()
}
