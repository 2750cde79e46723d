//! Push direction
//!
//! Walks the local change feed from the checkpoint, offers the leaf
//! revisions of each admitted document, sends what the peer lacks (blobs
//! first) and then moves the checkpoint past everything handled.

use std::collections::BTreeSet;

use crate::database::{ChangeEntry, RevisionTransfer};
use crate::observability::{Event, Logger};

use super::errors::ReplicationResult;
use super::filter::{admit, in_document_ids, Admission, DocumentFlags};
use super::protocol::{unexpected, Request, Response, RevisionRequest};
use super::session::{blobs_in, blocking, SyncContext};
use super::status::{Direction, DocumentReplication, ReplicatedDocument};

/// Pushes everything after the local checkpoint; returns revisions sent
pub(crate) async fn push(ctx: &SyncContext) -> ReplicationResult<u64> {
    let batch_size = ctx.config().batch_size;
    let mut cursor = ctx.checkpoint().await.local;
    let mut pinned = false;
    let mut pushed = 0u64;

    loop {
        let since = cursor;
        let changes = blocking(ctx.db(), move |db| db.changes_since(since, batch_size)).await?;
        let Some(last) = changes.last().map(|c| c.sequence) else {
            break;
        };
        ctx.shared.add_progress(0, changes.len() as u64);

        let admitted = admit_changes(ctx, changes).await?;
        let mut safe = None;
        let mut proposals = Vec::new();
        for (change, admission) in &admitted {
            match admission {
                Admission::Accept => proposals.extend(change.leaf_revisions().map(|rev| RevisionRequest {
                    doc_id: change.doc_id.clone(),
                    rev_id: rev.clone(),
                })),
                Admission::Skip => {}
                Admission::Reject => {
                    Logger::info(
                        Event::DocumentRejected.as_str(),
                        &[("direction", "push"), ("doc_id", &change.doc_id)],
                    );
                    pinned = true;
                }
            }
            if !pinned {
                safe = Some(change.sequence);
            }
        }

        if !proposals.is_empty() {
            let missing = match ctx.conn.request(Request::ProposeRevisions { revisions: proposals }).await? {
                Response::Missing { revisions } => revisions,
                other => return Err(unexpected("propose_revisions", &other)),
            };
            let transfers = load_transfers(ctx, missing).await?;
            if !transfers.is_empty() {
                send_blobs(ctx, &transfers).await?;
                let count = transfers.len() as u64;
                let documents = transfers
                    .iter()
                    .map(|t| ReplicatedDocument {
                        doc_id: t.doc_id.clone(),
                        rev_id: t.rev_id.to_string(),
                        deleted: t.deleted,
                        error: None,
                    })
                    .collect();
                match ctx.conn.request(Request::PushRevisions { revisions: transfers }).await? {
                    Response::Ok => {}
                    other => return Err(unexpected("push_revisions", &other)),
                }
                ctx.db().metrics().add_revisions_pushed(count);
                pushed += count;
                ctx.shared.post_documents(DocumentReplication {
                    direction: Direction::Push,
                    documents,
                });
            }
        }

        ctx.shared.add_progress(admitted.len() as u64, 0);
        if let Some(safe) = safe {
            ctx.advance_local(safe).await?;
        }
        cursor = last;
    }
    Ok(pushed)
}

async fn admit_changes(
    ctx: &SyncContext,
    changes: Vec<ChangeEntry>,
) -> ReplicationResult<Vec<(ChangeEntry, Admission)>> {
    let config = ctx.config();
    let document_ids = config.document_ids.clone();
    let channels = config.channels.clone();
    let filter = config.push_filter.clone();
    blocking(ctx.db(), move |db| {
        let mut out = Vec::with_capacity(changes.len());
        for change in changes {
            let admission = if !in_document_ids(&change.doc_id, &document_ids) {
                Admission::Skip
            } else {
                match db.revision_transfer(&change.doc_id, &change.rev_id)? {
                    Some(transfer) => admit(
                        &transfer.to_document()?,
                        DocumentFlags { deleted: change.deleted },
                        &document_ids,
                        &channels,
                        filter.as_deref(),
                    ),
                    None => Admission::Accept,
                }
            };
            out.push((change, admission));
        }
        Ok(out)
    })
    .await
}

async fn load_transfers(ctx: &SyncContext, wanted: Vec<RevisionRequest>) -> ReplicationResult<Vec<RevisionTransfer>> {
    blocking(ctx.db(), move |db| {
        let mut out = Vec::with_capacity(wanted.len());
        for RevisionRequest { doc_id, rev_id } in wanted {
            out.extend(db.revision_transfer(&doc_id, &rev_id)?);
        }
        Ok(out)
    })
    .await
}

/// Uploads blobs the peer lacks before the revisions that reference them
async fn send_blobs(ctx: &SyncContext, transfers: &[RevisionTransfer]) -> ReplicationResult<()> {
    let mut digests = BTreeSet::new();
    for transfer in transfers {
        digests.extend(blobs_in(&transfer.body)?.into_iter().map(|b| b.digest));
    }
    if digests.is_empty() {
        return Ok(());
    }
    let missing = match ctx
        .conn
        .request(Request::HasBlobs {
            digests: digests.into_iter().collect(),
        })
        .await?
    {
        Response::MissingBlobs { digests } => digests,
        other => return Err(unexpected("has_blobs", &other)),
    };
    for digest in missing {
        let key = digest.clone();
        let content = blocking(ctx.db(), move |db| Ok(db.blob_store().load(&key)?)).await?;
        match ctx.conn.request(Request::PutBlob { digest, content }).await? {
            Response::Ok => {}
            other => return Err(unexpected("put_blob", &other)),
        }
    }
    Ok(())
}
