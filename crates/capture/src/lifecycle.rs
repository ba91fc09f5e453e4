//! Staging of document messages into arena-backed batches,
//! and the inverse reader of a pushed transaction.

use crate::Error;
use anyhow::Context;
use link::MessageSink;
use proto_flow::capture::{Documents, PullResponse, PushRequest};
use proto_flow::flow::{self, Slice};

/// Capacity of a staged batch's document arena.
pub const ARENA_CAPACITY: usize = 1 << 14; // 16 KiB
/// Capacity of a staged batch's document slices.
pub const DOCS_CAPACITY: usize = 32;

/// Stage a captured document into the Documents batch of a pull RPC,
/// first flushing `current` to the stream if the document doesn't fit.
pub async fn stage_pull_documents<S>(
    tx: &mut S,
    current: &mut Option<Documents>,
    binding: u32,
    doc: &[u8],
) -> anyhow::Result<()>
where
    S: MessageSink<PullResponse>,
{
    if let Some(flushed) = stage_document(current, binding, doc) {
        tx.send_message(documents_response(flushed))
            .await
            .context("sending Documents response")?;
    }
    Ok(())
}

/// Stage a captured document into the Documents batch of a push RPC,
/// first flushing `current` to the stream if the document doesn't fit.
pub async fn stage_push_documents<S>(
    tx: &mut S,
    current: &mut Option<Documents>,
    binding: u32,
    doc: &[u8],
) -> anyhow::Result<()>
where
    S: MessageSink<PushRequest>,
{
    if let Some(flushed) = stage_document(current, binding, doc) {
        tx.send_message(documents_request(flushed))
            .await
            .context("sending Documents request")?;
    }
    Ok(())
}

/// Flush `current` (if any) and write a Checkpoint of a pull RPC.
pub async fn write_pull_checkpoint<S>(
    tx: &mut S,
    current: &mut Option<Documents>,
    checkpoint: flow::DriverCheckpoint,
) -> anyhow::Result<()>
where
    S: MessageSink<PullResponse>,
{
    if let Some(flushed) = current.take() {
        tx.send_message(documents_response(flushed))
            .await
            .context("sending Documents response")?;
    }
    tx.send_message(PullResponse {
        checkpoint: Some(checkpoint),
        ..Default::default()
    })
    .await
    .context("sending Checkpoint response")
}

/// Flush `current` (if any) and write a Checkpoint of a push RPC.
pub async fn write_push_checkpoint<S>(
    tx: &mut S,
    current: &mut Option<Documents>,
    checkpoint: flow::DriverCheckpoint,
) -> anyhow::Result<()>
where
    S: MessageSink<PushRequest>,
{
    if let Some(flushed) = current.take() {
        tx.send_message(documents_request(flushed))
            .await
            .context("sending Documents request")?;
    }
    tx.send_message(PushRequest {
        checkpoint: Some(checkpoint),
        ..Default::default()
    })
    .await
    .context("sending Checkpoint request")
}

// Stage `doc` into `current`, returning a batch which must now be flushed.
// A batch is flushed when its binding differs, when the document doesn't
// fit its remaining arena, or when its slices are at capacity. A document
// larger than the arena capacity becomes a single over-sized batch.
fn stage_document(
    current: &mut Option<Documents>,
    binding: u32,
    doc: &[u8],
) -> Option<Documents> {
    let flushed = match current {
        Some(cur)
            if cur.binding != binding
                || doc.len() > ARENA_CAPACITY - cur.arena.len().min(ARENA_CAPACITY)
                || cur.docs_json.len() == DOCS_CAPACITY =>
        {
            current.take()
        }
        _ => None,
    };

    let cur = current.get_or_insert_with(|| Documents {
        binding,
        arena: Vec::with_capacity(ARENA_CAPACITY),
        docs_json: Vec::with_capacity(DOCS_CAPACITY),
    });

    let begin = cur.arena.len() as u32;
    cur.arena.extend_from_slice(doc);
    cur.docs_json.push(Slice {
        begin,
        end: cur.arena.len() as u32,
    });

    flushed
}

fn documents_response(documents: Documents) -> PullResponse {
    PullResponse {
        documents: Some(documents),
        ..Default::default()
    }
}

fn documents_request(documents: Documents) -> PushRequest {
    PushRequest {
        documents: Some(documents),
        ..Default::default()
    }
}

/// Read one pushed transaction from the stream: Documents batches through
/// their closing Checkpoint. Returns None at a clean EOF arriving before
/// any batch. An EOF after batches but before their Checkpoint, or batches
/// exceeding `max_bytes` of summed arena, are errors.
pub async fn read_push_checkpoint(
    rx: &mut link::ServerRecv<PushRequest>,
    max_bytes: usize,
) -> Result<Option<(Vec<Documents>, flow::DriverCheckpoint)>, Error> {
    let mut batches = Vec::new();
    let mut bytes = 0;

    loop {
        let req = match rx.recv().await {
            Some(req) => req,
            None if batches.is_empty() => return Ok(None),
            None => return Err(Error::UnexpectedEof),
        };
        req.validate()?;
        let received = crate::push_request_name(&req);

        if let Some(documents) = req.documents {
            bytes += documents.arena.len();
            batches.push(documents);

            if bytes > max_bytes {
                return Err(Error::CheckpointOverflow {
                    bytes,
                    max: max_bytes,
                });
            }
        } else if let Some(checkpoint) = req.checkpoint {
            return Ok(Some((batches, checkpoint)));
        } else {
            return Err(Error::UnexpectedMessage {
                expected: "Documents or Checkpoint",
                received,
            });
        }
    }
}
