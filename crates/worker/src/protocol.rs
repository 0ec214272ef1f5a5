//! Dispatch protocol between rank 0 and remote workers
//!
//! A remote worker asks for work with `READY`, then reads `BATCH_LEN`. A zero
//! length means the queue is drained and no `BATCH` follows; otherwise a
//! `BATCH` frame with exactly that many indices comes next. Rank 0 keeps
//! answering until every remote worker has been told zero.

use batchdispatch_common::error::{DispatchError, Result};
use batchdispatch_common::{Batch, WorkerId};
use batchdispatch_dispatcher::Dispatcher;
use batchdispatch_proto::{BatchLen, Message, Ready, Tag, TaskBatch};
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::group::ProcessGroup;

/// Where a compute loop gets its next batch
pub enum BatchSource<'a, G> {
    /// Straight from a dispatcher in this process
    Direct(&'a Dispatcher),
    /// Over the wire from rank 0
    Remote(&'a G),
}

impl<G: ProcessGroup> BatchSource<'_, G> {
    /// Next batch for `worker`; empty once the job is drained
    pub async fn next_batch(&self, worker: WorkerId) -> Result<Batch> {
        match self {
            BatchSource::Direct(dispatcher) => {
                debug!("getting next batch directly");
                dispatcher.next_batch(worker)
            }
            BatchSource::Remote(group) => request_batch(*group).await,
        }
    }
}

/// Worker side of one protocol exchange
pub async fn request_batch<G: ProcessGroup>(group: &G) -> Result<Batch> {
    debug!("sending READY message");
    group.send(0, Message::ready(group.rank())).await?;

    let reply = group.recv(Tag::BatchLen).await?;
    let len = match reply.message {
        Message::BatchLen(BatchLen { len }) => len as usize,
        other => {
            return Err(DispatchError::unexpected(format!(
                "expected BATCH_LEN, got {:?}",
                other
            )))
        }
    };
    debug!("receiving batch of length {}", len);
    if len == 0 {
        return Ok(Batch::new());
    }

    let reply = group.recv(Tag::Batch).await?;
    let indices = match reply.message {
        Message::Batch(TaskBatch { indices }) => indices,
        other => {
            return Err(DispatchError::unexpected(format!(
                "expected BATCH, got {:?}",
                other
            )))
        }
    };
    if indices.len() != len {
        return Err(DispatchError::unexpected(format!(
            "announced a batch of {} tasks but received {}",
            len,
            indices.len()
        )));
    }
    Ok(indices)
}

/// Rank 0 side: answer `READY` requests until every worker in `workers` is done
///
/// Returns the number of batches handed out.
pub async fn serve<G, I>(group: &G, dispatcher: &Dispatcher, workers: I) -> Result<usize>
where
    G: ProcessGroup,
    I: IntoIterator<Item = WorkerId>,
{
    let mut active: BTreeSet<WorkerId> = workers.into_iter().collect();
    let mut served = 0;
    info!("Serving batches to {} remote workers", active.len());

    while !active.is_empty() {
        let request = group.recv(Tag::Ready).await?;
        let worker = match request.message {
            Message::Ready(Ready { rank }) if rank == request.source => rank,
            other => {
                return Err(DispatchError::unexpected(format!(
                    "invalid READY from rank {}: {:?}",
                    request.source, other
                )))
            }
        };
        if !active.contains(&worker) {
            return Err(DispatchError::unexpected(format!(
                "READY from rank {} which is not an active worker",
                worker
            )));
        }

        let batch = dispatcher.next_batch(worker)?;
        let len = u32::try_from(batch.len())
            .map_err(|_| DispatchError::internal("batch length exceeds u32"))?;
        group.send(worker, Message::batch_len(len)).await?;

        if batch.is_empty() {
            active.remove(&worker);
            debug!("rank {} is done, {} workers still busy", worker, active.len());
        } else {
            group.send(worker, Message::batch(batch)).await?;
            served += 1;
        }
    }

    info!("All remote workers done after {} batches", served);
    Ok(served)
}
