//! Process group abstraction
//!
//! A process group is the fixed set of ranks taking part in one job. It
//! provides tagged point-to-point messaging, the end-of-job barrier and a
//! group-wide abort signal. Two bindings exist:
//!
//! - [`LocalGroup`]: in-process loopback, used for the single-node fallback
//!   and for running several ranks inside one process.
//! - [`TcpGroup`]: real cluster IPC, a star of TCP connections around rank 0.

pub mod local;
pub mod mailbox;
pub mod tcp;

pub use local::LocalGroup;
pub use tcp::TcpGroup;

use batchdispatch_common::error::{DispatchError, Result, EXIT_FAILURE};
use batchdispatch_common::WorkerId;
use batchdispatch_proto::{BarrierEnter, BarrierRelease, Envelope, Message, Tag};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Which rank aborted the group, and with what exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortNotice {
    pub rank: WorkerId,
    pub code: i32,
}

impl From<AbortNotice> for DispatchError {
    fn from(notice: AbortNotice) -> Self {
        DispatchError::Aborted {
            rank: notice.rank,
            code: notice.code,
        }
    }
}

/// Membership and messaging for the ranks of one job
pub trait ProcessGroup: Send + Sync + 'static {
    /// This process's rank
    fn rank(&self) -> WorkerId;

    /// Number of ranks in the group
    fn size(&self) -> u32;

    /// Send `message` to rank `dest`
    fn send(&self, dest: WorkerId, message: Message) -> impl Future<Output = Result<()>> + Send;

    /// Next message carrying `tag`, from any rank, in arrival order
    fn recv(&self, tag: Tag) -> impl Future<Output = Result<Envelope>> + Send;

    /// Block until every rank has entered the barrier
    fn barrier(&self) -> impl Future<Output = Result<()>> + Send;

    /// Signal every rank that the job is aborted
    fn abort(&self, code: i32, reason: &str) -> impl Future<Output = ()> + Send;

    /// Resolves once any rank has aborted the group
    fn aborted(&self) -> impl Future<Output = AbortNotice> + Send;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// One-shot, group-wide abort flag
#[derive(Debug, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    notice: Mutex<Option<AbortNotice>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `notice`; only the first abort is kept
    pub fn raise(&self, notice: AbortNotice) -> bool {
        {
            let mut slot = self.notice.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(notice);
        }
        self.token.cancel();
        true
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) -> AbortNotice {
        self.token.cancelled().await;
        let notice = *self.notice.lock();
        notice.unwrap_or(AbortNotice {
            rank: 0,
            code: EXIT_FAILURE,
        })
    }
}

/// Barrier built from messages: every rank reports to rank 0, which releases all
pub(crate) async fn star_barrier<G: ProcessGroup>(group: &G) -> Result<()> {
    let rank = group.rank();
    let size = group.size();
    if size == 1 {
        return Ok(());
    }

    if rank == 0 {
        let mut arrived = BTreeSet::new();
        while arrived.len() < (size - 1) as usize {
            let envelope = group.recv(Tag::Barrier).await?;
            let entered = match envelope.message {
                Message::Barrier(BarrierEnter { rank }) if rank == envelope.source => rank,
                other => {
                    return Err(DispatchError::unexpected(format!(
                        "invalid barrier message from rank {}: {:?}",
                        envelope.source, other
                    )))
                }
            };
            if entered == 0 || !arrived.insert(entered) {
                return Err(DispatchError::unexpected(format!(
                    "rank {} entered the barrier twice",
                    entered
                )));
            }
            debug!("rank {} reached the barrier ({} of {})", entered, arrived.len(), size - 1);
        }
        for dest in 1..size {
            group
                .send(dest, Message::Release(BarrierRelease {}))
                .await?;
        }
    } else {
        group
            .send(0, Message::Barrier(BarrierEnter { rank }))
            .await?;
        group.recv(Tag::Release).await?;
    }
    Ok(())
}
