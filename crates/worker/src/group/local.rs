//! In-process process group

use super::mailbox::Mailbox;
use super::{star_barrier, AbortNotice, AbortSignal, ProcessGroup};
use batchdispatch_common::error::{DispatchError, Result};
use batchdispatch_common::WorkerId;
use batchdispatch_proto::{Envelope, Message, Tag};
use std::sync::Arc;
use tracing::warn;

/// Ranks that share one address space
///
/// [`LocalGroup::single`] is the single-node fallback used when no cluster is
/// configured. [`LocalGroup::fabric`] builds a whole group whose members can
/// be driven from separate tasks, which is how multi-rank jobs run in tests.
#[derive(Clone)]
pub struct LocalGroup {
    rank: WorkerId,
    size: u32,
    mailboxes: Arc<Vec<Mailbox>>,
    signal: Arc<AbortSignal>,
}

impl LocalGroup {
    /// A group of one: rank 0 of size 1
    pub fn single() -> Self {
        Self {
            rank: 0,
            size: 1,
            mailboxes: Arc::new(vec![Mailbox::new()]),
            signal: Arc::new(AbortSignal::new()),
        }
    }

    /// Every member of a `size`-rank group, indexed by rank
    pub fn fabric(size: u32) -> Vec<Self> {
        let size = size.max(1);
        let mailboxes = Arc::new((0..size).map(|_| Mailbox::new()).collect::<Vec<_>>());
        let signal = Arc::new(AbortSignal::new());

        (0..size)
            .map(|rank| Self {
                rank,
                size,
                mailboxes: mailboxes.clone(),
                signal: signal.clone(),
            })
            .collect()
    }

    fn mailbox(&self, rank: WorkerId) -> Result<&Mailbox> {
        self.mailboxes.get(rank as usize).ok_or_else(|| {
            DispatchError::transport(format!(
                "rank {} is outside a group of {}",
                rank, self.size
            ))
        })
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> WorkerId {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    async fn send(&self, dest: WorkerId, message: Message) -> Result<()> {
        let mailbox = self.mailbox(dest)?;
        if let Message::Abort(abort) = message {
            self.signal.raise(AbortNotice {
                rank: abort.rank,
                code: abort.code,
            });
            return Ok(());
        }
        mailbox.deliver(Envelope::new(self.rank, message))
    }

    async fn recv(&self, tag: Tag) -> Result<Envelope> {
        self.mailbox(self.rank)?.take(tag).await
    }

    async fn barrier(&self) -> Result<()> {
        star_barrier(self).await
    }

    async fn abort(&self, code: i32, reason: &str) {
        if self.signal.raise(AbortNotice {
            rank: self.rank,
            code,
        }) {
            warn!("rank {} aborted the group: {}", self.rank, reason);
        }
    }

    async fn aborted(&self) -> AbortNotice {
        self.signal.wait().await
    }
}

impl std::fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroup")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("aborted", &self.signal.is_raised())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchdispatch_proto::Abort;
    use std::time::Duration;

    #[tokio::test]
    async fn test_single() {
        let group = LocalGroup::single();
        assert_eq!(group.rank(), 0);
        assert_eq!(group.size(), 1);
        assert!(group.is_root());
        group.barrier().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_recv_by_tag() {
        let ranks = LocalGroup::fabric(3);
        ranks[1].send(0, Message::ready(1)).await.unwrap();
        ranks[2].send(0, Message::ready(2)).await.unwrap();
        ranks[0].send(2, Message::batch_len(0)).await.unwrap();

        let first = ranks[0].recv(Tag::Ready).await.unwrap();
        let second = ranks[0].recv(Tag::Ready).await.unwrap();
        assert_eq!((first.source, second.source), (1, 2));

        let reply = ranks[2].recv(Tag::BatchLen).await.unwrap();
        assert_eq!(reply.source, 0);
        assert_eq!(reply.message, Message::batch_len(0));
    }

    #[tokio::test]
    async fn test_send_out_of_range() {
        let ranks = LocalGroup::fabric(2);
        assert!(ranks[0].send(5, Message::ready(0)).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_barrier_waits_for_everyone() {
        let mut ranks = LocalGroup::fabric(4);
        let late = ranks.pop().unwrap();

        let early: Vec<_> = ranks
            .into_iter()
            .map(|group| tokio::spawn(async move { group.barrier().await }))
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(early.iter().all(|handle| !handle.is_finished()));

        late.barrier().await.unwrap();
        for handle in early {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_abort_reaches_every_rank() {
        let ranks = LocalGroup::fabric(3);
        ranks[2].abort(7, "calculation failed").await;

        for group in &ranks {
            assert_eq!(group.aborted().await, AbortNotice { rank: 2, code: 7 });
        }
    }

    #[tokio::test]
    async fn test_abort_message_trips_signal() {
        let ranks = LocalGroup::fabric(2);
        let abort = Abort {
            rank: 1,
            code: 3,
            reason: "boom".to_string(),
        };
        ranks[1].send(0, Message::Abort(abort)).await.unwrap();
        assert_eq!(ranks[0].aborted().await, AbortNotice { rank: 1, code: 3 });
    }
}
