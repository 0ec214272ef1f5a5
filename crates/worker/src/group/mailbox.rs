//! Per-tag inbound queues

use batchdispatch_common::error::{DispatchError, Result};
use batchdispatch_proto::{Envelope, Tag};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Slot {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

/// Inbound messages for one rank, one FIFO per tag
///
/// Closing the mailbox fails every pending and future [`Mailbox::take`] once
/// the queued messages for that tag are used up.
pub struct Mailbox {
    slots: HashMap<Tag, Slot>,
    closed: CancellationToken,
    close_reason: Mutex<Option<String>>,
}

impl Mailbox {
    pub fn new() -> Self {
        let slots = Tag::ALL
            .into_iter()
            .map(|tag| {
                let (tx, rx) = mpsc::unbounded_channel();
                (
                    tag,
                    Slot {
                        tx,
                        rx: tokio::sync::Mutex::new(rx),
                    },
                )
            })
            .collect();

        Self {
            slots,
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
        }
    }

    fn slot(&self, tag: Tag) -> Result<&Slot> {
        self.slots
            .get(&tag)
            .ok_or_else(|| DispatchError::internal(format!("no mailbox for tag {}", tag)))
    }

    pub fn deliver(&self, envelope: Envelope) -> Result<()> {
        let slot = self.slot(envelope.tag())?;
        slot.tx
            .send(envelope)
            .map_err(|_| DispatchError::internal("mailbox receiver dropped"))
    }

    pub async fn take(&self, tag: Tag) -> Result<Envelope> {
        let slot = self.slot(tag)?;
        let mut rx = slot.rx.lock().await;
        tokio::select! {
            biased;
            envelope = rx.recv() => {
                envelope.ok_or_else(|| DispatchError::internal("mailbox sender dropped"))
            }
            _ = self.closed.cancelled() => match rx.try_recv() {
                Ok(envelope) => Ok(envelope),
                Err(_) => Err(DispatchError::transport(self.reason())),
            },
        }
    }

    /// Fail waiting receivers with `reason`; the first reason wins
    pub fn close(&self, reason: impl Into<String>) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn reason(&self) -> String {
        self.close_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "mailbox closed".to_string())
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchdispatch_proto::Message;

    #[tokio::test]
    async fn test_fifo_per_tag() {
        let mailbox = Mailbox::new();
        mailbox.deliver(Envelope::new(1, Message::ready(1))).unwrap();
        mailbox.deliver(Envelope::new(2, Message::batch_len(4))).unwrap();
        mailbox.deliver(Envelope::new(2, Message::ready(2))).unwrap();

        assert_eq!(mailbox.take(Tag::Ready).await.unwrap().source, 1);
        assert_eq!(mailbox.take(Tag::Ready).await.unwrap().source, 2);
        let len = mailbox.take(Tag::BatchLen).await.unwrap();
        assert_eq!(len.message, Message::batch_len(4));
    }

    #[tokio::test]
    async fn test_close_drains_then_fails() {
        let mailbox = Mailbox::new();
        mailbox.deliver(Envelope::new(3, Message::ready(3))).unwrap();
        mailbox.close("connection to rank 3 closed");
        mailbox.close("ignored");

        assert!(mailbox.is_closed());
        assert_eq!(mailbox.take(Tag::Ready).await.unwrap().source, 3);
        let err = mailbox.take(Tag::Ready).await.unwrap_err();
        assert!(err.to_string().contains("connection to rank 3 closed"));
    }

    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let mailbox = std::sync::Arc::new(Mailbox::new());
        let waiter = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.take(Tag::Release).await })
        };
        tokio::task::yield_now().await;
        mailbox.close("peer gone");
        assert!(waiter.await.unwrap().is_err());
    }
}
