//! Cluster process group over TCP
//!
//! Rank 0 listens on `root_address`; every other rank dials it and introduces
//! itself with a `HELLO` frame. All traffic flows along these connections, so
//! workers only ever talk to rank 0. Each connection gets a reader task that
//! files inbound frames into the local [`Mailbox`]; `ABORT` frames bypass the
//! mailbox and trip the abort signal directly.

use super::mailbox::Mailbox;
use super::{star_barrier, AbortNotice, AbortSignal, ProcessGroup};
use batchdispatch_common::error::{DispatchError, Result};
use batchdispatch_common::{ClusterConfig, WorkerId};
use batchdispatch_proto::{Abort, Envelope, FrameCodec, Hello, Message, Tag};
use futures::SinkExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

const ABORT_SEND_TIMEOUT: Duration = Duration::from_secs(2);

type Reader = FramedRead<OwnedReadHalf, FrameCodec>;
type Writer = FramedWrite<OwnedWriteHalf, FrameCodec>;

/// Process group whose ranks are connected through rank 0
pub struct TcpGroup {
    rank: WorkerId,
    size: u32,
    mailbox: Arc<Mailbox>,
    signal: Arc<AbortSignal>,
    peers: HashMap<WorkerId, Mutex<Writer>>,
    readers: Vec<JoinHandle<()>>,
}

impl TcpGroup {
    /// Join the group described by `config`
    ///
    /// Rank 0 binds `root_address` and waits until every other rank has
    /// connected. Other ranks dial rank 0, retrying while it comes up.
    pub async fn connect(config: &ClusterConfig) -> Result<Self> {
        config.validate()?;
        if config.rank == 0 {
            let listener = TcpListener::bind(config.root_address.as_str()).await.map_err(|e| {
                DispatchError::transport(format!("cannot bind {}: {}", config.root_address, e))
            })?;
            Self::accept(listener, config).await
        } else {
            Self::dial(config).await
        }
    }

    /// Rank 0 side, on a listener that is already bound
    pub async fn accept(listener: TcpListener, config: &ClusterConfig) -> Result<Self> {
        let codec = FrameCodec::new(config.max_frame_bytes);
        let mailbox = Arc::new(Mailbox::new());
        let signal = Arc::new(AbortSignal::new());
        let mut peers = HashMap::new();
        let mut readers = Vec::new();

        info!(
            "Rank 0 listening on {} for {} workers",
            listener.local_addr()?,
            config.size - 1
        );

        while peers.len() < (config.size - 1) as usize {
            let (stream, addr) = listener.accept().await?;
            stream.set_nodelay(true)?;
            let (read, write) = stream.into_split();
            let mut reader = FramedRead::new(read, codec.clone());

            let hello = reader.next().await.ok_or_else(|| {
                DispatchError::transport(format!("{} disconnected before HELLO", addr))
            })??;
            let rank = match hello.message {
                Message::Hello(Hello { rank }) if rank == hello.source => rank,
                other => {
                    return Err(DispatchError::unexpected(format!(
                        "expected HELLO from {}, got {:?}",
                        addr, other
                    )))
                }
            };
            if rank == 0 || rank >= config.size || peers.contains_key(&rank) {
                return Err(DispatchError::unexpected(format!(
                    "{} claimed rank {} which is invalid or already taken",
                    addr, rank
                )));
            }

            debug!("Rank {} connected from {}", rank, addr);
            readers.push(tokio::spawn(read_loop(
                rank,
                reader,
                mailbox.clone(),
                signal.clone(),
            )));
            peers.insert(rank, Mutex::new(FramedWrite::new(write, codec.clone())));
        }

        info!("All {} ranks connected", config.size);
        Ok(Self {
            rank: 0,
            size: config.size,
            mailbox,
            signal,
            peers,
            readers,
        })
    }

    async fn dial(config: &ClusterConfig) -> Result<Self> {
        let stream = connect_with_retry(config).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let codec = FrameCodec::new(config.max_frame_bytes);

        let mut writer = FramedWrite::new(write, codec.clone());
        writer
            .send(Envelope::new(
                config.rank,
                Message::Hello(Hello { rank: config.rank }),
            ))
            .await?;

        let mailbox = Arc::new(Mailbox::new());
        let signal = Arc::new(AbortSignal::new());
        let reader = tokio::spawn(read_loop(
            0,
            FramedRead::new(read, codec),
            mailbox.clone(),
            signal.clone(),
        ));

        info!("Rank {} joined rank 0 at {}", config.rank, config.root_address);
        Ok(Self {
            rank: config.rank,
            size: config.size,
            mailbox,
            signal,
            peers: HashMap::from([(0, Mutex::new(writer))]),
            readers: vec![reader],
        })
    }

    async fn write(&self, dest: WorkerId, envelope: Envelope) -> Result<()> {
        let peer = self.peers.get(&dest).ok_or_else(|| {
            DispatchError::transport(format!("rank {} has no route to rank {}", self.rank, dest))
        })?;
        peer.lock().await.send(envelope).await?;
        Ok(())
    }
}

async fn connect_with_retry(config: &ClusterConfig) -> Result<TcpStream> {
    let mut attempt = 0;
    loop {
        match TcpStream::connect(config.root_address.as_str()).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < config.connect_retries => {
                attempt += 1;
                debug!(
                    "Rank 0 at {} not reachable ({}), retry {}/{}",
                    config.root_address, e, attempt, config.connect_retries
                );
                tokio::time::sleep(config.connect_backoff()).await;
            }
            Err(e) => {
                return Err(DispatchError::transport(format!(
                    "cannot reach rank 0 at {} after {} attempts: {}",
                    config.root_address,
                    attempt + 1,
                    e
                )))
            }
        }
    }
}

async fn read_loop(
    peer: WorkerId,
    mut reader: Reader,
    mailbox: Arc<Mailbox>,
    signal: Arc<AbortSignal>,
) {
    while let Some(frame) = reader.next().await {
        let envelope = match frame {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("Bad frame from rank {}: {}", peer, e);
                mailbox.close(format!("protocol error on connection to rank {}: {}", peer, e));
                return;
            }
        };

        if envelope.source != peer {
            error!(
                "Frame on rank {}'s connection claims source {}",
                peer, envelope.source
            );
            mailbox.close(format!("rank {} sent a frame with a forged source", peer));
            return;
        }

        match envelope.message {
            Message::Abort(abort) => {
                warn!(
                    "Rank {} aborted the job (code {}): {}",
                    abort.rank, abort.code, abort.reason
                );
                signal.raise(AbortNotice {
                    rank: abort.rank,
                    code: abort.code,
                });
            }
            _ => {
                if let Err(e) = mailbox.deliver(envelope) {
                    error!("Dropping frame from rank {}: {}", peer, e);
                }
            }
        }
    }

    debug!("Connection to rank {} closed", peer);
    mailbox.close(format!("connection to rank {} closed", peer));
}

impl ProcessGroup for TcpGroup {
    fn rank(&self) -> WorkerId {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    async fn send(&self, dest: WorkerId, message: Message) -> Result<()> {
        if dest == self.rank {
            return self.mailbox.deliver(Envelope::new(self.rank, message));
        }
        self.write(dest, Envelope::new(self.rank, message)).await
    }

    async fn recv(&self, tag: Tag) -> Result<Envelope> {
        self.mailbox.take(tag).await
    }

    async fn barrier(&self) -> Result<()> {
        star_barrier(self).await
    }

    /// Trip the local signal, then tell every directly connected rank
    ///
    /// A worker only reaches rank 0; rank 0 re-broadcasts when its own job
    /// fails with the abort.
    async fn abort(&self, code: i32, reason: &str) {
        self.signal.raise(AbortNotice {
            rank: self.rank,
            code,
        });

        let abort = Abort {
            rank: self.rank,
            code,
            reason: reason.to_string(),
        };
        for &dest in self.peers.keys() {
            let envelope = Envelope::new(self.rank, Message::Abort(abort.clone()));
            match tokio::time::timeout(ABORT_SEND_TIMEOUT, self.write(dest, envelope)).await {
                Ok(Ok(())) => debug!("Sent ABORT to rank {}", dest),
                Ok(Err(e)) => warn!("Could not send ABORT to rank {}: {}", dest, e),
                Err(_) => warn!("Timed out sending ABORT to rank {}", dest),
            }
        }
    }

    async fn aborted(&self) -> AbortNotice {
        self.signal.wait().await
    }
}

impl Drop for TcpGroup {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for TcpGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpGroup")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("peers", &self.peers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(rank: u32, size: u32, addr: &str) -> ClusterConfig {
        ClusterConfig {
            rank,
            size,
            root_address: addr.to_string(),
            connect_retries: 20,
            connect_backoff_ms: 25,
            ..ClusterConfig::default()
        }
    }

    async fn bind_group(size: u32) -> Vec<TcpGroup> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let root = {
            let config = cluster(0, size, &addr);
            tokio::spawn(async move { TcpGroup::accept(listener, &config).await })
        };
        let workers: Vec<_> = (1..size)
            .map(|rank| {
                let config = cluster(rank, size, &addr);
                tokio::spawn(async move { TcpGroup::connect(&config).await })
            })
            .collect();

        let mut groups = vec![root.await.unwrap().unwrap()];
        for worker in workers {
            groups.push(worker.await.unwrap().unwrap());
        }
        groups
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_star_messaging() {
        let groups = bind_group(3).await;

        groups[2].send(0, Message::ready(2)).await.unwrap();
        let ready = groups[0].recv(Tag::Ready).await.unwrap();
        assert_eq!(ready.source, 2);
        assert_eq!(ready.message, Message::ready(2));

        groups[0].send(2, Message::batch(vec![9, 8, 7])).await.unwrap();
        let batch = groups[2].recv(Tag::Batch).await.unwrap();
        assert_eq!(batch.message, Message::batch(vec![9, 8, 7]));

        // workers have no direct route to each other
        assert!(groups[1].send(2, Message::ready(1)).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_barrier_over_tcp() {
        let groups: Vec<Arc<TcpGroup>> = bind_group(3).await.into_iter().map(Arc::new).collect();
        let handles: Vec<_> = groups
            .iter()
            .cloned()
            .map(|group| tokio::spawn(async move { group.barrier().await }))
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_abort_reaches_root() {
        let groups = bind_group(2).await;
        groups[1].abort(4, "calculation failed").await;
        let notice = tokio::time::timeout(Duration::from_secs(5), groups[0].aborted())
            .await
            .unwrap();
        assert_eq!(notice, AbortNotice { rank: 1, code: 4 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_disconnect_fails_receivers() {
        let mut groups = bind_group(2).await;
        let worker = groups.pop().unwrap();
        drop(worker);

        let result = tokio::time::timeout(Duration::from_secs(5), groups[0].recv(Tag::Ready))
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dial_gives_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut config = cluster(1, 2, &addr);
        config.connect_retries = 1;
        let err = TcpGroup::connect(&config).await.unwrap_err();
        assert!(err.to_string().contains("cannot reach rank 0"));
    }
}
