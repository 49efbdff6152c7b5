//! Peer task
//!
//! A peer-to-peer signaling session multiplexed on a task id. The tunnel
//! writes inbound frames into a duplex pipe whose far end is published to
//! the API layer; a copy loop drains the near end (and the candidate
//! channel) back into the tunnel. A watchdog closes the session after an
//! absolute timeout regardless of traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::api::ApiSession;
use crate::common::{BufferPool, PooledBuf};
use crate::protocol::{CopyError, LimitedReader};

use super::writer::TunnelWriter;

/// Absolute lifetime of a peer task.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(120);

/// Outbound candidates buffered before the producer is backpressured.
const CANDIDATE_CHANNEL_CAP: usize = 16;

/// Pipe capacity between the tunnel and the API layer.
const PIPE_CAPACITY: usize = 64 * 1024;

// ============================================================================
// Peer map
// ============================================================================

/// Client-owned map of live peer tasks across all tunnels.
#[derive(Default)]
pub struct PeerMap {
    peers: RwLock<HashMap<u32, Arc<PeerTask>>>,
}

impl PeerMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, id: u32) -> Option<Arc<PeerTask>> {
        self.peers.read().get(&id).cloned()
    }

    pub fn insert(&self, id: u32, peer: Arc<PeerTask>) {
        self.peers.write().insert(id, peer);
    }

    pub fn remove(&self, id: u32) {
        self.peers.write().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.peers.read().contains_key(&id)
    }
}

// ============================================================================
// Peer task
// ============================================================================

pub struct PeerTask {
    id: u32,
    tunnel: Arc<TunnelWriter>,
    /// Near-end write half of the pipe; inbound frames land here.
    pipe: Mutex<Option<WriteHalf<DuplexStream>>>,
    closed: AtomicBool,
    close_notify: Notify,
    negotiation: Arc<Notify>,
    watchdog: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PeerTask {
    /// Build the peer task, publish-ready session, and its background work:
    /// the pipe-to-tunnel copy loop and the watchdog.
    pub fn spawn(
        id: u32,
        tunnel: Arc<TunnelWriter>,
        peers: Arc<PeerMap>,
        pool: Arc<BufferPool>,
    ) -> (Arc<Self>, ApiSession) {
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let (near_read, near_write) = tokio::io::split(near);
        let (candidate_tx, candidate_rx) = mpsc::channel(CANDIDATE_CHANNEL_CAP);
        let negotiation = Arc::new(Notify::new());

        let peer = Arc::new(Self {
            id,
            tunnel,
            pipe: Mutex::new(Some(near_write)),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            negotiation: negotiation.clone(),
            watchdog: parking_lot::Mutex::new(None),
        });

        let session = ApiSession {
            peer_id: id,
            stream: far,
            candidates: candidate_tx,
            negotiation_needed: negotiation,
        };

        let scratch = pool.get();
        tokio::spawn(
            peer.clone()
                .pipe_to_tunnel(near_read, candidate_rx, scratch, peers.clone()),
        );

        let watchdog_peer = peer.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(PEER_TIMEOUT).await;
            info!(peer = watchdog_peer.id, "peer task timeout");
            watchdog_peer.close_with_lock(&peers);
        });
        *peer.watchdog.lock() = Some(handle);

        (peer, session)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write one inbound signaling frame into the pipe. Pipe failures are
    /// reported as write errors; only the tunnel side produces read errors.
    pub async fn write_payload<R>(&self, payload: &mut LimitedReader<'_, R>) -> Result<(), CopyError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        // Inbound signaling may require an offer; nudge any waiter.
        self.negotiation.notify_waiters();

        let mut pipe = self.pipe.lock().await;
        match pipe.as_mut() {
            Some(writer) => payload.copy_to(writer).await.map(|_| ()),
            None => Err(CopyError::Write(
                std::io::ErrorKind::NotConnected.into(),
            )),
        }
    }

    /// Broadcast-once close. Idempotent; wakes the copy loop and cancels the
    /// watchdog.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.close_notify.notify_one();
        if let Some(handle) = self.watchdog.lock().take() {
            handle.abort();
        }
    }

    /// Close and drop the peer map entry.
    pub fn close_with_lock(&self, peers: &PeerMap) {
        if self.is_closed() {
            return;
        }
        self.close();
        peers.remove(self.id);
    }

    /// Copy loop: pipe and candidate channel back into tunnel data frames.
    async fn pipe_to_tunnel(
        self: Arc<Self>,
        mut pipe: ReadHalf<DuplexStream>,
        mut candidates: mpsc::Receiver<String>,
        mut scratch: PooledBuf,
        peers: Arc<PeerMap>,
    ) {
        scratch.fill_default();
        loop {
            if self.is_closed() {
                break;
            }
            tokio::select! {
                biased;
                _ = self.close_notify.notified() => break,
                candidate = candidates.recv() => match candidate {
                    Some(candidate) => {
                        if let Err(e) = self.tunnel.write_data_frame(self.id, candidate.as_bytes()).await {
                            if !e.is_closed_artifact() {
                                debug!(peer = self.id, error = %e, "candidate write failed");
                            }
                            break;
                        }
                    }
                    None => break,
                },
                result = pipe.read(&mut scratch[..]) => match result {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = self.tunnel.write_data_frame(self.id, &scratch[..n]).await {
                            if !e.is_closed_artifact() {
                                debug!(peer = self.id, error = %e, "peer response write failed");
                            }
                            break;
                        }
                    }
                    Err(e) => {
                        error!(peer = self.id, error = %e, "peer pipe read failed");
                        break;
                    }
                },
            }
        }

        let _ = self.tunnel.write_task_close(self.id).await;
        self.close_with_lock(&peers);
        self.release_pipe().await;
        info!(peer = self.id, "peer task finished");
    }

    async fn release_pipe(&self) {
        self.pipe.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{BufferPool, IntoStream};
    use crate::protocol::FrameReader;
    use tokio::io::AsyncWriteExt;

    fn tunnel_writer() -> (Arc<TunnelWriter>, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(4096);
        let (_r, w) = tokio::io::split(near.into_stream());
        (
            Arc::new(TunnelWriter::new(w, Duration::from_secs(1))),
            far,
        )
    }

    #[tokio::test]
    async fn inbound_frames_reach_the_api_session() {
        let (writer, _far) = tunnel_writer();
        let pool = BufferPool::new();
        let peers = PeerMap::new();
        let (peer, mut session) = PeerTask::spawn(9, writer, peers.clone(), pool.clone());
        peers.insert(9, peer.clone());

        let data: &[u8] = b"XPoffer-sdp";
        let mut reader = FrameReader::new(data, pool.get());
        let mut limited = reader.limited(11);
        peer.write_payload(&mut limited).await.unwrap();

        let mut buf = [0u8; 11];
        tokio::io::AsyncReadExt::read_exact(&mut session.stream, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf, b"XPoffer-sdp");
    }

    #[tokio::test]
    async fn api_responses_are_framed_back_to_the_tunnel() {
        let (writer, mut far) = tunnel_writer();
        let pool = BufferPool::new();
        let peers = PeerMap::new();
        let (_peer, mut session) = PeerTask::spawn(9, writer, peers, pool);

        session.stream.write_all(b"answer").await.unwrap();

        let mut head = [0u8; 10];
        tokio::io::AsyncReadExt::read_exact(&mut far, &mut head)
            .await
            .unwrap();
        assert_eq!(&head[..4], &9u32.to_be_bytes());
        assert_eq!(&head[6..10], &6u32.to_be_bytes());
        let mut body = [0u8; 6];
        tokio::io::AsyncReadExt::read_exact(&mut far, &mut body)
            .await
            .unwrap();
        assert_eq!(&body, b"answer");
    }

    #[tokio::test]
    async fn candidates_are_framed_back_to_the_tunnel() {
        let (writer, mut far) = tunnel_writer();
        let pool = BufferPool::new();
        let peers = PeerMap::new();
        let (_peer, session) = PeerTask::spawn(5, writer, peers, pool);

        session.candidates.send("cand:1".to_string()).await.unwrap();

        let mut head = [0u8; 10];
        tokio::io::AsyncReadExt::read_exact(&mut far, &mut head)
            .await
            .unwrap();
        assert_eq!(&head[..4], &5u32.to_be_bytes());
        let mut body = [0u8; 6];
        tokio::io::AsyncReadExt::read_exact(&mut far, &mut body)
            .await
            .unwrap();
        assert_eq!(&body, b"cand:1");
    }

    #[tokio::test]
    async fn close_with_lock_removes_the_peer_entry() {
        let (writer, _far) = tunnel_writer();
        let pool = BufferPool::new();
        let peers = PeerMap::new();
        let (peer, _session) = PeerTask::spawn(5, writer, peers.clone(), pool);
        peers.insert(5, peer.clone());

        peer.close_with_lock(&peers);
        assert!(peer.is_closed());
        assert!(!peers.contains(5));

        // Idempotent.
        peer.close_with_lock(&peers);
    }
}
