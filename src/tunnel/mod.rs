//! Tunnel connection
//!
//! One long-lived connection to the rendezvous server carrying multiplexed
//! task frames. The read loop is the sole consumer of the inbound stream:
//! it decodes signal words, answers keepalives, drains on server close, and
//! fans task payloads out to backend tasks and peer sessions.
//!
//! ```text
//! server ──> FrameReader ──> read loop ──┬─> TaskRegistry ──> HttpTask ──> backend
//!                                        └─> PeerTask pipe ──> API layer
//! backend/API ──> TunnelWriter ──> server
//! ```

pub mod http_task;
pub mod peer;
pub mod registry;
pub mod writer;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::io::ReadHalf;
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::common::Stream;
use crate::config::Service;
use crate::error::{Error, Result};
use crate::protocol::{
    handshake, CopyError, FrameReader, InfoCode, LimitedReader, Signal, OPTION_CLOSE, OPTION_DATA,
    OPTION_SERVICES_DATA, P2P_FORBIDDEN_RESPONSE, P2P_MAGIC,
};
use crate::transport::dial_backend;

use http_task::HttpTask;
use peer::PeerTask;
use registry::TaskRegistry;
use writer::TunnelWriter;

/// Unanswered keepalives tolerated before the tunnel is declared dead.
const PING_BUDGET: i32 = 3;

/// Inbound reader for the tunnel socket.
pub type TunnelReader = FrameReader<ReadHalf<Stream>>;

/// Outcome of forwarding one data frame.
enum DataOutcome {
    /// Payload reached its task (or was consumed by the P2P path).
    Forwarded,
    /// The frame was answered and refused without creating a task.
    Rejected,
    /// A task-side sink failed; transient, the tunnel keeps serving.
    WriteFailed(std::io::Error),
}

/// Keepalive and drain accounting local to one read loop.
#[derive(Default)]
struct LoopState {
    pings: i32,
    last_ping: i32,
    draining: bool,
}

pub struct Tunnel {
    conn_id: usize,
    client: Arc<Client>,
    writer: Arc<TunnelWriter>,
    registry: Arc<TaskRegistry>,
    closing: AtomicBool,
    close_notify: tokio::sync::Notify,
    finished_tasks: Arc<AtomicU64>,
    stuns: Vec<String>,
    /// Keepalive cadence: roughly twice per remote timeout.
    read_timeout: Option<Duration>,
    /// Self-handle for registering with the client on Ready.
    weak: Weak<Tunnel>,
}

fn keepalive_interval(remote_timeout: Duration) -> Option<Duration> {
    if remote_timeout.is_zero() {
        return None;
    }
    let half = remote_timeout / 2;
    Some(if half.is_zero() { remote_timeout } else { half })
}

impl Tunnel {
    /// Split the socket into the read loop's frame reader and the shared
    /// framed writer.
    pub fn new(client: &Arc<Client>, stream: Stream, conn_id: usize) -> (Arc<Self>, TunnelReader) {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FrameReader::new(read_half, client.pool().get());
        let writer = Arc::new(TunnelWriter::new(
            write_half,
            client.config().remote_timeout(),
        ));
        let tunnel = Arc::new_cyclic(|weak| Self {
            conn_id,
            stuns: client.config().stuns.clone(),
            read_timeout: keepalive_interval(client.config().remote_timeout()),
            client: client.clone(),
            writer,
            registry: TaskRegistry::new(),
            closing: AtomicBool::new(false),
            close_notify: tokio::sync::Notify::new(),
            finished_tasks: Arc::new(AtomicU64::new(0)),
            weak: weak.clone(),
        });
        (tunnel, reader)
    }

    pub fn conn_id(&self) -> usize {
        self.conn_id
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn tasks_len(&self) -> usize {
        self.registry.len()
    }

    pub fn finished_tasks(&self) -> u64 {
        self.finished_tasks.load(Ordering::SeqCst)
    }

    /// Send the handshake announcing identity and the service catalog.
    pub async fn init(&self) -> Result<()> {
        let config = self.client.config();
        let frame = handshake::encode(&config.id, &config.secret, self.client.services());
        self.writer.write_handshake(&frame).await
    }

    /// Close once: drain the registry, shut the socket, wake the read loop.
    pub async fn close(&self) {
        if self
            .closing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.registry.close_all();
        self.writer.shutdown().await;
        self.close_notify.notify_one();
    }

    /// Drive the tunnel until terminal, then run the deferred cleanup:
    /// deregister, close, log the termination summary, fire the client's
    /// close hook. Dropping the reader returns its buffer to the pool.
    pub async fn read_loop(self: Arc<Self>, mut reader: TunnelReader) {
        let mut state = LoopState::default();
        let result = self.run(&mut reader, &mut state).await;

        let err = match result {
            Ok(()) => None,
            Err(e) if e.is_closed_artifact() => None,
            Err(e) => Some(e),
        };

        self.client.remove_tunnel(self.conn_id);
        self.close().await;
        info!(
            conn = self.conn_id,
            error = err.as_ref().map(tracing::field::display),
            draining = state.draining,
            finished_tasks = self.finished_tasks(),
            tasks = self.registry.len(),
            pings = state.pings,
            "tunnel closed"
        );
        self.client.on_tunnel_close();
        drop(reader);
    }

    async fn run(&self, reader: &mut TunnelReader, state: &mut LoopState) -> Result<()> {
        while state.pings <= PING_BUDGET {
            let word = match self.read_signal(reader).await {
                Ok(word) => word,
                Err(Error::Timeout) => {
                    self.writer.send_ping().await?;
                    state.pings += 1;
                    info!(
                        conn = self.conn_id,
                        draining = state.draining,
                        finished_tasks = self.finished_tasks(),
                        tasks = self.registry.len(),
                        pings = state.pings,
                        "sent ping"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            match Signal::from(word) {
                Signal::Ping => {
                    state.pings -= 1;
                    state.last_ping += 1;
                    if state.draining && state.last_ping >= 3 && self.registry.is_empty() {
                        return Ok(());
                    }
                    if state.last_ping >= 6 {
                        state.last_ping = 0;
                        if self.client.idle_manager().change_to_wait(self.conn_id) {
                            self.writer.send_close().await?;
                            info!(conn = self.conn_id, "sent close signal");
                        }
                    }
                }
                Signal::Close => {
                    info!(conn = self.conn_id, "read close signal");
                    if state.draining {
                        return Ok(());
                    }
                    state.draining = true;
                }
                Signal::Ready => {
                    if let Some(tunnel) = self.weak.upgrade() {
                        self.client.add_tunnel(tunnel);
                    }
                    info!(conn = self.conn_id, "tunnel started");
                }
                Signal::Error => {
                    let code = self.timed(reader.read_u16()).await?;
                    let remote = crate::protocol::ErrorCode::from(code);
                    error!(conn = self.conn_id, %remote, "read error signal");
                    return Err(Error::Remote(remote));
                }
                Signal::Info => {
                    let code = self.timed(reader.read_u16()).await?;
                    let info = self.read_info(code, reader).await?;
                    info!(conn = self.conn_id, %info, "server information");
                }
                Signal::Task(task_id) => {
                    state.last_ping = 0;
                    self.dispatch_task_frame(task_id, reader).await?;
                }
            }
        }

        Err(Error::KeepaliveExhausted)
    }

    /// Peek-and-consume the 4-byte signal word, under the keepalive
    /// deadline when one is configured. A local close wakes the read
    /// immediately with the closed artifact.
    async fn read_signal(&self, reader: &mut TunnelReader) -> Result<u32> {
        if self.is_closing() {
            return Err(Error::ConnectionClosed);
        }
        let io = async {
            let bytes = reader.peek(4).await?;
            let word = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            reader.discard(4).await?;
            Ok::<u32, std::io::Error>(word)
        };
        tokio::select! {
            biased;
            _ = self.close_notify.notified() => Err(Error::ConnectionClosed),
            result = self.timed(io) => result,
        }
    }

    /// Run a frame read under the read deadline. Outside the signal-word
    /// peek an expiry is not recovered by a keepalive, so callers treat the
    /// resulting timeout as fatal.
    async fn timed<T>(
        &self,
        io: impl std::future::Future<Output = std::io::Result<T>>,
    ) -> Result<T> {
        match self.read_timeout {
            Some(t) => match tokio::time::timeout(t, io).await {
                Ok(result) => result.map_err(Error::from),
                Err(_) => Err(Error::Timeout),
            },
            None => io.await.map_err(Error::from),
        }
    }

    /// Code-specific variable-length info payloads. An unknown code is a
    /// protocol violation: its payload would not be self-delimiting.
    async fn read_info(&self, code: u16, reader: &mut TunnelReader) -> Result<String> {
        match InfoCode::from_wire(code) {
            Some(InfoCode::TcpPortOpened) => {
                let port = self.timed(reader.read_u16()).await?;
                Ok(format!("remote tcp port {} opened", port))
            }
            Some(InfoCode::HostPrefixAssigned) => {
                let len = self.timed(reader.peek(1)).await?[0] as usize;
                reader.discard(1).await?;
                let prefix =
                    String::from_utf8_lossy(self.timed(reader.peek(len)).await?).into_owned();
                reader.discard(len).await?;
                Ok(format!("host prefix {} assigned", prefix))
            }
            None => Err(Error::Protocol(format!("unknown info code {:#06x}", code))),
        }
    }

    async fn dispatch_task_frame(&self, task_id: u32, reader: &mut TunnelReader) -> Result<()> {
        let option = self.timed(reader.read_u16()).await?;
        match option {
            OPTION_DATA | OPTION_SERVICES_DATA => {
                let service_index = if option == OPTION_SERVICES_DATA {
                    self.timed(reader.read_u16()).await?
                } else {
                    0
                };
                let services = self.client.services();
                let service = services.get(service_index as usize).ok_or_else(|| {
                    error!(conn = self.conn_id, service_index, "invalid service index");
                    Error::Protocol(format!("invalid service index {}", service_index))
                })?;

                let length = self.timed(reader.read_u32()).await?;
                let mut payload = reader.limited(length as u64);
                let outcome = self.process_data(task_id, service, &mut payload).await;
                match outcome {
                    Err(e) => {
                        if !e.is_closed_artifact() {
                            warn!(conn = self.conn_id, task = task_id, error = %e, "failed to read task data");
                        }
                        return Err(e);
                    }
                    Ok(outcome) => {
                        // Defensive: the sink may have returned early without
                        // consuming the announced payload.
                        payload.discard_remaining().await?;
                        if let DataOutcome::WriteFailed(e) = outcome {
                            let e = Error::from(e);
                            if !e.is_closed_artifact() {
                                warn!(conn = self.conn_id, task = task_id, error = %e, "failed to write task data");
                            }
                        }
                    }
                }
            }
            OPTION_CLOSE => {
                if let Some(task) = self.registry.get(task_id) {
                    task.close_by_remote();
                }
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unknown task option {:#06x}",
                    other
                )));
            }
        }
        Ok(())
    }

    /// Forward one data payload, creating the task on first appearance.
    /// `Err` is a fatal tunnel read failure; sink trouble comes back as
    /// [`DataOutcome::WriteFailed`] and only costs the task.
    async fn process_data(
        &self,
        task_id: u32,
        service: &Service,
        payload: &mut LimitedReader<'_, ReadHalf<Stream>>,
    ) -> Result<DataOutcome> {
        let task = match self.registry.get(task_id) {
            Some(task) => task,
            None => {
                // First two bytes of a p2p sdp request are "XP" (0x5850).
                let looks_p2p = payload.remaining() >= 2 && {
                    let bytes = payload.peek(2).await?;
                    u16::from_be_bytes([bytes[0], bytes[1]]) == P2P_MAGIC
                };
                let existing_peer = self.client.peers().get(task_id);
                if existing_peer.is_some() || looks_p2p {
                    if self.stuns.is_empty() {
                        if let Err(e) = self
                            .writer
                            .respond_and_close(task_id, &[P2P_FORBIDDEN_RESPONSE])
                            .await
                        {
                            debug!(conn = self.conn_id, task = task_id, error = %e, "forbidden response failed");
                        }
                        return Ok(DataOutcome::Rejected);
                    }
                    self.process_p2p(task_id, payload, existing_peer).await?;
                    return Ok(DataOutcome::Forwarded);
                }

                let backend =
                    match dial_backend(self.client.dialer(), &service.local_url.host).await {
                        Ok(stream) => stream,
                        Err(e) => return Ok(DataOutcome::WriteFailed(e)),
                    };
                let rewrite_host = service
                    .use_local_as_http_host
                    .then(|| service.local_url.host.clone());
                let (task, backend_read) =
                    HttpTask::new(task_id, backend, rewrite_host, service.local_timeout);
                info!(conn = self.conn_id, task = task_id, "task started");
                self.registry.insert(task_id, task.clone());
                tokio::spawn(task.clone().run(
                    backend_read,
                    self.writer.clone(),
                    self.registry.clone(),
                    self.finished_tasks.clone(),
                    self.client.pool().clone(),
                ));
                task
            }
        };

        let outcome = match task.copy_payload(payload).await {
            Ok(()) => DataOutcome::Forwarded,
            Err(CopyError::Read(e)) => return Err(e.into()),
            Err(CopyError::Write(e)) => DataOutcome::WriteFailed(e),
        };
        // The deadline is refreshed even when the sink failed; the copy loop
        // is what notices a dead backend.
        task.touch_deadline();
        Ok(outcome)
    }

    /// Hand a P2P signaling frame to the API layer, creating the peer task
    /// on first arrival. Pipe write failures are logged and non-fatal; the
    /// watchdog or a remote close reaps the task.
    async fn process_p2p(
        &self,
        task_id: u32,
        payload: &mut LimitedReader<'_, ReadHalf<Stream>>,
        existing: Option<Arc<PeerTask>>,
    ) -> Result<()> {
        let peer = match existing {
            Some(peer) => peer,
            None => {
                let (peer, session) = PeerTask::spawn(
                    task_id,
                    self.writer.clone(),
                    self.client.peers().clone(),
                    self.client.pool().clone(),
                );
                self.client.peers().insert(task_id, peer.clone());
                self.client.api().publish(session);
                info!(conn = self.conn_id, peer = task_id, "peer task started");
                peer
            }
        };

        match peer.write_payload(payload).await {
            Ok(()) => Ok(()),
            Err(CopyError::Read(e)) => Err(e.into()),
            Err(CopyError::Write(e)) => {
                error!(conn = self.conn_id, peer = task_id, error = %e, "peer pipe write failed");
                Ok(())
            }
        }
    }
}
