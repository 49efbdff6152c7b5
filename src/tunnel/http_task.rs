//! HTTP task
//!
//! One task per server-assigned task id: a backend connection whose write
//! half is the sink for inbound tunnel payload and whose read half is
//! drained by an independent copy loop framing backend output back through
//! the tunnel.
//!
//! ```text
//! tunnel frames ──> copy_payload ──> backend socket
//! backend socket ──> run (copy loop) ──> tunnel data frames
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::common::{BufferPool, Stream};
use crate::protocol::{CopyError, LimitedReader};

use super::registry::TaskRegistry;
use super::writer::TunnelWriter;

// ============================================================================
// Task
// ============================================================================

pub struct HttpTask {
    id: u32,
    sink: Mutex<Sink>,
    closed: AtomicBool,
    closed_by_remote: AtomicBool,
    close_notify: Notify,
    /// Backend read deadline, refreshed after each inbound frame.
    deadline: parking_lot::Mutex<Option<Instant>>,
    local_timeout: Duration,
}

struct Sink {
    writer: Option<WriteHalf<Stream>>,
    rewriter: Option<HostRewriter>,
}

impl HttpTask {
    /// Split the backend stream; the returned read half belongs to the copy
    /// loop spawned via [`run`](Self::run).
    pub fn new(
        id: u32,
        backend: Stream,
        rewrite_host: Option<String>,
        local_timeout: Duration,
    ) -> (Arc<Self>, ReadHalf<Stream>) {
        let (read_half, write_half) = tokio::io::split(backend);
        let task = Arc::new(Self {
            id,
            sink: Mutex::new(Sink {
                writer: Some(write_half),
                rewriter: rewrite_host.map(HostRewriter::new),
            }),
            closed: AtomicBool::new(false),
            closed_by_remote: AtomicBool::new(false),
            close_notify: Notify::new(),
            deadline: parking_lot::Mutex::new(None),
            local_timeout,
        });
        (task, read_half)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent close: wakes the copy loop, which releases the backend
    /// socket and removes the task from the registry.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.close_notify.notify_one();
    }

    /// Close initiated by a server task-close frame.
    pub fn close_by_remote(&self) {
        self.closed_by_remote.store(true, Ordering::SeqCst);
        self.close();
    }

    /// Refresh the backend read deadline after an inbound frame.
    pub fn touch_deadline(&self) {
        if !self.local_timeout.is_zero() {
            *self.deadline.lock() = Some(Instant::now() + self.local_timeout);
        }
    }

    /// Stream one inbound payload into the backend. Sink failures (including
    /// writing to an already-closed task) are write errors; only the tunnel
    /// side produces read errors.
    pub async fn copy_payload<R>(&self, payload: &mut LimitedReader<'_, R>) -> Result<(), CopyError>
    where
        R: AsyncRead + Unpin,
    {
        let mut sink = self.sink.lock().await;
        loop {
            let n = {
                let chunk = match payload.chunk().await.map_err(CopyError::Read)? {
                    Some(chunk) => chunk,
                    None => break,
                };
                sink.write_chunk(chunk).await.map_err(CopyError::Write)?;
                chunk.len()
            };
            payload.consume(n);
        }
        Ok(())
    }

    /// Backend-to-tunnel copy loop. Runs as its own tokio task; on exit it
    /// tells the server the task is done, removes itself from the registry,
    /// and bumps the finished counter.
    pub async fn run(
        self: Arc<Self>,
        mut backend: ReadHalf<Stream>,
        tunnel: Arc<TunnelWriter>,
        registry: Arc<TaskRegistry>,
        finished_tasks: Arc<AtomicU64>,
        pool: Arc<BufferPool>,
    ) {
        let mut buf = pool.get();
        buf.fill_default();
        let mut reason = "backend eof";

        loop {
            if self.is_closed() {
                reason = self.close_reason();
                break;
            }
            let deadline = *self.deadline.lock();
            tokio::select! {
                biased;
                _ = self.close_notify.notified() => {
                    reason = self.close_reason();
                    break;
                }
                _ = deadline_wait(deadline) => {
                    // The deadline may have been pushed forward while we slept.
                    let now = Instant::now();
                    if self.deadline.lock().map_or(true, |d| d <= now) {
                        reason = "backend read timeout";
                        break;
                    }
                }
                result = backend.read(&mut buf[..]) => match result {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = tunnel.write_data_frame(self.id, &buf[..n]).await {
                            if !e.is_closed_artifact() {
                                warn!(task = self.id, error = %e, "tunnel write failed");
                            }
                            reason = "tunnel write failed";
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(task = self.id, error = %e, "backend read failed");
                        reason = "backend read failed";
                        break;
                    }
                },
            }
        }

        // Best effort: the tunnel may already be gone.
        let _ = tunnel.write_task_close(self.id).await;

        self.close();
        self.release_backend().await;
        registry.remove(self.id);
        finished_tasks.fetch_add(1, Ordering::SeqCst);
        info!(task = self.id, reason, "task finished");
    }

    fn close_reason(&self) -> &'static str {
        if self.closed_by_remote.load(Ordering::SeqCst) {
            "closed by remote"
        } else {
            "closed"
        }
    }

    async fn release_backend(&self) {
        let mut sink = self.sink.lock().await;
        if let Some(mut writer) = sink.writer.take() {
            let _ = writer.shutdown().await;
        }
    }
}

impl Sink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        match &mut self.rewriter {
            Some(rewriter) => rewriter.write(chunk, writer).await,
            None => writer.write_all(chunk).await,
        }
    }
}

async fn deadline_wait(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// Host rewriting
// ============================================================================

/// Head bytes buffered before the rewrite gives up on parsing.
const MAX_HEAD: usize = 64 * 1024;

/// Streaming Host-header rewriter.
///
/// Buffers request head bytes only at request boundaries, replaces the Host
/// header with the backend host, and tracks Content-Length bodies so the
/// next request on the connection is recognized. Chunked bodies and
/// protocol upgrades suspend rewriting for the remainder of the connection.
struct HostRewriter {
    host: String,
    state: RewriteState,
}

enum RewriteState {
    /// Accumulating a request head until the blank line.
    Head(Vec<u8>),
    /// Counted body bytes passing through untouched.
    Body(u64),
    /// Rewrite suspended; everything passes through.
    Passthrough,
}

impl HostRewriter {
    fn new(host: String) -> Self {
        Self {
            host,
            state: RewriteState::Head(Vec::new()),
        }
    }

    async fn write<W>(&mut self, mut chunk: &[u8], w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while !chunk.is_empty() {
            match &mut self.state {
                RewriteState::Passthrough => {
                    w.write_all(chunk).await?;
                    return Ok(());
                }
                RewriteState::Body(remaining) => {
                    let take = (*remaining).min(chunk.len() as u64) as usize;
                    w.write_all(&chunk[..take]).await?;
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.state = RewriteState::Head(Vec::new());
                    }
                    chunk = &chunk[take..];
                }
                RewriteState::Head(buf) => {
                    buf.extend_from_slice(chunk);
                    chunk = &[];
                    if let Some(head_end) = find_head_end(buf) {
                        let rest = buf.split_off(head_end);
                        let head = std::mem::take(buf);
                        let rewritten = rewrite_head(&head, &self.host);
                        w.write_all(&rewritten).await?;
                        self.state = next_state(&head);
                        if !rest.is_empty() {
                            // Re-process bytes that followed the head.
                            Box::pin(self.write(&rest, w)).await?;
                        }
                    } else if buf.len() > MAX_HEAD {
                        let head = std::mem::take(buf);
                        w.write_all(&head).await?;
                        self.state = RewriteState::Passthrough;
                    }
                }
            }
        }
        Ok(())
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn next_state(head: &[u8]) -> RewriteState {
    let mut content_length = 0u64;
    for line in head.split(|&b| b == b'\n') {
        let line = std::str::from_utf8(line).unwrap_or("").trim_end_matches('\r');
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            match key.as_str() {
                "content-length" => content_length = value.parse().unwrap_or(0),
                "transfer-encoding" if value.to_ascii_lowercase().contains("chunked") => {
                    return RewriteState::Passthrough;
                }
                "upgrade" => return RewriteState::Passthrough,
                _ => {}
            }
        }
    }
    if content_length > 0 {
        RewriteState::Body(content_length)
    } else {
        RewriteState::Head(Vec::new())
    }
}

/// Replace the Host header with `host`, inserting one after the request
/// line when absent. Framing of the head is preserved.
fn rewrite_head(head: &[u8], host: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(head.len() + host.len() + 8);
    let mut replaced = false;
    for line in head.split_inclusive(|&b| b == b'\n') {
        let is_host = line
            .get(..5)
            .map(|p| p.eq_ignore_ascii_case(b"host:"))
            .unwrap_or(false);
        if is_host {
            out.extend_from_slice(b"Host: ");
            out.extend_from_slice(host.as_bytes());
            out.extend_from_slice(b"\r\n");
            replaced = true;
        } else {
            out.extend_from_slice(line);
        }
    }
    if !replaced {
        // No Host header present: insert one after the request line.
        if let Some(pos) = out.windows(2).position(|w| w == b"\r\n") {
            let mut with_host = Vec::with_capacity(out.len() + host.len() + 10);
            with_host.extend_from_slice(&out[..pos + 2]);
            with_host.extend_from_slice(b"Host: ");
            with_host.extend_from_slice(host.as_bytes());
            with_host.extend_from_slice(b"\r\n");
            with_host.extend_from_slice(&out[pos + 2..]);
            return with_host;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::IntoStream;

    async fn rewrite_all(host: &str, chunks: &[&[u8]]) -> Vec<u8> {
        let mut rewriter = HostRewriter::new(host.to_string());
        let mut out = Vec::new();
        for chunk in chunks {
            rewriter.write(chunk, &mut out).await.unwrap();
        }
        out
    }

    #[tokio::test]
    async fn host_header_is_replaced() {
        let out = rewrite_all(
            "127.0.0.1:8080",
            &[b"GET / HTTP/1.1\r\nHost: abc.example.com\r\nAccept: */*\r\n\r\n"],
        )
        .await;
        assert_eq!(
            out,
            b"GET / HTTP/1.1\r\nHost: 127.0.0.1:8080\r\nAccept: */*\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn head_split_across_chunks_is_reassembled() {
        let out = rewrite_all(
            "local:1",
            &[b"GET / HTTP/1.1\r\nHo", b"st: far\r\n", b"\r\n"],
        )
        .await;
        assert_eq!(out, b"GET / HTTP/1.1\r\nHost: local:1\r\n\r\n");
    }

    #[tokio::test]
    async fn counted_body_passes_untouched_and_next_request_rewrites() {
        let out = rewrite_all(
            "local:1",
            &[
                b"POST / HTTP/1.1\r\nHost: far\r\nContent-Length: 4\r\n\r\nhost",
                b"GET /2 HTTP/1.1\r\nHost: far\r\n\r\n",
            ],
        )
        .await;
        let expected: &[u8] =
            b"POST / HTTP/1.1\r\nHost: local:1\r\nContent-Length: 4\r\n\r\nhostGET /2 HTTP/1.1\r\nHost: local:1\r\n\r\n";
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn missing_host_header_is_inserted() {
        let out = rewrite_all("local:1", &[b"GET / HTTP/1.0\r\nAccept: */*\r\n\r\n"]).await;
        assert_eq!(out, b"GET / HTTP/1.0\r\nHost: local:1\r\nAccept: */*\r\n\r\n");
    }

    #[tokio::test]
    async fn chunked_body_suspends_rewriting() {
        let out = rewrite_all(
            "local:1",
            &[
                b"POST / HTTP/1.1\r\nHost: far\r\nTransfer-Encoding: chunked\r\n\r\n",
                b"GET /2 HTTP/1.1\r\nHost: far\r\n\r\n",
            ],
        )
        .await;
        // First head rewritten, everything after passes through untouched.
        let expected: &[u8] =
            b"POST / HTTP/1.1\r\nHost: local:1\r\nTransfer-Encoding: chunked\r\n\r\nGET /2 HTTP/1.1\r\nHost: far\r\n\r\n";
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (near, _far) = tokio::io::duplex(64);
        let (task, _read) = HttpTask::new(1, near.into_stream(), None, Duration::ZERO);
        assert!(!task.is_closed());
        task.close();
        task.close();
        task.close_by_remote();
        assert!(task.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_backend_hits_the_read_deadline() {
        use crate::common::BufferPool;

        let (near, _far) = tokio::io::duplex(64);
        let (task, backend_read) = HttpTask::new(
            3,
            near.into_stream(),
            None,
            Duration::from_secs(1),
        );

        let (tunnel_near, _tunnel_far) = tokio::io::duplex(1024);
        let (_r, w) = tokio::io::split(tunnel_near.into_stream());
        let tunnel = Arc::new(TunnelWriter::new(w, Duration::ZERO));
        let registry = TaskRegistry::new();
        registry.insert(3, task.clone());
        let finished = Arc::new(AtomicU64::new(0));

        task.touch_deadline();
        let handle = tokio::spawn(task.clone().run(
            backend_read,
            tunnel,
            registry.clone(),
            finished.clone(),
            BufferPool::new(),
        ));

        // The backend never speaks and no further frames arrive; the
        // deadline reaps the task.
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(registry.is_empty());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn payload_to_closed_sink_is_a_write_error() {
        let (near, _far) = tokio::io::duplex(64);
        let (task, _read) = HttpTask::new(1, near.into_stream(), None, Duration::ZERO);
        task.release_backend().await;

        let pool = crate::common::BufferPool::new();
        let data: &[u8] = b"hi";
        let mut reader = crate::protocol::FrameReader::new(data, pool.get());
        let mut limited = reader.limited(2);
        match task.copy_payload(&mut limited).await {
            Err(CopyError::Write(_)) => {}
            other => panic!("expected write error, got {:?}", other),
        }
    }
}
