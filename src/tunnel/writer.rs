//! Tunnel write half
//!
//! All outbound traffic on a tunnel (signals, the handshake, task-framed
//! data from backend copy loops) funnels through one [`TunnelWriter`] so
//! concurrent writers cannot interleave partial frames. Each write runs
//! under the tunnel's write timeout.

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::Mutex;

use crate::common::Stream;
use crate::error::{Error, Result};
use crate::protocol::{CLOSE_SIGNAL, OPTION_CLOSE, OPTION_DATA, PING_SIGNAL};

pub struct TunnelWriter {
    inner: Mutex<Option<WriteHalf<Stream>>>,
    write_timeout: Duration,
}

impl TunnelWriter {
    pub fn new(half: WriteHalf<Stream>, write_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Some(half)),
            write_timeout,
        }
    }

    /// Single locked write of a complete frame. Partial writes surface as
    /// errors from `write_all`.
    async fn write_all(&self, buf: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        let io = async {
            writer.write_all(buf).await?;
            writer.flush().await
        };
        if self.write_timeout.is_zero() {
            io.await?;
        } else {
            tokio::time::timeout(self.write_timeout, io)
                .await
                .map_err(|_| Error::Timeout)??;
        }
        Ok(())
    }

    pub async fn write_handshake(&self, frame: &[u8]) -> Result<()> {
        self.write_all(frame).await
    }

    async fn send_signal(&self, word: u32) -> Result<()> {
        self.write_all(&word.to_be_bytes()).await
    }

    pub async fn send_ping(&self) -> Result<()> {
        self.send_signal(PING_SIGNAL).await
    }

    pub async fn send_close(&self) -> Result<()> {
        self.send_signal(CLOSE_SIGNAL).await
    }

    /// Frame `payload` as task data: id, Data option, length, payload.
    pub async fn write_data_frame(&self, task_id: u32, payload: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(10 + payload.len());
        buf.put_u32(task_id);
        buf.put_u16(OPTION_DATA);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        self.write_all(&buf).await
    }

    /// Tell the server this task is finished on our side.
    pub async fn write_task_close(&self, task_id: u32) -> Result<()> {
        let mut buf = BytesMut::with_capacity(6);
        buf.put_u32(task_id);
        buf.put_u16(OPTION_CLOSE);
        self.write_all(&buf).await
    }

    /// Frame a canned response on `task_id` and close the task, without a
    /// local task ever existing.
    pub async fn respond_and_close(&self, task_id: u32, chunks: &[&[u8]]) -> Result<()> {
        for chunk in chunks {
            self.write_data_frame(task_id, chunk).await?;
        }
        self.write_task_close(task_id).await
    }

    /// Shut the socket write half down and drop it. Idempotent; later
    /// writes fail with [`Error::ConnectionClosed`].
    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::IntoStream;
    use tokio::io::AsyncReadExt;

    fn writer_pair() -> (TunnelWriter, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(1024);
        let (_read, write) = tokio::io::split(near.into_stream());
        (TunnelWriter::new(write, Duration::from_secs(1)), far)
    }

    #[tokio::test]
    async fn data_frame_layout() {
        let (writer, mut far) = writer_pair();
        writer.write_data_frame(7, b"hello").await.unwrap();

        let mut buf = [0u8; 15];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..4], &7u32.to_be_bytes());
        assert_eq!(&buf[4..6], &OPTION_DATA.to_be_bytes());
        assert_eq!(&buf[6..10], &5u32.to_be_bytes());
        assert_eq!(&buf[10..], b"hello");
    }

    #[tokio::test]
    async fn respond_and_close_frames_then_closes() {
        let (writer, mut far) = writer_pair();
        writer.respond_and_close(9, &[b"ab"]).await.unwrap();

        let mut buf = [0u8; 18];
        far.read_exact(&mut buf).await.unwrap();
        // data frame
        assert_eq!(&buf[..4], &9u32.to_be_bytes());
        assert_eq!(&buf[4..6], &OPTION_DATA.to_be_bytes());
        assert_eq!(&buf[6..10], &2u32.to_be_bytes());
        assert_eq!(&buf[10..12], b"ab");
        // close frame
        assert_eq!(&buf[12..16], &9u32.to_be_bytes());
        assert_eq!(&buf[16..18], &OPTION_CLOSE.to_be_bytes());
    }

    #[tokio::test]
    async fn writes_after_shutdown_fail_closed() {
        let (writer, _far) = writer_pair();
        writer.shutdown().await;
        writer.shutdown().await;
        match writer.send_ping().await {
            Err(Error::ConnectionClosed) => {}
            other => panic!("expected ConnectionClosed, got {:?}", other),
        }
    }
}
