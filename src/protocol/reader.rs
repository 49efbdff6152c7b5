//! Framed stream reading
//!
//! [`FrameReader`] is a thin façade over a buffered reader supporting
//! `peek(n)` (non-consuming) and `discard(n)` (consuming). It owns no
//! semantics; it only yields bytes. [`LimitedReader`] caps reads to an
//! announced payload length so each data frame is strictly bounded, and
//! classifies copy failures by the side that produced them.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::PooledBuf;

/// Buffered reader with peek/discard over the tunnel socket.
///
/// The backing buffer is borrowed from the client's pool and returned when
/// the reader is dropped.
pub struct FrameReader<R> {
    inner: R,
    buf: PooledBuf,
    start: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, buf: PooledBuf) -> Self {
        Self {
            inner,
            buf,
            start: 0,
        }
    }

    fn buffered(&self) -> usize {
        self.buf.as_ref().len() - self.start
    }

    /// Drop already-consumed bytes so the backing buffer can refill.
    fn compact(&mut self) {
        if self.start > 0 {
            self.buf.as_mut().drain(..self.start);
            self.start = 0;
        }
    }

    /// Read at least one more byte into the buffer, or fail with
    /// `UnexpectedEof`.
    async fn fill(&mut self) -> io::Result<()> {
        self.compact();
        let n = self.inner.read_buf(self.buf.as_mut()).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }

    /// Return exactly `n` bytes without consuming them.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buffered() < n {
            self.fill().await?;
        }
        Ok(&self.buf.as_ref()[self.start..self.start + n])
    }

    /// Consume `n` bytes, reading through the underlying stream as needed.
    pub async fn discard(&mut self, n: usize) -> io::Result<()> {
        let mut remaining = n;
        loop {
            let take = remaining.min(self.buffered());
            self.start += take;
            remaining -= take;
            if remaining == 0 {
                return Ok(());
            }
            self.fill().await?;
        }
    }

    /// Peek-and-consume a big-endian u16.
    pub async fn read_u16(&mut self) -> io::Result<u16> {
        let bytes = self.peek(2).await?;
        let v = u16::from_be_bytes([bytes[0], bytes[1]]);
        self.discard(2).await?;
        Ok(v)
    }

    /// Peek-and-consume a big-endian u32.
    pub async fn read_u32(&mut self) -> io::Result<u32> {
        let bytes = self.peek(4).await?;
        let v = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        self.discard(4).await?;
        Ok(v)
    }

    /// Borrow this reader with a byte budget of `n`.
    pub fn limited(&mut self, n: u64) -> LimitedReader<'_, R> {
        LimitedReader {
            inner: self,
            remaining: n,
        }
    }
}

/// Failure classification for a bounded payload copy.
///
/// Read-side failures come from the tunnel socket and are fatal to the
/// tunnel; write-side failures come from a task sink and are transient.
#[derive(Debug)]
pub enum CopyError {
    Read(io::Error),
    Write(io::Error),
}

/// A borrow of a [`FrameReader`] capped to an announced payload length.
pub struct LimitedReader<'a, R> {
    inner: &'a mut FrameReader<R>,
    remaining: u64,
}

impl<R: AsyncRead + Unpin> LimitedReader<'_, R> {
    /// Bytes of the announced payload not yet consumed.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Peek up to `n` bytes without consuming; fails if the budget is
    /// smaller than `n`.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        if (n as u64) > self.remaining {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        self.inner.peek(n).await
    }

    /// Yield the next buffered chunk of the payload, or `None` when the
    /// budget is exhausted. Pair with [`consume`](Self::consume).
    pub async fn chunk(&mut self) -> io::Result<Option<&[u8]>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        if self.inner.buffered() == 0 {
            self.inner.fill().await?;
        }
        let available = self.inner.buffered().min(self.remaining as usize);
        let start = self.inner.start;
        Ok(Some(&self.inner.buf.as_ref()[start..start + available]))
    }

    /// Consume `n` bytes previously returned by [`chunk`](Self::chunk).
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n as u64 <= self.remaining);
        debug_assert!(n <= self.inner.buffered());
        self.inner.start += n;
        self.remaining -= n as u64;
    }

    /// Stream the remaining budget into `sink`.
    pub async fn copy_to<W>(&mut self, sink: &mut W) -> Result<u64, CopyError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut copied = 0u64;
        loop {
            let n = {
                let chunk = match self.chunk().await.map_err(CopyError::Read)? {
                    Some(chunk) => chunk,
                    None => return Ok(copied),
                };
                sink.write_all(chunk).await.map_err(CopyError::Write)?;
                chunk.len()
            };
            self.consume(n);
            copied += n as u64;
        }
    }

    /// Consume whatever is left of the budget, advancing the underlying
    /// reader by exactly the announced length no matter how much the sink
    /// accepted.
    pub async fn discard_remaining(&mut self) -> io::Result<()> {
        let n = self.remaining;
        self.remaining = 0;
        self.inner.discard(n as usize).await
    }
}
