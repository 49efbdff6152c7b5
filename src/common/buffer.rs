//! Buffer pool
//!
//! Reader and copy-loop buffers are reused across tunnel lifetimes. A
//! [`PooledBuf`] returns itself to the pool on drop, so every exit path of a
//! task gives the buffer back without explicit bookkeeping.

use std::sync::Arc;

use parking_lot::Mutex;

/// Default buffer size handed out by the pool (32KB)
const DEFAULT_BUF_SIZE: usize = 32 * 1024;

/// Default cap on idle buffers retained by the pool
const DEFAULT_MAX_IDLE: usize = 64;

/// Pool of fixed-size byte buffers.
pub struct BufferPool {
    idle: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
    max_idle: usize,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Self::with_sizes(DEFAULT_BUF_SIZE, DEFAULT_MAX_IDLE)
    }

    pub fn with_sizes(buf_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::new()),
            buf_size,
            max_idle,
        })
    }

    /// Take a zero-length buffer with `buf_size` capacity.
    pub fn get(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buf_size));
        PooledBuf {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Number of idle buffers currently retained.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }
}

/// A buffer borrowed from a [`BufferPool`], returned on drop.
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// Resize to the pool's buffer size, zero-filled, for use as a read buffer.
    pub fn fill_default(&mut self) {
        let size = self.pool.buf_size;
        self.as_mut().resize(size, 0);
    }

    pub fn as_ref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("buffer taken")
    }

    pub fn as_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer taken")
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_ref()
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_return_on_drop() {
        let pool = BufferPool::with_sizes(16, 8);
        assert_eq!(pool.idle_count(), 0);

        let a = pool.get();
        let b = pool.get();
        drop(a);
        assert_eq!(pool.idle_count(), 1);
        drop(b);
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn buffers_are_reused_cleared() {
        let pool = BufferPool::with_sizes(16, 8);
        {
            let mut buf = pool.get();
            buf.as_mut().extend_from_slice(b"dirty");
        }
        let buf = pool.get();
        assert!(buf.as_ref().is_empty());
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn idle_cap_is_enforced() {
        let pool = BufferPool::with_sizes(16, 1);
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn fill_default_sizes_to_pool_width() {
        let pool = BufferPool::with_sizes(16, 8);
        let mut buf = pool.get();
        buf.fill_default();
        assert_eq!(buf.as_ref().len(), 16);
    }
}
