//! Common types and abstractions
//!
//! - Stream: unified async I/O abstraction the tunnel and tasks operate on
//! - BufferPool: reusable byte buffers with guaranteed return on drop

mod buffer;
mod stream;

pub use buffer::{BufferPool, PooledBuf};
pub use stream::{IntoStream, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
