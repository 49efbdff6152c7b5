//! Backend transport
//!
//! Establishes raw connections to local backends. No protocol parsing, no
//! content inspection; the tunnel layer decides what flows over them.

use std::io;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::common::{IntoStream, Stream};

/// Dial attempts before a backend is reported unreachable.
pub const DIAL_ATTEMPTS: usize = 3;

/// Dialer trait for establishing backend connections
///
/// The production implementation is [`TcpDialer`]; tests substitute scripted
/// dialers to exercise the retry bounds.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to a backend given as "host:port".
    async fn dial(&self, host: &str) -> io::Result<Stream>;
}

/// Plain TCP dialer
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str) -> io::Result<Stream> {
        let stream = TcpStream::connect(host).await?;
        // Disable Nagle's algorithm for lower latency
        stream.set_nodelay(true)?;
        Ok(stream.into_stream())
    }
}

/// Dial with bounded retries; the last error is reported on persistent
/// failure.
pub async fn dial_backend(dialer: &dyn Dialer, host: &str) -> io::Result<Stream> {
    let mut last_err = None;
    for attempt in 1..=DIAL_ATTEMPTS {
        match dialer.dial(host).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(host, attempt, error = %e, "backend dial failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("at least one attempt"))
}
