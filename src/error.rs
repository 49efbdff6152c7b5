//! Error types for Burrow

use thiserror::Error;

use crate::protocol::ErrorCode;

/// Main error type for Burrow
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote error: {0}")]
    Remote(ErrorCode),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,

    #[error("Keepalive budget exhausted")]
    KeepaliveExhausted,
}

impl Error {
    /// True for the wakeup artifact of a locally closed socket.
    ///
    /// Closing the tunnel socket is the expected way to interrupt a blocked
    /// read, so this case must not be logged at warn level.
    pub fn is_closed_artifact(&self) -> bool {
        match self {
            Error::ConnectionClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

/// Result type alias for Burrow
pub type Result<T> = std::result::Result<T, Error>;
