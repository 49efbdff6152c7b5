//! Burrow - reverse-tunnel client
//!
//! Exposes local services through a rendezvous server the client dials out
//! to. One long-lived TCP connection per tunnel slot carries a framed binary
//! protocol multiplexing many logical task streams: HTTP requests, raw TCP
//! connections, and peer-to-peer signaling sessions.
//!
//! # Architecture
//!
//! ```text
//! server socket
//! → FrameReader (peek/discard, LimitedReader)
//! → Tunnel read loop (signals, keepalive, drain)
//! → TaskRegistry → HttpTask → local backend
//!   └ PeerTask pipe → API layer
//! backend / API → TunnelWriter → server socket
//! ```
//!
//! ## Core Principles
//!
//! - The read loop is the sole consumer of the inbound stream; frames are
//!   processed strictly in arrival order
//! - Locks are never held across I/O or a call into a task
//! - Per-task failures cost the task, never the tunnel
//! - Buffers come from a pool and return on every exit path
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, BufferPool
//! ├── protocol/        # Wire format: signals, handshake, frame reading
//! ├── transport/       # Backend dialing
//! ├── tunnel/          # State machine, registry, HTTP and peer tasks
//! ├── client/          # Container: supervisors, peer map, idle manager
//! └── api/             # Accept channel for P2P signaling sessions
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod api;
pub mod client;
pub mod protocol;
pub mod transport;
pub mod tunnel;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use client::Client;
pub use common::Stream;
pub use config::{Config, Service};
pub use error::{Error, Result};
pub use tunnel::Tunnel;
