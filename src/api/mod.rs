//! API layer seam
//!
//! Peer-to-peer signaling sessions are not handled inside the tunnel; the
//! tunnel forwards their frames into a duplex pipe and publishes the far end
//! here. Whatever drives the signaling (the embedding application's API
//! surface) accepts sessions from this server and speaks over the pipe.

use std::sync::Arc;

use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::warn;

/// Sessions queued for the API layer before accepts start failing.
const ACCEPT_BACKLOG: usize = 16;

/// One published signaling session.
pub struct ApiSession {
    /// Task id of the peer task that owns the tunnel side.
    pub peer_id: u32,
    /// Far end of the peer pipe: inbound signaling frames are read from
    /// here, responses written here flow back through the tunnel.
    pub stream: DuplexStream,
    /// Sink for ICE candidates produced during negotiation; the peer task
    /// forwards them through the tunnel.
    pub candidates: mpsc::Sender<String>,
    /// Notified when the peer task wants an offer.
    pub negotiation_needed: Arc<Notify>,
}

/// Accept channel between the tunnel layer and the API layer.
pub struct ApiServer {
    accept_tx: mpsc::Sender<ApiSession>,
    accept_rx: Mutex<mpsc::Receiver<ApiSession>>,
}

impl ApiServer {
    pub fn new() -> Arc<Self> {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        Arc::new(Self {
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
        })
    }

    /// Hand a new session to the API layer. Dropped (with a warning) when
    /// the backlog is full; the peer watchdog will reap the session.
    pub(crate) fn publish(&self, session: ApiSession) {
        let peer_id = session.peer_id;
        if self.accept_tx.try_send(session).is_err() {
            warn!(peer = peer_id, "api accept backlog full, dropping session");
        }
    }

    /// Receive the next signaling session.
    pub async fn accept(&self) -> Option<ApiSession> {
        self.accept_rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_session(id: u32) -> ApiSession {
        let (near, _far) = tokio::io::duplex(64);
        let (tx, _rx) = mpsc::channel(1);
        ApiSession {
            peer_id: id,
            stream: near,
            candidates: tx,
            negotiation_needed: Arc::new(Notify::new()),
        }
    }

    #[tokio::test]
    async fn published_sessions_are_accepted_in_order() {
        let server = ApiServer::new();
        server.publish(dummy_session(1));
        server.publish(dummy_session(2));
        assert_eq!(server.accept().await.unwrap().peer_id, 1);
        assert_eq!(server.accept().await.unwrap().peer_id, 2);
    }
}
