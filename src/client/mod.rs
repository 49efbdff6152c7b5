//! Client container
//!
//! Owns everything that outlives a single tunnel: the compiled service
//! list, the peer-task map, the buffer pool, the idle manager, the API
//! accept channel, and one reconnection supervisor per configured tunnel
//! slot.

mod idle;

pub use idle::IdleManager;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::api::ApiServer;
use crate::common::{BufferPool, IntoStream};
use crate::config::{Config, Service};
use crate::error::Result;
use crate::transport::{Dialer, TcpDialer};
use crate::tunnel::peer::PeerMap;
use crate::tunnel::Tunnel;

pub struct Client {
    config: Config,
    services: Vec<Service>,
    peers: Arc<PeerMap>,
    tunnels: Mutex<HashMap<usize, Arc<Tunnel>>>,
    idle: IdleManager,
    api: Arc<ApiServer>,
    pool: Arc<BufferPool>,
    dialer: Arc<dyn Dialer>,
    closing: AtomicBool,
}

impl Client {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        Self::with_dialer(config, Arc::new(TcpDialer))
    }

    /// Build a client with a custom backend dialer.
    pub fn with_dialer(config: Config, dialer: Arc<dyn Dialer>) -> Result<Arc<Self>> {
        let services = config.compile_services()?;
        let idle = IdleManager::new(config.connections, config.min_idle);
        Ok(Arc::new(Self {
            services,
            peers: PeerMap::new(),
            tunnels: Mutex::new(HashMap::new()),
            idle,
            api: ApiServer::new(),
            pool: BufferPool::new(),
            dialer,
            closing: AtomicBool::new(false),
            config,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn peers(&self) -> &Arc<PeerMap> {
        &self.peers
    }

    pub fn api(&self) -> &Arc<ApiServer> {
        &self.api
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn dialer(&self) -> &dyn Dialer {
        self.dialer.as_ref()
    }

    pub fn idle_manager(&self) -> &IdleManager {
        &self.idle
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Tunnels that have seen the server's Ready signal.
    pub fn active_tunnels(&self) -> usize {
        self.tunnels.lock().len()
    }

    /// Called by a tunnel on the server's Ready signal.
    pub fn add_tunnel(&self, tunnel: Arc<Tunnel>) {
        self.idle.set_running(tunnel.conn_id());
        self.tunnels.lock().insert(tunnel.conn_id(), tunnel);
    }

    pub fn remove_tunnel(&self, conn_id: usize) {
        self.tunnels.lock().remove(&conn_id);
    }

    /// Tunnel termination hook: keep the idle floor satisfied by waking a
    /// parked slot when the active set dips below it.
    pub fn on_tunnel_close(&self) {
        if !self.is_closing() && self.active_tunnels() < self.config.min_idle {
            self.idle.wake_waiting();
        }
    }

    /// Run one supervisor per configured tunnel slot until shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut handles = Vec::with_capacity(self.config.connections);
        for conn_id in 0..self.config.connections {
            let client = self.clone();
            handles.push(tokio::spawn(client.supervise(conn_id)));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Shut every tunnel down and release parked supervisors.
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let tunnels: Vec<Arc<Tunnel>> = self.tunnels.lock().drain().map(|(_, t)| t).collect();
        for tunnel in tunnels {
            tunnel.close().await;
        }
        self.idle.wake_all();
    }

    /// Dial, handshake, serve, repeat. The tunnel's own read loop decides
    /// when a connection is over; this loop only decides whether to retry.
    async fn supervise(self: Arc<Self>, conn_id: usize) {
        loop {
            if self.is_closing() {
                return;
            }
            if self.idle.is_waiting(conn_id) {
                self.idle.wait_for_wake(conn_id).await;
                continue;
            }
            if let Err(e) = Self::connect_once(&self, conn_id).await {
                warn!(conn = conn_id, error = %e, "tunnel attempt failed");
            }
            if self.is_closing() {
                return;
            }
            tokio::time::sleep(self.config.reconnect_delay()).await;
        }
    }

    async fn connect_once(this: &Arc<Self>, conn_id: usize) -> Result<()> {
        info!(conn = conn_id, remote = %this.config.remote, "dialing server");
        let socket = TcpStream::connect(&this.config.remote).await?;
        socket.set_nodelay(true)?;

        let (tunnel, reader) = Tunnel::new(this, socket.into_stream(), conn_id);
        tunnel.init().await?;
        tunnel.read_loop(reader).await;
        Ok(())
    }
}
