//! Configuration module for Burrow
//!
//! JSON configuration in the same spirit as the server side: a client id and
//! secret, the rendezvous server address, and the list of local services to
//! expose through it.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Client id announced in the handshake
    pub id: String,

    /// Shared secret announced in the handshake
    #[serde(default)]
    pub secret: String,

    /// Rendezvous server address, e.g. "tunnel.example.com:7000"
    pub remote: String,

    /// Seconds of server silence before keepalives kick in (0 disables)
    #[serde(default = "default_remote_timeout_secs")]
    pub remote_timeout_secs: u64,

    /// Seconds between reconnect attempts after a tunnel terminates
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Number of concurrent tunnel connections to maintain
    #[serde(default = "default_connections")]
    pub connections: usize,

    /// Tunnels kept running when the idle manager lets quiescent ones wait
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,

    /// STUN server URLs; empty disables the P2P path
    #[serde(default)]
    pub stuns: Vec<String>,

    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Services exposed through the tunnel, announced in handshake order
    pub services: Vec<ServiceConfig>,
}

/// One local service to expose
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Backend URL: "tcp://host:port", "http://host:port" or "https://host:port"
    pub local: String,

    /// Let the server pick the remote TCP port (tcp scheme only)
    #[serde(default)]
    pub remote_tcp_random: bool,

    /// Remote TCP port to request (tcp scheme only)
    #[serde(default)]
    pub remote_tcp_port: u16,

    /// Host prefix served by the server (HTTP family only; defaults to the
    /// client id)
    #[serde(default)]
    pub host_prefix: String,

    /// Rewrite the Host header of forwarded requests to the backend host
    #[serde(default)]
    pub use_local_as_http_host: bool,

    /// Seconds the backend may stay silent between inbound frames (0 disables)
    #[serde(default)]
    pub local_timeout_secs: u64,
}

fn default_remote_timeout_secs() -> u64 {
    45
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_connections() -> usize {
    1
}

fn default_min_idle() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Create an example configuration exposing one HTTP service
    pub fn example() -> Self {
        Config {
            id: "my-client".to_string(),
            secret: "change-me".to_string(),
            remote: "tunnel.example.com:7000".to_string(),
            remote_timeout_secs: default_remote_timeout_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            connections: default_connections(),
            min_idle: default_min_idle(),
            stuns: vec!["stun:stun.l.google.com:19302".to_string()],
            log_level: default_log_level(),
            services: vec![ServiceConfig {
                local: "http://127.0.0.1:8080".to_string(),
                remote_tcp_random: false,
                remote_tcp_port: 0,
                host_prefix: "my-client".to_string(),
                use_local_as_http_host: false,
                local_timeout_secs: 0,
            }],
        }
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Validate and compile the service list into runtime descriptors.
    pub fn compile_services(&self) -> Result<Vec<Service>> {
        if self.id.is_empty() || self.id.len() > 255 {
            return Err(Error::Config("id must be 1..=255 bytes".into()));
        }
        if self.secret.len() > 255 {
            return Err(Error::Config("secret must be at most 255 bytes".into()));
        }
        if self.services.is_empty() {
            return Err(Error::Config("at least one service is required".into()));
        }
        if self.connections == 0 {
            return Err(Error::Config("connections must be at least 1".into()));
        }
        if self.min_idle > self.connections {
            return Err(Error::Config("min_idle cannot exceed connections".into()));
        }

        self.services
            .iter()
            .map(|s| Service::compile(s, &self.id))
            .collect()
    }
}

// ============================================================================
// Compiled service descriptors
// ============================================================================

/// Backend URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Http,
    Https,
}

impl Scheme {
    pub fn is_tcp(self) -> bool {
        matches!(self, Scheme::Tcp)
    }
}

/// Parsed backend URL: scheme plus "host:port"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUrl {
    pub scheme: Scheme,
    pub host: String,
}

impl LocalUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let (scheme, host) = raw
            .split_once("://")
            .ok_or_else(|| Error::Config(format!("invalid local url: {}", raw)))?;
        let scheme = match scheme {
            "tcp" => Scheme::Tcp,
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(Error::Config(format!("unsupported scheme: {}", other)));
            }
        };
        let host = host.trim_end_matches('/');
        if host.is_empty() || !host.contains(':') {
            return Err(Error::Config(format!(
                "local url must contain host:port: {}",
                raw
            )));
        }
        Ok(LocalUrl {
            scheme,
            host: host.to_string(),
        })
    }
}

/// Immutable runtime descriptor for one exposed service
#[derive(Debug, Clone)]
pub struct Service {
    pub local_url: LocalUrl,
    pub remote_tcp_random: bool,
    pub remote_tcp_port: u16,
    pub host_prefix: String,
    pub use_local_as_http_host: bool,
    pub local_timeout: Duration,
}

impl Service {
    fn compile(config: &ServiceConfig, id: &str) -> Result<Self> {
        let local_url = LocalUrl::parse(&config.local)?;

        if local_url.scheme.is_tcp() {
            if !config.remote_tcp_random && config.remote_tcp_port == 0 {
                return Err(Error::Config(format!(
                    "tcp service {} needs remote_tcp_port or remote_tcp_random",
                    config.local
                )));
            }
        }

        let host_prefix = if config.host_prefix.is_empty() {
            id.to_string()
        } else {
            config.host_prefix.clone()
        };
        if host_prefix.len() > 255 {
            return Err(Error::Config("host_prefix must be at most 255 bytes".into()));
        }

        Ok(Service {
            local_url,
            remote_tcp_random: config.remote_tcp_random,
            remote_tcp_port: config.remote_tcp_port,
            host_prefix,
            use_local_as_http_host: config.use_local_as_http_host,
            local_timeout: Duration::from_secs(config.local_timeout_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_round_trips() {
        let config = Config::example();
        let json = serde_json::to_string(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.id, "my-client");
        assert_eq!(parsed.services.len(), 1);
        parsed.compile_services().unwrap();
    }

    #[test]
    fn local_url_parsing() {
        let url = LocalUrl::parse("tcp://127.0.0.1:22").unwrap();
        assert_eq!(url.scheme, Scheme::Tcp);
        assert_eq!(url.host, "127.0.0.1:22");

        let url = LocalUrl::parse("http://localhost:8080/").unwrap();
        assert_eq!(url.scheme, Scheme::Http);
        assert_eq!(url.host, "localhost:8080");

        assert!(LocalUrl::parse("ftp://x:1").is_err());
        assert!(LocalUrl::parse("nohost").is_err());
        assert!(LocalUrl::parse("http://noport").is_err());
    }

    #[test]
    fn host_prefix_defaults_to_id() {
        let mut config = Config::example();
        config.services[0].host_prefix = String::new();
        let services = config.compile_services().unwrap();
        assert_eq!(services[0].host_prefix, "my-client");
    }

    #[test]
    fn tcp_service_requires_port_or_random() {
        let mut config = Config::example();
        config.services[0].local = "tcp://127.0.0.1:22".to_string();
        config.services[0].remote_tcp_port = 0;
        config.services[0].remote_tcp_random = false;
        assert!(config.compile_services().is_err());

        config.services[0].remote_tcp_random = true;
        assert!(config.compile_services().is_ok());
    }

    #[test]
    fn oversized_identity_is_rejected() {
        let mut config = Config::example();
        config.id = "x".repeat(256);
        assert!(config.compile_services().is_err());
    }
}
