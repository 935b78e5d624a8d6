//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Broadcast hub limits and sweep periods
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastConfig {
    /// Connections beyond this are closed with a policy violation
    pub max_connections: usize,
    /// Largest frame accepted or sent (bytes)
    pub max_payload_bytes: usize,
    /// Connections silent for longer than this are closed
    pub heartbeat_timeout: Duration,
    /// Liveness sweep period
    pub heartbeat_sweep_interval: Duration,
    /// Empty index cleanup period
    pub cleanup_interval: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_payload_bytes: 1024 * 1024,
            heartbeat_timeout: Duration::from_secs(60),
            heartbeat_sweep_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl BroadcastConfig {
    /// Set connection capacity
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set payload cap
    pub fn with_max_payload(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    /// Set heartbeat timeout
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Bind address
    pub addr: SocketAddr,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Enable request tracing
    pub logging: bool,
    /// CORS enabled
    pub cors_enabled: bool,
    /// Real-time hub settings
    pub broadcast: BroadcastConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_body_size: 2 * 1024 * 1024, // 2MB
            logging: true,
            cors_enabled: true,
            broadcast: BroadcastConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Listen on localhost at `port`
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr.set_port(port);
        self
    }

    /// Bind to all interfaces
    pub fn bind_all(mut self) -> Self {
        self.addr = SocketAddr::from(([0, 0, 0, 0], self.addr.port()));
        self
    }

    /// Set address directly
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Set hub settings
    pub fn with_broadcast(mut self, broadcast: BroadcastConfig) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Disable request tracing
    pub fn without_logging(mut self) -> Self {
        self.logging = false;
        self
    }

    /// Disable CORS
    pub fn without_cors(mut self) -> Self {
        self.cors_enabled = false;
        self
    }
}
