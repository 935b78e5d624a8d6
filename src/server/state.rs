//! Server state shared across handlers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::config::ServerConfig;
use super::hub::{BroadcastServer, CLOSE_HEARTBEAT_TIMEOUT};
use crate::config::Config;
use crate::error::Result;
use crate::realtime::{RealtimeConfig, SessionCoordinator};
use crate::scheduler::Scheduler;
use crate::security::{IntegrationConfig, SecurityIntegration};

/// Application state shared across handlers
#[derive(Debug)]
pub struct AppState {
    /// Server configuration
    pub config: ServerConfig,
    /// Global security coordinator
    pub security: Arc<SecurityIntegration>,
    /// Real-time hub
    pub hub: Arc<BroadcastServer>,
    /// Analysis session coordinator
    pub coordinator: Arc<SessionCoordinator>,
    /// Periodic maintenance tasks
    pub scheduler: Arc<Scheduler>,
    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    /// Build every component from a loaded [`Config`]
    pub fn new(config: &Config) -> Result<Self> {
        Self::from_parts(
            config.server_config()?,
            config.integration_config()?,
            config.realtime_config()?,
        )
    }

    /// Build from already-resolved component settings
    pub fn from_parts(
        server: ServerConfig,
        integration: IntegrationConfig,
        realtime: RealtimeConfig,
    ) -> Result<Self> {
        let security = Arc::new(SecurityIntegration::new(integration)?);
        let hub = Arc::new(BroadcastServer::new(server.broadcast.clone()));
        let scheduler = Arc::new(Scheduler::new());
        let coordinator = Arc::new(SessionCoordinator::new(
            realtime,
            Arc::clone(&hub),
            Arc::clone(&security),
            Arc::clone(&scheduler),
        ));

        Ok(Self {
            config: server,
            security,
            hub,
            coordinator,
            scheduler,
            start_time: Instant::now(),
        })
    }

    /// Start maintenance timers and the security relay.
    /// Must be called within a tokio runtime.
    pub fn start(&self) {
        self.security.start(&self.scheduler);
        self.hub.start(&self.scheduler);
        self.coordinator.start();
        tracing::info!(tasks = ?self.scheduler.task_names(), "Background tasks started");
    }

    /// Stop timers and close every real-time connection
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
        self.scheduler.shutdown();
        self.hub
            .close_all(CLOSE_HEARTBEAT_TIMEOUT, "Server shutting down")
            .await;
        tracing::info!("Server state shut down");
    }

    /// Get server uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}
