//! CodeGuard HTTP and real-time server.
//!
//! Provides:
//! - The real-time channel (`GET /ws`) backed by the [`BroadcastServer`]
//! - Request validation and lifecycle event intake
//! - The operator surface (dashboard, report, emergency shutdown)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use codeguard::config::Config;
//! use codeguard::server::{create_router, AppState};
//!
//! let state = Arc::new(AppState::new(&Config::default())?);
//! state.start();
//! let app = create_router(state);
//! ```

mod config;
mod handlers;
mod hub;
mod state;

pub use config::{BroadcastConfig, ServerConfig};
pub use handlers::{create_router, health_check};
pub use hub::{
    BroadcastServer, ClientHandle, ClientInfo, HubStats, Outbound, CLOSE_HEARTBEAT_TIMEOUT,
    CLOSE_POLICY_VIOLATION,
};
pub use state::AppState;
