//! Network transport for the CodeGuard server.
//!
//! The HTTP API and the real-time channel share one axum [`Router`]; a
//! transport only decides how that router is exposed.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Router (HTTP API + /ws upgrade)     │
//! └──────────────────┬──────────────────────┘
//!                    │
//!                    ▼
//!          ┌─────────────────┐
//!          │  TcpTransport   │
//!          │   (HTTP/1.1)    │
//!          └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use codeguard::transport::{TcpTransport, Transport};
//!
//! let transport = TcpTransport::localhost(8080);
//! transport.serve(router).await?;
//! ```

mod tcp;

pub use tcp::TcpTransport;

use crate::error::Result;
use axum::Router;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`Transport::serve`]
pub type ServeFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Transport trait for pluggable network backends.
pub trait Transport: Send + Sync {
    /// Serve the given router until the process stops.
    fn serve(&self, router: Router) -> ServeFuture<'_>;

    /// Serve the given router until `shutdown` resolves, then drain
    /// in-flight requests.
    fn serve_with_shutdown(
        &self,
        router: Router,
        shutdown: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    ) -> ServeFuture<'_>;

    /// Get the transport name for logging.
    fn name(&self) -> &'static str;

    /// Get the listen address as a string.
    fn listen_addr(&self) -> String;
}
