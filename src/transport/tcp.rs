//! TCP transport.
//!
//! HTTP/1.1 over TCP using axum's built-in server. WebSocket upgrades on
//! `/ws` ride the same listener.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use axum::Router;
use tokio::net::TcpListener;

use super::{ServeFuture, Transport};
use crate::error::{GuardError, Result};

/// TCP/HTTP transport using axum's built-in server.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    listen_addr: SocketAddr,
}

impl TcpTransport {
    /// Create a new TCP transport.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self { listen_addr }
    }

    /// Create with localhost address.
    pub fn localhost(port: u16) -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.listen_addr).await.map_err(|e| {
            GuardError::Server(format!("Failed to bind TCP to {}: {e}", self.listen_addr))
        })?;
        tracing::info!(addr = %self.listen_addr, "TCP transport listening");
        Ok(listener)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::localhost(8080)
    }
}

impl Transport for TcpTransport {
    fn serve(&self, router: Router) -> ServeFuture<'_> {
        Box::pin(async move {
            let listener = self.bind().await?;
            axum::serve(listener, router)
                .await
                .map_err(|e| GuardError::Server(format!("TCP server error: {e}")))
        })
    }

    fn serve_with_shutdown(
        &self,
        router: Router,
        shutdown: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    ) -> ServeFuture<'_> {
        Box::pin(async move {
            let listener = self.bind().await?;
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
                .map_err(|e| GuardError::Server(format!("TCP server error: {e}")))?;
            tracing::info!(addr = %self.listen_addr, "TCP transport stopped");
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "TCP/HTTP"
    }

    fn listen_addr(&self) -> String {
        format!("http://{}", self.listen_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    #[test]
    fn test_tcp_transport_default() {
        let transport = TcpTransport::default();
        assert_eq!(transport.listen_addr.port(), 8080);
        assert_eq!(transport.name(), "TCP/HTTP");
    }

    #[test]
    fn test_tcp_transport_localhost() {
        let transport = TcpTransport::localhost(3000);
        assert_eq!(transport.listen_addr(), "http://127.0.0.1:3000");
    }

    #[tokio::test]
    async fn test_graceful_shutdown_returns() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let transport = TcpTransport::localhost(port);
        let router = Router::new().route("/", get(|| async { "ok" }));

        let result = transport
            .serve_with_shutdown(router, Box::pin(async {}))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_server_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let transport = TcpTransport::new(taken.local_addr().unwrap());

        let result = transport.serve(Router::new()).await;
        assert!(matches!(result, Err(GuardError::Server(_))));
    }
}
