//! End-to-end transport tests.
//!
//! These tests serve the real CodeGuard router over TCP and talk to it with
//! real HTTP and WebSocket clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use codeguard::config::Config;
use codeguard::server::{create_router, AppState};
use codeguard::transport::{TcpTransport, Transport};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Find an available port for testing
async fn find_available_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn spawn_server(config: Config) -> (Arc<AppState>, u16, tokio::task::JoinHandle<()>) {
    let port = find_available_port().await;
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let state = Arc::new(AppState::new(&config).unwrap());
    let router = create_router(Arc::clone(&state));
    let transport = TcpTransport::new(addr);
    let handle = tokio::spawn(async move {
        let _ = transport.serve(router).await;
    });

    // Give server time to start
    tokio::time::sleep(Duration::from_millis(100)).await;
    (state, port, handle)
}

#[tokio::test]
async fn test_tcp_transport_serves_health() {
    let (_, port, server) = spawn_server(Config::default()).await;

    let client = reqwest::Client::new();
    let response = timeout(
        Duration::from_secs(5),
        client.get(format!("http://127.0.0.1:{port}/health")).send(),
    )
    .await
    .expect("Request timed out")
    .expect("Request failed");

    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    server.abort();
}

#[tokio::test]
async fn test_tcp_transport_handles_concurrent_requests() {
    let (_, port, server) = spawn_server(Config::default()).await;
    let client = reqwest::Client::new();

    let mut handles = vec![];
    for i in 0..10 {
        let client = client.clone();
        let url = format!("http://127.0.0.1:{port}/analysis/validate");
        handles.push(tokio::spawn(async move {
            client
                .post(&url)
                .json(&json!({
                    "projectId": format!("p{i}"),
                    "repositoryUrl": "https://github.com/acme/app",
                    "analysisTypes": ["code_quality"]
                }))
                .send()
                .await
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert!(response.status().is_success());
    }

    server.abort();
}

#[tokio::test]
async fn test_websocket_heartbeat_roundtrip() {
    let (state, port, server) = spawn_server(Config::default()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws?userId=u1"))
        .await
        .unwrap();
    ws.send(WsMessage::Text(r#"{"type":"heartbeat","data":{}}"#.into()))
        .await
        .unwrap();

    let reply = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("No heartbeat reply")
        .unwrap()
        .unwrap();
    let body: Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(body["type"], "heartbeat");
    assert_eq!(body["data"]["status"], "pong");

    let stats = state.hub.stats().await;
    assert_eq!(stats.connections, 1);

    ws.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state.hub.client_count().await, 0);

    server.abort();
}

#[tokio::test]
async fn test_websocket_capacity_rejection() {
    let mut config = Config::default();
    config.server.max_connections = 1;
    let (_, port, server) = spawn_server(config).await;
    let url = format!("ws://127.0.0.1:{port}/ws");

    let (_first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    // Registration happens after the upgrade completes
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (mut second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let frame = timeout(Duration::from_secs(5), second.next())
        .await
        .expect("No close frame")
        .unwrap()
        .unwrap();
    match frame {
        WsMessage::Close(Some(close)) => assert_eq!(u16::from(close.code), 1008),
        other => panic!("expected close frame, got {other:?}"),
    }

    server.abort();
}

#[tokio::test]
async fn test_graceful_shutdown_stops_server() {
    let port = find_available_port().await;
    let state = Arc::new(AppState::new(&Config::default()).unwrap());
    let router = create_router(Arc::clone(&state));
    let transport = TcpTransport::localhost(port);

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        transport
            .serve_with_shutdown(
                router,
                Box::pin(async move {
                    let _ = rx.await;
                }),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .unwrap();
    assert!(response.status().is_success());
    drop(response);

    tx.send(()).unwrap();
    let result = timeout(Duration::from_secs(5), server)
        .await
        .expect("Server did not stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_connection_refused_is_error() {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(500))
        .build()
        .unwrap();

    let port = find_available_port().await;
    let result = client
        .get(format!("http://127.0.0.1:{port}/health"))
        .send()
        .await;
    assert!(result.is_err());
}
