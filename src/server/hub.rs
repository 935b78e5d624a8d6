//! Broadcast hub for real-time connections.
//!
//! Each connection owns its project and channel subscription sets. Two
//! reverse indices (`project -> clients`, `channel -> clients`) keep fan-out
//! proportional to the subscriber count.
//!
//! The hub never touches sockets. Every connection gets an unbounded
//! [`Outbound`] queue; the socket task drains it in order. A failed enqueue
//! means the socket task is gone and is handled exactly like a disconnect.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use super::config::BroadcastConfig;
use crate::error::{GuardError, Result};
use crate::protocol::{Message, MessageType, SubscriptionRequest, SubscriptionStatus};
use crate::scheduler::Scheduler;

/// Close code sent to connections that miss their heartbeat
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 1001;

/// Close code for policy violations (capacity)
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Frame queued for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Text frame
    Text(String),
    /// Close the connection
    Close {
        /// WebSocket close code
        code: u16,
        /// Close reason
        reason: String,
    },
}

/// Returned by [`BroadcastServer::connect`]
#[derive(Debug)]
pub struct ClientHandle {
    /// Connection id
    pub id: String,
    /// Outbound frames for this connection, in order
    pub receiver: mpsc::UnboundedReceiver<Outbound>,
}

/// Public view of one connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Connection id
    pub id: String,
    /// User id from the handshake
    pub user_id: Option<String>,
    /// Subscribed projects, sorted
    pub projects: Vec<String>,
    /// Subscribed channels, sorted
    pub channels: Vec<String>,
    /// Connection time
    pub connected_at: DateTime<Utc>,
}

/// Hub counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    /// Open connections
    pub connections: usize,
    /// Project index entries
    pub projects: usize,
    /// Channel index entries
    pub channels: usize,
    /// Frames enqueued
    pub messages_sent: u64,
    /// Enqueue failures (treated as disconnects)
    pub send_failures: u64,
}

#[derive(Debug)]
struct Client {
    user_id: Option<String>,
    projects: HashSet<String>,
    channels: HashSet<String>,
    connected_at: DateTime<Utc>,
    last_heartbeat: Instant,
    tx: mpsc::UnboundedSender<Outbound>,
}

#[derive(Debug, Default)]
struct Registry {
    clients: HashMap<String, Client>,
    by_project: HashMap<String, HashSet<String>>,
    by_channel: HashMap<String, HashSet<String>>,
}

impl Registry {
    fn remove(&mut self, id: &str) -> Option<Client> {
        let client = self.clients.remove(id)?;
        for project in &client.projects {
            if let Some(ids) = self.by_project.get_mut(project) {
                ids.remove(id);
            }
        }
        for channel in &client.channels {
            if let Some(ids) = self.by_channel.get_mut(channel) {
                ids.remove(id);
            }
        }
        Some(client)
    }
}

/// Real-time broadcast server
#[derive(Debug)]
pub struct BroadcastServer {
    config: BroadcastConfig,
    registry: RwLock<Registry>,
    messages_sent: AtomicU64,
    send_failures: AtomicU64,
}

impl BroadcastServer {
    /// Create an empty hub
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            config,
            registry: RwLock::new(Registry::default()),
            messages_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
        }
    }

    /// Hub configuration
    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    /// Register the liveness sweep and index cleanup with the scheduler
    pub fn start(self: &Arc<Self>, scheduler: &Scheduler) {
        let hub = Arc::clone(self);
        scheduler.spawn_periodic(
            "hub:heartbeat-sweep",
            self.config.heartbeat_sweep_interval,
            move || {
                let hub = Arc::clone(&hub);
                async move {
                    hub.sweep_stale(Instant::now()).await;
                }
            },
        );

        let hub = Arc::clone(self);
        scheduler.spawn_periodic(
            "hub:index-cleanup",
            self.config.cleanup_interval,
            move || {
                let hub = Arc::clone(&hub);
                async move {
                    hub.cleanup_indices().await;
                }
            },
        );
    }

    /// Register a connection. Fails with [`GuardError::Capacity`] when full.
    pub async fn connect(&self, user_id: Option<String>) -> Result<ClientHandle> {
        let mut registry = self.registry.write().await;
        if registry.clients.len() >= self.config.max_connections {
            tracing::warn!(
                max = self.config.max_connections,
                "Rejecting connection: at capacity"
            );
            return Err(GuardError::Capacity {
                max: self.config.max_connections,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (tx, receiver) = mpsc::unbounded_channel();
        registry.clients.insert(
            id.clone(),
            Client {
                user_id: user_id.clone(),
                projects: HashSet::new(),
                channels: HashSet::new(),
                connected_at: Utc::now(),
                last_heartbeat: Instant::now(),
                tx,
            },
        );

        tracing::info!(
            client_id = %id,
            user_id = user_id.as_deref().unwrap_or("-"),
            connections = registry.clients.len(),
            "Client connected"
        );
        Ok(ClientHandle { id, receiver })
    }

    /// Remove a connection and its index entries. Returns false if unknown.
    pub async fn disconnect(&self, client_id: &str) -> bool {
        let removed = self.registry.write().await.remove(client_id).is_some();
        if removed {
            tracing::info!(client_id, "Client disconnected");
        }
        removed
    }

    /// Handle one inbound text frame
    pub async fn handle_incoming(&self, client_id: &str, text: &str) {
        if text.len() > self.config.max_payload_bytes {
            tracing::warn!(client_id, bytes = text.len(), "Inbound frame too large");
            self.send_to(
                client_id,
                &Message::parse_error("payload too large").with_session(client_id),
            )
            .await;
            return;
        }

        let message = match Message::parse(text) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(client_id, error = %e, "Unparseable frame");
                self.send_to(
                    client_id,
                    &Message::parse_error(&e.to_string()).with_session(client_id),
                )
                .await;
                return;
            },
        };

        let reply = match message.msg_type {
            MessageType::Subscribe | MessageType::Unsubscribe => {
                match message.subscription() {
                    Some(request) => {
                        self.apply_subscription(client_id, message.msg_type, &request)
                            .await
                    },
                    None => Some(Message::parse_error(
                        "subscription requires projectId or channel",
                    )),
                }
            },
            MessageType::Heartbeat => {
                let mut registry = self.registry.write().await;
                let alive = match registry.clients.get_mut(client_id) {
                    Some(client) => {
                        client.last_heartbeat = Instant::now();
                        true
                    },
                    None => false,
                };
                alive.then(Message::heartbeat_pong)
            },
            other => {
                tracing::warn!(client_id, msg_type = %other, "Unhandled message type");
                Some(Message::unknown_type_error())
            },
        };

        if let Some(reply) = reply {
            self.send_to(client_id, &reply.with_session(client_id)).await;
        }
    }

    async fn apply_subscription(
        &self,
        client_id: &str,
        msg_type: MessageType,
        request: &SubscriptionRequest,
    ) -> Option<Message> {
        let subscribe = msg_type == MessageType::Subscribe;
        let mut registry = self.registry.write().await;
        let Registry {
            clients,
            by_project,
            by_channel,
        } = &mut *registry;
        let client = clients.get_mut(client_id)?;

        if let Some(project) = &request.project_id {
            if subscribe {
                client.projects.insert(project.clone());
                by_project
                    .entry(project.clone())
                    .or_default()
                    .insert(client_id.to_string());
            } else {
                client.projects.remove(project);
                if let Some(ids) = by_project.get_mut(project) {
                    ids.remove(client_id);
                }
            }
        }

        if let Some(channel) = &request.channel {
            if subscribe {
                client.channels.insert(channel.clone());
                by_channel
                    .entry(channel.clone())
                    .or_default()
                    .insert(client_id.to_string());
            } else {
                client.channels.remove(channel);
                if let Some(ids) = by_channel.get_mut(channel) {
                    ids.remove(client_id);
                }
            }
        }

        tracing::debug!(
            client_id,
            project_id = request.project_id.as_deref().unwrap_or("-"),
            channel = request.channel.as_deref().unwrap_or("-"),
            subscribe,
            "Subscription updated"
        );

        let status = if subscribe {
            SubscriptionStatus::Subscribed
        } else {
            SubscriptionStatus::Unsubscribed
        };
        Some(Message::subscription_ack(msg_type, request, status))
    }

    /// Send to every subscriber of a project. Returns the number reached.
    pub async fn broadcast_to_project(&self, project_id: &str, message: &Message) -> usize {
        let targets = {
            let registry = self.registry.read().await;
            registry
                .by_project
                .get(project_id)
                .map(|ids| ids.iter().cloned().collect::<Vec<_>>())
                .unwrap_or_default()
        };
        self.deliver(targets, message).await
    }

    /// Send to every subscriber of a channel
    pub async fn broadcast_to_channel(&self, channel: &str, message: &Message) -> usize {
        let targets = {
            let registry = self.registry.read().await;
            registry
                .by_channel
                .get(channel)
                .map(|ids| ids.iter().cloned().collect::<Vec<_>>())
                .unwrap_or_default()
        };
        self.deliver(targets, message).await
    }

    /// Send once to every subscriber of the project or the channel
    pub async fn broadcast_scoped(
        &self,
        project_id: &str,
        channel: &str,
        message: &Message,
    ) -> usize {
        let targets = {
            let registry = self.registry.read().await;
            let mut ids: HashSet<String> = HashSet::new();
            if let Some(p) = registry.by_project.get(project_id) {
                ids.extend(p.iter().cloned());
            }
            if let Some(c) = registry.by_channel.get(channel) {
                ids.extend(c.iter().cloned());
            }
            ids.into_iter().collect::<Vec<_>>()
        };
        self.deliver(targets, message).await
    }

    /// Send to every connection regardless of subscriptions
    pub async fn broadcast_all(&self, message: &Message) -> usize {
        let targets = {
            let registry = self.registry.read().await;
            registry.clients.keys().cloned().collect::<Vec<_>>()
        };
        self.deliver(targets, message).await
    }

    /// Close connections whose last heartbeat is older than the timeout
    pub async fn sweep_stale(&self, now: Instant) -> Vec<String> {
        let stale: Vec<(String, Client)> = {
            let mut registry = self.registry.write().await;
            let ids: Vec<String> = registry
                .clients
                .iter()
                .filter(|(_, c)| {
                    now.saturating_duration_since(c.last_heartbeat) > self.config.heartbeat_timeout
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| registry.remove(&id).map(|c| (id, c)))
                .collect()
        };

        let mut closed = Vec::with_capacity(stale.len());
        for (id, client) in stale {
            let _ = client.tx.send(Outbound::Close {
                code: CLOSE_HEARTBEAT_TIMEOUT,
                reason: "Heartbeat timeout".to_string(),
            });
            tracing::info!(client_id = %id, "Closing stale connection");
            closed.push(id);
        }
        closed
    }

    /// Drop index entries with no subscribers. Returns how many were removed.
    pub async fn cleanup_indices(&self) -> usize {
        let mut registry = self.registry.write().await;
        let before = registry.by_project.len() + registry.by_channel.len();
        registry.by_project.retain(|_, ids| !ids.is_empty());
        registry.by_channel.retain(|_, ids| !ids.is_empty());
        let removed = before - (registry.by_project.len() + registry.by_channel.len());
        if removed > 0 {
            tracing::debug!(removed, "Cleaned up empty subscription indices");
        }
        removed
    }

    /// Close every connection
    pub async fn close_all(&self, code: u16, reason: &str) {
        let clients: Vec<Client> = {
            let mut registry = self.registry.write().await;
            let ids: Vec<String> = registry.clients.keys().cloned().collect();
            ids.iter().filter_map(|id| registry.remove(id)).collect()
        };
        for client in clients {
            let _ = client.tx.send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    /// Open connections
    pub async fn client_count(&self) -> usize {
        self.registry.read().await.clients.len()
    }

    /// View of one connection
    pub async fn client_info(&self, client_id: &str) -> Option<ClientInfo> {
        let registry = self.registry.read().await;
        registry.clients.get(client_id).map(|c| {
            let mut projects: Vec<String> = c.projects.iter().cloned().collect();
            projects.sort();
            let mut channels: Vec<String> = c.channels.iter().cloned().collect();
            channels.sort();
            ClientInfo {
                id: client_id.to_string(),
                user_id: c.user_id.clone(),
                projects,
                channels,
                connected_at: c.connected_at,
            }
        })
    }

    /// Counter snapshot
    pub async fn stats(&self) -> HubStats {
        let registry = self.registry.read().await;
        HubStats {
            connections: registry.clients.len(),
            projects: registry.by_project.len(),
            channels: registry.by_channel.len(),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }

    async fn send_to(&self, client_id: &str, message: &Message) -> bool {
        self.deliver(vec![client_id.to_string()], message).await == 1
    }

    async fn deliver(&self, targets: Vec<String>, message: &Message) -> usize {
        if targets.is_empty() {
            return 0;
        }

        let text = match message.to_json() {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize message");
                return 0;
            },
        };
        if text.len() > self.config.max_payload_bytes {
            tracing::warn!(
                msg_type = %message.msg_type,
                bytes = text.len(),
                max = self.config.max_payload_bytes,
                "Dropping oversized broadcast"
            );
            return 0;
        }

        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let registry = self.registry.read().await;
            for id in targets {
                let Some(client) = registry.clients.get(&id) else {
                    continue;
                };
                if client.tx.send(Outbound::Text(text.clone())).is_ok() {
                    delivered += 1;
                } else {
                    failed.push(id);
                }
            }
        }

        self.messages_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        if !failed.is_empty() {
            self.send_failures
                .fetch_add(failed.len() as u64, Ordering::Relaxed);
            for id in failed {
                tracing::debug!(client_id = %id, "Send failed, dropping connection");
                self.disconnect(&id).await;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn hub() -> BroadcastServer {
        BroadcastServer::new(BroadcastConfig::default())
    }

    fn drain(handle: &mut ClientHandle) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = handle.receiver.try_recv() {
            if let Outbound::Text(text) = frame {
                out.push(Message::parse(&text).unwrap());
            }
        }
        out
    }

    async fn subscribe(hub: &BroadcastServer, handle: &mut ClientHandle, req: SubscriptionRequest) {
        let text = Message::subscribe(&req).to_json().unwrap();
        hub.handle_incoming(&handle.id, &text).await;
        drain(handle);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let hub = BroadcastServer::new(BroadcastConfig::default().with_max_connections(2));
        let _a = hub.connect(None).await.unwrap();
        let _b = hub.connect(None).await.unwrap();
        assert!(matches!(
            hub.connect(None).await,
            Err(GuardError::Capacity { max: 2 })
        ));
    }

    #[tokio::test]
    async fn test_subscribe_ack_and_index() {
        let hub = hub();
        let mut c = hub.connect(Some("u1".to_string())).await.unwrap();
        let text = Message::subscribe(&SubscriptionRequest::project("p")).to_json().unwrap();
        hub.handle_incoming(&c.id, &text).await;

        let replies = drain(&mut c);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].msg_type, MessageType::Subscribe);
        assert_eq!(
            replies[0].subscription_status(),
            Some(SubscriptionStatus::Subscribed)
        );

        let info = hub.client_info(&c.id).await.unwrap();
        assert_eq!(info.projects, vec!["p".to_string()]);
        assert_eq!(info.user_id.as_deref(), Some("u1"));
        assert_eq!(hub.stats().await.projects, 1);
    }

    #[tokio::test]
    async fn test_project_isolation_and_channels() {
        let hub = hub();
        let mut p = hub.connect(None).await.unwrap();
        let mut q = hub.connect(None).await.unwrap();
        let mut ch = hub.connect(None).await.unwrap();
        subscribe(&hub, &mut p, SubscriptionRequest::project("P")).await;
        subscribe(&hub, &mut q, SubscriptionRequest::project("Q")).await;
        subscribe(&hub, &mut ch, SubscriptionRequest::channel("analysis")).await;

        let msg = Message::new(MessageType::ProgressUpdate, serde_json::json!({})).with_project("Q");
        assert_eq!(hub.broadcast_scoped("Q", "analysis", &msg).await, 2);

        assert!(drain(&mut p).is_empty());
        assert_eq!(drain(&mut q).len(), 1);
        assert_eq!(drain(&mut ch).len(), 1);
    }

    #[tokio::test]
    async fn test_scoped_dedupes() {
        let hub = hub();
        let mut c = hub.connect(None).await.unwrap();
        subscribe(&hub, &mut c, SubscriptionRequest::project("P")).await;
        subscribe(&hub, &mut c, SubscriptionRequest::channel("analysis")).await;

        let msg = Message::new(MessageType::ProgressUpdate, serde_json::json!({}));
        assert_eq!(hub.broadcast_scoped("P", "analysis", &msg).await, 1);
        assert_eq!(drain(&mut c).len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_cleanup() {
        let hub = hub();
        let mut c = hub.connect(None).await.unwrap();
        subscribe(&hub, &mut c, SubscriptionRequest::project("P")).await;

        let text = Message::unsubscribe(&SubscriptionRequest::project("P"))
            .to_json()
            .unwrap();
        hub.handle_incoming(&c.id, &text).await;
        let replies = drain(&mut c);
        assert_eq!(replies[0].msg_type, MessageType::Unsubscribe);

        let msg = Message::new(MessageType::ProgressUpdate, serde_json::json!({}));
        assert_eq!(hub.broadcast_to_project("P", &msg).await, 0);
        assert_eq!(hub.cleanup_indices().await, 1);
        assert_eq!(hub.stats().await.projects, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_and_unknown() {
        let hub = hub();
        let mut c = hub.connect(None).await.unwrap();

        hub.handle_incoming(&c.id, &Message::heartbeat().to_json().unwrap())
            .await;
        hub.handle_incoming(&c.id, r#"{"type":"teleport","data":{}}"#)
            .await;
        hub.handle_incoming(&c.id, "garbage").await;

        let replies = drain(&mut c);
        assert_eq!(replies.len(), 3);
        assert!(replies.iter().all(|m| m.msg_type == MessageType::Heartbeat));
        assert_eq!(replies[0].data["status"], "pong");
        assert_eq!(replies[1].error(), Some("Unknown message type"));
        assert!(replies[2].error().unwrap().starts_with("Invalid message"));
    }

    #[tokio::test]
    async fn test_failed_send_disconnects() {
        let hub = hub();
        let c = hub.connect(None).await.unwrap();
        let id = c.id.clone();
        drop(c);

        let msg = Message::new(MessageType::SecurityAlert, serde_json::json!({}));
        assert_eq!(hub.broadcast_all(&msg).await, 0);
        assert!(hub.client_info(&id).await.is_none());
        assert_eq!(hub.stats().await.send_failures, 1);
    }

    #[tokio::test]
    async fn test_oversized_broadcast_dropped() {
        let hub = BroadcastServer::new(BroadcastConfig::default().with_max_payload(64));
        let mut c = hub.connect(None).await.unwrap();
        let msg = Message::new(
            MessageType::ProgressUpdate,
            serde_json::json!({ "blob": "x".repeat(200) }),
        );
        assert_eq!(hub.broadcast_all(&msg).await, 0);
        assert!(drain(&mut c).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_connections_swept() {
        let hub = BroadcastServer::new(
            BroadcastConfig::default().with_heartbeat_timeout(Duration::from_secs(60)),
        );
        let mut idle = hub.connect(None).await.unwrap();
        let mut live = hub.connect(None).await.unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        hub.handle_incoming(&live.id, &Message::heartbeat().to_json().unwrap())
            .await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let closed = hub.sweep_stale(Instant::now()).await;
        assert_eq!(closed, vec![idle.id.clone()]);
        assert_eq!(hub.client_count().await, 1);
        assert!(matches!(
            idle.receiver.try_recv(),
            Ok(Outbound::Close {
                code: CLOSE_HEARTBEAT_TIMEOUT,
                ..
            })
        ));
        assert_eq!(drain(&mut live).len(), 1);
    }
}
