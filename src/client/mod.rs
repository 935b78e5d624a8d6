//! Real-time channel client.
//!
//! [`ClientConnector`] keeps one logical connection to the server's `/ws`
//! endpoint. Subscriptions are recorded locally and replayed after every
//! (re)connect, since the server forgets them when a connection drops.
//!
//! # Reconnection
//!
//! ```text
//!   delay(attempt) = base_interval * 1.5^(attempt - 1)
//!
//!   attempt:   1      2      3      4      5      6
//!   delay:     1.0s   1.5s   2.25s  3.4s   5.1s   MaxAttemptsReached
//! ```
//!
//! A successful connect resets the attempt counter. Dead peers are detected
//! through the transport's close/error signal only; missed pongs are not
//! tracked.
//!
//! # Usage
//!
//! ```rust,ignore
//! use codeguard::client::{ClientConfig, ClientConnector, ClientEvent};
//!
//! let client = ClientConnector::new(ClientConfig::new("ws://127.0.0.1:8080/ws"));
//! let mut events = client.events();
//! client.connect()?;
//! client.subscribe_project("proj-1");
//!
//! while let Ok(event) = events.recv().await {
//!     if let ClientEvent::Completed(msg) = event {
//!         println!("score: {}", msg.data["score"]);
//!     }
//! }
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::{GuardError, Result};
use crate::protocol::{Message, MessageType, SubscriptionRequest, SubscriptionStatus};

/// Client settings
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Server endpoint (`ws://` or `wss://`)
    pub url: String,
    /// User id sent at handshake
    pub user_id: Option<String>,
    /// First reconnect delay
    pub base_interval: Duration,
    /// Reconnect attempts before giving up
    pub max_attempts: u32,
    /// Heartbeat period
    pub heartbeat_interval: Duration,
}

impl ClientConfig {
    /// Defaults for `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_id: None,
            base_interval: Duration::from_millis(1000),
            max_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    /// Set user id
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set first reconnect delay
    pub fn with_base_interval(mut self, interval: Duration) -> Self {
        self.base_interval = interval;
        self
    }

    /// Set reconnect attempt limit
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set heartbeat period
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    fn endpoint(&self) -> String {
        match &self.user_id {
            Some(user) => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{sep}userId={}", self.url, urlencoding::encode(user))
            },
            None => self.url.clone(),
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based)
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1).min(30)).unwrap_or(30);
    base.mul_f64(1.5_f64.powi(exponent))
}

/// Notifications emitted by the connector
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection established (subscriptions replayed)
    Connected,
    /// Connection lost
    Disconnected {
        /// Why
        reason: String,
    },
    /// Waiting before the next attempt
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
        /// Wait before the attempt
        delay: Duration,
    },
    /// Gave up reconnecting
    MaxAttemptsReached {
        /// Attempts made
        attempts: u32,
    },
    /// `progress_update`
    Progress(Message),
    /// `analysis_complete`
    Completed(Message),
    /// `analysis_failed`
    Failed(Message),
    /// `security_alert`
    SecurityAlert(Message),
    /// Subscribe/unsubscribe acknowledged
    SubscriptionAck {
        /// What was (un)subscribed
        request: SubscriptionRequest,
        /// Outcome
        status: SubscriptionStatus,
    },
    /// Heartbeat reply
    Heartbeat,
    /// Error reported by the server
    ServerError(String),
}

#[derive(Debug, Default)]
struct Subscriptions {
    projects: BTreeSet<String>,
    channels: BTreeSet<String>,
}

#[derive(Debug)]
struct Inner {
    config: ClientConfig,
    subscriptions: Mutex<Subscriptions>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connected: AtomicBool,
    events: broadcast::Sender<ClientEvent>,
}

impl Inner {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn send(&self, message: Message) -> bool {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| tx.send(message).is_ok())
    }

    /// Install a fresh outbound queue and replay every recorded subscription
    /// onto it. Holding the subscription lock keeps a concurrent subscribe
    /// from landing between the snapshot and the swap.
    fn attach(&self, tx: mpsc::UnboundedSender<Message>) {
        let subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let requests = subs
            .projects
            .iter()
            .map(SubscriptionRequest::project)
            .chain(subs.channels.iter().map(SubscriptionRequest::channel));
        for request in requests {
            let _ = tx.send(Message::subscribe(&request));
        }
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    /// Record a subscription change and forward it on the live connection
    fn update_subscriptions(
        &self,
        change: impl FnOnce(&mut Subscriptions),
        message: Message,
    ) {
        let mut subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        change(&mut subs);
        self.send(message);
    }
}

/// Auto-reconnecting real-time client
#[derive(Debug)]
pub struct ClientConnector {
    inner: Arc<Inner>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientConnector {
    /// Create a connector. Nothing happens until [`connect`](Self::connect).
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                subscriptions: Mutex::new(Subscriptions::default()),
                outbound: Mutex::new(None),
                connected: AtomicBool::new(false),
                events,
            }),
            stop,
            task: Mutex::new(None),
        }
    }

    /// Subscribe to connector events
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Start the connection loop. Must be called within a tokio runtime.
    pub fn connect(&self) -> Result<()> {
        let url = &self.inner.config.url;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(GuardError::Connection(format!(
                "Unsupported endpoint {url}: expected ws:// or wss://"
            )));
        }
        if self.inner.config.heartbeat_interval.is_zero() {
            return Err(GuardError::Config(
                "Heartbeat interval must be non-zero".to_string(),
            ));
        }

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        self.stop.send_replace(false);
        let inner = Arc::clone(&self.inner);
        let stop = self.stop.subscribe();
        *task = Some(tokio::spawn(run(inner, stop)));
        Ok(())
    }

    /// Stop the connection loop and close the socket
    pub fn disconnect(&self) {
        self.stop.send_replace(true);
    }

    /// Is a connection currently open
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Subscribe to a project's analysis traffic
    pub fn subscribe_project(&self, project_id: &str) {
        self.inner.update_subscriptions(
            |subs| {
                subs.projects.insert(project_id.to_string());
            },
            Message::subscribe(&SubscriptionRequest::project(project_id)),
        );
    }

    /// Drop a project subscription
    pub fn unsubscribe_project(&self, project_id: &str) {
        self.inner.update_subscriptions(
            |subs| {
                subs.projects.remove(project_id);
            },
            Message::unsubscribe(&SubscriptionRequest::project(project_id)),
        );
    }

    /// Subscribe to a channel
    pub fn subscribe_channel(&self, channel: &str) {
        self.inner.update_subscriptions(
            |subs| {
                subs.channels.insert(channel.to_string());
            },
            Message::subscribe(&SubscriptionRequest::channel(channel)),
        );
    }

    /// Drop a channel subscription
    pub fn unsubscribe_channel(&self, channel: &str) {
        self.inner.update_subscriptions(
            |subs| {
                subs.channels.remove(channel);
            },
            Message::unsubscribe(&SubscriptionRequest::channel(channel)),
        );
    }

    /// Locally recorded subscriptions (projects, channels)
    pub fn subscriptions(&self) -> (Vec<String>, Vec<String>) {
        let subs = self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        (
            subs.projects.iter().cloned().collect(),
            subs.channels.iter().cloned().collect(),
        )
    }

    /// Send a raw message on the current connection
    pub fn send(&self, message: Message) -> Result<()> {
        if self.inner.send(message) {
            Ok(())
        } else {
            Err(GuardError::Connection("Not connected".to_string()))
        }
    }
}

impl Drop for ClientConnector {
    fn drop(&mut self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

async fn run(inner: Arc<Inner>, mut stop: watch::Receiver<bool>) {
    let endpoint = inner.config.endpoint();
    let mut attempt: u32 = 0;

    loop {
        if *stop.borrow() {
            break;
        }

        match tokio_tungstenite::connect_async(endpoint.as_str()).await {
            Ok((stream, _)) => {
                attempt = 0;
                let reason = session(&inner, stream, &mut stop).await;
                inner.connected.store(false, Ordering::SeqCst);
                *inner.outbound.lock().unwrap_or_else(PoisonError::into_inner) = None;
                tracing::info!(%reason, "Real-time connection closed");
                inner.emit(ClientEvent::Disconnected { reason });
            },
            Err(e) => {
                tracing::debug!(error = %e, url = %inner.config.url, "Connection attempt failed");
            },
        }

        if *stop.borrow() {
            break;
        }

        attempt += 1;
        if attempt > inner.config.max_attempts {
            tracing::warn!(attempts = attempt - 1, "Giving up reconnecting");
            inner.emit(ClientEvent::MaxAttemptsReached {
                attempts: attempt - 1,
            });
            break;
        }

        let delay = backoff_delay(inner.config.base_interval, attempt);
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
        inner.emit(ClientEvent::Reconnecting { attempt, delay });

        tokio::select! {
            () = tokio::time::sleep(delay) => {},
            _ = stop.changed() => break,
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Drive one open connection until it closes. Returns the close reason.
async fn session(inner: &Inner, stream: WsStream, stop: &mut watch::Receiver<bool>) -> String {
    let (mut sink, mut source) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    inner.attach(tx);
    inner.connected.store(true, Ordering::SeqCst);
    inner.emit(ClientEvent::Connected);

    let period = inner.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let Some(message) = outgoing else {
                    return "Outbound queue closed".to_string();
                };
                let text = match message.to_json() {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping unserializable message");
                        continue;
                    },
                };
                if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                    return e.to_string();
                }
            },
            incoming = source.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => dispatch(inner, text.as_str()),
                Some(Ok(WsMessage::Close(frame))) => {
                    return frame.map_or_else(
                        || "Closed by server".to_string(),
                        |f| format!("Closed by server ({}): {}", u16::from(f.code), f.reason),
                    );
                },
                Some(Ok(_)) => {},
                Some(Err(e)) => return e.to_string(),
                None => return "Connection reset".to_string(),
            },
            _ = heartbeat.tick() => {
                let text = match Message::heartbeat().to_json() {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                    return e.to_string();
                }
            },
            _ = stop.changed() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return "Disconnected by client".to_string();
            },
        }
    }
}

fn dispatch(inner: &Inner, text: &str) {
    let message = match Message::parse(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring unparseable frame");
            return;
        },
    };

    let event = match message.msg_type {
        MessageType::ProgressUpdate => ClientEvent::Progress(message),
        MessageType::AnalysisComplete => ClientEvent::Completed(message),
        MessageType::AnalysisFailed => ClientEvent::Failed(message),
        MessageType::SecurityAlert => ClientEvent::SecurityAlert(message),
        MessageType::Subscribe | MessageType::Unsubscribe => {
            let request = serde_json::from_value::<SubscriptionRequest>(message.data.clone())
                .unwrap_or_default();
            match message.subscription_status() {
                Some(status) => ClientEvent::SubscriptionAck { request, status },
                None => return,
            }
        },
        MessageType::Heartbeat => match message.error() {
            Some(error) => ClientEvent::ServerError(error.to_string()),
            None => ClientEvent::Heartbeat,
        },
        MessageType::Unknown => {
            tracing::debug!("Ignoring unknown message type");
            return;
        },
    };
    inner.emit(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth() {
        let base = Duration::from_millis(1000);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(1500));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(2250));
        assert!(backoff_delay(base, 5) > backoff_delay(base, 4));
        // Large attempt counts do not overflow
        assert!(backoff_delay(base, u32::MAX) > Duration::ZERO);
    }

    #[test]
    fn test_endpoint_carries_user() {
        let config = ClientConfig::new("ws://localhost:8080/ws").with_user("alice");
        assert_eq!(config.endpoint(), "ws://localhost:8080/ws?userId=alice");

        let config = ClientConfig::new("ws://h/ws?x=1").with_user("bob");
        assert_eq!(config.endpoint(), "ws://h/ws?x=1&userId=bob");

        let config = ClientConfig::new("ws://h/ws").with_user("a&b #c");
        assert_eq!(config.endpoint(), "ws://h/ws?userId=a%26b%20%23c");
    }

    #[test]
    fn test_rejects_zero_heartbeat() {
        let client = ClientConnector::new(
            ClientConfig::new("ws://localhost:1/ws").with_heartbeat_interval(Duration::ZERO),
        );
        let err = tokio_test::assert_err!(client.connect());
        assert!(matches!(err, GuardError::Config(_)));
    }

    #[test]
    fn test_rejects_non_ws_url() {
        let client = ClientConnector::new(ClientConfig::new("http://localhost"));
        let err = tokio_test::assert_err!(client.connect());
        assert!(matches!(err, GuardError::Connection(_)));
    }

    #[test]
    fn test_subscriptions_recorded_offline() {
        let client = ClientConnector::new(ClientConfig::new("ws://localhost:1/ws"));
        client.subscribe_project("p1");
        client.subscribe_channel("security");
        client.subscribe_project("p2");
        client.unsubscribe_project("p1");

        let (projects, channels) = client.subscriptions();
        assert_eq!(projects, vec!["p2".to_string()]);
        assert_eq!(channels, vec!["security".to_string()]);
        assert!(client.send(Message::heartbeat()).is_err());
    }

    #[test]
    fn test_attach_replays_then_forwards() {
        let client = ClientConnector::new(ClientConfig::new("ws://localhost:1/ws"));
        client.subscribe_project("p1");
        client.subscribe_channel("security");

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.inner.attach(tx);
        client.subscribe_project("p2");

        let mut sent = Vec::new();
        while let Ok(message) = rx.try_recv() {
            assert_eq!(message.msg_type, MessageType::Subscribe);
            sent.push(message.data);
        }
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0]["projectId"], "p1");
        assert_eq!(sent[1]["channel"], "security");
        assert_eq!(sent[2]["projectId"], "p2");
        assert!(client.send(Message::heartbeat()).is_ok());
    }

    #[test]
    fn test_dispatch_maps_types() {
        let client = ClientConnector::new(ClientConfig::new("ws://localhost:1/ws"));
        let mut events = client.events();

        let ack = Message::subscription_ack(
            MessageType::Subscribe,
            &SubscriptionRequest::project("p"),
            SubscriptionStatus::Subscribed,
        );
        dispatch(&client.inner, &ack.to_json().unwrap());
        dispatch(
            &client.inner,
            &Message::unknown_type_error().to_json().unwrap(),
        );
        dispatch(&client.inner, "not json");

        match events.try_recv().unwrap() {
            ClientEvent::SubscriptionAck { request, status } => {
                assert_eq!(request.project_id.as_deref(), Some("p"));
                assert_eq!(status, SubscriptionStatus::Subscribed);
            },
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::ServerError(_)
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        // Port 9 on localhost is almost never listening
        let client = ClientConnector::new(
            ClientConfig::new("ws://127.0.0.1:9/ws")
                .with_base_interval(Duration::from_millis(5))
                .with_max_attempts(2),
        );
        let mut events = client.events();
        client.connect().unwrap();

        let mut attempts = Vec::new();
        let outcome = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(ClientEvent::Reconnecting { attempt, .. }) => attempts.push(attempt),
                    Ok(ClientEvent::MaxAttemptsReached { attempts }) => return attempts,
                    Ok(_) => {},
                    Err(_) => return 0,
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(attempts, vec![1, 2]);
        assert_eq!(outcome, 2);
        assert!(!client.is_connected());
    }
}
