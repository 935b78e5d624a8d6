//! Message envelope for the real-time channel.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{GuardError, Result};

/// Message types on the real-time channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Progress or stage milestone
    ProgressUpdate,
    /// Analysis finished
    AnalysisComplete,
    /// Analysis failed or was blocked
    AnalysisFailed,
    /// Security notification
    SecurityAlert,
    /// Subscribe request or acknowledgement
    Subscribe,
    /// Unsubscribe request or acknowledgement
    Unsubscribe,
    /// Keep-alive
    Heartbeat,
    /// Any unrecognized type
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ProgressUpdate => "progress_update",
            Self::AnalysisComplete => "analysis_complete",
            Self::AnalysisFailed => "analysis_failed",
            Self::SecurityAlert => "security_alert",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Heartbeat => "heartbeat",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Body of a subscribe/unsubscribe request. Either field may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    /// Project to (un)subscribe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Channel to (un)subscribe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl SubscriptionRequest {
    /// Project subscription
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            channel: None,
        }
    }

    /// Channel subscription
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            project_id: None,
            channel: Some(channel.into()),
        }
    }

    /// Neither field set
    pub fn is_empty(&self) -> bool {
        self.project_id.is_none() && self.channel.is_none()
    }
}

/// Acknowledgement status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Subscription recorded
    Subscribed,
    /// Subscription removed
    Unsubscribed,
}

/// Real-time channel envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message type
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Payload
    #[serde(default)]
    pub data: Value,
    /// Unix millis
    #[serde(default = "current_timestamp")]
    pub timestamp: u64,
    /// Project scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Originating or target user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Analysis session, or the connection id for control traffic
    #[serde(default)]
    pub session_id: String,
}

impl Message {
    /// Create a message stamped now
    pub fn new(msg_type: MessageType, data: Value) -> Self {
        Self {
            msg_type,
            data,
            timestamp: current_timestamp(),
            project_id: None,
            user_id: None,
            session_id: String::new(),
        }
    }

    /// Set project scope
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Set user
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set session id
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Subscribe request
    pub fn subscribe(request: &SubscriptionRequest) -> Self {
        Self::new(MessageType::Subscribe, json!(request))
    }

    /// Unsubscribe request
    pub fn unsubscribe(request: &SubscriptionRequest) -> Self {
        Self::new(MessageType::Unsubscribe, json!(request))
    }

    /// Acknowledge a (un)subscribe. Reuses the request's type.
    pub fn subscription_ack(
        msg_type: MessageType,
        request: &SubscriptionRequest,
        status: SubscriptionStatus,
    ) -> Self {
        let mut data = json!(request);
        data["status"] = json!(status);
        Self::new(msg_type, data)
    }

    /// Client keep-alive
    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat, json!({}))
    }

    /// Server reply to a heartbeat
    pub fn heartbeat_pong() -> Self {
        Self::new(MessageType::Heartbeat, json!({ "status": "pong" }))
    }

    /// Reply to an unrecognized message type. Framed as a heartbeat.
    pub fn unknown_type_error() -> Self {
        Self::new(
            MessageType::Heartbeat,
            json!({ "error": "Unknown message type" }),
        )
    }

    /// Reply to a frame that could not be parsed
    pub fn parse_error(reason: &str) -> Self {
        Self::new(
            MessageType::Heartbeat,
            json!({ "error": format!("Invalid message: {reason}") }),
        )
    }

    /// Parse a text frame
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| GuardError::Protocol(e.to_string()))
    }

    /// Serialize to a text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Subscription body of a subscribe/unsubscribe message
    pub fn subscription(&self) -> Option<SubscriptionRequest> {
        match self.msg_type {
            MessageType::Subscribe | MessageType::Unsubscribe => {
                serde_json::from_value::<SubscriptionRequest>(self.data.clone())
                    .ok()
                    .filter(|r| !r.is_empty())
            },
            _ => None,
        }
    }

    /// Acknowledgement status, if this is an ack
    pub fn subscription_status(&self) -> Option<SubscriptionStatus> {
        self.data
            .get("status")
            .and_then(|s| serde_json::from_value(s.clone()).ok())
    }

    /// Error text carried in `data.error`
    pub fn error(&self) -> Option<&str> {
        self.data.get("error").and_then(Value::as_str)
    }
}

/// Current time in Unix millis
pub(crate) fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let msg = Message::new(MessageType::ProgressUpdate, json!({ "progress": 10 }))
            .with_project("proj-1")
            .with_session("s-1");
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "progress_update");
        assert_eq!(json["projectId"], "proj-1");
        assert_eq!(json["sessionId"], "s-1");
        assert_eq!(json["data"]["progress"], 10);
        assert!(json.get("userId").is_none());
    }

    #[test]
    fn test_unknown_type_parses() {
        let msg = Message::parse(r#"{"type":"launch_missiles","data":{}}"#).unwrap();
        assert_eq!(msg.msg_type, MessageType::Unknown);
        assert_eq!(msg.session_id, "");
        assert!(msg.timestamp > 0);
    }

    #[test]
    fn test_invalid_json_is_protocol_error() {
        assert!(matches!(
            Message::parse("not json"),
            Err(GuardError::Protocol(_))
        ));
    }

    #[test]
    fn test_subscription_body() {
        let msg = Message::subscribe(&SubscriptionRequest::project("p"));
        let parsed = Message::parse(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed.subscription(), Some(SubscriptionRequest::project("p")));

        let empty = Message::new(MessageType::Subscribe, json!({}));
        assert!(empty.subscription().is_none());
        assert!(Message::heartbeat().subscription().is_none());
    }

    #[test]
    fn test_ack_reuses_type() {
        let ack = Message::subscription_ack(
            MessageType::Unsubscribe,
            &SubscriptionRequest::channel("security"),
            SubscriptionStatus::Unsubscribed,
        );
        assert_eq!(ack.msg_type, MessageType::Unsubscribe);
        assert_eq!(ack.data["channel"], "security");
        assert_eq!(
            ack.subscription_status(),
            Some(SubscriptionStatus::Unsubscribed)
        );
    }

    #[test]
    fn test_unknown_reply_is_heartbeat() {
        let reply = Message::unknown_type_error();
        assert_eq!(reply.msg_type, MessageType::Heartbeat);
        assert_eq!(reply.error(), Some("Unknown message type"));
    }
}
