//! Real-time channel wire protocol.
//!
//! Every frame on the real-time channel is one JSON [`Message`] envelope:
//!
//! ```text
//! {"type":"progress_update","data":{...},"timestamp":1700000000000,
//!  "projectId":"proj-1","sessionId":"..."}
//! ```
//!
//! ## Message Types
//!
//! | Type                | Direction      | Purpose                               |
//! |---------------------|----------------|---------------------------------------|
//! | `progress_update`   | Server→Client  | Periodic progress or stage milestone  |
//! | `analysis_complete` | Server→Client  | Terminal success with result          |
//! | `analysis_failed`   | Server→Client  | Terminal failure with reason          |
//! | `security_alert`    | Server→Client  | Security notification                 |
//! | `subscribe`         | Bidirectional  | Subscribe request / acknowledgement   |
//! | `unsubscribe`       | Bidirectional  | Unsubscribe request / acknowledgement |
//! | `heartbeat`         | Bidirectional  | Keep-alive and pong                   |
//!
//! Any other `type` value parses as [`MessageType::Unknown`].

mod message;

pub use message::{Message, MessageType, SubscriptionRequest, SubscriptionStatus};

/// Channel carrying analysis lifecycle traffic
pub const ANALYSIS_CHANNEL: &str = "analysis";

/// Channel carrying security notifications
pub const SECURITY_CHANNEL: &str = "security";
