//! Security events and notifications.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::ThreatLevel;

/// Capacity of the in-memory event log
pub const MAX_EVENTS: usize = 1000;

/// Kind of security event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    /// A threat was found
    ThreatDetected,
    /// A project was quarantined
    QuarantineApplied,
    /// A request was blocked
    AnalysisBlocked,
    /// Emergency shutdown engaged
    EmergencyShutdown,
    /// A request passed every check
    AnalysisAllowed,
}

/// One security event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    /// Event id
    pub id: String,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Kind
    pub event_type: SecurityEventType,
    /// Severity
    pub severity: ThreatLevel,
    /// Layer key, or `global`
    pub layer_name: String,
    /// Project involved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Threat descriptions
    #[serde(default)]
    pub threat_details: Vec<String>,
    /// What the system did about it
    pub action_taken: String,
}

impl SecurityEvent {
    /// Create an event stamped now
    pub fn new(
        event_type: SecurityEventType,
        severity: ThreatLevel,
        layer_name: impl Into<String>,
        action_taken: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            severity,
            layer_name: layer_name.into(),
            project_id: None,
            threat_details: vec![],
            action_taken: action_taken.into(),
        }
    }

    /// Set project
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Set threat details
    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.threat_details = details;
        self
    }
}

/// Append-only ring buffer of events, oldest dropped first
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<SecurityEvent>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(MAX_EVENTS)
    }
}

impl EventLog {
    /// Log with a custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(MAX_EVENTS)),
            capacity: capacity.max(1),
        }
    }

    /// Append an event
    pub fn push(&mut self, event: SecurityEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Number of events held
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Log is empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Newest `n` events, newest first
    pub fn recent(&self, n: usize) -> Vec<SecurityEvent> {
        self.events.iter().rev().take(n).cloned().collect()
    }

    /// Events with `from <= timestamp <= to`, oldest first
    pub fn range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<SecurityEvent> {
        self.events
            .iter()
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .cloned()
            .collect()
    }

    /// Count events of one type since `since`
    pub fn count_since(&self, event_type: SecurityEventType, since: DateTime<Utc>) -> usize {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type && e.timestamp >= since)
            .count()
    }
}

/// Notifications published by the security integration
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecurityNotification {
    /// A HIGH or CRITICAL event was recorded
    Alert {
        /// The event
        event: SecurityEvent,
    },
    /// Emergency shutdown engaged
    EmergencyShutdown {
        /// Why
        reason: String,
        /// When
        at: DateTime<Utc>,
    },
    /// Emergency shutdown lifted
    ShutdownLifted {
        /// Lifted by an operator rather than by cool-down
        manual: bool,
        /// When
        at: DateTime<Utc>,
    },
}

impl SecurityNotification {
    /// Severity used for routing on the real-time channel
    pub fn severity(&self) -> ThreatLevel {
        match self {
            Self::Alert { event } => event.severity,
            Self::EmergencyShutdown { .. } => ThreatLevel::Critical,
            Self::ShutdownLifted { .. } => ThreatLevel::Medium,
        }
    }

    /// Wire name of the notification kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Alert { .. } => "alert",
            Self::EmergencyShutdown { .. } => "emergency_shutdown",
            Self::ShutdownLifted { .. } => "shutdown_lifted",
        }
    }

    /// When it happened
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Alert { event } => event.timestamp,
            Self::EmergencyShutdown { at, .. } | Self::ShutdownLifted { at, .. } => *at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: usize) -> SecurityEvent {
        SecurityEvent::new(
            SecurityEventType::ThreatDetected,
            ThreatLevel::Low,
            "global",
            format!("event {n}"),
        )
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let mut log = EventLog::default();
        for i in 0..MAX_EVENTS + 5 {
            log.push(event(i));
        }

        assert_eq!(log.len(), MAX_EVENTS);
        let newest = log.recent(1);
        assert_eq!(newest[0].action_taken, format!("event {}", MAX_EVENTS + 4));
        let oldest = log.range(DateTime::<Utc>::MIN_UTC, Utc::now());
        assert_eq!(oldest[0].action_taken, "event 5");
    }

    #[test]
    fn test_recent_newest_first() {
        let mut log = EventLog::with_capacity(10);
        for i in 0..3 {
            log.push(event(i));
        }
        let recent = log.recent(2);
        assert_eq!(recent[0].action_taken, "event 2");
        assert_eq!(recent[1].action_taken, "event 1");
    }

    #[test]
    fn test_notification_serializes_with_kind() {
        let note = SecurityNotification::ShutdownLifted {
            manual: true,
            at: Utc::now(),
        };
        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(json["kind"], "shutdown_lifted");
        assert_eq!(json["manual"], true);
    }
}
