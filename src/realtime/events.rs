//! Lifecycle events consumed from the analysis pipeline.

use serde::{Deserialize, Serialize};

use crate::analysis::{AnalysisRequest, AnalysisResult};

/// One lifecycle event, keyed by session id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalysisEvent {
    /// Analysis accepted and queued
    Started {
        /// Session id
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Request being analyzed
        request: AnalysisRequest,
    },
    /// Progress report (no immediate broadcast)
    Progress {
        /// Session id
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Percent complete
        progress: f64,
    },
    /// Pipeline entered a new stage
    StageChanged {
        /// Session id
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Stage name
        stage: String,
        /// Percent complete
        progress: f64,
    },
    /// Analysis finished
    Completed {
        /// Session id
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Per-discipline results
        results: Vec<AnalysisResult>,
    },
    /// Analysis failed
    Failed {
        /// Session id
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Failure reason
        error: String,
    },
}

impl AnalysisEvent {
    /// Session this event belongs to
    pub fn session_id(&self) -> &str {
        match self {
            Self::Started { session_id, .. }
            | Self::Progress { session_id, .. }
            | Self::StageChanged { session_id, .. }
            | Self::Completed { session_id, .. }
            | Self::Failed { session_id, .. } => session_id,
        }
    }

    /// Event name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Progress { .. } => "progress",
            Self::StageChanged { .. } => "stage_changed",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let json = r#"{"event":"stage_changed","sessionId":"s1","stage":"Parsing","progress":50}"#;
        let event: AnalysisEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.session_id(), "s1");
        assert_eq!(event.name(), "stage_changed");
        assert!(matches!(
            event,
            AnalysisEvent::StageChanged { ref stage, progress, .. } if stage == "Parsing" && progress == 50.0
        ));
    }

    #[test]
    fn test_started_carries_request() {
        let json = r#"{
            "event": "started",
            "sessionId": "s2",
            "request": {
                "projectId": "p",
                "repositoryUrl": "https://github.com/a/b",
                "analysisTypes": ["code_quality"]
            }
        }"#;
        let event: AnalysisEvent = serde_json::from_str(json).unwrap();
        match event {
            AnalysisEvent::Started { request, .. } => {
                assert_eq!(request.project_id, "p");
                assert_eq!(request.analysis_types.len(), 1);
            },
            other => panic!("unexpected event {other:?}"),
        }
    }
}
