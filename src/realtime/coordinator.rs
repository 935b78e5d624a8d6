//! Session coordinator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::events::AnalysisEvent;
use super::RealtimeConfig;
use crate::analysis::{AnalysisRequest, AnalysisResult, Discipline};
use crate::error::{GuardError, Result};
use crate::protocol::{Message, MessageType, ANALYSIS_CHANNEL, SECURITY_CHANNEL};
use crate::scheduler::Scheduler;
use crate::security::{SecurityIntegration, SecurityNotification, ThreatLevel};
use crate::server::BroadcastServer;

/// Reason shown to requesters whose analysis was blocked
const BLOCKED_REASON: &str = "Analysis request was rejected";

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Started, no progress yet
    Queued,
    /// Running
    InProgress,
    /// Finished
    Completed,
    /// Failed
    Failed,
}

/// Snapshot of one active session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSession {
    /// Session id
    pub session_id: String,
    /// Project under analysis
    pub project_id: String,
    /// Requested disciplines
    pub analysis_types: Vec<Discipline>,
    /// Start time
    pub start_time: DateTime<Utc>,
    /// Current stage name
    pub current_stage: String,
    /// Percent complete, never decreasing
    pub progress: f64,
    /// Seconds remaining
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u64>,
    /// Status
    pub status: SessionStatus,
}

#[derive(Debug)]
struct SessionState {
    view: AnalysisSession,
    started: Instant,
    estimated_total: Duration,
}

impl SessionState {
    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn advance(&mut self, progress: f64) {
        let progress = progress.clamp(0.0, 100.0);
        if progress > self.view.progress {
            self.view.progress = progress;
        }
        self.view.status = SessionStatus::InProgress;
        self.view.estimated_time_remaining = Some(self.eta().as_secs());
    }

    fn eta(&self) -> Duration {
        let elapsed = self.elapsed();
        let progress = self.view.progress;
        if progress > 0.0 {
            let remaining = elapsed.as_secs_f64() * (100.0 - progress) / progress;
            Duration::try_from_secs_f64(remaining).unwrap_or(Duration::MAX)
        } else {
            self.estimated_total.saturating_sub(elapsed)
        }
    }
}

type Sessions = Arc<Mutex<HashMap<String, SessionState>>>;

/// Turns analysis lifecycle events into real-time broadcasts
#[derive(Debug)]
pub struct SessionCoordinator {
    config: RealtimeConfig,
    hub: Arc<BroadcastServer>,
    security: Arc<SecurityIntegration>,
    scheduler: Arc<Scheduler>,
    sessions: Sessions,
    relay: StdMutex<Option<JoinHandle<()>>>,
}

impl SessionCoordinator {
    /// Create a coordinator
    pub fn new(
        config: RealtimeConfig,
        hub: Arc<BroadcastServer>,
        security: Arc<SecurityIntegration>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            config,
            hub,
            security,
            scheduler,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            relay: StdMutex::new(None),
        }
    }

    /// Start relaying security notifications onto the security channel
    pub fn start(&self) {
        let mut rx = self.security.subscribe();
        let hub = Arc::clone(&self.hub);

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(note) => relay_security(&hub, &note).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Security relay lagged");
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self
            .relay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            previous.abort();
        }
    }

    /// Dispatch one lifecycle event
    pub async fn handle_event(&self, event: AnalysisEvent) -> Result<()> {
        tracing::debug!(session_id = event.session_id(), event = event.name(), "Analysis event");
        match event {
            AnalysisEvent::Started {
                session_id,
                request,
            } => self.start_session(&session_id, &request).await,
            AnalysisEvent::Progress {
                session_id,
                progress,
            } => {
                self.update_progress(&session_id, progress).await;
                Ok(())
            },
            AnalysisEvent::StageChanged {
                session_id,
                stage,
                progress,
            } => {
                self.change_stage(&session_id, &stage, progress).await;
                Ok(())
            },
            AnalysisEvent::Completed {
                session_id,
                results,
            } => {
                self.complete_session(&session_id, results).await;
                Ok(())
            },
            AnalysisEvent::Failed { session_id, error } => {
                self.fail_session(&session_id, &error).await;
                Ok(())
            },
        }
    }

    /// Begin tracking a session and broadcast its initial state
    pub async fn start_session(&self, session_id: &str, request: &AnalysisRequest) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(session_id) {
            return Err(GuardError::Validation(format!(
                "Session {session_id} is already active"
            )));
        }

        let estimated_total = self.config.estimate(&request.analysis_types);
        let state = SessionState {
            view: AnalysisSession {
                session_id: session_id.to_string(),
                project_id: request.project_id.clone(),
                analysis_types: request.analysis_types.clone(),
                start_time: Utc::now(),
                current_stage: "Queued".to_string(),
                progress: 0.0,
                estimated_time_remaining: Some(estimated_total.as_secs()),
                status: SessionStatus::Queued,
            },
            started: Instant::now(),
            estimated_total,
        };

        self.hub
            .broadcast_scoped(
                &state.view.project_id,
                ANALYSIS_CHANNEL,
                &progress_message(&state.view, false),
            )
            .await;
        sessions.insert(session_id.to_string(), state);
        drop(sessions);

        let timer_sessions = Arc::clone(&self.sessions);
        let hub = Arc::clone(&self.hub);
        let id = session_id.to_string();
        self.scheduler.spawn_periodic(
            timer_name(session_id),
            self.config.progress_interval,
            move || {
                let sessions = Arc::clone(&timer_sessions);
                let hub = Arc::clone(&hub);
                let id = id.clone();
                async move {
                    let mut sessions = sessions.lock().await;
                    if let Some(state) = sessions.get_mut(&id) {
                        if state.view.status == SessionStatus::InProgress {
                            state.view.estimated_time_remaining = Some(state.eta().as_secs());
                        }
                        hub.broadcast_scoped(
                            &state.view.project_id,
                            ANALYSIS_CHANNEL,
                            &progress_message(&state.view, false),
                        )
                        .await;
                    }
                }
            },
        );

        tracing::info!(
            session_id,
            project_id = %request.project_id,
            estimated_secs = estimated_total.as_secs(),
            "Analysis session started"
        );
        Ok(())
    }

    /// Record progress. The next timer tick broadcasts it.
    pub async fn update_progress(&self, session_id: &str, progress: f64) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(session_id) {
            Some(state) => {
                state.advance(progress);
                true
            },
            None => {
                tracing::debug!(session_id, "Progress for unknown session");
                false
            },
        }
    }

    /// Record a stage change and broadcast it immediately
    pub async fn change_stage(&self, session_id: &str, stage: &str, progress: f64) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(state) = sessions.get_mut(session_id) else {
            tracing::debug!(session_id, "Stage change for unknown session");
            return false;
        };

        state.view.current_stage = stage.to_string();
        state.advance(progress);
        tracing::info!(session_id, stage, progress = state.view.progress, "Stage changed");

        self.hub
            .broadcast_scoped(
                &state.view.project_id,
                ANALYSIS_CHANNEL,
                &progress_message(&state.view, true),
            )
            .await;
        true
    }

    /// Validate the results, broadcast completion once and drop the session
    pub async fn complete_session(&self, session_id: &str, results: Vec<AnalysisResult>) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(mut state) = sessions.remove(session_id) else {
            tracing::debug!(session_id, "Completion for unknown session");
            return false;
        };
        self.scheduler.cancel(&timer_name(session_id));

        let results: Vec<AnalysisResult> = results
            .into_iter()
            .map(|r| self.screen_result(r))
            .collect();
        let score = if results.is_empty() {
            0.0
        } else {
            results.iter().map(|r| r.score).sum::<f64>() / results.len() as f64
        };

        state.view.status = SessionStatus::Completed;
        state.view.progress = 100.0;
        let elapsed = state.elapsed();

        let message = Message::new(
            MessageType::AnalysisComplete,
            json!({
                "status": state.view.status,
                "score": score,
                "results": results,
                "elapsedMs": elapsed.as_millis() as u64,
            }),
        )
        .with_project(&state.view.project_id)
        .with_session(session_id);

        self.hub
            .broadcast_scoped(&state.view.project_id, ANALYSIS_CHANNEL, &message)
            .await;
        tracing::info!(session_id, score, elapsed_ms = elapsed.as_millis() as u64, "Analysis completed");
        true
    }

    /// Broadcast failure once and drop the session
    pub async fn fail_session(&self, session_id: &str, error: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(mut state) = sessions.remove(session_id) else {
            tracing::debug!(session_id, "Failure for unknown session");
            return false;
        };
        self.scheduler.cancel(&timer_name(session_id));

        state.view.status = SessionStatus::Failed;
        let elapsed = state.elapsed();
        let message = Message::new(
            MessageType::AnalysisFailed,
            json!({
                "status": state.view.status,
                "error": error,
                "stage": state.view.current_stage,
                "elapsedMs": elapsed.as_millis() as u64,
            }),
        )
        .with_project(&state.view.project_id)
        .with_session(session_id);

        self.hub
            .broadcast_scoped(&state.view.project_id, ANALYSIS_CHANNEL, &message)
            .await;
        tracing::warn!(session_id, error, "Analysis failed");
        true
    }

    /// Tell a project's subscribers that its request was rejected. The
    /// detailed reason stays on the operator dashboard.
    pub async fn notify_blocked(&self, project_id: &str) -> usize {
        let message = Message::new(
            MessageType::AnalysisFailed,
            json!({
                "status": SessionStatus::Failed,
                "error": BLOCKED_REASON,
            }),
        )
        .with_project(project_id);

        self.hub.broadcast_to_project(project_id, &message).await
    }

    /// Re-broadcast a session's current state now
    pub async fn force_update(&self, session_id: &str) -> bool {
        let sessions = self.sessions.lock().await;
        let Some(state) = sessions.get(session_id) else {
            return false;
        };
        self.hub
            .broadcast_scoped(
                &state.view.project_id,
                ANALYSIS_CHANNEL,
                &progress_message(&state.view, false),
            )
            .await;
        true
    }

    /// Number of active sessions
    pub async fn active_session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Number of open real-time connections
    pub async fn connected_client_count(&self) -> usize {
        self.hub.client_count().await
    }

    /// Snapshot of one session
    pub async fn session_snapshot(&self, session_id: &str) -> Option<AnalysisSession> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|s| s.view.clone())
    }

    /// Snapshots of every active session, oldest first
    pub async fn sessions(&self) -> Vec<AnalysisSession> {
        let mut views: Vec<AnalysisSession> = self
            .sessions
            .lock()
            .await
            .values()
            .map(|s| s.view.clone())
            .collect();
        views.sort_by_key(|v| v.start_time);
        views
    }

    /// Stop every session timer and the security relay
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.lock().await;
        for id in sessions.keys() {
            self.scheduler.cancel(&timer_name(id));
        }
        sessions.clear();

        if let Some(relay) = self
            .relay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            relay.abort();
        }
    }

    fn screen_result(&self, result: AnalysisResult) -> AnalysisResult {
        let discipline = result.discipline();
        match self.security.validate_result(&result, discipline, None) {
            Ok(validation) if validation.is_valid => result,
            Ok(validation) => match validation.sanitized_result {
                Some(clean) => clean,
                None => {
                    tracing::warn!(
                        project_id = %result.project_id,
                        issues = validation.issues.len(),
                        "Surfacing unsanitized flagged result"
                    );
                    result
                },
            },
            Err(e) => {
                tracing::warn!(error = %e, "Result failed shape validation");
                result
            },
        }
    }
}

fn timer_name(session_id: &str) -> String {
    format!("session:{session_id}")
}

fn progress_message(view: &AnalysisSession, milestone: bool) -> Message {
    Message::new(
        MessageType::ProgressUpdate,
        json!({
            "sessionId": view.session_id,
            "status": view.status,
            "stage": view.current_stage,
            "progress": view.progress,
            "estimatedTimeRemaining": view.estimated_time_remaining,
            "analysisTypes": view.analysis_types,
            "milestone": milestone,
        }),
    )
    .with_project(&view.project_id)
    .with_session(&view.session_id)
}

/// Threat details, actions and layers stay on the dashboard. Clients only
/// learn that something happened.
async fn relay_security(hub: &BroadcastServer, note: &SecurityNotification) {
    let severity = note.severity();
    let mut message = Message::new(
        MessageType::SecurityAlert,
        json!({
            "kind": note.kind(),
            "severity": severity,
            "timestamp": note.timestamp(),
        }),
    );
    if let SecurityNotification::Alert { event } = note {
        if let Some(project) = &event.project_id {
            message = message.with_project(project);
        }
    }

    if severity == ThreatLevel::Critical {
        hub.broadcast_all(&message).await;
    } else {
        hub.broadcast_to_channel(SECURITY_CHANNEL, &message).await;
    }
}
