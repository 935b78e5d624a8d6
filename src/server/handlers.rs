//! HTTP and WebSocket request handlers.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Json, Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Duration, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::hub::Outbound;
use super::state::AppState;
use crate::analysis::{AnalysisRequest, Discipline};
use crate::error::GuardError;
use crate::realtime::AnalysisEvent;

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        // Health and status
        .route("/health", get(health_check))
        .route("/status", get(status))
        // Analysis pipeline
        .route("/analysis/validate", post(validate_request))
        .route("/analysis/events", post(analysis_event))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/refresh", post(refresh_session))
        // Operator surface
        .route("/security/dashboard", get(dashboard))
        .route("/security/report", get(report))
        .route("/security/audit", get(audit))
        .route(
            "/security/shutdown",
            post(force_shutdown).delete(lift_shutdown),
        )
        .route(
            "/security/quarantine/:layer/:project/release",
            post(release_quarantine),
        )
        // Real-time channel
        .route("/ws", get(ws_upgrade))
        .layer(DefaultBodyLimit::max(state.config.max_body_size));

    if state.config.cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }
    if state.config.logging {
        router = router.layer(TraceLayer::new_for_http());
    }

    router.with_state(state)
}

fn error_response(err: &GuardError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        GuardError::Validation(_)
        | GuardError::Configuration(_)
        | GuardError::Protocol(_)
        | GuardError::Json(_) => StatusCode::BAD_REQUEST,
        GuardError::Capacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.to_string()})))
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    /// Always `ok`
    pub status: &'static str,
    /// Crate version
    pub version: &'static str,
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let emergency = state.security.is_emergency_active();
    Json(json!({
        "status": if emergency { "emergency" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.uptime().as_secs(),
        "activeSessions": state.coordinator.active_session_count().await,
        "hub": state.hub.stats().await,
        "criticalThreatCount": state.security.critical_threat_count(),
        "backgroundTasks": state.scheduler.task_names(),
    }))
}

/// Validate an analysis request. Blocked requests answer 403 and the
/// project's subscribers get a generic failure notice.
async fn validate_request(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnalysisRequest>,
) -> impl IntoResponse {
    match state.security.validate_analysis_request(&request) {
        Ok(decision) if decision.is_allowed => {
            (StatusCode::OK, Json(json!(decision)))
        },
        Ok(decision) => {
            state.coordinator.notify_blocked(&request.project_id).await;
            (StatusCode::FORBIDDEN, Json(json!(decision)))
        },
        Err(e) => error_response(&e),
    }
}

async fn analysis_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<AnalysisEvent>,
) -> impl IntoResponse {
    let session_id = event.session_id().to_string();
    let name = event.name();
    match state.coordinator.handle_event(event).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({"sessionId": session_id, "event": name})),
        ),
        Err(e) => error_response(&e),
    }
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({"sessions": state.coordinator.sessions().await}))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.session_snapshot(&id).await {
        Some(session) => (StatusCode::OK, Json(json!(session))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Session not found"})),
        ),
    }
}

async fn refresh_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.coordinator.force_update(&id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn dashboard(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.security.dashboard())
}

/// Report range. Defaults to the last 24 hours.
#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    /// Range start (RFC 3339)
    pub from: Option<DateTime<Utc>>,
    /// Range end (RFC 3339)
    pub to: Option<DateTime<Utc>>,
}

async fn report(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportQuery>,
) -> impl IntoResponse {
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or(to - Duration::hours(24));
    if from > to {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Report range start is after its end"})),
        );
    }
    (
        StatusCode::OK,
        Json(json!(state.security.generate_report(from, to))),
    )
}

async fn audit(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.security.run_health_check())
}

/// Manual shutdown request
#[derive(Debug, Default, Deserialize)]
pub struct ShutdownRequest {
    /// Reason recorded with the shutdown
    #[serde(default)]
    pub reason: Option<String>,
}

async fn force_shutdown(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ShutdownRequest>>,
) -> impl IntoResponse {
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "Manual shutdown".to_string());
    state.security.force_emergency_shutdown(&reason);
    (
        StatusCode::OK,
        Json(json!({"emergencyShutdown": state.security.emergency_status()})),
    )
}

async fn lift_shutdown(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let lifted = state.security.lift_emergency_shutdown();
    Json(json!({"lifted": lifted}))
}

async fn release_quarantine(
    State(state): State<Arc<AppState>>,
    Path((layer, project)): Path<(String, String)>,
) -> impl IntoResponse {
    let discipline = match Discipline::from_str(&layer) {
        Ok(d) => d,
        Err(e) => return error_response(&e),
    };
    match state.security.release_quarantine(discipline, &project) {
        Ok(released) => (
            StatusCode::OK,
            Json(json!({"layer": discipline.key(), "projectId": project, "released": released})),
        ),
        Err(e) => error_response(&e),
    }
}

/// Real-time handshake parameters
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    /// Connecting user
    pub user_id: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
) -> impl IntoResponse {
    ws.max_message_size(state.config.broadcast.max_payload_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, params.user_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: Option<String>) {
    let (mut sender, mut receiver) = socket.split();

    let mut handle = match state.hub.connect(user_id).await {
        Ok(h) => h,
        Err(e) => {
            let _ = sender
                .send(WsMessage::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        },
    };
    let client_id = handle.id.clone();

    loop {
        tokio::select! {
            outbound = handle.receiver.recv() => match outbound {
                Some(Outbound::Text(text)) => {
                    if sender.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                },
                Some(Outbound::Close { code, reason }) => {
                    let _ = sender
                        .send(WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                },
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    state.hub.handle_incoming(&client_id, text.as_str()).await;
                },
                Some(Ok(WsMessage::Binary(_))) => {
                    tracing::debug!(client_id = %client_id, "Ignoring binary frame");
                },
                Some(Ok(WsMessage::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {},
            },
        }
    }

    state.hub.disconnect(&client_id).await;
}
