//! Global security coordinator.
//!
//! Wraps the [`SecurityOrchestrator`] plus a larger-capacity global engine and
//! adds a system-wide circuit breaker, the security event log and the
//! operator dashboard/report.
//!
//! # Emergency Shutdown
//!
//! ```text
//!                 critical counter >= threshold
//!                 or force_emergency_shutdown()
//!     [Normal] ───────────────────────────────────> [Shutdown]
//!        ^                                              │
//!        │   cool-down elapsed or lift_emergency_shutdown()
//!        └──────────────────────────────────────────────┘
//! ```
//!
//! Every CRITICAL event increments the counter; the decay tick subtracts one
//! per minute regardless of state, so only bursts that outpace the decay
//! trip the breaker.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::engine::ThreatDetectionEngine;
use super::events::{EventLog, SecurityEvent, SecurityEventType, SecurityNotification};
use super::layer::{AnalysisContext, LayerConfig, LayerMetrics, ResultValidation};
use super::orchestrator::{SecurityAudit, SecurityOrchestrator};
use super::types::{ScanResult, SecurityConfig, ThreatLevel};
use crate::analysis::{AnalysisRequest, AnalysisResult, Discipline};
use crate::error::{GuardError, Result};
use crate::scheduler::Scheduler;

/// Layer name used for events raised by the global engine
pub const GLOBAL_LAYER: &str = "global";

/// Integration configuration
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationConfig {
    /// Configuration shared by all discipline layers
    pub layer: LayerConfig,
    /// Global engine configuration
    pub global: SecurityConfig,
    /// CRITICAL events needed to trip the breaker
    pub emergency_shutdown_threshold: u32,
    /// Automatic lift after this long
    pub shutdown_cooldown: Duration,
    /// Health check period
    pub health_check_interval: StdDuration,
    /// Quarantine expiry sweep period
    pub quarantine_sweep_interval: StdDuration,
    /// Critical counter decay period
    pub decay_interval: StdDuration,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            layer: LayerConfig::default(),
            global: SecurityConfig::default().with_max_content_length(100_000),
            emergency_shutdown_threshold: 5,
            shutdown_cooldown: Duration::minutes(30),
            health_check_interval: StdDuration::from_secs(5 * 60),
            quarantine_sweep_interval: StdDuration::from_secs(60 * 60),
            decay_interval: StdDuration::from_secs(60),
        }
    }
}

/// Per-request security context returned for allowed requests
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    /// Global scan over the whole request
    pub global_scan: ScanResult,
    /// Per-discipline contexts
    pub layers: BTreeMap<Discipline, AnalysisContext>,
}

/// Allow/block decision for a request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDecision {
    /// Request may proceed
    pub is_allowed: bool,
    /// Context (allowed requests only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
    /// Why the request was blocked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
}

impl RequestDecision {
    fn allow(context: SecurityContext) -> Self {
        Self {
            is_allowed: true,
            security_context: Some(context),
            block_reason: None,
        }
    }

    fn block(reason: impl Into<String>) -> Self {
        Self {
            is_allowed: false,
            security_context: None,
            block_reason: Some(reason.into()),
        }
    }
}

/// Overall status shown on the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemStatus {
    /// Health >= 80
    Secure,
    /// Health 50..80
    Warning,
    /// Health < 50
    Critical,
    /// Emergency shutdown engaged
    Emergency,
}

/// Active emergency shutdown
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownInfo {
    /// When it engaged
    pub since: DateTime<Utc>,
    /// Why
    pub reason: String,
    /// Engaged by an operator
    pub manual: bool,
    /// Automatic lift time
    pub lifts_at: DateTime<Utc>,
}

/// Operator dashboard snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityDashboard {
    /// Overall status
    pub overall_status: SystemStatus,
    /// Overall health score
    pub overall_health_score: i64,
    /// Active shutdown, if any
    pub emergency_shutdown: Option<ShutdownInfo>,
    /// Rolling CRITICAL counter
    pub critical_threat_count: u32,
    /// Threat-detected events in the last 24h
    pub active_threats: usize,
    /// Last 20 events, newest first
    pub recent_events: Vec<SecurityEvent>,
    /// Current recommendations
    pub recommendations: Vec<String>,
    /// Current critical issues
    pub critical_issues: Vec<String>,
    /// Aggregated layer counters
    pub metrics: LayerMetrics,
    /// Quarantined projects per layer
    pub quarantined: BTreeMap<Discipline, Vec<String>>,
}

/// Per-layer section of a report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerReport {
    /// Layer key or `global`
    pub layer_name: String,
    /// Events in range
    pub total_events: usize,
    /// Counts by event type
    pub by_type: BTreeMap<SecurityEventType, usize>,
    /// Average severity classification
    pub average_severity: ThreatLevel,
}

/// Time-ranged security report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityReport {
    /// Range start
    pub from: DateTime<Utc>,
    /// Range end
    pub to: DateTime<Utc>,
    /// When generated
    pub generated_at: DateTime<Utc>,
    /// Events in range
    pub total_events: usize,
    /// Counts by event type
    pub by_type: BTreeMap<SecurityEventType, usize>,
    /// Per-layer breakdown
    pub layers: Vec<LayerReport>,
    /// Suggested actions
    pub recommendations: Vec<String>,
}

#[derive(Debug, Default)]
struct Breaker {
    critical_count: u32,
    shutdown: Option<ShutdownInfo>,
}

/// Global security coordinator
#[derive(Debug)]
pub struct SecurityIntegration {
    config: IntegrationConfig,
    orchestrator: SecurityOrchestrator,
    global_engine: ThreatDetectionEngine,
    events: Mutex<EventLog>,
    breaker: Mutex<Breaker>,
    notifier: broadcast::Sender<SecurityNotification>,
}

impl SecurityIntegration {
    /// Build the integration and its layers
    pub fn new(config: IntegrationConfig) -> Result<Self> {
        let orchestrator = SecurityOrchestrator::new(&config.layer)?;
        let global_engine = ThreatDetectionEngine::new(GLOBAL_LAYER, config.global.clone())?;
        let (notifier, _) = broadcast::channel(1024);

        Ok(Self {
            config,
            orchestrator,
            global_engine,
            events: Mutex::new(EventLog::default()),
            breaker: Mutex::new(Breaker::default()),
            notifier,
        })
    }

    /// Register background tasks with the scheduler
    pub fn start(self: &Arc<Self>, scheduler: &Scheduler) {
        let this = Arc::clone(self);
        scheduler.spawn_periodic("security:decay", self.config.decay_interval, move || {
            let this = Arc::clone(&this);
            async move { this.decay_tick() }
        });

        let this = Arc::clone(self);
        scheduler.spawn_periodic(
            "security:health",
            self.config.health_check_interval,
            move || {
                let this = Arc::clone(&this);
                async move {
                    this.run_health_check();
                }
            },
        );

        let this = Arc::clone(self);
        scheduler.spawn_periodic(
            "security:quarantine-sweep",
            self.config.quarantine_sweep_interval,
            move || {
                let this = Arc::clone(&this);
                async move {
                    this.sweep_quarantine(Utc::now());
                }
            },
        );

        tracing::info!(
            threshold = self.config.emergency_shutdown_threshold,
            "Security integration started"
        );
    }

    /// Configuration
    pub fn config(&self) -> &IntegrationConfig {
        &self.config
    }

    /// Orchestrator
    pub fn orchestrator(&self) -> &SecurityOrchestrator {
        &self.orchestrator
    }

    /// Global engine
    pub fn global_engine(&self) -> &ThreatDetectionEngine {
        &self.global_engine
    }

    /// Subscribe to security notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SecurityNotification> {
        self.notifier.subscribe()
    }

    /// Decide whether an analysis request may proceed
    pub fn validate_analysis_request(&self, request: &AnalysisRequest) -> Result<RequestDecision> {
        if request.analysis_types.is_empty() {
            return Err(GuardError::Validation(
                "Analysis request names no analysis types".to_string(),
            ));
        }

        if self.is_emergency_active() {
            self.record_event(
                SecurityEvent::new(
                    SecurityEventType::AnalysisBlocked,
                    ThreatLevel::High,
                    GLOBAL_LAYER,
                    "Blocked: emergency shutdown active",
                )
                .with_project(&request.project_id),
            );
            return Ok(RequestDecision::block(
                "System is in emergency shutdown mode",
            ));
        }

        let global_scan = self
            .global_engine
            .scan(&request.to_json(), "global:request");

        if global_scan.threat_level == ThreatLevel::Critical {
            self.record_event(
                SecurityEvent::new(
                    SecurityEventType::ThreatDetected,
                    ThreatLevel::Critical,
                    GLOBAL_LAYER,
                    "Blocked: critical threats in request",
                )
                .with_project(&request.project_id)
                .with_details(describe(&global_scan)),
            );
            return Ok(RequestDecision::block(
                "Security validation failed: critical threats in request",
            ));
        }

        let mut layers = BTreeMap::new();
        for discipline in &request.analysis_types {
            if layers.contains_key(discipline) {
                continue;
            }

            let context = self.orchestrator.validate_request(*discipline, request)?;

            if context.is_quarantined {
                self.record_event(
                    SecurityEvent::new(
                        SecurityEventType::QuarantineApplied,
                        context.scan_result.threat_level,
                        discipline.key(),
                        "Blocked: project quarantined",
                    )
                    .with_project(&request.project_id)
                    .with_details(describe(&context.scan_result)),
                );
                return Ok(RequestDecision::block(format!(
                    "Security validation failed: request quarantined by {} security layer",
                    discipline.label()
                )));
            }

            if !context.scan_result.detected_threats.is_empty() {
                self.record_event(
                    SecurityEvent::new(
                        SecurityEventType::ThreatDetected,
                        context.scan_result.threat_level,
                        discipline.key(),
                        "Allowed with warnings",
                    )
                    .with_project(&request.project_id)
                    .with_details(describe(&context.scan_result)),
                );
            }

            layers.insert(*discipline, context);
        }

        self.record_event(
            SecurityEvent::new(
                SecurityEventType::AnalysisAllowed,
                global_scan.threat_level,
                GLOBAL_LAYER,
                "Allowed",
            )
            .with_project(&request.project_id),
        );

        Ok(RequestDecision::allow(SecurityContext {
            global_scan,
            layers,
        }))
    }

    /// Validate an analysis result in its discipline layer
    pub fn validate_result(
        &self,
        result: &AnalysisResult,
        discipline: Discipline,
        context: Option<&AnalysisContext>,
    ) -> Result<ResultValidation> {
        let validation = self
            .orchestrator
            .validate_result(discipline, result, context)?;

        if !validation.is_valid {
            let severity = validation
                .issues
                .iter()
                .map(|i| i.severity)
                .max()
                .unwrap_or(ThreatLevel::Low);
            let action = if validation.sanitized_result.is_some() {
                "Result sanitized"
            } else {
                "Result flagged"
            };
            self.record_event(
                SecurityEvent::new(
                    SecurityEventType::ThreatDetected,
                    severity,
                    discipline.key(),
                    action,
                )
                .with_project(&result.project_id)
                .with_details(
                    validation
                        .issues
                        .iter()
                        .map(|i| format!("{}: {}", i.field, i.description))
                        .collect(),
                ),
            );
        }

        Ok(validation)
    }

    /// Is emergency shutdown in effect (lifts it first if the cool-down elapsed)
    pub fn is_emergency_active(&self) -> bool {
        self.is_emergency_active_at(Utc::now())
    }

    pub(crate) fn is_emergency_active_at(&self, now: DateTime<Utc>) -> bool {
        let lifted = {
            let mut breaker = self.lock_breaker();
            match &breaker.shutdown {
                Some(info) if now >= info.lifts_at => {
                    breaker.shutdown = None;
                    breaker.critical_count = 0;
                    true
                },
                Some(_) => return true,
                None => return false,
            }
        };

        if lifted {
            tracing::info!("Emergency shutdown lifted after cool-down");
            let _ = self
                .notifier
                .send(SecurityNotification::ShutdownLifted { manual: false, at: now });
        }
        false
    }

    /// Active shutdown details
    pub fn emergency_status(&self) -> Option<ShutdownInfo> {
        if self.is_emergency_active() {
            self.lock_breaker().shutdown.clone()
        } else {
            None
        }
    }

    /// Engage emergency shutdown manually
    pub fn force_emergency_shutdown(&self, reason: &str) {
        self.enter_shutdown(reason.to_string(), true);
    }

    /// Lift emergency shutdown. Returns false if it was not engaged.
    pub fn lift_emergency_shutdown(&self) -> bool {
        let was_active = {
            let mut breaker = self.lock_breaker();
            breaker.critical_count = 0;
            breaker.shutdown.take().is_some()
        };

        if was_active {
            tracing::warn!("Emergency shutdown lifted by operator");
            let _ = self.notifier.send(SecurityNotification::ShutdownLifted {
                manual: true,
                at: Utc::now(),
            });
        }
        was_active
    }

    /// Current rolling CRITICAL counter
    pub fn critical_threat_count(&self) -> u32 {
        self.lock_breaker().critical_count
    }

    /// Decrement the rolling counter and apply cool-down expiry
    pub fn decay_tick(&self) {
        {
            let mut breaker = self.lock_breaker();
            breaker.critical_count = breaker.critical_count.saturating_sub(1);
        }
        self.is_emergency_active();
    }

    /// Audit all layers and log if health is poor
    pub fn run_health_check(&self) -> SecurityAudit {
        let audit = self.orchestrator.audit_all_layers();
        if audit.overall_health_score < 50 {
            tracing::error!(
                health = audit.overall_health_score,
                issues = ?audit.critical_issues,
                "Security health check failed"
            );
        } else {
            tracing::debug!(health = audit.overall_health_score, "Security health check");
        }
        audit
    }

    /// Release quarantine entries past their maximum age
    pub fn sweep_quarantine(&self, now: DateTime<Utc>) -> usize {
        let released = self.orchestrator.release_expired(now);
        if released > 0 {
            tracing::info!(released, "Expired quarantine entries released");
        }
        released
    }

    /// Release a project from one layer
    pub fn release_quarantine(&self, discipline: Discipline, project_id: &str) -> Result<bool> {
        Ok(self.orchestrator.layer(discipline)?.release(project_id))
    }

    /// Record an event; CRITICAL events feed the circuit breaker
    pub fn record_event(&self, event: SecurityEvent) {
        let counts = event.severity == ThreatLevel::Critical
            && event.event_type != SecurityEventType::EmergencyShutdown;
        let alert = event.severity >= ThreatLevel::High
            && event.event_type != SecurityEventType::AnalysisAllowed;

        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());

        if alert {
            let _ = self.notifier.send(SecurityNotification::Alert { event });
        }

        if counts {
            let tripped = {
                let mut breaker = self.lock_breaker();
                breaker.critical_count += 1;
                breaker.shutdown.is_none()
                    && breaker.critical_count >= self.config.emergency_shutdown_threshold
            };
            if tripped {
                self.enter_shutdown(
                    format!(
                        "{} critical threats within the decay window",
                        self.config.emergency_shutdown_threshold
                    ),
                    false,
                );
            }
        }
    }

    /// Operator dashboard
    pub fn dashboard(&self) -> SecurityDashboard {
        let audit = self.orchestrator.audit_all_layers();
        let emergency = self.emergency_status();

        let overall_status = if emergency.is_some() {
            SystemStatus::Emergency
        } else if audit.overall_health_score < 50 {
            SystemStatus::Critical
        } else if audit.overall_health_score < 80 {
            SystemStatus::Warning
        } else {
            SystemStatus::Secure
        };

        let (active_threats, recent_events) = {
            let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
            (
                events.count_since(
                    SecurityEventType::ThreatDetected,
                    Utc::now() - Duration::hours(24),
                ),
                events.recent(20),
            )
        };

        let mut recommendations = audit.recommendations.clone();
        if emergency.is_some() {
            recommendations.push(
                "Investigate recent critical threats before lifting emergency shutdown"
                    .to_string(),
            );
        }

        SecurityDashboard {
            overall_status,
            overall_health_score: audit.overall_health_score,
            emergency_shutdown: emergency,
            critical_threat_count: self.critical_threat_count(),
            active_threats,
            recent_events,
            recommendations,
            critical_issues: audit.critical_issues,
            metrics: self.orchestrator.aggregate_metrics(),
            quarantined: audit
                .layers
                .into_iter()
                .map(|l| (l.layer, l.quarantined_projects))
                .collect(),
        }
    }

    /// Report over `[from, to]`
    pub fn generate_report(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> SecurityReport {
        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .range(from, to);

        let mut by_type: BTreeMap<SecurityEventType, usize> = BTreeMap::new();
        let mut by_layer: BTreeMap<String, Vec<&SecurityEvent>> = BTreeMap::new();
        for event in &events {
            *by_type.entry(event.event_type).or_default() += 1;
            by_layer
                .entry(event.layer_name.clone())
                .or_default()
                .push(event);
        }

        let mut recommendations = Vec::new();
        let layers: Vec<LayerReport> = by_layer
            .into_iter()
            .map(|(layer_name, layer_events)| {
                let mut counts: BTreeMap<SecurityEventType, usize> = BTreeMap::new();
                for e in &layer_events {
                    *counts.entry(e.event_type).or_default() += 1;
                }
                let avg = layer_events
                    .iter()
                    .map(|e| f64::from(e.severity.ordinal()))
                    .sum::<f64>()
                    / layer_events.len() as f64;

                if layer_events.len() > 5 {
                    recommendations.push(format!(
                        "Layer {layer_name} recorded {} security events; review its configuration",
                        layer_events.len()
                    ));
                }

                LayerReport {
                    layer_name,
                    total_events: layer_events.len(),
                    by_type: counts,
                    average_severity: ThreatLevel::from_average(avg),
                }
            })
            .collect();

        if by_type.contains_key(&SecurityEventType::EmergencyShutdown) {
            recommendations.push(
                "Emergency shutdown occurred in this period; review the triggering threats"
                    .to_string(),
            );
        }
        if recommendations.is_empty() {
            recommendations.push("No action required".to_string());
        }

        SecurityReport {
            from,
            to,
            generated_at: Utc::now(),
            total_events: events.len(),
            by_type,
            layers,
            recommendations,
        }
    }

    fn enter_shutdown(&self, reason: String, manual: bool) {
        let now = Utc::now();
        {
            let mut breaker = self.lock_breaker();
            if breaker.shutdown.is_some() {
                return;
            }
            breaker.shutdown = Some(ShutdownInfo {
                since: now,
                reason: reason.clone(),
                manual,
                lifts_at: now + self.config.shutdown_cooldown,
            });
        }

        tracing::error!(%reason, manual, "EMERGENCY SHUTDOWN engaged");
        self.record_event(SecurityEvent::new(
            SecurityEventType::EmergencyShutdown,
            ThreatLevel::Critical,
            GLOBAL_LAYER,
            reason.clone(),
        ));
        let _ = self
            .notifier
            .send(SecurityNotification::EmergencyShutdown { reason, at: now });
    }

    fn lock_breaker(&self) -> std::sync::MutexGuard<'_, Breaker> {
        self.breaker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn describe(scan: &ScanResult) -> Vec<String> {
    scan.detected_threats
        .iter()
        .map(|t| format!("{} ({}): {}", t.threat_type, t.severity, t.description))
        .collect()
}
