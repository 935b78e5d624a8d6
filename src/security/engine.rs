//! Threat detection engine.
//!
//! Scans a string against the built-in pattern sets, the suspicious phrase
//! dictionary, role manipulation patterns and any configured custom patterns,
//! then aggregates the hits into a single [`ScanResult`].

use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::sync::broadcast;

use super::patterns::{mask_redactions, match_patterns, PatternMatch, URGENCY_REGEX};
use super::types::{
    CustomPattern, Location, ScanResult, SecurityConfig, Threat, ThreatLevel, ThreatType,
};
use crate::error::Result;

/// Emitted whenever a scan comes back insecure
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatNotification {
    /// Engine name
    pub engine: String,
    /// Caller-supplied scan context
    pub context: String,
    /// Aggregate level
    pub threat_level: ThreatLevel,
    /// Number of threats
    pub threat_count: usize,
    /// When the scan ran
    pub timestamp: DateTime<Utc>,
}

/// Pattern-based threat detection engine
#[derive(Debug)]
pub struct ThreatDetectionEngine {
    /// Engine name (used in logs and notifications)
    name: String,
    /// Active configuration
    config: RwLock<SecurityConfig>,
    /// Compiled custom patterns
    custom: RwLock<Vec<(Regex, CustomPattern)>>,
    /// Threat notifications
    notifier: broadcast::Sender<ThreatNotification>,
}

impl ThreatDetectionEngine {
    /// Create an engine. Fails if a custom pattern does not compile.
    pub fn new(name: impl Into<String>, config: SecurityConfig) -> Result<Self> {
        let custom = compile_custom(&config.custom_patterns)?;
        let (notifier, _) = broadcast::channel(256);

        Ok(Self {
            name: name.into(),
            config: RwLock::new(config),
            custom: RwLock::new(custom),
            notifier,
        })
    }

    /// Engine name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current configuration
    pub fn config(&self) -> SecurityConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration at runtime
    pub fn update_config(&self, config: SecurityConfig) -> Result<()> {
        let custom = compile_custom(&config.custom_patterns)?;
        *self.custom.write().unwrap_or_else(PoisonError::into_inner) = custom;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }

    /// Add one custom pattern at runtime
    pub fn add_custom_pattern(&self, pattern: CustomPattern) -> Result<()> {
        let regex = compile_one(&pattern)?;
        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .custom_patterns
            .push(pattern.clone());
        self.custom
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((regex, pattern));
        Ok(())
    }

    /// Subscribe to threat notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ThreatNotification> {
        self.notifier.subscribe()
    }

    /// Scan content for threats
    pub fn scan(&self, content: &str, context: &str) -> ScanResult {
        let config = self.config();

        if !config.enabled {
            return ScanResult::secure();
        }

        // Oversized content is rejected without pattern work
        if content.len() > config.max_content_length {
            let threat = Threat {
                threat_type: ThreatType::SystemOverride,
                severity: ThreatLevel::High,
                description: format!(
                    "Content exceeds maximum length: {} > {}",
                    content.len(),
                    config.max_content_length
                ),
                location: Location {
                    start: 0,
                    end: content.len(),
                },
                suggestion: "Reduce content size".to_string(),
            };
            let result = ScanResult {
                is_secure: ThreatLevel::High < config.threat_threshold,
                threat_level: ThreatLevel::High,
                detected_threats: vec![threat],
                confidence: confidence_for(1),
                sanitized_content: None,
            };
            self.report(&config, &result, context);
            return result;
        }

        let masked = mask_redactions(content);
        let mut hits = match_patterns(&masked);
        hits.extend(self.match_custom(&masked));

        let threats = build_threats(&masked, hits);
        let threat_level = aggregate_level(&threats);
        let is_secure = threat_level < config.threat_threshold;

        let sanitized_content = if !is_secure && config.auto_sanitize {
            sanitize(content, &threats)
        } else {
            None
        };

        let result = ScanResult {
            is_secure,
            threat_level,
            confidence: if threats.is_empty() {
                1.0
            } else {
                confidence_for(threats.len())
            },
            detected_threats: threats,
            sanitized_content,
        };

        self.report(&config, &result, context);
        result
    }

    fn match_custom(&self, content: &str) -> Vec<PatternMatch> {
        let custom = self.custom.read().unwrap_or_else(PoisonError::into_inner);
        let mut hits = Vec::new();

        for (regex, pattern) in custom.iter() {
            for m in regex.find_iter(content) {
                hits.push(PatternMatch {
                    threat_type: pattern.threat_type,
                    description: pattern
                        .description
                        .clone()
                        .unwrap_or_else(|| format!("Custom pattern: {}", pattern.pattern)),
                    start: m.start(),
                    end: m.end(),
                });
            }
        }

        hits
    }

    fn report(&self, config: &SecurityConfig, result: &ScanResult, context: &str) {
        if result.is_secure {
            return;
        }

        if config.logging {
            tracing::warn!(
                engine = %self.name,
                context,
                level = %result.threat_level,
                threats = result.detected_threats.len(),
                "Threat detected"
            );
        }

        // No receivers is fine
        let _ = self.notifier.send(ThreatNotification {
            engine: self.name.clone(),
            context: context.to_string(),
            threat_level: result.threat_level,
            threat_count: result.detected_threats.len(),
            timestamp: Utc::now(),
        });
    }
}

fn compile_one(pattern: &CustomPattern) -> Result<Regex> {
    Ok(Regex::new(&format!("(?i){}", pattern.pattern))?)
}

fn compile_custom(patterns: &[CustomPattern]) -> Result<Vec<(Regex, CustomPattern)>> {
    patterns
        .iter()
        .map(|p| compile_one(p).map(|r| (r, p.clone())))
        .collect()
}

/// `min(1, 0.7 + 0.1 * count)`
fn confidence_for(count: usize) -> f32 {
    (0.7 + 0.1 * count as f32).min(1.0)
}

fn build_threats(content: &str, mut hits: Vec<PatternMatch>) -> Vec<Threat> {
    hits.sort_by_key(|h| (h.start, h.end));
    hits.dedup_by(|a, b| a.threat_type == b.threat_type && a.start == b.start && a.end == b.end);

    hits.into_iter()
        .map(|hit| {
            let mut severity = hit.threat_type.base_severity();
            if URGENCY_REGEX.is_match(&content[hit.start..hit.end]) {
                severity = severity.escalate();
            }
            Threat {
                threat_type: hit.threat_type,
                severity,
                description: hit.description,
                location: Location {
                    start: hit.start,
                    end: hit.end,
                },
                suggestion: hit.threat_type.suggestion().to_string(),
            }
        })
        .collect()
}

/// Aggregate individual severities into one level
pub(crate) fn aggregate_level(threats: &[Threat]) -> ThreatLevel {
    let Some(max) = threats.iter().map(|t| t.severity).max() else {
        return ThreatLevel::Low;
    };

    let avg = threats
        .iter()
        .map(|t| f64::from(t.severity.ordinal()))
        .sum::<f64>()
        / threats.len() as f64;

    if max == ThreatLevel::Critical {
        ThreatLevel::Critical
    } else if max >= ThreatLevel::High || avg >= 2.5 {
        ThreatLevel::High
    } else if max >= ThreatLevel::Medium || avg >= 1.5 {
        ThreatLevel::Medium
    } else {
        ThreatLevel::Low
    }
}

/// Redact HIGH/CRITICAL spans. Returns `None` if nothing qualified.
fn sanitize(content: &str, threats: &[Threat]) -> Option<String> {
    let mut spans: Vec<(usize, usize, ThreatType)> = threats
        .iter()
        .filter(|t| t.severity >= ThreatLevel::High)
        .map(|t| (t.location.start, t.location.end, t.threat_type))
        .collect();

    if spans.is_empty() {
        return None;
    }

    // Overlapping spans would invalidate each other's offsets
    spans.sort_by_key(|s| s.0);
    let mut merged: Vec<(usize, usize, ThreatType)> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.0 < last.1 => last.1 = last.1.max(span.1),
            _ => merged.push(span),
        }
    }

    let mut sanitized = content.to_string();
    for (start, end, kind) in merged.into_iter().rev() {
        sanitized.replace_range(start..end, &kind.redaction_marker());
    }

    Some(sanitized)
}
