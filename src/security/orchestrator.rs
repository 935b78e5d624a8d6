//! Security orchestrator: one layer manager per discipline.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::layer::{
    AnalysisContext, LayerConfig, LayerMetrics, LayerSecurityManager, ResultValidation,
};
use crate::analysis::{AnalysisRequest, AnalysisResult, Discipline};
use crate::error::{GuardError, Result};

/// Health classification of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LayerHealth {
    /// Score >= 80
    Healthy,
    /// Score 50..80
    Warning,
    /// Score < 50
    Critical,
}

impl LayerHealth {
    /// Classify a health score
    pub fn from_score(score: i64) -> Self {
        if score >= 80 {
            Self::Healthy
        } else if score >= 50 {
            Self::Warning
        } else {
            Self::Critical
        }
    }
}

/// Audit of one layer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerAudit {
    /// Layer
    pub layer: Discipline,
    /// Heuristic score (`100 - 10 * quarantined`)
    pub health_score: i64,
    /// Classification
    pub status: LayerHealth,
    /// Projects currently quarantined
    pub quarantined_projects: Vec<String>,
    /// Counters
    pub metrics: LayerMetrics,
}

/// Audit across all layers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityAudit {
    /// When the audit ran
    pub timestamp: DateTime<Utc>,
    /// Overall score (100 - 20 per CRITICAL - 10 per WARNING, floored at 0)
    pub overall_health_score: i64,
    /// Per-layer results
    pub layers: Vec<LayerAudit>,
    /// Issues requiring immediate attention
    pub critical_issues: Vec<String>,
    /// Suggested actions
    pub recommendations: Vec<String>,
}

/// Holds one [`LayerSecurityManager`] per discipline
#[derive(Debug)]
pub struct SecurityOrchestrator {
    layers: BTreeMap<Discipline, LayerSecurityManager>,
}

impl SecurityOrchestrator {
    /// Create an orchestrator with the same configuration for every layer
    pub fn new(config: &LayerConfig) -> Result<Self> {
        let layers = Discipline::ALL
            .iter()
            .map(|d| LayerSecurityManager::new(*d, config.clone()).map(|m| (*d, m)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Self { layers })
    }

    /// Layer for a discipline
    pub fn layer(&self, discipline: Discipline) -> Result<&LayerSecurityManager> {
        self.layers.get(&discipline).ok_or_else(|| {
            GuardError::Configuration(format!("No security layer for {discipline}"))
        })
    }

    /// Layer for a string key; unknown keys are a configuration error
    pub fn layer_by_key(&self, key: &str) -> Result<&LayerSecurityManager> {
        self.layer(Discipline::from_str(key)?)
    }

    /// All layers
    pub fn layers(&self) -> impl Iterator<Item = &LayerSecurityManager> {
        self.layers.values()
    }

    /// Validate a request in one layer
    pub fn validate_request(
        &self,
        discipline: Discipline,
        request: &AnalysisRequest,
    ) -> Result<AnalysisContext> {
        Ok(self.layer(discipline)?.validate_request(request))
    }

    /// Validate a result in one layer
    pub fn validate_result(
        &self,
        discipline: Discipline,
        result: &AnalysisResult,
        context: Option<&AnalysisContext>,
    ) -> Result<ResultValidation> {
        self.layer(discipline)?.validate_result(result, context)
    }

    /// Is the project quarantined in any layer
    pub fn is_quarantined_anywhere(&self, project_id: &str) -> bool {
        self.layers.values().any(|l| l.is_quarantined(project_id))
    }

    /// Release a project from every layer. Returns the layers it was released from.
    pub fn release_everywhere(&self, project_id: &str) -> Vec<Discipline> {
        self.layers
            .values()
            .filter(|l| l.release(project_id))
            .map(LayerSecurityManager::layer)
            .collect()
    }

    /// Release expired quarantine entries in every layer
    pub fn release_expired(&self, now: DateTime<Utc>) -> usize {
        self.layers
            .values()
            .map(|l| l.release_expired(now).len())
            .sum()
    }

    /// Sum of all layer counters
    pub fn aggregate_metrics(&self) -> LayerMetrics {
        self.layers
            .values()
            .map(LayerSecurityManager::metrics)
            .fold(LayerMetrics::default(), |mut acc, m| {
                acc.requests_validated += m.requests_validated;
                acc.results_validated += m.results_validated;
                acc.threats_detected += m.threats_detected;
                acc.quarantines_applied += m.quarantines_applied;
                acc.results_sanitized += m.results_sanitized;
                acc.critical_incidents += m.critical_incidents;
                acc.quarantined_projects += m.quarantined_projects;
                acc
            })
    }

    /// Audit every layer
    pub fn audit_all_layers(&self) -> SecurityAudit {
        let mut layers = Vec::with_capacity(self.layers.len());
        let mut critical_issues = Vec::new();
        let mut recommendations = Vec::new();
        let mut overall: i64 = 100;

        for manager in self.layers.values() {
            let quarantined = manager.quarantined_projects();
            let health_score = 100 - 10 * quarantined.len() as i64;
            let status = LayerHealth::from_score(health_score);

            match status {
                LayerHealth::Critical => {
                    overall -= 20;
                    critical_issues.push(format!(
                        "{} layer is critical: {} projects quarantined",
                        manager.layer().label(),
                        quarantined.len()
                    ));
                },
                LayerHealth::Warning => {
                    overall -= 10;
                    recommendations.push(format!(
                        "Review {} layer configuration ({} projects quarantined)",
                        manager.layer().label(),
                        quarantined.len()
                    ));
                },
                LayerHealth::Healthy => {},
            }

            layers.push(LayerAudit {
                layer: manager.layer(),
                health_score,
                status,
                quarantined_projects: quarantined,
                metrics: manager.metrics(),
            });
        }

        SecurityAudit {
            timestamp: Utc::now(),
            overall_health_score: overall.max(0),
            layers,
            critical_issues,
            recommendations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator() -> SecurityOrchestrator {
        SecurityOrchestrator::new(&LayerConfig::default()).unwrap()
    }

    #[test]
    fn test_unknown_layer_key() {
        let orch = orchestrator();
        assert!(orch.layer_by_key("coherence").is_ok());
        assert!(matches!(
            orch.layer_by_key("vibes"),
            Err(GuardError::Configuration(_))
        ));
    }

    #[test]
    fn test_audit_healthy() {
        let audit = orchestrator().audit_all_layers();
        assert_eq!(audit.overall_health_score, 100);
        assert_eq!(audit.layers.len(), 4);
        assert!(audit.layers.iter().all(|l| l.status == LayerHealth::Healthy));
        assert!(audit.recommendations.is_empty());
    }

    #[test]
    fn test_audit_warning_and_critical() {
        let orch = orchestrator();
        let quality = orch.layer(Discipline::CodeQuality).unwrap();
        for i in 0..3 {
            quality.quarantine_project(&format!("q{i}"));
        }
        let coherence = orch.layer(Discipline::Coherence).unwrap();
        for i in 0..6 {
            coherence.quarantine_project(&format!("c{i}"));
        }

        let audit = orch.audit_all_layers();
        // quality: 70 -> WARNING, coherence: 40 -> CRITICAL
        assert_eq!(audit.overall_health_score, 70);
        assert_eq!(audit.recommendations.len(), 1);
        assert_eq!(audit.critical_issues.len(), 1);
        let coh = audit
            .layers
            .iter()
            .find(|l| l.layer == Discipline::Coherence)
            .unwrap();
        assert_eq!(coh.health_score, 40);
        assert_eq!(coh.status, LayerHealth::Critical);
    }

    #[test]
    fn test_all_layers_critical() {
        let orch = orchestrator();
        for layer in orch.layers() {
            for i in 0..10 {
                layer.quarantine_project(&format!("p{i}"));
            }
        }
        let audit = orch.audit_all_layers();
        assert_eq!(audit.overall_health_score, 20);
        assert_eq!(audit.critical_issues.len(), 4);
        assert_eq!(LayerHealth::from_score(0), LayerHealth::Critical);
    }

    #[test]
    fn test_release_everywhere() {
        let orch = orchestrator();
        orch.layer(Discipline::Innovation)
            .unwrap()
            .quarantine_project("p");
        assert!(orch.is_quarantined_anywhere("p"));
        assert_eq!(orch.release_everywhere("p"), vec![Discipline::Innovation]);
        assert!(!orch.is_quarantined_anywhere("p"));
        assert_eq!(orch.aggregate_metrics().quarantines_applied, 1);
    }
}
