//! Analysis results.
//!
//! Every discipline shares one envelope; discipline-specific findings live in
//! a tagged union keyed by the `type` field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Discipline;
use crate::error::{GuardError, Result};

/// Terminal status reported by an analyzer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    /// Analysis finished normally
    Completed,
    /// Analysis finished with partial coverage
    Partial,
    /// Analysis failed
    Failed,
}

/// Discipline-specific findings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisciplineFindings {
    /// Code quality findings
    CodeQuality {
        /// Reported code issues
        #[serde(default)]
        issues: Vec<String>,
    },
    /// Innovation findings
    Innovation {
        /// Novel aspects of the project
        #[serde(default)]
        highlights: Vec<String>,
    },
    /// Coherence findings
    Coherence {
        /// Documentation/code mismatches
        #[serde(default)]
        inconsistencies: Vec<String>,
    },
    /// Blockchain usage findings
    BlockchainUsage {
        /// Networks the project touches
        #[serde(default)]
        networks: Vec<String>,
        /// Contracts referenced by the project
        #[serde(default)]
        contracts: Vec<String>,
    },
}

impl DisciplineFindings {
    /// Empty findings for a discipline.
    pub fn empty(discipline: Discipline) -> Self {
        match discipline {
            Discipline::CodeQuality => Self::CodeQuality { issues: vec![] },
            Discipline::Innovation => Self::Innovation { highlights: vec![] },
            Discipline::Coherence => Self::Coherence {
                inconsistencies: vec![],
            },
            Discipline::BlockchainUsage => Self::BlockchainUsage {
                networks: vec![],
                contracts: vec![],
            },
        }
    }

    /// Discipline these findings belong to
    pub fn discipline(&self) -> Discipline {
        match self {
            Self::CodeQuality { .. } => Discipline::CodeQuality,
            Self::Innovation { .. } => Discipline::Innovation,
            Self::Coherence { .. } => Discipline::Coherence,
            Self::BlockchainUsage { .. } => Discipline::BlockchainUsage,
        }
    }

    fn entries(&self) -> Vec<&String> {
        match self {
            Self::CodeQuality { issues } => issues.iter().collect(),
            Self::Innovation { highlights } => highlights.iter().collect(),
            Self::Coherence { inconsistencies } => inconsistencies.iter().collect(),
            Self::BlockchainUsage {
                networks,
                contracts,
            } => networks.iter().chain(contracts.iter()).collect(),
        }
    }

    fn entries_mut(&mut self) -> Vec<&mut String> {
        match self {
            Self::CodeQuality { issues } => issues.iter_mut().collect(),
            Self::Innovation { highlights } => highlights.iter_mut().collect(),
            Self::Coherence { inconsistencies } => inconsistencies.iter_mut().collect(),
            Self::BlockchainUsage {
                networks,
                contracts,
            } => networks.iter_mut().chain(contracts.iter_mut()).collect(),
        }
    }
}

/// Location of a text-bearing field inside a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "key", rename_all = "snake_case")]
pub enum TextField {
    /// `summary`
    Summary,
    /// `details`
    Details,
    /// `recommendations[i]`
    Recommendation(usize),
    /// `metadata[key]` (string values only)
    Metadata(String),
    /// i-th discipline finding entry
    Finding(usize),
}

impl std::fmt::Display for TextField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Summary => write!(f, "summary"),
            Self::Details => write!(f, "details"),
            Self::Recommendation(i) => write!(f, "recommendations[{i}]"),
            Self::Metadata(key) => write!(f, "metadata.{key}"),
            Self::Finding(i) => write!(f, "findings[{i}]"),
        }
    }
}

/// Common result envelope produced by every analyzer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// Terminal status
    pub status: AnalysisStatus,
    /// Project identifier
    pub project_id: String,
    /// Score in [0, 100]
    pub score: f64,
    /// Short summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Long-form details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Recommendations
    #[serde(default)]
    pub recommendations: Vec<String>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Discipline-specific findings (carries the `type` tag)
    #[serde(flatten)]
    pub findings: DisciplineFindings,
}

impl AnalysisResult {
    /// Create a completed result with no text.
    pub fn new(discipline: Discipline, project_id: impl Into<String>, score: f64) -> Self {
        Self {
            status: AnalysisStatus::Completed,
            project_id: project_id.into(),
            score,
            summary: None,
            details: None,
            recommendations: vec![],
            metadata: BTreeMap::new(),
            findings: DisciplineFindings::empty(discipline),
        }
    }

    /// Set summary
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Set status
    pub fn with_status(mut self, status: AnalysisStatus) -> Self {
        self.status = status;
        self
    }

    /// Parse a raw result, rejecting malformed shapes.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let result: Self = serde_json::from_value(value)
            .map_err(|e| GuardError::Validation(format!("Malformed analysis result: {e}")))?;
        result.check_shape()?;
        Ok(result)
    }

    /// Shape invariants that typing alone cannot express.
    pub fn check_shape(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            return Err(GuardError::Validation(
                "Analysis result has empty projectId".to_string(),
            ));
        }
        if !self.score.is_finite() {
            return Err(GuardError::Validation(format!(
                "Analysis result score is not a finite number: {}",
                self.score
            )));
        }
        Ok(())
    }

    /// Discipline of this result
    pub fn discipline(&self) -> Discipline {
        self.findings.discipline()
    }

    /// All text-bearing fields with their locations.
    pub fn text_fields(&self) -> Vec<(TextField, &str)> {
        let mut fields = Vec::new();

        if let Some(summary) = &self.summary {
            fields.push((TextField::Summary, summary.as_str()));
        }
        if let Some(details) = &self.details {
            fields.push((TextField::Details, details.as_str()));
        }
        for (i, rec) in self.recommendations.iter().enumerate() {
            fields.push((TextField::Recommendation(i), rec.as_str()));
        }
        for (key, value) in &self.metadata {
            if let serde_json::Value::String(s) = value {
                fields.push((TextField::Metadata(key.clone()), s.as_str()));
            }
        }
        for (i, entry) in self.findings.entries().into_iter().enumerate() {
            fields.push((TextField::Finding(i), entry.as_str()));
        }

        fields
    }

    /// Overwrite one text field. Returns false if the field does not exist.
    pub fn set_text(&mut self, field: &TextField, text: String) -> bool {
        match field {
            TextField::Summary => self.summary.as_mut().map(|s| *s = text).is_some(),
            TextField::Details => self.details.as_mut().map(|s| *s = text).is_some(),
            TextField::Recommendation(i) => {
                self.recommendations.get_mut(*i).map(|s| *s = text).is_some()
            },
            TextField::Metadata(key) => match self.metadata.get_mut(key) {
                Some(value @ serde_json::Value::String(_)) => {
                    *value = serde_json::Value::String(text);
                    true
                },
                _ => false,
            },
            TextField::Finding(i) => self
                .findings
                .entries_mut()
                .into_iter()
                .nth(*i)
                .map(|s| *s = text)
                .is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_from_json_with_findings() {
        let value = json!({
            "status": "completed",
            "projectId": "p1",
            "type": "code_quality",
            "score": 77.0,
            "summary": "Solid codebase",
            "recommendations": ["Add tests"],
            "metadata": {"analyzer": "v2", "files": 12},
            "issues": ["Long function in main.rs"]
        });

        let result = AnalysisResult::from_json(value).unwrap();
        assert_eq!(result.discipline(), Discipline::CodeQuality);
        assert_eq!(result.score, 77.0);

        let fields = result.text_fields();
        // summary + 1 recommendation + 1 string metadata + 1 issue
        assert_eq!(fields.len(), 4);
        assert!(fields
            .iter()
            .any(|(f, _)| *f == TextField::Metadata("analyzer".to_string())));
    }

    #[test]
    fn test_result_malformed_shape() {
        let missing_type = json!({"status": "completed", "projectId": "p", "score": 1.0});
        assert!(matches!(
            AnalysisResult::from_json(missing_type),
            Err(GuardError::Validation(_))
        ));

        let bad_score = json!({"status": "completed", "projectId": "p", "type": "innovation", "score": "high"});
        assert!(AnalysisResult::from_json(bad_score).is_err());

        let empty_project = json!({"status": "completed", "projectId": " ", "type": "innovation", "score": 5.0});
        assert!(AnalysisResult::from_json(empty_project).is_err());
    }

    #[test]
    fn test_set_text() {
        let mut result = AnalysisResult::new(Discipline::BlockchainUsage, "p", 50.0);
        if let DisciplineFindings::BlockchainUsage {
            networks,
            contracts,
        } = &mut result.findings
        {
            networks.push("ethereum".to_string());
            contracts.push("0xabc".to_string());
        }

        assert!(result.set_text(&TextField::Finding(1), "redacted".to_string()));
        assert!(!result.set_text(&TextField::Summary, "x".to_string()));
        assert_eq!(result.text_fields()[1].1, "redacted");
    }
}
