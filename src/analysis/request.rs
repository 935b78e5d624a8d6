//! Analysis requests.

use serde::{Deserialize, Serialize};

use super::Discipline;

/// A request to analyze one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    /// Project identifier
    pub project_id: String,
    /// Repository reference (usually a URL)
    pub repository_url: String,
    /// Requested disciplines
    pub analysis_types: Vec<Discipline>,
    /// Analysis options
    #[serde(default)]
    pub options: AnalysisOptions,
}

/// Options forwarded to the analysis orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOptions {
    /// Maximum number of files to analyze
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_files: Option<u32>,
    /// Analyze test files too
    #[serde(default)]
    pub include_tests: bool,
    /// Restrict to these languages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,
    /// Free-form instructions for the analyzer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<String>,
}

impl AnalysisRequest {
    /// Create a request for the given project and disciplines.
    pub fn new(
        project_id: impl Into<String>,
        repository_url: impl Into<String>,
        analysis_types: Vec<Discipline>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            repository_url: repository_url.into(),
            analysis_types,
            options: AnalysisOptions::default(),
        }
    }

    /// Set options
    pub fn with_options(mut self, options: AnalysisOptions) -> Self {
        self.options = options;
        self
    }

    /// Serialize options for scanning.
    pub fn options_json(&self) -> String {
        serde_json::to_string(&self.options).unwrap_or_default()
    }

    /// Serialize the whole request for scanning.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_camel_case() {
        let json = r#"{
            "projectId": "p1",
            "repositoryUrl": "https://github.com/acme/app",
            "analysisTypes": ["code_quality", "coherence"],
            "options": {"maxFiles": 200, "includeTests": true}
        }"#;

        let req: AnalysisRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.project_id, "p1");
        assert_eq!(req.analysis_types.len(), 2);
        assert_eq!(req.options.max_files, Some(200));
        assert!(req.options.include_tests);
    }

    #[test]
    fn test_options_default_when_missing() {
        let json = r#"{"projectId":"p","repositoryUrl":"r","analysisTypes":[]}"#;
        let req: AnalysisRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.options, AnalysisOptions::default());
        assert_eq!(req.options_json(), r#"{"includeTests":false}"#);
    }
}
