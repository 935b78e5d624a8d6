//! Scan verdicts, threat descriptors and scanner configuration.

use serde::{Deserialize, Serialize};

/// Threat level, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatLevel {
    /// Informational
    Low,
    /// Worth a look
    Medium,
    /// Likely malicious
    High,
    /// Malicious
    Critical,
}

impl ThreatLevel {
    /// Numeric ordinal (LOW = 1 .. CRITICAL = 4)
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }

    /// One level up, saturating at CRITICAL
    pub fn escalate(&self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    /// Level for an average ordinal (used by reports)
    pub fn from_average(avg: f64) -> Self {
        if avg >= 3.5 {
            Self::Critical
        } else if avg >= 2.5 {
            Self::High
        } else if avg >= 1.5 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl std::str::FromStr for ThreatLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            _ => Err(format!("Unknown threat level: {s}")),
        }
    }
}

/// Kinds of manipulation attempts the engine recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatType {
    /// "Ignore previous instructions" and friends
    PromptInjection,
    /// DAN mode, developer mode, restriction bypass
    Jailbreak,
    /// Fake system messages, admin overrides, oversized payloads
    SystemOverride,
    /// Replacing the task with a different one
    InstructionHijack,
    /// "You are now ..." persona changes
    RoleManipulation,
    /// Forcing specific scores or verdicts
    OutputManipulation,
    /// Planting false facts in the analyzed context
    ContextPoisoning,
    /// Authority or urgency pressure
    SocialEngineering,
}

impl ThreatType {
    /// Base severity before urgency escalation
    pub fn base_severity(&self) -> ThreatLevel {
        match self {
            Self::Jailbreak | Self::SystemOverride => ThreatLevel::Critical,
            Self::PromptInjection | Self::InstructionHijack | Self::ContextPoisoning => {
                ThreatLevel::High
            },
            Self::RoleManipulation | Self::OutputManipulation => ThreatLevel::Medium,
            Self::SocialEngineering => ThreatLevel::Low,
        }
    }

    /// Upper-case code used in redaction markers
    pub fn code(&self) -> &'static str {
        match self {
            Self::PromptInjection => "PROMPT_INJECTION",
            Self::Jailbreak => "JAILBREAK",
            Self::SystemOverride => "SYSTEM_OVERRIDE",
            Self::InstructionHijack => "INSTRUCTION_HIJACK",
            Self::RoleManipulation => "ROLE_MANIPULATION",
            Self::OutputManipulation => "OUTPUT_MANIPULATION",
            Self::ContextPoisoning => "CONTEXT_POISONING",
            Self::SocialEngineering => "SOCIAL_ENGINEERING",
        }
    }

    /// Redaction marker that replaces a span of this type
    pub fn redaction_marker(&self) -> String {
        format!("[REDACTED:{}]", self.code())
    }

    /// Generic remediation hint
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::PromptInjection => "Remove instructions addressed to the analyzer",
            Self::Jailbreak => "Remove attempts to disable analyzer safeguards",
            Self::SystemOverride => "Remove fake system or administrator directives",
            Self::InstructionHijack => "Keep content limited to the project under analysis",
            Self::RoleManipulation => "Remove persona or role-change requests",
            Self::OutputManipulation => "Remove attempts to dictate scores or verdicts",
            Self::ContextPoisoning => "Remove unverifiable claims about prior approvals",
            Self::SocialEngineering => "Remove urgency or authority pressure",
        }
    }
}

impl std::fmt::Display for ThreatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code().to_lowercase())
    }
}

/// Byte span of a match inside the scanned text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Start offset (inclusive)
    pub start: usize,
    /// End offset (exclusive)
    pub end: usize,
}

/// A detected threat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Threat {
    /// Threat kind
    #[serde(rename = "type")]
    pub threat_type: ThreatType,
    /// Severity after escalation
    pub severity: ThreatLevel,
    /// Description
    pub description: String,
    /// Matched span
    pub location: Location,
    /// Remediation hint
    pub suggestion: String,
}

/// Result of a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    /// `threat_level` is below the configured threshold
    pub is_secure: bool,
    /// Aggregate level
    pub threat_level: ThreatLevel,
    /// Detected threats
    pub detected_threats: Vec<Threat>,
    /// Confidence (0.0 - 1.0)
    pub confidence: f32,
    /// Redacted copy of the input, when sanitization ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanitized_content: Option<String>,
}

impl ScanResult {
    /// Clean verdict
    pub fn secure() -> Self {
        Self {
            is_secure: true,
            threat_level: ThreatLevel::Low,
            detected_threats: vec![],
            confidence: 1.0,
            sanitized_content: None,
        }
    }

    /// Combine two verdicts: union of threats, max level, min confidence.
    ///
    /// Sanitized content is taken from `self` only.
    pub fn merge(mut self, other: ScanResult) -> Self {
        self.is_secure = self.is_secure && other.is_secure;
        self.threat_level = self.threat_level.max(other.threat_level);
        self.confidence = self.confidence.min(other.confidence);
        self.detected_threats.extend(other.detected_threats);
        self
    }

    /// Highest threat severity, if any threat was found
    pub fn max_severity(&self) -> Option<ThreatLevel> {
        self.detected_threats.iter().map(|t| t.severity).max()
    }
}

/// User-supplied extra pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomPattern {
    /// Regex source (case-insensitive matching is added automatically)
    pub pattern: String,
    /// Threat kind reported on match
    pub threat_type: ThreatType,
    /// Description
    #[serde(default)]
    pub description: Option<String>,
}

impl CustomPattern {
    /// Create a custom pattern
    pub fn new(pattern: impl Into<String>, threat_type: ThreatType) -> Self {
        Self {
            pattern: pattern.into(),
            threat_type,
            description: None,
        }
    }
}

/// Scanner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityConfig {
    /// Scanning on/off
    pub enabled: bool,
    /// Levels at or above this are insecure
    pub threat_threshold: ThreatLevel,
    /// Redact HIGH/CRITICAL spans of insecure content
    pub auto_sanitize: bool,
    /// Log findings
    pub logging: bool,
    /// Maximum content length (bytes)
    pub max_content_length: usize,
    /// Extra patterns
    pub custom_patterns: Vec<CustomPattern>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threat_threshold: ThreatLevel::Medium,
            auto_sanitize: true,
            logging: true,
            max_content_length: 50_000,
            custom_patterns: vec![],
        }
    }
}

impl SecurityConfig {
    /// Set threshold
    pub fn with_threshold(mut self, threshold: ThreatLevel) -> Self {
        self.threat_threshold = threshold;
        self
    }

    /// Set max content length
    pub fn with_max_content_length(mut self, len: usize) -> Self {
        self.max_content_length = len;
        self
    }

    /// Disable sanitization
    pub fn without_sanitize(mut self) -> Self {
        self.auto_sanitize = false;
        self
    }

    /// Add a custom pattern
    pub fn with_custom_pattern(mut self, pattern: CustomPattern) -> Self {
        self.custom_patterns.push(pattern);
        self
    }
}
