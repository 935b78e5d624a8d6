//! Analysis request and result payloads.
//!
//! The analyses themselves run in an external orchestrator. This module only
//! models what crosses the boundary so the security layers can validate it:
//!
//! - [`AnalysisRequest`]: what a user asked to analyze and how
//! - [`AnalysisResult`]: the common result envelope with a per-discipline
//!   [`DisciplineFindings`] union
//!
//! # Disciplines
//!
//! | Key                | Discipline                        |
//! |--------------------|-----------------------------------|
//! | `code_quality`     | Code quality and maintainability  |
//! | `innovation`       | Novelty of the approach           |
//! | `coherence`        | Consistency between docs and code |
//! | `blockchain_usage` | On-chain integration depth        |

mod request;
mod result;

pub use request::{AnalysisOptions, AnalysisRequest};
pub use result::{AnalysisResult, AnalysisStatus, DisciplineFindings, TextField};

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GuardError;

/// One analysis dimension, each guarded by its own security layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Discipline {
    /// Code quality analysis
    CodeQuality,
    /// Innovation analysis
    Innovation,
    /// Documentation/code coherence analysis
    Coherence,
    /// Blockchain usage analysis
    BlockchainUsage,
}

impl Discipline {
    /// All disciplines, in layer order.
    pub const ALL: [Discipline; 4] = [
        Discipline::CodeQuality,
        Discipline::Innovation,
        Discipline::Coherence,
        Discipline::BlockchainUsage,
    ];

    /// Canonical key.
    pub fn key(&self) -> &'static str {
        match self {
            Self::CodeQuality => "code_quality",
            Self::Innovation => "innovation",
            Self::Coherence => "coherence",
            Self::BlockchainUsage => "blockchain_usage",
        }
    }

    /// Human-readable name.
    pub fn label(&self) -> &'static str {
        match self {
            Self::CodeQuality => "Code Quality",
            Self::Innovation => "Innovation",
            Self::Coherence => "Coherence",
            Self::BlockchainUsage => "Blockchain Usage",
        }
    }
}

impl std::fmt::Display for Discipline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl FromStr for Discipline {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_lowercase();

        match normalized.as_str() {
            "codequality" | "quality" => Ok(Self::CodeQuality),
            "innovation" => Ok(Self::Innovation),
            "coherence" => Ok(Self::Coherence),
            "blockchainusage" | "blockchain" => Ok(Self::BlockchainUsage),
            _ => Err(GuardError::Configuration(format!(
                "Unknown security layer: {s}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discipline_from_str() {
        assert_eq!(
            Discipline::from_str("code_quality").unwrap(),
            Discipline::CodeQuality
        );
        assert_eq!(
            Discipline::from_str("codeQuality").unwrap(),
            Discipline::CodeQuality
        );
        assert_eq!(
            Discipline::from_str("blockchain-usage").unwrap(),
            Discipline::BlockchainUsage
        );
        assert!(matches!(
            Discipline::from_str("astrology"),
            Err(GuardError::Configuration(_))
        ));
    }

    #[test]
    fn test_discipline_serde_key() {
        let json = serde_json::to_string(&Discipline::BlockchainUsage).unwrap();
        assert_eq!(json, "\"blockchain_usage\"");
        for d in Discipline::ALL {
            assert_eq!(Discipline::from_str(d.key()).unwrap(), d);
        }
    }
}
