//! Real-time analysis session tracking.
//!
//! The [`SessionCoordinator`] consumes [`AnalysisEvent`]s from the analysis
//! pipeline and turns them into broadcasts on the real-time channel.
//!
//! ```text
//!   started ──> [Queued] ──progress/stage──> [InProgress] ──completed──> removed
//!                  │                              │
//!                  └──────────── failed ──────────┴────────────────────> removed
//! ```
//!
//! Progress events only update state; a per-session timer re-broadcasts the
//! latest state every `progress_interval`. Stage changes broadcast at once.

mod coordinator;
mod events;

use std::collections::BTreeMap;
use std::time::Duration;

pub use coordinator::{AnalysisSession, SessionCoordinator, SessionStatus};
pub use events::AnalysisEvent;

use crate::analysis::Discipline;

/// Session coordinator settings
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeConfig {
    /// Periodic progress broadcast interval
    pub progress_interval: Duration,
    /// Expected run time per discipline
    pub duration_estimates: BTreeMap<Discipline, Duration>,
    /// Multiplier applied to the summed estimate
    pub overhead_factor: f64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        let duration_estimates = [
            (Discipline::CodeQuality, 120),
            (Discipline::Innovation, 90),
            (Discipline::Coherence, 60),
            (Discipline::BlockchainUsage, 150),
        ]
        .into_iter()
        .map(|(d, secs)| (d, Duration::from_secs(secs)))
        .collect();

        Self {
            progress_interval: Duration::from_millis(2000),
            duration_estimates,
            overhead_factor: 1.2,
        }
    }
}

impl RealtimeConfig {
    /// Set the progress broadcast interval
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Estimated total duration for a set of disciplines
    pub fn estimate(&self, disciplines: &[Discipline]) -> Duration {
        let total: f64 = disciplines
            .iter()
            .filter_map(|d| self.duration_estimates.get(d))
            .map(Duration::as_secs_f64)
            .sum();
        Duration::try_from_secs_f64(total * self.overhead_factor).unwrap_or(Duration::MAX)
    }
}
