//! Per-cycle outcome reports.
//!
//! Every orchestrator iteration produces a `CycleReport`, so that "nothing
//! happened" is always distinguishable from a hang.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What woke the orchestrator up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// First iteration of a dev session
    Startup,

    /// A debounced batch of file events
    FileChanges,

    /// An explicit build/sync/deploy request
    Intent,
}

/// What happened to one artifact during a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ArtifactOutcome {
    /// Built by the external builder
    Built { tag: String },

    /// Served from the build cache unchanged
    Cached { tag: String },

    /// Served from the build cache under a fresh tag
    Retagged { tag: String },

    /// Files copied into the running container
    Synced { files: usize },

    /// Not attempted because a dependency failed
    Skipped { dependency: String },

    /// Build or sync failed
    Failed { error: String },
}

impl ArtifactOutcome {
    /// Whether the artifact has a usable result from this cycle
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Built { .. } | Self::Cached { .. } | Self::Retagged { .. } | Self::Synced { .. }
        )
    }
}

/// Outcome of a test or deploy phase
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum PhaseOutcome {
    /// Phase was not needed this cycle
    #[default]
    NotRun,

    /// Phase ran and succeeded
    Succeeded,

    /// Phase was needed but withheld
    Skipped { reason: String },

    /// Phase ran and failed
    Failed { error: String },
}

/// Summary of one orchestrator iteration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Dev iteration number; no-op cycles do not advance it
    pub iteration: u64,

    /// What started the cycle
    pub trigger: Trigger,

    /// When the cycle started
    pub started_at: DateTime<Utc>,

    /// Per-artifact outcome
    pub artifacts: BTreeMap<String, ArtifactOutcome>,

    /// Test phase outcome
    pub test: PhaseOutcome,

    /// Deploy phase outcome
    pub deploy: PhaseOutcome,

    /// Non-fatal errors surfaced during the cycle
    pub errors: Vec<String>,

    /// Time taken in milliseconds
    pub duration_ms: Option<u64>,
}

impl CycleReport {
    /// Start a report for a new cycle
    pub fn new(iteration: u64, trigger: Trigger) -> Self {
        Self {
            iteration,
            trigger,
            started_at: Utc::now(),
            artifacts: BTreeMap::new(),
            test: PhaseOutcome::NotRun,
            deploy: PhaseOutcome::NotRun,
            errors: Vec::new(),
            duration_ms: None,
        }
    }

    /// Record the outcome for an artifact
    pub fn record(&mut self, name: impl Into<String>, outcome: ArtifactOutcome) {
        self.artifacts.insert(name.into(), outcome);
    }

    /// Record a non-fatal error
    pub fn with_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Set the duration
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Whether the cycle did nothing at all
    pub fn is_noop(&self) -> bool {
        self.artifacts.is_empty()
            && self.test == PhaseOutcome::NotRun
            && self.deploy == PhaseOutcome::NotRun
            && self.errors.is_empty()
    }

    /// Whether every attempted artifact succeeded
    pub fn all_succeeded(&self) -> bool {
        self.artifacts.values().all(ArtifactOutcome::is_success)
    }

    /// Outcome for one artifact
    pub fn outcome(&self, name: &str) -> Option<&ArtifactOutcome> {
        self.artifacts.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_report() {
        let report = CycleReport::new(0, Trigger::FileChanges);
        assert!(report.is_noop());
        assert!(report.all_succeeded());
    }

    #[test]
    fn test_report_serialization() {
        let mut report = CycleReport::new(3, Trigger::Intent);
        report.record("app", ArtifactOutcome::Built { tag: "app:abc".to_string() });
        report.record(
            "web",
            ArtifactOutcome::Skipped {
                dependency: "base".to_string(),
            },
        );
        report.deploy = PhaseOutcome::Skipped {
            reason: "build failed".to_string(),
        };

        let json = serde_json::to_string(&report).unwrap();
        let parsed: CycleReport = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.iteration, 3);
        assert!(!parsed.all_succeeded());
        assert!(!parsed.is_noop());
        assert!(json.contains("\"outcome\":\"skipped\""));
    }
}
