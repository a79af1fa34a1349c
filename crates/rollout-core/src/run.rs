use crate::error::Result;
use crate::gate::GateReport;
use crate::health::HealthReport;
use crate::io;
use crate::keys::KeyBackupOutcome;
use crate::paths;
use crate::propagation::PropagationReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    PartialFailure,
    Failure,
    Cancelled,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::Failure => 1,
            RunOutcome::PartialFailure => 2,
            RunOutcome::Cancelled => 130,
        }
    }

    /// Keep the more severe of two outcomes.
    pub fn worsen(self, other: RunOutcome) -> RunOutcome {
        fn rank(o: RunOutcome) -> u8 {
            match o {
                RunOutcome::Success => 0,
                RunOutcome::PartialFailure => 1,
                RunOutcome::Failure => 2,
                RunOutcome::Cancelled => 3,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Success => write!(f, "success"),
            RunOutcome::PartialFailure => write!(f, "partial failure"),
            RunOutcome::Failure => write!(f, "failure"),
            RunOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum PropagationStage {
    Completed(PropagationReport),
    DiscoveryFailed { reason: String },
    Skipped { reason: String },
}

/// One deployment attempt, start to finish.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationRun {
    pub id: Uuid,
    pub environment: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    /// Release order.
    pub units: Vec<GateReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub propagation: Option<PropagationStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_backup: Option<KeyBackupOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl OrchestrationRun {
    pub fn start(environment: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            environment: environment.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: RunOutcome::Success,
            units: Vec::new(),
            propagation: None,
            key_backup: None,
            health: None,
            notes: Vec::new(),
        }
    }

    pub fn degrade(&mut self, to: RunOutcome, note: impl Into<String>) {
        self.outcome = self.outcome.worsen(to);
        self.notes.push(note.into());
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn unit(&self, id: &str) -> Option<&GateReport> {
        self.units.iter().find(|u| u.unit == id)
    }

    /// Append this run as one JSON line to the audit log.
    pub fn append_to_log(&self, root: &Path) -> Result<()> {
        let line = serde_json::to_string(self)?;
        io::append_line(&paths::runs_log_path(root), &line)?;
        info!(run = %self.id, environment = %self.environment, outcome = %self.outcome, "run recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn exit_codes() {
        assert_eq!(RunOutcome::Success.exit_code(), 0);
        assert_eq!(RunOutcome::Failure.exit_code(), 1);
        assert_eq!(RunOutcome::PartialFailure.exit_code(), 2);
        assert_eq!(RunOutcome::Cancelled.exit_code(), 130);
    }

    #[test]
    fn degrade_never_improves() {
        let mut run = OrchestrationRun::start("prod");
        run.degrade(RunOutcome::Failure, "gate timed out");
        run.degrade(RunOutcome::PartialFailure, "target conflict");
        assert_eq!(run.outcome, RunOutcome::Failure);
        assert_eq!(run.notes.len(), 2);
    }

    #[test]
    fn runs_append_as_json_lines() {
        let dir = TempDir::new().unwrap();
        let mut a = OrchestrationRun::start("prod");
        a.finish();
        a.append_to_log(dir.path()).unwrap();
        let mut b = OrchestrationRun::start("staging");
        b.finish();
        b.append_to_log(dir.path()).unwrap();

        let log = std::fs::read_to_string(dir.path().join(".rollout/runs.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> = log
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["environment"], "staging");
        assert_eq!(lines[0]["outcome"], "success");
        assert!(lines[0].get("health").is_none());
    }
}
