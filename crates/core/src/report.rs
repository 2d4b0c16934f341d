//! Run report handed to operators at the end of a bootstrap run.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::records::{FailureKind, StepOutcome, StepRecord};
use crate::state::BootstrapState;
use crate::types::Timestamp;

/// Everything one run did, in plan order. Written as JSON by `--report`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// UUID v7, so reports sort by start time.
    pub run_id: Uuid,
    /// Terminal state of the run.
    pub state: BootstrapState,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    /// One record per planned step, each with a terminal outcome.
    pub steps: Vec<StepRecord>,
    /// Shards the router failed to report during verification.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unverified_shards: Vec<String>,
}

/// Outcome counts across all steps of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepSummary {
    pub succeeded: usize,
    pub skipped_already_done: usize,
    pub failed: usize,
    /// Always zero for a finished run.
    pub pending: usize,
}

impl RunReport {
    /// Count steps by outcome.
    pub fn summary(&self) -> StepSummary {
        let mut summary = StepSummary::default();
        for step in &self.steps {
            match step.outcome {
                StepOutcome::Pending => summary.pending += 1,
                StepOutcome::Succeeded => summary.succeeded += 1,
                StepOutcome::Failed { .. } => summary.failed += 1,
                StepOutcome::SkippedAlreadyDone => summary.skipped_already_done += 1,
            }
        }
        summary
    }

    /// Failed steps that were not merely collateral of an earlier failure.
    pub fn blocking_steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|s| {
            matches!(
                s.outcome.failure_kind(),
                Some(kind) if kind != FailureKind::PrerequisiteFailed && kind != FailureKind::Aborted
            )
        })
    }

    /// Process exit code for the final state.
    pub fn exit_code(&self) -> u8 {
        self.state
            .exit_code()
            .unwrap_or(crate::state::EXIT_FAILED)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::planner::{StepId, StepKind};

    fn record(id: usize, outcome: StepOutcome) -> StepRecord {
        StepRecord {
            step_id: StepId(id),
            kind: StepKind::Initiate,
            action: format!("initiate g{id}"),
            target: "localhost:1".to_string(),
            mandatory: true,
            started_at: None,
            finished_at: None,
            attempts: 1,
            outcome,
        }
    }

    #[test]
    fn summary_and_blocking_steps() {
        let report = RunReport {
            run_id: Uuid::now_v7(),
            state: BootstrapState::Failed,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            steps: vec![
                record(0, StepOutcome::Succeeded),
                record(1, StepOutcome::failed(FailureKind::NodeUnreachable, "timed out")),
                record(2, StepOutcome::failed(FailureKind::PrerequisiteFailed, "#1 failed")),
                record(3, StepOutcome::SkippedAlreadyDone),
            ],
            unverified_shards: vec![],
        };

        assert_eq!(
            report.summary(),
            StepSummary {
                succeeded: 1,
                skipped_already_done: 1,
                failed: 2,
                pending: 0,
            }
        );
        let blocking: Vec<StepId> = report.blocking_steps().map(|s| s.step_id).collect();
        assert_eq!(blocking, vec![StepId(1)]);
        assert_eq!(report.exit_code(), 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"], "failed");
        assert!(json.get("unverified_shards").is_none());
    }
}
