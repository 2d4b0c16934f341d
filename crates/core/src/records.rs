//! Step records: the only mutable state of a bootstrap run.
//!
//! [`StepLog`] holds one slot per planned step. A slot starts `pending` and
//! receives exactly one terminal record; a second completion is rejected.
//! Slots are write-once cells, so concurrent step tasks can complete their
//! own slots through a shared reference without a lock, and the snapshot
//! always comes back in plan order.

use std::sync::OnceLock;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::planner::{BootstrapPlan, StepId, StepKind};
use crate::types::Timestamp;

pub const OUTCOME_PENDING: &str = "pending";
pub const OUTCOME_SUCCEEDED: &str = "succeeded";
pub const OUTCOME_FAILED: &str = "failed";
pub const OUTCOME_SKIPPED_ALREADY_DONE: &str = "skipped_already_done";

/// Why a step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The prober timed out waiting for a node.
    NodeUnreachable,
    /// The cluster already holds a different configuration.
    ConflictingState,
    /// A retriable command failure that persisted past the retry bound.
    TransientCommandFailure,
    /// The node rejected the command outright.
    CommandRejected,
    /// The node kept answering health probes with protocol errors.
    ProbeFatal,
    /// A prerequisite step did not succeed.
    PrerequisiteFailed,
    /// The run was aborted or cancelled before the step finished.
    Aborted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodeUnreachable => "node_unreachable",
            Self::ConflictingState => "conflicting_state",
            Self::TransientCommandFailure => "transient_command_failure",
            Self::CommandRejected => "command_rejected",
            Self::ProbeFatal => "probe_fatal",
            Self::PrerequisiteFailed => "prerequisite_failed",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Pending,
    Succeeded,
    Failed { kind: FailureKind, reason: String },
    SkippedAlreadyDone,
}

impl StepOutcome {
    pub fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            reason: reason.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Succeeded now or found already done.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::SkippedAlreadyDone)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => OUTCOME_PENDING,
            Self::Succeeded => OUTCOME_SUCCEEDED,
            Self::Failed { .. } => OUTCOME_FAILED,
            Self::SkippedAlreadyDone => OUTCOME_SKIPPED_ALREADY_DONE,
        }
    }
}

/// One attempted initialization action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: StepId,
    pub kind: StepKind,
    pub action: String,
    pub target: String,
    pub mandatory: bool,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    /// Command attempts made by the executor (0 if it never ran).
    pub attempts: u32,
    pub outcome: StepOutcome,
}

struct StepSlot {
    pending: StepRecord,
    started_at: OnceLock<Timestamp>,
    terminal: OnceLock<StepRecord>,
}

impl StepSlot {
    fn snapshot(&self) -> StepRecord {
        match self.terminal.get() {
            Some(record) => record.clone(),
            None => StepRecord {
                started_at: self.started_at.get().copied(),
                ..self.pending.clone()
            },
        }
    }
}

/// Write-once record slots, one per planned step.
pub struct StepLog {
    /// Indexed by `StepId`.
    slots: Vec<StepSlot>,
    order: Vec<StepId>,
}

impl StepLog {
    pub fn new(plan: &BootstrapPlan) -> Self {
        let mut slots: Vec<StepSlot> = Vec::with_capacity(plan.len());
        for index in 0..plan.len() {
            let id = StepId(index);
            let Some(step) = plan.step(id) else { continue };
            slots.push(StepSlot {
                pending: StepRecord {
                    step_id: id,
                    kind: step.action.kind(),
                    action: step.action.label(),
                    target: step.target.clone(),
                    mandatory: step.mandatory,
                    started_at: None,
                    finished_at: None,
                    attempts: 0,
                    outcome: StepOutcome::Pending,
                },
                started_at: OnceLock::new(),
                terminal: OnceLock::new(),
            });
        }
        Self {
            slots,
            order: plan.order().to_vec(),
        }
    }

    fn slot(&self, id: StepId) -> Result<&StepSlot, CoreError> {
        self.slots.get(id.0).ok_or(CoreError::StepNotFound(id))
    }

    /// Stamp the start time. Later calls keep the first stamp.
    pub fn mark_started(&self, id: StepId) -> Result<(), CoreError> {
        let slot = self.slot(id)?;
        let _ = slot.started_at.set(Utc::now());
        Ok(())
    }

    /// Write the step's terminal record. Fails if one was already written.
    pub fn complete(
        &self,
        id: StepId,
        outcome: StepOutcome,
        attempts: u32,
    ) -> Result<StepRecord, CoreError> {
        if !outcome.is_terminal() {
            return Err(CoreError::OutcomeNotTerminal(id));
        }
        let slot = self.slot(id)?;
        let now = Utc::now();
        let record = StepRecord {
            started_at: Some(*slot.started_at.get_or_init(|| now)),
            finished_at: Some(now),
            attempts,
            outcome,
            ..slot.pending.clone()
        };
        slot.terminal
            .set(record.clone())
            .map_err(|_| CoreError::StepAlreadyRecorded(id))?;
        Ok(record)
    }

    pub fn outcome(&self, id: StepId) -> StepOutcome {
        self.slots
            .get(id.0)
            .and_then(|s| s.terminal.get())
            .map(|r| r.outcome.clone())
            .unwrap_or(StepOutcome::Pending)
    }

    pub fn is_complete(&self, id: StepId) -> bool {
        self.slots
            .get(id.0)
            .is_some_and(|s| s.terminal.get().is_some())
    }

    pub fn all_complete(&self) -> bool {
        self.slots.iter().all(|s| s.terminal.get().is_some())
    }

    /// Snapshot of every record in plan order.
    pub fn records(&self) -> Vec<StepRecord> {
        self.order
            .iter()
            .filter_map(|id| self.slots.get(id.0))
            .map(StepSlot::snapshot)
            .collect()
    }
}
