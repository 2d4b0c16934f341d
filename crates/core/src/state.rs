//! Bootstrap run state machine.
//!
//! ```text
//! Planning -> Executing -> Verifying -> Ready
//!                 |            |-> PartiallyComplete
//!                 |            `-> Failed
//!                 |-> PartiallyComplete
//!                 `-> Failed
//! ```
//!
//! `Planning -> Failed` covers a run cancelled before any step started.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Process exit code for a `Ready` cluster (and for a successful dry run).
pub const EXIT_READY: u8 = 0;
/// Process exit code for a `Failed` run.
pub const EXIT_FAILED: u8 = 1;
/// Process exit code for a `PartiallyComplete` run.
pub const EXIT_PARTIALLY_COMPLETE: u8 = 2;
/// Process exit code for a topology rejected before execution.
pub const EXIT_INVALID_TOPOLOGY: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapState {
    Planning,
    Executing,
    Verifying,
    Ready,
    Failed,
    PartiallyComplete,
}

impl BootstrapState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::PartiallyComplete => "partially_complete",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::PartiallyComplete)
    }

    pub fn can_transition_to(&self, next: BootstrapState) -> bool {
        use BootstrapState::*;
        matches!(
            (*self, next),
            (Planning, Executing)
                | (Planning, Failed)
                | (Executing, Verifying)
                | (Executing, Failed)
                | (Executing, PartiallyComplete)
                | (Verifying, Ready)
                | (Verifying, PartiallyComplete)
                | (Verifying, Failed)
        )
    }

    /// Validated transition.
    pub fn transition_to(self, next: BootstrapState) -> Result<BootstrapState, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidTransition {
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }

    /// Exit code for terminal states; `None` while the run is in progress.
    pub fn exit_code(&self) -> Option<u8> {
        match self {
            Self::Ready => Some(EXIT_READY),
            Self::Failed => Some(EXIT_FAILED),
            Self::PartiallyComplete => Some(EXIT_PARTIALLY_COMPLETE),
            Self::Planning | Self::Executing | Self::Verifying => None,
        }
    }
}
