use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one plan inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionState {
    Created,
    Validating,
    ValidationFailed,
    AwaitingConfirmation,
    Scheduled,
    Executing,
    Succeeded,
    /// Finished with at least one non-critical failure.
    PartiallyFailed,
    RollingBack,
    RolledBack,
    /// A critical step failed and rollback is disabled.
    Failed,
    Cancelled,
    /// Rejected, or the confirmation window ran out.
    Aborted,
}

impl ExecutionState {
    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Created, Validating)
                | (Validating, ValidationFailed | AwaitingConfirmation | Scheduled)
                | (AwaitingConfirmation, Scheduled | Aborted | ValidationFailed)
                | (Scheduled, Executing | Cancelled)
                | (Executing, Succeeded | PartiallyFailed | RollingBack | Failed | Cancelled)
                | (RollingBack, RolledBack)
        )
    }

    pub fn is_terminal(self) -> bool {
        use ExecutionState::*;
        matches!(
            self,
            ValidationFailed | Succeeded | PartiallyFailed | RolledBack | Failed | Cancelled | Aborted
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
