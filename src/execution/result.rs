use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{engine::state::ExecutionState, error::ToolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Outcome of one step. Created once by the executor and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub tool_name: String,
    pub status: StepStatus,

    /// Data available to dependent steps; present iff succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Present iff failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,

    /// Zero only for skipped steps.
    pub attempts: u32,

    /// Parameters after reference resolution, kept for rollback.
    #[serde(default)]
    pub parameters: Map<String, Value>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StepResult {
    pub fn succeeded(
        step_id: &str,
        tool_name: &str,
        parameters: Map<String, Value>,
        output: Value,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            step_id: step_id.to_string(),
            tool_name: tool_name.to_string(),
            status: StepStatus::Succeeded,
            output: Some(output),
            error: None,
            skip_reason: None,
            attempts,
            parameters,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(
        step_id: &str,
        tool_name: &str,
        parameters: Map<String, Value>,
        error: ToolError,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            step_id: step_id.to_string(),
            tool_name: tool_name.to_string(),
            status: StepStatus::Failed,
            output: None,
            error: Some(error),
            skip_reason: None,
            attempts,
            parameters,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn skipped(step_id: &str, tool_name: &str, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.to_string(),
            tool_name: tool_name.to_string(),
            status: StepStatus::Skipped,
            output: None,
            error: None,
            skip_reason: Some(reason.into()),
            attempts: 0,
            parameters: Map::new(),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverallStatus {
    Succeeded,
    Failed,
    RolledBack,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RollbackStatus {
    Compensated,
    NotReversible,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackEntry {
    pub step_id: String,
    pub tool_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub compensating_tool: Option<String>,

    pub status: RollbackStatus,

    /// Why the step could not be undone, when a compensator failed or is missing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Best-effort undo report, in the order compensators were considered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    pub entries: Vec<RollbackEntry>,
    /// True when every succeeded step was compensated.
    pub complete: bool,
}

impl RollbackResult {
    pub fn new(entries: Vec<RollbackEntry>) -> Self {
        let complete = entries
            .iter()
            .all(|e| e.status == RollbackStatus::Compensated);
        Self { entries, complete }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn compensated(&self) -> impl Iterator<Item = &RollbackEntry> + '_ {
        self.entries
            .iter()
            .filter(|e| e.status == RollbackStatus::Compensated)
    }

    pub fn not_reversible(&self) -> impl Iterator<Item = &RollbackEntry> + '_ {
        self.entries
            .iter()
            .filter(|e| e.status == RollbackStatus::NotReversible)
    }
}

/// Outcome of running a whole plan. Finalized when the engine returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: String,
    pub plan_id: String,
    pub overall_status: OverallStatus,
    /// Final state; `PartiallyFailed` flags non-critical failures under a succeeded status.
    pub state: ExecutionState,
    /// Completion order.
    pub steps: Vec<StepResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_result: Option<RollbackResult>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn has_partial_failures(&self) -> bool {
        self.overall_status == OverallStatus::Succeeded && self.steps.iter().any(StepResult::is_failed)
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> + '_ {
        self.steps.iter().filter(|s| s.is_failed())
    }
}
