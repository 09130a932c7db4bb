use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::{
    engine::{confirmation::ImpactSummary, state::ExecutionState},
    error::ToolError,
    execution::result::OverallStatus,
};

/// Progress notification. Serialized with a `type` tag such as `step:started`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ExecutionEvent {
    #[serde(rename = "step:started")]
    StepStarted {
        plan_id: String,
        step_id: String,
        tool_name: String,
    },

    #[serde(rename = "step:completed")]
    StepCompleted {
        plan_id: String,
        step_id: String,
        attempts: u32,
    },

    #[serde(rename = "step:failed")]
    StepFailed {
        plan_id: String,
        step_id: String,
        attempts: u32,
        error: ToolError,
    },

    #[serde(rename = "step:skipped")]
    StepSkipped {
        plan_id: String,
        step_id: String,
        reason: String,
    },

    #[serde(rename = "plan:awaiting_confirmation")]
    PlanAwaitingConfirmation {
        plan_id: String,
        impact_summary: ImpactSummary,
    },

    #[serde(rename = "plan:rolling_back")]
    PlanRollingBack { plan_id: String, failed_step: String },

    #[serde(rename = "plan:completed")]
    PlanCompleted {
        plan_id: String,
        overall_status: OverallStatus,
        state: ExecutionState,
    },

    #[serde(rename = "plan:rejected")]
    PlanRejected { plan_id: String, reason: String },
}

impl ExecutionEvent {
    pub fn plan_id(&self) -> &str {
        match self {
            ExecutionEvent::StepStarted { plan_id, .. }
            | ExecutionEvent::StepCompleted { plan_id, .. }
            | ExecutionEvent::StepFailed { plan_id, .. }
            | ExecutionEvent::StepSkipped { plan_id, .. }
            | ExecutionEvent::PlanAwaitingConfirmation { plan_id, .. }
            | ExecutionEvent::PlanRollingBack { plan_id, .. }
            | ExecutionEvent::PlanCompleted { plan_id, .. }
            | ExecutionEvent::PlanRejected { plan_id, .. } => plan_id,
        }
    }

    /// The serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionEvent::StepStarted { .. } => "step:started",
            ExecutionEvent::StepCompleted { .. } => "step:completed",
            ExecutionEvent::StepFailed { .. } => "step:failed",
            ExecutionEvent::StepSkipped { .. } => "step:skipped",
            ExecutionEvent::PlanAwaitingConfirmation { .. } => "plan:awaiting_confirmation",
            ExecutionEvent::PlanRollingBack { .. } => "plan:rolling_back",
            ExecutionEvent::PlanCompleted { .. } => "plan:completed",
            ExecutionEvent::PlanRejected { .. } => "plan:rejected",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EventBusStats {
    pub published: u64,
    /// Events nobody was subscribed to.
    pub undelivered: u64,
}

/// Fan-out of execution events to any number of observers (chat stream, dashboard, tests).
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
    stats: RwLock<EventBusStats>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            stats: RwLock::new(EventBusStats::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Publishing never fails; events without subscribers are counted and dropped.
    pub async fn publish(&self, event: ExecutionEvent) {
        debug!(plan_id = %event.plan_id(), kind = event.kind(), "publishing event");
        let delivered = self.sender.send(event).is_ok();

        let mut stats = self.stats.write().await;
        stats.published += 1;
        if !delivered {
            stats.undelivered += 1;
        }
    }

    pub async fn stats(&self) -> EventBusStats {
        *self.stats.read().await
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
