use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::{
    execution::{
        context::ExecutionContext,
        executor::StepExecutor,
        result::{RollbackEntry, RollbackResult, RollbackStatus, StepResult},
    },
    planning::ValidatedPlan,
};

/// Undoes succeeded steps, newest first, through their compensating tools.
pub struct RollbackCoordinator {
    executor: Arc<StepExecutor>,
}

impl RollbackCoordinator {
    pub fn new(executor: Arc<StepExecutor>) -> Self {
        Self { executor }
    }

    /// `steps` must be in completion order. Keeps going past failed compensations.
    pub async fn rollback(
        &self,
        steps: &[StepResult],
        plan: &ValidatedPlan,
        context: &ExecutionContext,
    ) -> RollbackResult {
        let mut entries = Vec::new();

        for step in steps.iter().rev().filter(|s| s.is_succeeded()) {
            let entry = self.undo(step, plan, context).await;
            match &entry.error {
                None => info!(step_id = %step.step_id, compensator = ?entry.compensating_tool, "step compensated"),
                Some(error) => warn!(step_id = %step.step_id, %error, "step left in place"),
            }
            entries.push(entry);
        }
        let result = RollbackResult::new(entries);

        info!(
            plan_id = %plan.id(),
            entries = result.entries.len(),
            complete = result.is_complete(),
            "rollback finished"
        );
        result
    }

    async fn undo(&self, step: &StepResult, plan: &ValidatedPlan, context: &ExecutionContext) -> RollbackEntry {
        let mut entry = RollbackEntry {
            step_id: step.step_id.clone(),
            tool_name: step.tool_name.clone(),
            compensating_tool: None,
            status: RollbackStatus::NotReversible,
            error: None,
        };

        let compensator_name = plan
            .tool(&step.tool_name)
            .filter(|tool| tool.reversible)
            .and_then(|tool| tool.compensating_tool.clone());
        let Some(compensator_name) = compensator_name else {
            entry.error = Some(format!("tool `{}` is not reversible", step.tool_name));
            return entry;
        };
        entry.compensating_tool = Some(compensator_name.clone());

        let Some(compensator) = plan.tool(&compensator_name) else {
            entry.error = Some(format!("compensating tool `{compensator_name}` is not registered"));
            return entry;
        };

        let parameters = compensation_parameters(step);
        match self
            .executor
            .compensate(&step.step_id, compensator, &parameters, context)
            .await
        {
            Ok(_) => entry.status = RollbackStatus::Compensated,
            Err(e) => entry.error = Some(e.to_string()),
        }
        entry
    }
}

/// The parameters the step ran with, overlaid by the fields it returned, plus `compensates`.
pub fn compensation_parameters(step: &StepResult) -> Map<String, Value> {
    let mut parameters = step.parameters.clone();
    if let Some(Value::Object(output)) = &step.output {
        parameters.extend(output.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    parameters.insert("compensates".to_string(), Value::String(step.step_id.clone()));
    parameters
}
