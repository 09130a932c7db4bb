use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use crate::{
    execution::result::{StepResult, StepStatus},
    planning::TaskStep,
};

/// Step results of one execution in completion order. Each step is written once.
#[derive(Debug, Default)]
pub struct ExecutionLedger {
    results: Vec<StepResult>,
    index: HashMap<String, usize>,
    outputs: HashMap<String, Value>,
}

impl ExecutionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `result`. A second result for the same step is dropped.
    pub fn record(&mut self, result: StepResult) -> bool {
        if self.index.contains_key(&result.step_id) {
            warn!(step_id = %result.step_id, "step already recorded, ignoring");
            return false;
        }
        if let (StepStatus::Succeeded, Some(output)) = (result.status, &result.output) {
            self.outputs.insert(result.step_id.clone(), output.clone());
        }
        self.index.insert(result.step_id.clone(), self.results.len());
        self.results.push(result);
        true
    }

    pub fn get(&self, step_id: &str) -> Option<&StepResult> {
        self.index.get(step_id).map(|&i| &self.results[i])
    }

    /// Outputs of succeeded steps, for reference resolution.
    pub fn outputs(&self) -> &HashMap<String, Value> {
        &self.outputs
    }

    /// First dependency of `step` that has not succeeded.
    pub fn blocked_by<'a>(&self, step: &'a TaskStep) -> Option<&'a str> {
        step.depends_on
            .iter()
            .find(|dep| !self.get(dep).is_some_and(StepResult::is_succeeded))
            .map(String::as_str)
    }

    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    pub fn has_failures(&self) -> bool {
        self.results.iter().any(StepResult::is_failed)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn into_results(self) -> Vec<StepResult> {
        self.results
    }
}
