use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::planning::validator::ValidatedPlan;

/// Steps with no dependency on each other. May run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionBatch {
    pub index: usize,
    /// Ascending step id, the order used when running sequentially.
    pub step_ids: Vec<String>,
}

/// Layers a validated plan into batches, Kahn style.
#[derive(Debug, Default, Clone)]
pub struct DependencyScheduler;

impl DependencyScheduler {
    /// A step lands in the batch after the latest of its dependencies.
    pub fn order(&self, plan: &ValidatedPlan) -> Vec<ExecutionBatch> {
        let mut layer_of: HashMap<&str, usize> = HashMap::new();
        let mut batches: Vec<ExecutionBatch> = Vec::new();

        // The topological order guarantees every dependency already has a layer.
        for id in plan.order() {
            let Some(step) = plan.step(id) else {
                continue;
            };
            let layer = step
                .depends_on
                .iter()
                .filter_map(|dep| layer_of.get(dep.as_str()))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            layer_of.insert(id.as_str(), layer);

            while batches.len() <= layer {
                batches.push(ExecutionBatch {
                    index: batches.len(),
                    step_ids: Vec::new(),
                });
            }
            batches[layer].step_ids.push(id.clone());
        }

        for batch in &mut batches {
            batch.step_ids.sort();
        }

        debug!(plan_id = %plan.id(), batches = batches.len(), "plan scheduled");
        batches
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{Map, Value};

    use super::*;
    use crate::{
        error::ToolError,
        execution::context::ExecutionContext,
        planning::{PlanValidator, TaskPlan, TaskStep},
        tools::{Tool, ToolHandler, ToolOutput, ToolRegistry},
    };

    struct Noop;

    #[async_trait]
    impl ToolHandler for Noop {
        async fn apply(
            &self,
            _parameters: &Map<String, Value>,
            _context: &ExecutionContext,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::success(Value::Null))
        }
    }

    fn validate(plan: &TaskPlan) -> ValidatedPlan {
        let mut registry = ToolRegistry::new();
        registry.register(Tool::new("noop", Arc::new(Noop))).unwrap();
        PlanValidator::new(Arc::new(registry)).validate(plan).unwrap()
    }

    fn ids(batches: &[ExecutionBatch]) -> Vec<Vec<&str>> {
        batches
            .iter()
            .map(|b| b.step_ids.iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn test_diamond_layers() {
        let plan = TaskPlan::new(
            "p",
            vec![
                TaskStep::new("d", "noop").depends_on(["b", "c"]),
                TaskStep::new("c", "noop").depends_on(["a"]),
                TaskStep::new("b", "noop").depends_on(["a"]),
                TaskStep::new("a", "noop"),
            ],
        );

        let batches = DependencyScheduler.order(&validate(&plan));
        assert_eq!(ids(&batches), vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
        assert_eq!(batches[2].index, 2);
    }

    #[test]
    fn test_every_step_is_after_its_dependencies() {
        let plan = TaskPlan::new(
            "p",
            vec![
                TaskStep::new("s1", "noop"),
                TaskStep::new("s2", "noop"),
                TaskStep::new("s3", "noop").depends_on(["s1"]),
                TaskStep::new("s4", "noop").depends_on(["s3", "s2"]),
                TaskStep::new("s5", "noop").depends_on(["s1"]),
                TaskStep::new("s6", "noop").depends_on(["s4", "s5"]),
            ],
        );

        let batches = DependencyScheduler.order(&validate(&plan));
        let batch_of: HashMap<&str, usize> = batches
            .iter()
            .flat_map(|b| b.step_ids.iter().map(move |id| (id.as_str(), b.index)))
            .collect();

        assert_eq!(batch_of.len(), plan.steps.len());
        for step in &plan.steps {
            for dep in &step.depends_on {
                assert!(batch_of[step.id.as_str()] > batch_of[dep.as_str()]);
            }
        }
    }

    #[test]
    fn test_independent_steps_share_first_batch() {
        let plan = TaskPlan::new(
            "p",
            vec![TaskStep::new("b", "noop"), TaskStep::new("a", "noop")],
        );
        assert_eq!(ids(&DependencyScheduler.order(&validate(&plan))), vec![vec!["a", "b"]]);
    }

    #[test]
    fn test_empty_plan_has_no_batches() {
        let plan = TaskPlan::new("p", vec![]);
        assert!(DependencyScheduler.order(&validate(&plan)).is_empty());
    }
}
