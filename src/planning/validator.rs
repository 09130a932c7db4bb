use std::{
    collections::{BTreeSet, HashMap, HashSet},
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    error::PlanError,
    planning::{plan::TaskPlan, reference, step::TaskStep},
    tools::{Tool, ToolRegistry},
};

/// A plan that passed every structural check, with its execution order precomputed.
///
/// Nothing reaches the scheduler without going through this wrapper.
#[derive(Debug, Clone)]
pub struct ValidatedPlan {
    plan: TaskPlan,
    order: Vec<String>,
    tools: HashMap<String, Arc<Tool>>,
    required_permissions: BTreeSet<String>,
    fingerprint: u64,
    validated_at: DateTime<Utc>,
}

impl ValidatedPlan {
    pub fn plan(&self) -> &TaskPlan {
        &self.plan
    }

    pub fn id(&self) -> &str {
        &self.plan.id
    }

    /// Topological order, ascending step id among independent steps.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn step(&self, id: &str) -> Option<&TaskStep> {
        self.plan.step(id)
    }

    /// The tool a step's name (or a registered compensator's name) resolved to.
    pub fn tool(&self, name: &str) -> Option<&Arc<Tool>> {
        self.tools.get(name)
    }

    pub fn step_tool(&self, step: &TaskStep) -> Option<&Arc<Tool>> {
        self.tools.get(&step.tool_name)
    }

    /// Plan-declared permissions plus every permission its tools require.
    pub fn required_permissions(&self) -> &BTreeSet<String> {
        &self.required_permissions
    }

    /// Hash of the plan content, used to bind approvals to this exact plan.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn validated_at(&self) -> DateTime<Utc> {
        self.validated_at
    }
}

#[derive(Debug, Clone)]
pub struct PlanValidator {
    registry: Arc<ToolRegistry>,
}

impl PlanValidator {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Runs the checks in order and stops at the first violation.
    pub fn validate(&self, plan: &TaskPlan) -> Result<ValidatedPlan, PlanError> {
        let result = self.check(plan);
        match &result {
            Ok(validated) => debug!(plan_id = %plan.id, order = ?validated.order, "plan validated"),
            Err(e) => warn!(plan_id = %plan.id, error = %e, "plan rejected"),
        }
        result
    }

    /// Validates the wrapped plan again, e.g. against a registry that may have changed.
    pub fn revalidate(&self, validated: &ValidatedPlan) -> Result<ValidatedPlan, PlanError> {
        self.validate(&validated.plan)
    }

    fn check(&self, plan: &TaskPlan) -> Result<ValidatedPlan, PlanError> {
        let mut steps: HashMap<&str, &TaskStep> = HashMap::new();
        for step in &plan.steps {
            if steps.insert(step.id.as_str(), step).is_some() {
                return Err(PlanError::DuplicateStep {
                    step_id: step.id.clone(),
                });
            }
        }

        let mut tools = HashMap::new();
        for step in &plan.steps {
            let tool = self
                .registry
                .lookup(&step.tool_name)
                .map_err(|_| PlanError::UnknownTool {
                    step_id: step.id.clone(),
                    tool_name: step.tool_name.clone(),
                })?;
            tools.insert(step.tool_name.clone(), tool);
        }

        for step in &plan.steps {
            if let Some(missing) = step.depends_on.iter().find(|dep| !steps.contains_key(dep.as_str())) {
                return Err(PlanError::DanglingDependency {
                    step_id: step.id.clone(),
                    missing_dep: missing.clone(),
                });
            }
        }

        if let Some(cycle) = find_cycle(&steps) {
            return Err(PlanError::CyclicDependency { cycle });
        }

        for step in &plan.steps {
            check_parameters(step, &tools[&step.tool_name], &steps)?;
        }

        let compensators: Vec<Arc<Tool>> = tools
            .values()
            .filter_map(|tool| tool.compensating_tool.as_deref())
            .filter_map(|name| self.registry.lookup(name).ok())
            .collect();
        for compensator in compensators {
            tools.entry(compensator.name.clone()).or_insert(compensator);
        }

        let mut required_permissions = plan.required_permissions.clone();
        for step in &plan.steps {
            if let Some(permission) = &tools[&step.tool_name].required_permission {
                required_permissions.insert(permission.clone());
            }
        }

        Ok(ValidatedPlan {
            order: topological_order(&steps),
            tools,
            required_permissions,
            fingerprint: fingerprint(plan),
            validated_at: Utc::now(),
            plan: plan.clone(),
        })
    }
}

fn fingerprint(plan: &TaskPlan) -> u64 {
    let mut hasher = DefaultHasher::new();
    serde_json::to_vec(plan).unwrap_or_default().hash(&mut hasher);
    hasher.finish()
}

/// Depth-first search with a "visiting" set. Returns the path from the first visit of the
/// repeated node back to it, e.g. `[s1, s2, s1]`.
fn find_cycle(steps: &HashMap<&str, &TaskStep>) -> Option<Vec<String>> {
    fn visit<'a>(
        id: &'a str,
        steps: &HashMap<&'a str, &'a TaskStep>,
        visiting: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        if done.contains(id) {
            return None;
        }
        if let Some(pos) = visiting.iter().position(|v| *v == id) {
            let mut cycle: Vec<String> = visiting[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Some(cycle);
        }

        let step: &'a TaskStep = steps[id];
        visiting.push(id);
        for dep in &step.depends_on {
            if let Some(cycle) = visit(dep.as_str(), steps, visiting, done) {
                return Some(cycle);
            }
        }
        visiting.pop();
        done.insert(id);
        None
    }

    let mut ids: Vec<&str> = steps.keys().copied().collect();
    ids.sort_unstable();

    let mut done = HashSet::new();
    for id in ids {
        let mut visiting = Vec::new();
        if let Some(cycle) = visit(id, steps, &mut visiting, &mut done) {
            return Some(cycle);
        }
    }
    None
}

/// Kahn's algorithm; ready steps are taken in ascending id order.
fn topological_order(steps: &HashMap<&str, &TaskStep>) -> Vec<String> {
    let mut remaining: HashMap<&str, usize> = steps
        .iter()
        .map(|(id, step)| (*id, step.depends_on.len()))
        .collect();
    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(id) = ready.pop_first() {
        remaining.remove(id);
        order.push(id.to_string());
        for (other, step) in steps {
            if step.depends_on.contains(id) {
                if let Some(n) = remaining.get_mut(other) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(*other);
                    }
                }
            }
        }
    }
    order
}

/// Every step reachable through `depends_on`.
fn ancestors<'a>(step: &'a TaskStep, steps: &HashMap<&'a str, &'a TaskStep>) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    let mut stack: Vec<&str> = step.depends_on.iter().map(String::as_str).collect();
    while let Some(id) = stack.pop() {
        if seen.insert(id) {
            if let Some(&dep) = steps.get(id) {
                stack.extend(dep.depends_on.iter().map(String::as_str));
            }
        }
    }
    seen
}

fn check_parameters(
    step: &TaskStep,
    tool: &Tool,
    steps: &HashMap<&str, &TaskStep>,
) -> Result<(), PlanError> {
    for name in tool.parameter_schema.required_params() {
        if !step.parameters.contains_key(name) {
            return Err(PlanError::MissingParameter {
                step_id: step.id.clone(),
                param_name: name.to_string(),
            });
        }
    }

    let prior = ancestors(step, steps);
    for (name, value) in &step.parameters {
        let refs = reference::references_in(value);
        if let Some(bad) = refs.iter().find(|r| !prior.contains(r.step_id.as_str())) {
            return Err(PlanError::UnresolvedReference {
                step_id: step.id.clone(),
                param_name: name.clone(),
                reference: bad.to_string(),
            });
        }

        if refs.is_empty() {
            if let Some(spec) = tool.parameter_schema.get(name) {
                spec.check(value).map_err(|reason| PlanError::InvalidParameter {
                    step_id: step.id.clone(),
                    param_name: name.clone(),
                    reason,
                })?;
            }
        }
    }

    Ok(())
}
