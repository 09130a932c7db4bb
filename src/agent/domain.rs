use std::sync::Arc;

use tracing::info;

use crate::{
    agent::intent::{Intent, Planner},
    engine::{Approval, ExecutionEngine, ExecutionOutcome},
    error::Result,
    execution::{ExecutionContext, ExecutionResult},
    tools::{Tool, ToolRegistry},
};

/// A user/course/content/analytics agent. Plans with its own tools, runs on the shared engine.
pub struct DomainAgent {
    name: String,
    domain: String,
    engine: Arc<ExecutionEngine>,
    registry: Arc<ToolRegistry>,
    planner: Arc<dyn Planner>,
}

impl DomainAgent {
    pub fn new(
        name: impl Into<String>,
        domain: impl Into<String>,
        engine: Arc<ExecutionEngine>,
        registry: Arc<ToolRegistry>,
        planner: Arc<dyn Planner>,
    ) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            engine,
            registry,
            planner,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Tools registered under this agent's domain.
    pub fn tools(&self) -> Vec<Arc<Tool>> {
        self.registry.by_domain(&self.domain).cloned().collect()
    }

    /// Plans the intent and submits the plan. Cross-domain intents see the whole registry.
    pub async fn handle(&self, intent: &Intent, context: &ExecutionContext) -> Result<ExecutionOutcome> {
        let tools = if intent.cross_domain {
            self.registry.tools().cloned().collect()
        } else {
            self.tools()
        };

        let plan = self.planner.plan(intent, &tools).await?;
        info!(
            agent = %self.name,
            goal = %intent.goal,
            plan_id = %plan.id,
            steps = plan.steps.len(),
            "intent planned"
        );
        self.engine.submit(&plan, context).await
    }

    pub async fn approve(
        &self,
        plan_id: &str,
        approval: Approval,
        context: &ExecutionContext,
    ) -> Result<ExecutionResult> {
        self.engine.approve(plan_id, approval, context).await
    }

    pub async fn reject(&self, plan_id: &str, reason: impl Into<String>) -> Result<()> {
        self.engine.reject(plan_id, reason).await
    }
}
