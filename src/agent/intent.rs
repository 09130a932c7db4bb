use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::Result, planning::TaskPlan, tools::Tool};

/// A structured request from the conversation layer, e.g. "create a course and enroll the class".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    /// Short goal, such as `create_course`.
    pub goal: String,

    /// Values extracted from the request.
    #[serde(default)]
    pub parameters: Map<String, Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Free-form restrictions, e.g. "do not notify students".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<String>,

    /// Lets the planner use tools outside the handling agent's domain.
    #[serde(default)]
    pub cross_domain: bool,
}

impl Intent {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_constraints(mut self, constraints: impl Into<String>) -> Self {
        self.constraints = Some(constraints.into());
        self
    }

    pub fn cross_domain(mut self) -> Self {
        self.cross_domain = true;
        self
    }
}

/// Turns an intent into a plan over the offered tools. Failures surface as `Error::Planner`.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, intent: &Intent, tools: &[Arc<Tool>]) -> Result<TaskPlan>;
}
