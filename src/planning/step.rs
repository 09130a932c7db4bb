use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_retryable() -> bool {
    true
}

/// One unit of work in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStep {
    pub id: String,

    #[serde(alias = "tool")]
    pub tool_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Values of the form `${step}` or `${step.field}` refer to an earlier step's output.
    #[serde(default)]
    pub parameters: Map<String, Value>,

    #[serde(default, alias = "deps")]
    pub depends_on: BTreeSet<String>,

    #[serde(default = "default_retryable")]
    pub retryable: bool,

    #[serde(default)]
    pub is_critical: bool,
}

impl TaskStep {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            description: None,
            parameters: Map::new(),
            depends_on: BTreeSet::new(),
            retryable: true,
            is_critical: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn depends_on<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(steps.into_iter().map(Into::into));
        self
    }

    pub fn critical(mut self) -> Self {
        self.is_critical = true;
        self
    }

    pub fn not_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }
}
