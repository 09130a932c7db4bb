use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::ToolError, execution::context::ExecutionContext, tools::schema::ParameterSchema};

/// What a tool does to the system. Used by the confirmation gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Read,
    Write,
    Delete,
    Bulk,
}

impl ToolCategory {
    pub fn is_destructive(&self) -> bool {
        matches!(self, ToolCategory::Delete | ToolCategory::Bulk)
    }
}

/// Name fragments that mark a tool as destructive when it declares no category.
const DESTRUCTIVE_NAME_HINTS: &[&str] = &["delete", "remove", "purge", "drop", "bulk", "mass", "batch"];

/// The `{success, data, error}` shape every tool returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,

    #[serde(default)]
    pub data: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
        }
    }

    /// Folds a reported failure into the error channel.
    pub fn into_result(self) -> Result<Value, ToolError> {
        if self.success {
            Ok(self.data)
        } else {
            Err(ToolError::execution(
                self.error.unwrap_or_else(|| "tool reported failure".to_string()),
            ))
        }
    }
}

/// Domain capability behind a tool. Implemented by the user/course/content services.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn apply(
        &self,
        parameters: &Map<String, Value>,
        context: &ExecutionContext,
    ) -> Result<ToolOutput, ToolError>;
}

/// A named, permissioned capability a plan step can invoke.
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub domain: Option<String>,
    pub parameter_schema: ParameterSchema,
    pub required_permission: Option<String>,
    pub reversible: bool,
    pub compensating_tool: Option<String>,
    pub category: Option<ToolCategory>,
    /// False when two invocations must not touch the same entity at once.
    pub concurrency_safe: bool,
    /// Parameter whose value names the entity this tool mutates.
    pub entity_param: Option<String>,
    handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("required_permission", &self.required_permission)
            .field("reversible", &self.reversible)
            .field("compensating_tool", &self.compensating_tool)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

impl Tool {
    pub fn new(name: impl Into<String>, handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            domain: None,
            parameter_schema: ParameterSchema::default(),
            required_permission: None,
            reversible: false,
            compensating_tool: None,
            category: None,
            concurrency_safe: true,
            entity_param: None,
            handler,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_schema(mut self, schema: ParameterSchema) -> Self {
        self.parameter_schema = schema;
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.required_permission = Some(permission.into());
        self
    }

    pub fn with_category(mut self, category: ToolCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Marks the tool reversible through `compensating_tool`.
    pub fn with_compensator(mut self, compensating_tool: impl Into<String>) -> Self {
        self.reversible = true;
        self.compensating_tool = Some(compensating_tool.into());
        self
    }

    pub fn exclusive_on(mut self, entity_param: impl Into<String>) -> Self {
        self.concurrency_safe = false;
        self.entity_param = Some(entity_param.into());
        self
    }

    pub async fn apply(
        &self,
        parameters: &Map<String, Value>,
        context: &ExecutionContext,
    ) -> Result<ToolOutput, ToolError> {
        self.handler.apply(parameters, context).await
    }

    /// Deletion or bulk work. A declared category wins; the name is only a fallback.
    pub fn is_destructive(&self) -> bool {
        match self.category {
            Some(category) => category.is_destructive(),
            None => {
                let name = self.name.to_ascii_lowercase();
                DESTRUCTIVE_NAME_HINTS.iter().any(|hint| name.contains(hint))
            }
        }
    }

    /// Lock key for the entity touched by this call, when the tool asks for exclusivity.
    pub fn entity_key(&self, parameters: &Map<String, Value>) -> Option<String> {
        if self.concurrency_safe {
            return None;
        }
        let param = self.entity_param.as_ref()?;
        let value = parameters.get(param)?;
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Some(format!("{}:{}", param, value))
    }
}
