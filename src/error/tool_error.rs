use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Failure of a single tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolError {
    #[error("permission `{required}` required by tool `{tool_name}` was not granted")]
    Permission { tool_name: String, required: String },

    #[error("tool execution failed: {message}")]
    Execution { message: String },

    #[error("tool timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("execution cancelled")]
    Cancelled,

    #[error("cannot resolve `{reference}`: {reason}")]
    Reference { reference: String, reason: String },
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        ToolError::Execution {
            message: message.into(),
        }
    }

    /// Transient failures worth another attempt. Timeouts count as execution failures.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::Execution { .. } | ToolError::Timeout { .. })
    }
}
