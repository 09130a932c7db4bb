/// Reasons a plan is refused before any step runs.
///
/// These are always surfaced to the caller and never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("step id `{step_id}` appears more than once")]
    DuplicateStep { step_id: String },

    #[error("step `{step_id}` references unknown tool `{tool_name}`")]
    UnknownTool { step_id: String, tool_name: String },

    #[error("step `{step_id}` depends on missing step `{missing_dep}`")]
    DanglingDependency { step_id: String, missing_dep: String },

    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("step `{step_id}` is missing required parameter `{param_name}`")]
    MissingParameter { step_id: String, param_name: String },

    #[error("step `{step_id}` parameter `{param_name}` references `{reference}`, which is not a dependency")]
    UnresolvedReference {
        step_id: String,
        param_name: String,
        reference: String,
    },

    #[error("step `{step_id}` parameter `{param_name}` is invalid: {reason}")]
    InvalidParameter {
        step_id: String,
        param_name: String,
        reason: String,
    },
}

impl PlanError {
    /// The step the violation was found on, if it belongs to one.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            PlanError::DuplicateStep { step_id }
            | PlanError::UnknownTool { step_id, .. }
            | PlanError::DanglingDependency { step_id, .. }
            | PlanError::MissingParameter { step_id, .. }
            | PlanError::UnresolvedReference { step_id, .. }
            | PlanError::InvalidParameter { step_id, .. } => Some(step_id),
            PlanError::CyclicDependency { .. } => None,
        }
    }
}
