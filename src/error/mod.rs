pub mod plan_error;
pub mod tool_error;

use std::io;

use thiserror::Error as ThisError;

pub use plan_error::PlanError;
pub use tool_error::ToolError;

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),

    #[error("tool `{0}` is not registered")]
    UnknownTool(String),
}

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serde_json error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("plan rejected: {0}")]
    Plan(#[from] PlanError),

    #[error("plan `{0}` is already in progress")]
    PlanInProgress(String),

    #[error("no plan `{0}` is awaiting confirmation")]
    PlanNotPending(String),

    #[error("approval token does not match plan `{0}`")]
    InvalidApprovalToken(String),

    #[error("confirmation window for plan `{0}` has expired")]
    ConfirmationExpired(String),

    #[error("planner error: {0}")]
    Planner(String),
}

pub type Result<T> = core::result::Result<T, Error>;
