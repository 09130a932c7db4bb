//! Planning and execution core for domain agents.
//!
//! A [`TaskPlan`] is validated against a [`ToolRegistry`], optionally parked for human
//! confirmation, then run batch by batch with retries. A failing critical step rolls back
//! the work already done through compensating tools.

pub mod agent;
pub mod engine;
pub mod error;
pub mod execution;
pub mod planning;
pub mod shared;
pub mod tools;

pub use agent::{DomainAgent, Intent, Planner};
pub use engine::{Approval, ExecutionEngine, ExecutionEvent, ExecutionOutcome, ExecutionState, PendingConfirmation};
pub use error::{Error, Result};
pub use execution::{ExecutionContext, ExecutionResult, OverallStatus, StepResult, StepStatus};
pub use planning::{RiskLevel, TaskPlan, TaskStep};
pub use shared::EngineConfig;
pub use tools::{Tool, ToolHandler, ToolOutput, ToolRegistry};
