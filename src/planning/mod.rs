pub mod plan;
pub mod reference;
pub mod scheduler;
pub mod step;
pub mod validator;

pub use plan::{RiskLevel, TaskPlan};
pub use scheduler::{DependencyScheduler, ExecutionBatch};
pub use step::TaskStep;
pub use validator::{PlanValidator, ValidatedPlan};
