pub mod audit;
pub mod context;
pub mod executor;
pub mod ledger;
pub mod result;
pub mod retry;
pub mod rollback;

pub use audit::{AuditOutcome, AuditRecord, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use context::ExecutionContext;
pub use executor::StepExecutor;
pub use ledger::ExecutionLedger;
pub use result::{
    ExecutionResult, OverallStatus, RollbackEntry, RollbackResult, RollbackStatus, StepResult, StepStatus,
};
pub use retry::RetryPolicy;
pub use rollback::RollbackCoordinator;
