pub mod confirmation;
#[allow(clippy::module_inception)]
pub mod engine;
pub mod events;
pub mod state;

pub use confirmation::{Approval, ConfirmationGate, ConfirmationReason, ImpactSummary, PendingConfirmation};
pub use engine::{ExecutionEngine, ExecutionOutcome};
pub use events::{EventBus, ExecutionEvent};
pub use state::ExecutionState;
