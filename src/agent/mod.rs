pub mod domain;
pub mod intent;

pub use domain::DomainAgent;
pub use intent::{Intent, Planner};
