pub mod model;
pub mod registry;
pub mod schema;

pub use model::{Tool, ToolCategory, ToolHandler, ToolOutput};
pub use registry::ToolRegistry;
pub use schema::{ParamSpec, ParamType, ParameterSchema};
