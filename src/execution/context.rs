use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Who is running a plan and what they may do.
///
/// # Fields
/// - `actor_id`: identity recorded on every audit record.
/// - `granted_permissions`: compared against each tool's required permission.
/// - `metadata`: free-form data passed through to tools (locale, tenant, request id...).
/// - `session_id` / `trace_id`: optional correlation ids for logs.
/// - `cancellation`: cooperative cancellation signal; tools may poll it during long work.
#[derive(Debug, Default, Clone)]
pub struct ExecutionContext {
    pub actor_id: String,
    pub granted_permissions: HashSet<String>,
    pub metadata: HashMap<String, Value>,
    pub session_id: Option<String>,
    pub trace_id: Option<String>,
    pub cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            ..Default::default()
        }
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.granted_permissions
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.granted_permissions.contains(permission)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Same identity, bound to a different cancellation signal.
    pub(crate) fn with_cancellation(&self, cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            ..self.clone()
        }
    }
}
