use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::info;

/// Keys whose values never reach an audit record.
const SENSITIVE_KEY_HINTS: &[&str] = &["password", "secret", "token", "api_key", "credential"];
const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Succeeded,
    Failed,
    /// Permission check failed; the tool was not called.
    Denied,
}

/// One tool invocation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    pub tool_name: String,
    pub step_id: String,
    pub parameters_sanitized: Map<String, Value>,
    pub outcome: AuditOutcome,
    pub attempt: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Destination for audit records. Implementations must tolerate concurrent calls.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord);
}

/// Keeps every record in memory. Handy for tests and short-lived sessions.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: RwLock<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Records for one tool, in arrival order.
    pub async fn for_tool(&self, tool_name: &str) -> Vec<AuditRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.tool_name == tool_name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: AuditRecord) {
        self.records.write().await.push(record);
    }
}

/// Writes records as structured events on the `rusplan::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) {
        let parameters = Value::Object(record.parameters_sanitized);
        info!(
            target: "rusplan::audit",
            actor = %record.actor_id,
            tool = %record.tool_name,
            step_id = %record.step_id,
            attempt = record.attempt,
            outcome = ?record.outcome,
            error = record.error.as_deref().unwrap_or(""),
            parameters = %parameters,
            "tool invocation"
        );
    }
}

/// Copies `parameters`, masking values under sensitive keys at any depth.
pub fn sanitize_parameters(parameters: &Map<String, Value>) -> Map<String, Value> {
    parameters
        .iter()
        .map(|(key, value)| {
            let value = if is_sensitive(key) {
                Value::String(REDACTED.to_string())
            } else {
                sanitize_value(value)
            };
            (key.clone(), value)
        })
        .collect()
}

fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sanitize_parameters(map)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        other => other.clone(),
    }
}

fn is_sensitive(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEY_HINTS.iter().any(|hint| key.contains(hint))
}
