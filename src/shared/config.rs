use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Engine-wide tuning knobs. Omitted keys fall back to the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts for a retryable step; never more than three are made.
    pub max_attempts: u32,
    /// First backoff delay, doubled after every failed attempt.
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Per-attempt timeout around a tool call.
    pub step_timeout_secs: u64,
    /// Upper bound on steps of one batch running at the same time.
    pub max_concurrent_steps: usize,
    /// Approvals arriving later than this re-validate the plan. Zero means always.
    pub revalidate_after_secs: u64,
    /// Pending confirmations older than this are aborted. `None` keeps them forever.
    pub confirmation_timeout_secs: Option<u64>,
    pub rollback_on_critical_failure: bool,
    /// Capacity of the progress event channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 5_000,
            step_timeout_secs: 30,
            max_concurrent_steps: 8,
            revalidate_after_secs: 0,
            confirmation_timeout_secs: Some(3_600),
            rollback_on_critical_failure: true,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn revalidate_after(&self) -> Duration {
        Duration::from_secs(self.revalidate_after_secs)
    }

    pub fn confirmation_timeout(&self) -> Option<Duration> {
        self.confirmation_timeout_secs.map(Duration::from_secs)
    }

    /// At least one step always runs.
    pub fn concurrency(&self) -> usize {
        self.max_concurrent_steps.max(1)
    }
}
