use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::{
    error::ToolError,
    execution::{
        audit::{AuditOutcome, AuditRecord, AuditSink, sanitize_parameters},
        context::ExecutionContext,
        result::StepResult,
        retry::RetryPolicy,
    },
    planning::TaskStep,
    shared::EngineConfig,
    tools::Tool,
};

/// Advisory locks keyed by entity, shared by every execution on one engine.
///
/// An entry lives only while some execution holds or waits on it.
#[derive(Debug, Default)]
pub struct EntityLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EntityLocks {
    pub async fn acquire(&self, key: &str) -> EntityGuard<'_> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone();
        EntityGuard {
            locks: self,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of entities currently locked or contended.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry whose only handle is the map's own. Also sweeps entries left
    /// behind by a waiter that was dropped before it got the lock.
    fn release(&self) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// Held for the duration of one tool call. Unlocks the entity on drop.
#[derive(Debug)]
pub struct EntityGuard<'a> {
    locks: &'a EntityLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.release();
    }
}

/// Runs one step: permission check, then up to three timed attempts with backoff.
pub struct StepExecutor {
    policy: RetryPolicy,
    step_timeout: Duration,
    audit: Arc<dyn AuditSink>,
    locks: EntityLocks,
}

impl StepExecutor {
    pub fn new(policy: RetryPolicy, step_timeout: Duration, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            policy,
            step_timeout,
            audit,
            locks: EntityLocks::default(),
        }
    }

    pub fn from_config(config: &EngineConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self::new(RetryPolicy::from_config(config), config.step_timeout(), audit)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `parameters` must already have their symbolic references resolved.
    pub async fn execute(
        &self,
        step: &TaskStep,
        tool: &Tool,
        parameters: Map<String, Value>,
        context: &ExecutionContext,
    ) -> StepResult {
        let started_at = Utc::now();

        if let Err(denied) = self.authorize(&step.id, tool, &parameters, context).await {
            return StepResult::failed(&step.id, &tool.name, parameters, denied, 1, started_at);
        }

        let max_attempts = self.policy.attempts(step.retryable);
        let mut attempt = 1;
        loop {
            debug!(step_id = %step.id, tool = %tool.name, attempt, "invoking tool");
            let outcome = self.invoke(tool, &parameters, context).await;
            self.audit(&step.id, tool, &parameters, context, attempt, &outcome)
                .await;

            let error = match outcome {
                Ok(output) => {
                    info!(step_id = %step.id, tool = %tool.name, attempt, "step succeeded");
                    return StepResult::succeeded(
                        &step.id, &tool.name, parameters, output, attempt, started_at,
                    );
                }
                Err(error) => error,
            };

            if attempt >= max_attempts || !error.is_retryable() {
                warn!(step_id = %step.id, tool = %tool.name, attempt, error = %error, "step failed");
                return StepResult::failed(&step.id, &tool.name, parameters, error, attempt, started_at);
            }

            let delay = self.policy.delay_for(attempt);
            debug!(step_id = %step.id, attempt, ?delay, error = %error, "retrying after backoff");
            tokio::select! {
                _ = context.cancellation.cancelled() => {
                    info!(step_id = %step.id, attempt, "retry abandoned, execution cancelled");
                    return StepResult::failed(
                        &step.id, &tool.name, parameters, ToolError::Cancelled, attempt, started_at,
                    );
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// A single audited, permission-checked call of a compensating tool on behalf of `step_id`.
    pub async fn compensate(
        &self,
        step_id: &str,
        compensator: &Tool,
        parameters: &Map<String, Value>,
        context: &ExecutionContext,
    ) -> Result<Value, ToolError> {
        self.authorize(step_id, compensator, parameters, context)
            .await?;

        let outcome = self.invoke(compensator, parameters, context).await;
        self.audit(step_id, compensator, parameters, context, 1, &outcome)
            .await;
        outcome
    }

    async fn authorize(
        &self,
        step_id: &str,
        tool: &Tool,
        parameters: &Map<String, Value>,
        context: &ExecutionContext,
    ) -> Result<(), ToolError> {
        let Some(required) = &tool.required_permission else {
            return Ok(());
        };
        if context.has_permission(required) {
            return Ok(());
        }

        let denied = ToolError::Permission {
            tool_name: tool.name.clone(),
            required: required.clone(),
        };
        warn!(step_id, tool = %tool.name, actor = %context.actor_id, %required, "permission denied");
        self.audit
            .record(AuditRecord {
                timestamp: Utc::now(),
                actor_id: context.actor_id.clone(),
                tool_name: tool.name.clone(),
                step_id: step_id.to_string(),
                parameters_sanitized: sanitize_parameters(parameters),
                outcome: AuditOutcome::Denied,
                attempt: 1,
                error: Some(denied.to_string()),
            })
            .await;
        Err(denied)
    }

    /// One attempt. The tool sees the cancellation token and decides itself whether to stop.
    async fn invoke(
        &self,
        tool: &Tool,
        parameters: &Map<String, Value>,
        context: &ExecutionContext,
    ) -> Result<Value, ToolError> {
        let _guard = match tool.entity_key(parameters) {
            Some(key) => Some(self.locks.acquire(&key).await),
            None => None,
        };

        let output = tokio::time::timeout(self.step_timeout, tool.apply(parameters, context))
            .await
            .map_err(|_| ToolError::Timeout {
                timeout: self.step_timeout,
            })??;
        output.into_result()
    }

    async fn audit(
        &self,
        step_id: &str,
        tool: &Tool,
        parameters: &Map<String, Value>,
        context: &ExecutionContext,
        attempt: u32,
        outcome: &Result<Value, ToolError>,
    ) {
        let (outcome, error) = match outcome {
            Ok(_) => (AuditOutcome::Succeeded, None),
            Err(e) => (AuditOutcome::Failed, Some(e.to_string())),
        };
        self.audit
            .record(AuditRecord {
                timestamp: Utc::now(),
                actor_id: context.actor_id.clone(),
                tool_name: tool.name.clone(),
                step_id: step_id.to_string(),
                parameters_sanitized: sanitize_parameters(parameters),
                outcome,
                attempt,
                error,
            })
            .await;
    }
}
