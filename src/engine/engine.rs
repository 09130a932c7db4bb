use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use futures::{StreamExt, stream};
use serde_json::{Map, Value};
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    engine::{
        confirmation::{Approval, ConfirmationGate, PendingConfirmation},
        events::{EventBus, EventBusStats, ExecutionEvent},
        state::ExecutionState,
    },
    error::{Error, Result, ToolError},
    execution::{
        AuditSink, ExecutionContext, ExecutionLedger, ExecutionResult, OverallStatus, RollbackCoordinator,
        StepExecutor, StepResult, StepStatus,
    },
    planning::{DependencyScheduler, PlanValidator, TaskPlan, TaskStep, ValidatedPlan, reference},
    shared::EngineConfig,
    tools::{Tool, ToolRegistry},
};

/// What `submit` hands back: a finished run, or a plan parked for approval.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(ExecutionResult),
    AwaitingConfirmation(PendingConfirmation),
}

impl ExecutionOutcome {
    pub fn completed(self) -> Option<ExecutionResult> {
        match self {
            ExecutionOutcome::Completed(result) => Some(result),
            ExecutionOutcome::AwaitingConfirmation(_) => None,
        }
    }

    pub fn pending(&self) -> Option<&PendingConfirmation> {
        match self {
            ExecutionOutcome::AwaitingConfirmation(pending) => Some(pending),
            ExecutionOutcome::Completed(_) => None,
        }
    }
}

struct PendingPlan {
    plan: ValidatedPlan,
    confirmation: PendingConfirmation,
}

/// A step ready to launch: its tool and resolved parameters, or why it cannot run.
struct PreparedStep<'a> {
    step: &'a TaskStep,
    call: std::result::Result<(Arc<Tool>, Map<String, Value>), ToolError>,
}

/// Validates, gates, schedules and runs plans against one tool registry.
pub struct ExecutionEngine {
    config: EngineConfig,
    validator: PlanValidator,
    scheduler: DependencyScheduler,
    gate: ConfirmationGate,
    executor: Arc<StepExecutor>,
    rollback: RollbackCoordinator,
    events: EventBus,
    states: RwLock<HashMap<String, ExecutionState>>,
    pending: RwLock<HashMap<String, PendingPlan>>,
    running: RwLock<HashMap<String, CancellationToken>>,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<ToolRegistry>, audit: Arc<dyn AuditSink>, config: EngineConfig) -> Self {
        let executor = Arc::new(StepExecutor::from_config(&config, audit));
        Self {
            validator: PlanValidator::new(registry),
            scheduler: DependencyScheduler,
            gate: ConfirmationGate,
            rollback: RollbackCoordinator::new(executor.clone()),
            executor,
            events: EventBus::new(config.event_capacity),
            states: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            running: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub async fn event_stats(&self) -> EventBusStats {
        self.events.stats().await
    }

    pub async fn state(&self, plan_id: &str) -> Option<ExecutionState> {
        self.states.read().await.get(plan_id).copied()
    }

    /// Drops the recorded state of a finished plan. Plans still parked or running are kept.
    pub async fn forget(&self, plan_id: &str) -> bool {
        let mut states = self.states.write().await;
        if !states.get(plan_id).is_some_and(|state| state.is_terminal()) {
            return false;
        }
        states.remove(plan_id);
        debug!(plan_id, "plan state dropped");
        true
    }

    pub async fn pending_confirmation(&self, plan_id: &str) -> Option<PendingConfirmation> {
        self.pending
            .read()
            .await
            .get(plan_id)
            .map(|entry| entry.confirmation.clone())
    }

    /// Validates `plan`, then either runs it or parks it for approval.
    ///
    /// A plan that fails validation is returned as `Error::Plan` before any tool is touched.
    pub async fn submit(&self, plan: &TaskPlan, context: &ExecutionContext) -> Result<ExecutionOutcome> {
        self.begin(&plan.id).await?;
        self.transition(&plan.id, ExecutionState::Validating).await;

        let validated = match self.validator.validate(plan) {
            Ok(validated) => validated,
            Err(e) => {
                self.transition(&plan.id, ExecutionState::ValidationFailed).await;
                return Err(e.into());
            }
        };

        let summary = self.gate.impact_summary(&validated);
        if summary.requires_confirmation() {
            let confirmation =
                PendingConfirmation::new(&validated, summary.clone(), self.config.confirmation_timeout());
            self.pending.write().await.insert(
                plan.id.clone(),
                PendingPlan {
                    plan: validated,
                    confirmation: confirmation.clone(),
                },
            );
            self.transition(&plan.id, ExecutionState::AwaitingConfirmation)
                .await;
            info!(plan_id = %plan.id, reasons = ?summary.reasons, "plan awaiting confirmation");
            self.events
                .publish(ExecutionEvent::PlanAwaitingConfirmation {
                    plan_id: plan.id.clone(),
                    impact_summary: summary,
                })
                .await;
            return Ok(ExecutionOutcome::AwaitingConfirmation(confirmation));
        }

        self.transition(&plan.id, ExecutionState::Scheduled).await;
        Ok(ExecutionOutcome::Completed(self.run(validated, context).await))
    }

    /// Resumes a parked plan. The token must be the one issued for it.
    ///
    /// The parked plan is immutable, so the token alone ties the approval to its
    /// fingerprint. A late approval re-runs the structural and tool checks against the
    /// registry before anything executes.
    pub async fn approve(
        &self,
        plan_id: &str,
        approval: Approval,
        context: &ExecutionContext,
    ) -> Result<ExecutionResult> {
        let entry = {
            let mut pending = self.pending.write().await;
            let Some(entry) = pending.remove(plan_id) else {
                return Err(Error::PlanNotPending(plan_id.to_string()));
            };
            if entry.confirmation.approval_token != approval.token {
                warn!(plan_id, approver = %approval.approver_id, "approval token mismatch");
                pending.insert(plan_id.to_string(), entry);
                return Err(Error::InvalidApprovalToken(plan_id.to_string()));
            }
            entry
        };

        let now = Utc::now();
        if entry.confirmation.is_expired(now) {
            self.abort(plan_id, "confirmation window expired").await;
            return Err(Error::ConfirmationExpired(plan_id.to_string()));
        }

        let plan = if entry.confirmation.age(now) >= self.config.revalidate_after() {
            match self.validator.revalidate(&entry.plan) {
                Ok(plan) => plan,
                Err(e) => {
                    self.transition(plan_id, ExecutionState::ValidationFailed)
                        .await;
                    self.events
                        .publish(ExecutionEvent::PlanRejected {
                            plan_id: plan_id.to_string(),
                            reason: e.to_string(),
                        })
                        .await;
                    return Err(e.into());
                }
            }
        } else {
            entry.plan
        };

        info!(plan_id, approver = %approval.approver_id, "plan approved");
        self.transition(plan_id, ExecutionState::Scheduled).await;
        Ok(self.run(plan, context).await)
    }

    pub async fn reject(&self, plan_id: &str, reason: impl Into<String>) -> Result<()> {
        if self.pending.write().await.remove(plan_id).is_none() {
            return Err(Error::PlanNotPending(plan_id.to_string()));
        }
        self.abort(plan_id, reason).await;
        Ok(())
    }

    /// Stops a running plan before its next step, or drops a parked one.
    /// Returns false when the plan is neither.
    pub async fn cancel(&self, plan_id: &str) -> bool {
        let token = self.running.read().await.get(plan_id).cloned();
        if let Some(token) = token {
            info!(plan_id, "cancelling execution");
            token.cancel();
            return true;
        }
        self.reject(plan_id, "cancelled before approval").await.is_ok()
    }

    /// Aborts every parked plan whose confirmation window has passed. Returns their ids.
    pub async fn expire_pending(&self) -> Vec<String> {
        let now = Utc::now();
        let expired: Vec<String> = {
            let mut pending = self.pending.write().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| entry.confirmation.is_expired(now))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                pending.remove(id);
            }
            ids
        };

        for plan_id in &expired {
            self.abort(plan_id, "confirmation window expired").await;
        }
        expired
    }

    async fn begin(&self, plan_id: &str) -> Result<()> {
        let mut states = self.states.write().await;
        if states.get(plan_id).is_some_and(|state| !state.is_terminal()) {
            return Err(Error::PlanInProgress(plan_id.to_string()));
        }
        states.insert(plan_id.to_string(), ExecutionState::Created);
        Ok(())
    }

    async fn transition(&self, plan_id: &str, next: ExecutionState) {
        let previous = self
            .states
            .write()
            .await
            .insert(plan_id.to_string(), next);
        match previous {
            Some(from) if !from.can_transition_to(next) => {
                warn!(plan_id, %from, to = %next, "unexpected state transition")
            }
            _ => debug!(plan_id, to = %next, "state changed"),
        }
    }

    async fn abort(&self, plan_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        info!(plan_id, %reason, "plan aborted");
        self.transition(plan_id, ExecutionState::Aborted).await;
        self.events
            .publish(ExecutionEvent::PlanRejected {
                plan_id: plan_id.to_string(),
                reason,
            })
            .await;
    }

    async fn run(&self, plan: ValidatedPlan, context: &ExecutionContext) -> ExecutionResult {
        let plan_id = plan.id().to_string();
        let execution_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        let cancellation = context.cancellation.child_token();
        self.running
            .write()
            .await
            .insert(plan_id.clone(), cancellation.clone());
        let step_context = context.with_cancellation(cancellation.clone());
        // Set once a critical step fails; queued steps of the same batch then stay unstarted.
        let halt = CancellationToken::new();

        self.transition(&plan_id, ExecutionState::Executing).await;
        info!(%plan_id, %execution_id, steps = plan.plan().steps.len(), "execution started");

        let mut ledger = ExecutionLedger::new();
        let mut critical_failure: Option<String> = None;

        for batch in self.scheduler.order(&plan) {
            let mut runnable = Vec::new();
            for step_id in &batch.step_ids {
                let Some(step) = plan.step(step_id) else {
                    continue;
                };
                let skip_reason = if cancellation.is_cancelled() {
                    Some("execution cancelled".to_string())
                } else if let Some(failed) = &critical_failure {
                    Some(format!("critical step `{failed}` failed"))
                } else if let Some(dep) = ledger.blocked_by(step) {
                    // A critical step that can never run fails the plan like one that ran and failed.
                    if step.is_critical {
                        error!(
                            %plan_id,
                            step_id = %step.id,
                            dependency = %dep,
                            "critical step blocked, halting execution"
                        );
                        critical_failure = Some(step.id.clone());
                        halt.cancel();
                    }
                    Some(format!("dependency `{dep}` did not succeed"))
                } else {
                    None
                };

                match skip_reason {
                    Some(reason) => {
                        let result = StepResult::skipped(&step.id, &step.tool_name, reason);
                        self.announce(&plan_id, &result).await;
                        ledger.record(result);
                    }
                    None => runnable.push(prepare(&plan, step, ledger.outputs())),
                }
            }

            let mut completions = stream::iter(
                runnable
                    .into_iter()
                    .map(|prepared| self.run_step(&plan_id, prepared, &step_context, &halt)),
            )
            .buffer_unordered(self.config.concurrency());

            while let Some(result) = completions.next().await {
                self.announce(&plan_id, &result).await;

                let critical = plan.step(&result.step_id).is_some_and(|s| s.is_critical);
                let cancelled = matches!(result.error, Some(ToolError::Cancelled));
                if critical && result.is_failed() && !cancelled && critical_failure.is_none() {
                    error!(%plan_id, step_id = %result.step_id, "critical step failed, halting execution");
                    critical_failure = Some(result.step_id.clone());
                    halt.cancel();
                }
                ledger.record(result);
            }
        }

        self.running.write().await.remove(&plan_id);

        let (overall_status, state, rollback_result) = match critical_failure {
            Some(failed_step) if self.config.rollback_on_critical_failure => {
                self.transition(&plan_id, ExecutionState::RollingBack).await;
                self.events
                    .publish(ExecutionEvent::PlanRollingBack {
                        plan_id: plan_id.clone(),
                        failed_step,
                    })
                    .await;
                let rollback = self
                    .rollback
                    .rollback(ledger.results(), &plan, context)
                    .await;
                (OverallStatus::RolledBack, ExecutionState::RolledBack, Some(rollback))
            }
            Some(_) => (OverallStatus::Failed, ExecutionState::Failed, None),
            None if cancellation.is_cancelled() => (OverallStatus::Cancelled, ExecutionState::Cancelled, None),
            None if ledger.has_failures() => (OverallStatus::Succeeded, ExecutionState::PartiallyFailed, None),
            None => (OverallStatus::Succeeded, ExecutionState::Succeeded, None),
        };

        self.transition(&plan_id, state).await;
        self.events
            .publish(ExecutionEvent::PlanCompleted {
                plan_id: plan_id.clone(),
                overall_status,
                state,
            })
            .await;
        info!(%plan_id, %execution_id, ?overall_status, %state, steps = ledger.len(), "execution finished");

        ExecutionResult {
            execution_id,
            plan_id,
            overall_status,
            state,
            steps: ledger.into_results(),
            rollback_result,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn run_step(
        &self,
        plan_id: &str,
        prepared: PreparedStep<'_>,
        context: &ExecutionContext,
        halt: &CancellationToken,
    ) -> StepResult {
        let PreparedStep { step, call } = prepared;
        if context.is_cancelled() {
            return StepResult::skipped(&step.id, &step.tool_name, "execution cancelled");
        }
        if halt.is_cancelled() {
            return StepResult::skipped(&step.id, &step.tool_name, "execution halted by a critical failure");
        }

        let (tool, parameters) = match call {
            Ok(call) => call,
            Err(e) => {
                warn!(plan_id, step_id = %step.id, error = %e, "step cannot be started");
                return StepResult::failed(&step.id, &step.tool_name, Map::new(), e, 1, Utc::now());
            }
        };

        self.events
            .publish(ExecutionEvent::StepStarted {
                plan_id: plan_id.to_string(),
                step_id: step.id.clone(),
                tool_name: tool.name.clone(),
            })
            .await;
        self.executor
            .execute(step, &tool, parameters, context)
            .await
    }

    async fn announce(&self, plan_id: &str, result: &StepResult) {
        let plan_id = plan_id.to_string();
        let step_id = result.step_id.clone();
        let event = match result.status {
            StepStatus::Succeeded => ExecutionEvent::StepCompleted {
                plan_id,
                step_id,
                attempts: result.attempts,
            },
            StepStatus::Failed => ExecutionEvent::StepFailed {
                plan_id,
                step_id,
                attempts: result.attempts,
                error: result
                    .error
                    .clone()
                    .unwrap_or_else(|| ToolError::execution("unknown failure")),
            },
            StepStatus::Skipped => ExecutionEvent::StepSkipped {
                plan_id,
                step_id,
                reason: result.skip_reason.clone().unwrap_or_default(),
            },
        };
        self.events.publish(event).await;
    }
}

fn prepare<'a>(
    plan: &'a ValidatedPlan,
    step: &'a TaskStep,
    outputs: &HashMap<String, Value>,
) -> PreparedStep<'a> {
    let call = match plan.step_tool(step) {
        Some(tool) => reference::resolve_parameters(&step.parameters, outputs).map(|p| (tool.clone(), p)),
        None => Err(ToolError::execution(format!(
            "tool `{}` was not resolved during validation",
            step.tool_name
        ))),
    };
    PreparedStep { step, call }
}
