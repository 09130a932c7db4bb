use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    planning::{RiskLevel, ValidatedPlan},
    tools::ToolCategory,
};

/// Why a plan needs a human in the loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ConfirmationReason {
    HighRisk,
    DestructiveStep { step_id: String, tool_name: String },
    MultiStepMediumRisk { step_count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestructiveStep {
    pub step_id: String,
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ToolCategory>,
}

/// What a plan would do, shown to the approver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactSummary {
    pub plan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub risk_level: RiskLevel,
    pub step_count: usize,
    pub destructive_steps: Vec<DestructiveStep>,
    pub required_permissions: Vec<String>,
    pub estimated_duration_seconds: u64,
    /// Empty when the plan can run without confirmation.
    pub reasons: Vec<ConfirmationReason>,
}

impl ImpactSummary {
    pub fn requires_confirmation(&self) -> bool {
        !self.reasons.is_empty()
    }
}

/// A plan parked until someone approves or rejects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingConfirmation {
    pub plan_id: String,
    pub approval_token: Uuid,
    /// Content hash of the plan the token was issued for.
    pub plan_fingerprint: u64,
    pub impact_summary: ImpactSummary,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PendingConfirmation {
    pub fn new(plan: &ValidatedPlan, impact_summary: ImpactSummary, timeout: Option<Duration>) -> Self {
        let created_at = Utc::now();
        let expires_at = timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .and_then(|t| created_at.checked_add_signed(t));
        Self {
            plan_id: plan.id().to_string(),
            approval_token: Uuid::new_v4(),
            plan_fingerprint: plan.fingerprint(),
            impact_summary,
            created_at,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// How long the plan has been waiting.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }
}

/// The answer to a [`PendingConfirmation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub token: Uuid,
    pub approver_id: String,
}

impl Approval {
    pub fn new(token: Uuid, approver_id: impl Into<String>) -> Self {
        Self {
            token,
            approver_id: approver_id.into(),
        }
    }

    pub fn for_pending(pending: &PendingConfirmation, approver_id: impl Into<String>) -> Self {
        Self::new(pending.approval_token, approver_id)
    }
}

/// Decides whether a validated plan may run straight away.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfirmationGate;

impl ConfirmationGate {
    /// High risk, any destructive step, or medium risk spread over more than one step.
    pub fn requires_confirmation(&self, plan: &ValidatedPlan) -> bool {
        self.impact_summary(plan).requires_confirmation()
    }

    pub fn impact_summary(&self, plan: &ValidatedPlan) -> ImpactSummary {
        let task = plan.plan();
        let mut reasons = Vec::new();

        if task.risk_level == RiskLevel::High {
            reasons.push(ConfirmationReason::HighRisk);
        }

        let mut destructive_steps = Vec::new();
        for step in &task.steps {
            let Some(tool) = plan.step_tool(step) else {
                continue;
            };
            if tool.is_destructive() {
                reasons.push(ConfirmationReason::DestructiveStep {
                    step_id: step.id.clone(),
                    tool_name: tool.name.clone(),
                });
                destructive_steps.push(DestructiveStep {
                    step_id: step.id.clone(),
                    tool_name: tool.name.clone(),
                    category: tool.category,
                });
            }
        }

        if task.risk_level == RiskLevel::Medium && task.steps.len() > 1 {
            reasons.push(ConfirmationReason::MultiStepMediumRisk {
                step_count: task.steps.len(),
            });
        }

        ImpactSummary {
            plan_id: task.id.clone(),
            description: task.description.clone(),
            risk_level: task.risk_level,
            step_count: task.steps.len(),
            destructive_steps,
            required_permissions: plan.required_permissions().iter().cloned().collect(),
            estimated_duration_seconds: task.estimated_duration_seconds,
            reasons,
        }
    }
}
