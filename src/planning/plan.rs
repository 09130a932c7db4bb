use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

use crate::{error::Result, planning::step::TaskStep};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// A dependency-annotated set of steps, usually produced by an external planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPlan {
    #[serde(alias = "planId")]
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub steps: Vec<TaskStep>,

    #[serde(default)]
    pub risk_level: RiskLevel,

    #[serde(default)]
    pub estimated_duration_seconds: u64,

    #[serde(default)]
    pub required_permissions: BTreeSet<String>,
}

impl TaskPlan {
    pub fn new(id: impl Into<String>, steps: Vec<TaskStep>) -> Self {
        Self {
            id: id.into(),
            description: None,
            steps,
            risk_level: RiskLevel::Low,
            estimated_duration_seconds: 0,
            required_permissions: BTreeSet::new(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_risk(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_estimated_duration(mut self, seconds: u64) -> Self {
        self.estimated_duration_seconds = seconds;
        self
    }

    pub fn step(&self, id: &str) -> Option<&TaskStep> {
        self.steps.iter().find(|step| step.id == id)
    }
}
