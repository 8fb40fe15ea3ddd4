//! Plan data model: steps, risk, validation results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Risk classification for a step or a whole plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// One level up, saturating at critical
    pub fn bumped(&self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

/// Lifecycle of a plan step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// What kind of work a step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Analysis,
    Edit,
    Create,
    Delete,
    Test,
    Command,
}

impl StepType {
    /// Whether steps of this type mutate the filesystem
    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::Edit | Self::Create | Self::Delete | Self::Command)
    }
}

/// One step of a task plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub step_type: StepType,
    pub description: String,
    /// Registry tool this step invokes
    pub tool: String,
    /// JSON-encoded arguments for the tool
    pub args: String,
    /// Step ids within the same plan that must complete first
    pub dependencies: Vec<String>,
    pub risk_level: RiskLevel,
    pub status: StepStatus,
    /// Rough duration estimate in seconds
    pub estimated_duration_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PlanStep {
    pub fn new(
        step_type: StepType,
        description: impl Into<String>,
        tool: impl Into<String>,
        args: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("step_{}", uuid::Uuid::new_v4().simple()),
            step_type,
            description: description.into(),
            tool: tool.into(),
            args: args.into(),
            dependencies: Vec::new(),
            risk_level: RiskLevel::Low,
            status: StepStatus::Pending,
            estimated_duration_secs: 10,
            start_time: None,
            end_time: None,
            result: None,
            error: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk_level = risk;
        self
    }

    pub fn with_duration(mut self, secs: u64) -> Self {
        self.estimated_duration_secs = secs;
        self
    }
}

/// Plan-level metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub files_affected: Vec<String>,
}

/// A validated DAG of tool-call steps derived from a user request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub id: String,
    pub description: String,
    pub steps: Vec<PlanStep>,
    pub overall_risk_level: RiskLevel,
    pub total_estimated_duration_secs: u64,
    pub metadata: PlanMetadata,
}

impl TaskPlan {
    pub fn new(description: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        let total: u64 = steps.iter().map(|s| s.estimated_duration_secs).sum();
        let max_risk = steps
            .iter()
            .map(|s| s.risk_level)
            .max()
            .unwrap_or(RiskLevel::Low);
        Self {
            id: format!("plan_{}", uuid::Uuid::new_v4().simple()),
            description: description.into(),
            steps,
            overall_risk_level: max_risk,
            total_estimated_duration_secs: total,
            metadata: PlanMetadata::default(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Outcome of structural plan validation
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
    /// Rough probability the plan executes cleanly, in [0, 1]
    pub estimated_success_rate: f64,
}
