//! Task planning: analysis, synthesis, validation, execution
//!
//! A complex request becomes a [`TaskPlan`] (a DAG of tool-call steps
//! with per-step risk), is validated structurally, previewed for
//! confirmation, and executed with snapshots and rollback.

mod analyzer;
mod code_intel;
mod executor;
mod types;
mod validator;

pub use analyzer::{Complexity, Intent, PlanOutcome, Planner, RequestAnalysis};
pub use code_intel::{CodeIntelligence, FileCategory, WorkspaceScanner};
pub use executor::{ExecutionReport, ExecutorConfig, ExecutorEvent, PlanExecutor};
pub use types::{
    PlanMetadata, PlanStep, PlanValidationResult, RiskLevel, StepStatus, StepType, TaskPlan,
};
pub use validator::PlanValidator;
