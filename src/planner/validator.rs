//! Structural plan validation and preview formatting

use super::types::{PlanValidationResult, RiskLevel, TaskPlan};
use crate::tools::ToolRegistry;
use std::collections::{HashMap, HashSet};

/// Warn when a plan's estimated duration exceeds this many seconds
const DEFAULT_DURATION_CEILING_SECS: u64 = 600;

/// Warn when a plan touches more than this many files
const FILES_AFFECTED_CEILING: usize = 10;

/// Validates plans before execution
pub struct PlanValidator {
    duration_ceiling_secs: u64,
}

impl PlanValidator {
    pub fn new() -> Self {
        Self {
            duration_ceiling_secs: DEFAULT_DURATION_CEILING_SECS,
        }
    }

    pub fn with_duration_ceiling(mut self, secs: u64) -> Self {
        self.duration_ceiling_secs = secs;
        self
    }

    /// Validate structure, dependencies, and tools
    ///
    /// Errors make the plan unexecutable; warnings lower the estimated
    /// success rate but do not block.
    pub fn validate(&self, plan: &TaskPlan, registry: &ToolRegistry) -> PlanValidationResult {
        let mut result = PlanValidationResult::default();

        if plan.description.trim().is_empty() {
            result.errors.push("Plan description is empty".to_string());
        }
        if plan.steps.is_empty() {
            result.errors.push("Plan has no steps".to_string());
        }

        let ids: HashSet<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        if ids.len() != plan.steps.len() {
            result.errors.push("Plan has duplicate step ids".to_string());
        }

        for (index, step) in plan.steps.iter().enumerate() {
            if step.description.trim().is_empty() {
                result
                    .errors
                    .push(format!("Step {} has no description", index + 1));
            }
            if step.tool.trim().is_empty() {
                result.errors.push(format!("Step {} names no tool", index + 1));
            } else if !registry.contains(&step.tool) {
                result
                    .errors
                    .push(format!("Step {} uses unknown tool '{}'", index + 1, step.tool));
            }
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    result.errors.push(format!(
                        "Step {} depends on '{}' which is not in the plan",
                        index + 1,
                        dep
                    ));
                }
                if dep == &step.id {
                    result
                        .errors
                        .push(format!("Step {} depends on itself", index + 1));
                }
            }
        }

        if has_cycle(plan) {
            result
                .errors
                .push("Step dependencies form a cycle".to_string());
        }

        // Warnings
        if plan
            .steps
            .iter()
            .any(|s| s.risk_level == RiskLevel::Critical)
        {
            result
                .warnings
                .push("Plan contains a critical-risk step".to_string());
            result
                .suggestions
                .push("Review the critical step before confirming".to_string());
        }
        if plan.total_estimated_duration_secs > self.duration_ceiling_secs {
            result.warnings.push(format!(
                "Estimated duration {}s exceeds the {}s ceiling",
                plan.total_estimated_duration_secs, self.duration_ceiling_secs
            ));
            result
                .suggestions
                .push("Consider splitting the request into smaller plans".to_string());
        }
        if plan.metadata.files_affected.len() > FILES_AFFECTED_CEILING {
            result.warnings.push(format!(
                "Plan affects {} files",
                plan.metadata.files_affected.len()
            ));
        }

        result.is_valid = result.errors.is_empty();
        result.estimated_success_rate = if result.is_valid {
            estimate_success_rate(plan, result.warnings.len())
        } else {
            0.0
        };
        result
    }

    /// Deterministic preview block used to request confirmation
    pub fn format_preview(&self, plan: &TaskPlan) -> String {
        let index_of: HashMap<&str, usize> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i + 1))
            .collect();

        let mut out = String::new();
        out.push_str(&format!("Execution plan: {}\n", plan.description));
        out.push_str(&format!(
            "Risk: {} | Steps: {} | Estimated duration: {}s\n",
            plan.overall_risk_level.label(),
            plan.steps.len(),
            plan.total_estimated_duration_secs
        ));
        if !plan.metadata.files_affected.is_empty() {
            out.push_str(&format!(
                "Files affected ({}): {}\n",
                plan.metadata.files_affected.len(),
                plan.metadata.files_affected.join(", ")
            ));
        }
        out.push('\n');

        for (i, step) in plan.steps.iter().enumerate() {
            let mut deps: Vec<usize> = step
                .dependencies
                .iter()
                .filter_map(|d| index_of.get(d.as_str()).copied())
                .collect();
            deps.sort_unstable();
            let after = if deps.is_empty() {
                String::new()
            } else {
                format!(
                    ", after: {}",
                    deps.iter()
                        .map(|d| d.to_string())
                        .collect::<Vec<_>>()
                        .join(",")
                )
            };
            out.push_str(&format!(
                "  {}. {} (tool: {}, risk: {}{})\n",
                i + 1,
                step.description,
                step.tool,
                step.risk_level.label(),
                after
            ));
        }
        out
    }
}

impl Default for PlanValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Success-rate heuristic: shrinks with step count, max risk, and warnings
fn estimate_success_rate(plan: &TaskPlan, warning_count: usize) -> f64 {
    let risk_penalty = match plan.overall_risk_level {
        RiskLevel::Low => 0.0,
        RiskLevel::Medium => 0.05,
        RiskLevel::High => 0.15,
        RiskLevel::Critical => 0.25,
    };
    let rate =
        0.99 - 0.005 * plan.steps.len() as f64 - risk_penalty - 0.02 * warning_count as f64;
    rate.clamp(0.05, 0.99)
}

/// DFS three-color cycle detection over the dependency graph
fn has_cycle(plan: &TaskPlan) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let index_of: HashMap<&str, usize> = plan
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let mut colors = vec![Color::White; plan.steps.len()];

    fn visit(
        node: usize,
        plan: &TaskPlan,
        index_of: &HashMap<&str, usize>,
        colors: &mut Vec<Color>,
    ) -> bool {
        colors[node] = Color::Gray;
        for dep in &plan.steps[node].dependencies {
            let Some(&next) = index_of.get(dep.as_str()) else {
                continue; // foreign deps are reported separately
            };
            match colors[next] {
                Color::Gray => return true,
                Color::White => {
                    if visit(next, plan, index_of, colors) {
                        return true;
                    }
                }
                Color::Black => {}
            }
        }
        colors[node] = Color::Black;
        false
    }

    for node in 0..plan.steps.len() {
        if colors[node] == Color::White && visit(node, plan, &index_of, &mut colors) {
            return true;
        }
    }
    false
}
