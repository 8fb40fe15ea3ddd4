//! Request analysis and plan synthesis
//!
//! The planner turns a natural-language request into a concrete
//! [`TaskPlan`]: real tool names, real file paths (via the
//! code-intelligence seam), dependency edges, and per-step risk.

use super::code_intel::{CodeIntelligence, FileCategory};
use super::types::{PlanStep, RiskLevel, StepType, TaskPlan};
use super::validator::PlanValidator;
use super::PlanValidationResult;
use crate::tools::ToolRegistry;
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What the user is fundamentally asking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    AddEndpoint,
    RefactorSymbol,
    MoveCode,
    Implement,
    FixBug,
    General,
}

/// Rough complexity bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

/// Result of analyzing a user request
#[derive(Debug, Clone)]
pub struct RequestAnalysis {
    pub intent: Intent,
    pub complexity: Complexity,
    pub estimated_steps: usize,
    pub potential_risks: Vec<String>,
}

/// Plan plus the analysis and validation that produced it
#[derive(Debug)]
pub struct PlanOutcome {
    pub plan: TaskPlan,
    pub validation: PlanValidationResult,
    pub analysis: RequestAnalysis,
}

static RENAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:rename|change|replace)\s+`?(\w+)`?\s+(?:to|with)\s+`?(\w+)`?")
        .expect("valid rename regex")
});

static SYMBOL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"`(\w+)`|\b([a-z][a-z0-9]*(?:_[a-z0-9]+)+|[a-z]+[A-Z]\w+)\b")
        .expect("valid symbol regex"));

const COMPLEXITY_KEYWORDS: &[&str] = &[
    "refactor",
    "move",
    "extract",
    "implement",
    "restructure",
    "migrate",
    "redesign",
    "rewrite",
];

/// Files whose edits carry elevated risk
fn is_core_config(path: &Path) -> bool {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_lowercase();
    name == "cargo.toml"
        || name == "package.json"
        || name == "tsconfig.json"
        || name.starts_with(".env")
        || name.contains("config")
        || name.contains("settings")
}

/// Decomposes complex requests into validated task plans
pub struct Planner {
    code_intel: Arc<dyn CodeIntelligence>,
    working_dir: PathBuf,
}

impl Planner {
    pub fn new(code_intel: Arc<dyn CodeIntelligence>, working_dir: PathBuf) -> Self {
        Self {
            code_intel,
            working_dir,
        }
    }

    /// Classify the request without touching the filesystem
    pub fn analyze(&self, request: &str) -> RequestAnalysis {
        let lower = request.to_lowercase();

        let intent = if lower.contains("endpoint") || lower.contains("api route") {
            Intent::AddEndpoint
        } else if lower.contains("refactor") || RENAME_PATTERN.is_match(request) {
            Intent::RefactorSymbol
        } else if lower.contains("move ") || lower.contains("extract") {
            Intent::MoveCode
        } else if lower.contains("implement") || lower.contains("add ") || lower.contains("build ")
        {
            Intent::Implement
        } else if lower.contains("fix") || lower.contains("bug") {
            Intent::FixBug
        } else {
            Intent::General
        };

        let keyword_hits = COMPLEXITY_KEYWORDS
            .iter()
            .filter(|k| lower.contains(*k))
            .count();
        let scope_hit = lower.contains("across") || lower.contains("throughout");
        let complexity = match keyword_hits + usize::from(scope_hit) {
            0 => Complexity::Simple,
            1 => Complexity::Moderate,
            _ => Complexity::Complex,
        };

        let estimated_steps = match complexity {
            Complexity::Simple => 2,
            Complexity::Moderate => 4,
            Complexity::Complex => 6,
        };

        let mut potential_risks = Vec::new();
        if matches!(intent, Intent::RefactorSymbol | Intent::MoveCode) {
            potential_risks.push("Cross-cutting change may break references".to_string());
        }
        if scope_hit {
            potential_risks.push("Request spans multiple areas of the codebase".to_string());
        }
        if lower.contains("config") {
            potential_risks.push("Core configuration may be touched".to_string());
        }

        RequestAnalysis {
            intent,
            complexity,
            estimated_steps,
            potential_risks,
        }
    }

    /// Synthesize and validate a plan for the request
    pub async fn create_plan(
        &self,
        request: &str,
        registry: &ToolRegistry,
    ) -> Result<PlanOutcome> {
        let analysis = self.analyze(request);
        let symbol = extract_symbol(request);

        let mut steps: Vec<PlanStep> = Vec::new();
        let mut files_affected: Vec<String> = Vec::new();

        // Every plan opens with an analysis step so later steps act on
        // current information.
        let survey_args = if symbol.is_empty() {
            serde_json::json!({ "path": "." }).to_string()
        } else {
            serde_json::json!({ "pattern": symbol }).to_string()
        };
        let survey_tool = if symbol.is_empty() { "list_directory" } else { "search" };
        let survey = PlanStep::new(
            StepType::Analysis,
            format!("Survey the codebase for '{}'", request),
            survey_tool,
            survey_args,
        )
        .with_duration(5);
        let survey_id = survey.id.clone();
        steps.push(survey);

        match analysis.intent {
            Intent::AddEndpoint => {
                for category in [
                    FileCategory::Routes,
                    FileCategory::Controllers,
                    FileCategory::Services,
                ] {
                    let candidates = self.code_intel.candidate_files(category, &symbol).await;
                    if let Some(path) = candidates.first() {
                        files_affected.push(self.relative_display(path));
                        steps.push(self.edit_step(path, &symbol, None, &survey_id, &analysis));
                    }
                }
            }
            Intent::RefactorSymbol | Intent::MoveCode => {
                let rename = RENAME_PATTERN.captures(request).map(|c| {
                    (
                        c.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
                        c.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
                    )
                });
                let hint = rename
                    .as_ref()
                    .map(|(old, _)| old.clone())
                    .unwrap_or_else(|| symbol.clone());

                let dependents = self
                    .code_intel
                    .candidate_files(FileCategory::Dependents, &hint)
                    .await;
                for path in &dependents {
                    files_affected.push(self.relative_display(path));
                    steps.push(self.edit_step(
                        path,
                        &hint,
                        rename.as_ref(),
                        &survey_id,
                        &analysis,
                    ));
                }
            }
            Intent::Implement | Intent::FixBug | Intent::General => {
                let candidates = self
                    .code_intel
                    .candidate_files(FileCategory::Dependents, &symbol)
                    .await;
                for path in candidates.iter().take(3) {
                    files_affected.push(self.relative_display(path));
                    let view = PlanStep::new(
                        StepType::Analysis,
                        format!("Inspect {}", self.relative_display(path)),
                        "view_file",
                        serde_json::json!({ "path": self.relative_display(path) }).to_string(),
                    )
                    .with_dependencies(vec![survey_id.clone()])
                    .with_duration(5);
                    steps.push(view);
                }
            }
        }

        // Close with a verification step once there is anything to verify;
        // it waits on every mutation (or on all work when nothing mutates)
        if steps.len() > 1 {
            let mut gate_ids: Vec<String> = steps
                .iter()
                .filter(|s| s.step_type.is_mutating())
                .map(|s| s.id.clone())
                .collect();
            if gate_ids.is_empty() {
                gate_ids = steps.iter().skip(1).map(|s| s.id.clone()).collect();
            }
            steps.push(
                PlanStep::new(
                    StepType::Test,
                    "Verify the change set",
                    "bash",
                    serde_json::json!({ "command": "cargo check 2>/dev/null || true" })
                        .to_string(),
                )
                .with_dependencies(gate_ids)
                .with_risk(RiskLevel::Medium)
                .with_duration(30),
            );
        }

        let mut plan = TaskPlan::new(request, steps);
        files_affected.sort();
        files_affected.dedup();
        if files_affected.len() > 10 {
            plan.overall_risk_level = plan.overall_risk_level.bumped();
        }
        plan.metadata.files_affected = files_affected;

        let validation = PlanValidator::new().validate(&plan, registry);

        Ok(PlanOutcome {
            plan,
            validation,
            analysis,
        })
    }

    fn relative_display(&self, path: &Path) -> String {
        path.strip_prefix(&self.working_dir)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    /// Step that changes (or stages the change of) one file
    ///
    /// With a known rename pair the step is a concrete `str_replace_edit`;
    /// without one it is a review of the file slated for change, carrying
    /// the same risk so confirmation gating still applies.
    fn edit_step(
        &self,
        path: &Path,
        symbol: &str,
        rename: Option<&(String, String)>,
        survey_id: &str,
        analysis: &RequestAnalysis,
    ) -> PlanStep {
        let display = self.relative_display(path);

        let mut risk = if is_core_config(path) {
            RiskLevel::High
        } else {
            RiskLevel::Medium
        };
        // Cross-cutting refactors are riskier than isolated edits
        if analysis.intent == Intent::RefactorSymbol && risk < RiskLevel::High {
            risk = RiskLevel::High;
        }

        let step = match rename {
            Some((old, new)) => PlanStep::new(
                StepType::Edit,
                format!("Replace '{}' with '{}' in {}", old, new, display),
                "str_replace_edit",
                serde_json::json!({
                    "path": display,
                    "old_str": old,
                    "new_str": new,
                    "replace_all": true
                })
                .to_string(),
            ),
            None => PlanStep::new(
                StepType::Analysis,
                format!("Review {} for changes related to '{}'", display, symbol),
                "view_file",
                serde_json::json!({ "path": display }).to_string(),
            ),
        };

        step.with_dependencies(vec![survey_id.to_string()])
            .with_risk(risk)
            .with_duration(15)
    }
}

/// Pull the most likely symbol or topic out of a request
fn extract_symbol(request: &str) -> String {
    for captures in SYMBOL_PATTERN.captures_iter(request) {
        if let Some(backticked) = captures.get(1) {
            return backticked.as_str().to_string();
        }
        if let Some(identifier) = captures.get(2) {
            return identifier.as_str().to_string();
        }
    }
    // Fall back to the last capitalized-ish word, else the longest word
    request
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| w.len() > 3)
        .max_by_key(|w| w.len())
        .unwrap_or("")
        .to_string()
}
