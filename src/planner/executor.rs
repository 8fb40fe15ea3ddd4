//! Plan execution with snapshots and automatic rollback
//!
//! Steps run in dependency order (ties broken by plan order). Before a
//! mutating step is dispatched, every file its arguments name is
//! snapshotted; on failure with auto-rollback enabled, snapshots are
//! restored in reverse capture order and all dependent steps are skipped.

use super::types::{PlanStep, StepStatus, TaskPlan};
use crate::metrics::metrics_collector;
use crate::tools::{FallbackEngine, ToolRegistry, ToolResult};
use crate::llm::ToolCall;
use anyhow::Result;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Restore snapshots when a step fails
    pub auto_rollback_on_failure: bool,
    /// Run independent ready steps concurrently
    pub parallel_execution: bool,
    /// Ceiling on concurrently running steps
    pub max_parallel_steps: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            auto_rollback_on_failure: true,
            parallel_execution: false,
            max_parallel_steps: 2,
        }
    }
}

/// Progress notifications emitted during execution
#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    /// Execution phase changed (executing, rolling_back, completed, failed)
    Phase { phase: String },
    /// A step changed status
    Progress {
        completed: usize,
        total: usize,
        step_id: String,
        status: StepStatus,
    },
}

/// Aggregate result of one execution run
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub success: bool,
    pub completed: usize,
    pub skipped: usize,
    pub failed_step: Option<String>,
    pub rolled_back: bool,
}

/// Point-in-time copy of a file before its first write in a run
struct Snapshot {
    path: PathBuf,
    /// `None` means the file did not exist before the run
    content: Option<Vec<u8>>,
}

/// Executes validated plans against the tool registry
pub struct PlanExecutor {
    registry: Arc<ToolRegistry>,
    fallback: Option<Arc<FallbackEngine>>,
    config: ExecutorConfig,
}

impl PlanExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            fallback: None,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_fallback_engine(mut self, engine: Arc<FallbackEngine>) -> Self {
        self.fallback = Some(engine);
        self
    }

    /// Execute the plan, mutating step status in place
    pub async fn execute(
        &self,
        plan: &mut TaskPlan,
        on_event: &(dyn Fn(ExecutorEvent) + Send + Sync),
    ) -> Result<ExecutionReport> {
        let total = plan.steps.len();
        on_event(ExecutorEvent::Phase {
            phase: "executing".to_string(),
        });

        let mut snapshots: Vec<Snapshot> = Vec::new();
        let mut snapshotted: HashSet<PathBuf> = HashSet::new();
        let mut completed_count = 0usize;

        loop {
            let batch = self.next_ready_batch(plan);
            if batch.is_empty() {
                break;
            }

            // Snapshot every file the batch may write, before dispatch
            for &index in &batch {
                if plan.steps[index].step_type.is_mutating() {
                    for path in self.files_named_by(&plan.steps[index]) {
                        if snapshotted.insert(path.clone()) {
                            snapshots.push(Snapshot {
                                content: std::fs::read(&path).ok(),
                                path,
                            });
                        }
                    }
                }
            }

            // Mark running
            for &index in &batch {
                let step = &mut plan.steps[index];
                step.status = StepStatus::Running;
                step.start_time = Some(Utc::now());
                on_event(ExecutorEvent::Progress {
                    completed: completed_count,
                    total,
                    step_id: step.id.clone(),
                    status: StepStatus::Running,
                });
            }

            // Dispatch the batch concurrently; ready steps are pairwise
            // independent by construction
            let dispatches: Vec<_> = batch
                .iter()
                .map(|&index| {
                    let step = &plan.steps[index];
                    let tool = step.tool.clone();
                    let args = step.args.clone();
                    let step_id = step.id.clone();
                    async move {
                        let result = self.run_step_tool(&step_id, &tool, &args).await;
                        (index, result)
                    }
                })
                .collect();
            let mut results = futures::future::join_all(dispatches).await;
            results.sort_by_key(|(index, _)| *index);

            // Apply results in plan order
            let mut failed_index: Option<usize> = None;
            for (index, result) in results {
                let step = &mut plan.steps[index];
                step.end_time = Some(Utc::now());
                if result.success {
                    step.status = StepStatus::Completed;
                    step.result = result.output.clone();
                    completed_count += 1;
                    on_event(ExecutorEvent::Progress {
                        completed: completed_count,
                        total,
                        step_id: step.id.clone(),
                        status: StepStatus::Completed,
                    });
                } else {
                    step.status = StepStatus::Failed;
                    step.error = result.error.clone();
                    on_event(ExecutorEvent::Progress {
                        completed: completed_count,
                        total,
                        step_id: step.id.clone(),
                        status: StepStatus::Failed,
                    });
                    if failed_index.is_none() {
                        failed_index = Some(index);
                    }
                }
            }

            if let Some(failed) = failed_index {
                let failed_id = plan.steps[failed].id.clone();
                let skipped = self.skip_remaining(plan, on_event, completed_count, total);

                let mut rolled_back = false;
                if self.config.auto_rollback_on_failure {
                    on_event(ExecutorEvent::Phase {
                        phase: "rolling_back".to_string(),
                    });
                    self.restore_snapshots(&snapshots).await;
                    rolled_back = true;
                }

                on_event(ExecutorEvent::Phase {
                    phase: "failed".to_string(),
                });
                return Ok(ExecutionReport {
                    success: false,
                    completed: completed_count,
                    skipped,
                    failed_step: Some(failed_id),
                    rolled_back,
                });
            }
        }

        // Anything still pending has an unsatisfiable dependency chain
        let skipped = self.skip_remaining(plan, on_event, completed_count, total);

        on_event(ExecutorEvent::Phase {
            phase: "completed".to_string(),
        });
        Ok(ExecutionReport {
            success: true,
            completed: completed_count,
            skipped,
            failed_step: None,
            rolled_back: false,
        })
    }

    /// Pending steps whose dependencies all completed, in plan order
    fn next_ready_batch(&self, plan: &TaskPlan) -> Vec<usize> {
        let status_of: HashMap<&str, StepStatus> = plan
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.status))
            .collect();

        let limit = if self.config.parallel_execution {
            self.config.max_parallel_steps.max(1)
        } else {
            1
        };

        plan.steps
            .iter()
            .enumerate()
            .filter(|(_, step)| step.status == StepStatus::Pending)
            .filter(|(_, step)| {
                step.dependencies.iter().all(|dep| {
                    status_of
                        .get(dep.as_str())
                        .map(|s| *s == StepStatus::Completed)
                        .unwrap_or(false)
                })
            })
            .map(|(index, _)| index)
            .take(limit)
            .collect()
    }

    /// Run one step's tool through metrics and the fallback engine
    async fn run_step_tool(&self, step_id: &str, tool: &str, args: &str) -> ToolResult {
        let op_id = metrics_collector().start_operation(
            tool,
            Some(serde_json::json!({ "planStep": step_id })),
        );

        let mut result = self.registry.execute(tool, args).await;
        let mut fallback_used = None;

        if !result.success {
            if let Some(engine) = &self.fallback {
                if let Some(strategy) = engine.strategy_for(tool) {
                    let fallback_tool = strategy.fallback_tools.first().cloned();
                    metrics_collector().record_retry(&op_id);
                    let call = ToolCall {
                        id: step_id.to_string(),
                        name: tool.to_string(),
                        arguments: args.to_string(),
                    };
                    let error = result.error.clone().unwrap_or_default();
                    let rescued = engine.attempt_fallback(&call, &error, &self.registry).await;
                    if rescued.success {
                        fallback_used = fallback_tool;
                        result = rescued;
                    }
                }
            }
        }

        metrics_collector().end_operation(
            &op_id,
            result.success,
            result.error.clone(),
            fallback_used,
        );
        result
    }

    /// Files a step's arguments name (`path` plus any `files` array)
    fn files_named_by(&self, step: &PlanStep) -> Vec<PathBuf> {
        let Ok(args) = serde_json::from_str::<serde_json::Value>(&step.args) else {
            return Vec::new();
        };

        let mut paths = Vec::new();
        if let Some(path) = args.get("path").and_then(|p| p.as_str()) {
            paths.push(path.to_string());
        }
        if let Some(files) = args.get("files").and_then(|f| f.as_array()) {
            paths.extend(files.iter().filter_map(|f| f.as_str().map(String::from)));
        }

        paths
            .into_iter()
            .map(|p| {
                let path = PathBuf::from(&p);
                if path.is_absolute() {
                    path
                } else {
                    self.registry.working_dir().join(path)
                }
            })
            .collect()
    }

    /// Mark all still-pending steps skipped; returns how many
    fn skip_remaining(
        &self,
        plan: &mut TaskPlan,
        on_event: &(dyn Fn(ExecutorEvent) + Send + Sync),
        completed: usize,
        total: usize,
    ) -> usize {
        let mut skipped = 0;
        for step in &mut plan.steps {
            if step.status == StepStatus::Pending {
                step.status = StepStatus::Skipped;
                skipped += 1;
                on_event(ExecutorEvent::Progress {
                    completed,
                    total,
                    step_id: step.id.clone(),
                    status: StepStatus::Skipped,
                });
            }
        }
        skipped
    }

    /// Restore snapshots in reverse capture order
    async fn restore_snapshots(&self, snapshots: &[Snapshot]) {
        for snapshot in snapshots.iter().rev() {
            let outcome = match &snapshot.content {
                Some(bytes) => tokio::fs::write(&snapshot.path, bytes).await,
                None => match tokio::fs::remove_file(&snapshot.path).await {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    other => other,
                },
            };
            if let Err(e) = outcome {
                tracing::error!(
                    "Rollback failed for {}: {}",
                    snapshot.path.display(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::types::{RiskLevel, StepType};
    use crate::tools::Tool;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn noop_events() -> impl Fn(ExecutorEvent) + Send + Sync {
        |_| {}
    }

    struct ScriptedTool {
        name: String,
        outcomes: Mutex<Vec<ToolResult>>,
        invocations: Mutex<Vec<String>>,
    }

    impl ScriptedTool {
        fn new(name: &str, outcomes: Vec<ToolResult>) -> Self {
            Self {
                name: name.to_string(),
                outcomes: Mutex::new(outcomes),
                invocations: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Tool for ScriptedTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "scripted"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({})
        }
        async fn execute(&self, args: &str) -> Result<ToolResult> {
            self.invocations.lock().unwrap().push(args.to_string());
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                Ok(ToolResult::success("default ok"))
            } else {
                Ok(outcomes.remove(0))
            }
        }
    }

    fn step_with(tool: &str, args: &str) -> PlanStep {
        PlanStep::new(StepType::Analysis, format!("run {}", tool), tool, args)
    }

    #[tokio::test]
    async fn test_topological_order_respects_dependencies() {
        let registry = Arc::new(ToolRegistry::new(PathBuf::from(".")));
        let tool = Arc::new(ScriptedTool::new("probe", vec![]));
        registry.register(tool.clone());

        let a = step_with("probe", r#"{"step":"a"}"#);
        let b = step_with("probe", r#"{"step":"b"}"#).with_dependencies(vec![a.id.clone()]);
        let c = step_with("probe", r#"{"step":"c"}"#).with_dependencies(vec![b.id.clone()]);
        // Declare steps out of order; execution must follow dependencies
        let mut plan = TaskPlan::new("ordered", vec![c, a, b]);

        let executor = PlanExecutor::new(registry);
        let report = executor.execute(&mut plan, &noop_events()).await.unwrap();
        assert!(report.success);

        let invocations = tool.invocations.lock().unwrap().clone();
        assert_eq!(
            invocations,
            vec![r#"{"step":"a"}"#, r#"{"step":"b"}"#, r#"{"step":"c"}"#]
        );

        // For every edge u -> v: u.end_time <= v.start_time
        for step in &plan.steps {
            for dep in &step.dependencies {
                let upstream = plan.step(dep).unwrap();
                assert!(upstream.end_time.unwrap() <= step.start_time.unwrap());
            }
        }
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_and_rolls_back() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target.txt");
        std::fs::write(&target, "original").unwrap();

        let registry = Arc::new(ToolRegistry::new(dir.path().to_path_buf()));
        // The mutating step writes, then a later step fails
        struct WriteTool {
            path: PathBuf,
        }
        #[async_trait]
        impl Tool for WriteTool {
            fn name(&self) -> &str {
                "writer"
            }
            fn description(&self) -> &str {
                "writes"
            }
            fn parameters(&self) -> Value {
                serde_json::json!({})
            }
            async fn execute(&self, _args: &str) -> Result<ToolResult> {
                std::fs::write(&self.path, "mutated").unwrap();
                Ok(ToolResult::success("wrote"))
            }
        }
        registry.register(Arc::new(WriteTool {
            path: target.clone(),
        }));
        registry.register(Arc::new(ScriptedTool::new(
            "failer",
            vec![ToolResult::error("boom")],
        )));
        registry.register(Arc::new(ScriptedTool::new("after", vec![])));

        let mut write_step = step_with("writer", &format!(r#"{{"path":"target.txt"}}"#));
        write_step.step_type = StepType::Edit;
        write_step.risk_level = RiskLevel::Medium;
        let fail_step =
            step_with("failer", "{}").with_dependencies(vec![write_step.id.clone()]);
        let downstream =
            step_with("after", "{}").with_dependencies(vec![fail_step.id.clone()]);

        let mut plan = TaskPlan::new("rollback", vec![write_step, fail_step, downstream]);
        let executor = PlanExecutor::new(registry);
        let report = executor.execute(&mut plan, &noop_events()).await.unwrap();

        assert!(!report.success);
        assert!(report.rolled_back);
        assert_eq!(report.skipped, 1);
        assert_eq!(plan.steps[2].status, StepStatus::Skipped);
        // Snapshot restored the pre-run bytes
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "original");
    }

    #[tokio::test]
    async fn test_rollback_removes_files_created_during_run() {
        let dir = TempDir::new().unwrap();
        let created = dir.path().join("created.txt");

        let registry = Arc::new(ToolRegistry::new(dir.path().to_path_buf()));
        struct CreateTool {
            path: PathBuf,
        }
        #[async_trait]
        impl Tool for CreateTool {
            fn name(&self) -> &str {
                "creator"
            }
            fn description(&self) -> &str {
                "creates"
            }
            fn parameters(&self) -> Value {
                serde_json::json!({})
            }
            async fn execute(&self, _args: &str) -> Result<ToolResult> {
                std::fs::write(&self.path, "fresh").unwrap();
                Ok(ToolResult::success("created"))
            }
        }
        registry.register(Arc::new(CreateTool {
            path: created.clone(),
        }));
        registry.register(Arc::new(ScriptedTool::new(
            "failer",
            vec![ToolResult::error("boom")],
        )));

        let mut create_step = step_with("creator", r#"{"path":"created.txt"}"#);
        create_step.step_type = StepType::Create;
        let fail_step =
            step_with("failer", "{}").with_dependencies(vec![create_step.id.clone()]);

        let mut plan = TaskPlan::new("undo create", vec![create_step, fail_step]);
        let executor = PlanExecutor::new(registry);
        let report = executor.execute(&mut plan, &noop_events()).await.unwrap();

        assert!(!report.success);
        assert!(!created.exists(), "created file should be rolled back");
    }

    #[tokio::test]
    async fn test_no_rollback_when_disabled() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("keep.txt");
        std::fs::write(&target, "original").unwrap();

        let registry = Arc::new(ToolRegistry::new(dir.path().to_path_buf()));
        struct WriteTool {
            path: PathBuf,
        }
        #[async_trait]
        impl Tool for WriteTool {
            fn name(&self) -> &str {
                "writer"
            }
            fn description(&self) -> &str {
                "writes"
            }
            fn parameters(&self) -> Value {
                serde_json::json!({})
            }
            async fn execute(&self, _args: &str) -> Result<ToolResult> {
                std::fs::write(&self.path, "mutated").unwrap();
                Ok(ToolResult::success("wrote"))
            }
        }
        registry.register(Arc::new(WriteTool {
            path: target.clone(),
        }));
        registry.register(Arc::new(ScriptedTool::new(
            "failer",
            vec![ToolResult::error("boom")],
        )));

        let mut write_step = step_with("writer", r#"{"path":"keep.txt"}"#);
        write_step.step_type = StepType::Edit;
        let fail_step =
            step_with("failer", "{}").with_dependencies(vec![write_step.id.clone()]);

        let mut plan = TaskPlan::new("no rollback", vec![write_step, fail_step]);
        let executor = PlanExecutor::new(registry).with_config(ExecutorConfig {
            auto_rollback_on_failure: false,
            ..Default::default()
        });
        let report = executor.execute(&mut plan, &noop_events()).await.unwrap();

        assert!(!report.success);
        assert!(!report.rolled_back);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "mutated");
    }

    #[tokio::test]
    async fn test_parallel_batch_caps_width() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let registry = Arc::new(ToolRegistry::new(PathBuf::from(".")));
        struct GaugeTool {
            current: AtomicUsize,
            peak: AtomicUsize,
        }
        #[async_trait]
        impl Tool for GaugeTool {
            fn name(&self) -> &str {
                "gauge"
            }
            fn description(&self) -> &str {
                "tracks concurrency"
            }
            fn parameters(&self) -> Value {
                serde_json::json!({})
            }
            async fn execute(&self, _args: &str) -> Result<ToolResult> {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(ToolResult::success("ok"))
            }
        }
        let gauge = Arc::new(GaugeTool {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        registry.register(gauge.clone());

        let steps: Vec<PlanStep> = (0..4).map(|_| step_with("gauge", "{}")).collect();
        let mut plan = TaskPlan::new("parallel", steps);

        let executor = PlanExecutor::new(registry).with_config(ExecutorConfig {
            parallel_execution: true,
            max_parallel_steps: 2,
            ..Default::default()
        });
        let report = executor.execute(&mut plan, &noop_events()).await.unwrap();

        assert!(report.success);
        assert_eq!(report.completed, 4);
        let peak = gauge.peak.load(Ordering::SeqCst);
        assert!(peak >= 2, "parallel batches should overlap");
        assert!(peak <= 2, "parallelism must respect the cap");
    }

    #[tokio::test]
    async fn test_progress_events_emitted() {
        let registry = Arc::new(ToolRegistry::new(PathBuf::from(".")));
        registry.register(Arc::new(ScriptedTool::new("probe", vec![])));

        let mut plan = TaskPlan::new("events", vec![step_with("probe", "{}")]);
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();

        let executor = PlanExecutor::new(registry);
        executor
            .execute(&mut plan, &move |event| {
                let line = match event {
                    ExecutorEvent::Phase { phase } => format!("phase:{}", phase),
                    ExecutorEvent::Progress { status, .. } => format!("step:{:?}", status),
                };
                sink.lock().unwrap().push(line);
            })
            .await
            .unwrap();

        let log = events.lock().unwrap().clone();
        assert_eq!(log.first().unwrap(), "phase:executing");
        assert!(log.contains(&"step:Running".to_string()));
        assert!(log.contains(&"step:Completed".to_string()));
        assert_eq!(log.last().unwrap(), "phase:completed");
    }
}
