//! Plan-path scenarios: detection, confirmation, execution, rollback

mod common;

use async_trait::async_trait;
use common::*;
use grok_core::agent::{CancellationFlag, ConfirmationHandler, Orchestrator};
use grok_core::planner::{
    ExecutorConfig, PlanExecutor, PlanStep, StepStatus, StepType, TaskPlan,
};
use grok_core::storage::SessionLog;
use grok_core::tools::{FallbackEngine, ToolRegistry};
use grok_core::planner::{Planner, WorkspaceScanner};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn auth_workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    for (path, content) in [
        (
            "src/auth/mod.rs",
            "pub fn authenticate(token: &str) -> bool {\n    !token.is_empty()\n}\n",
        ),
        (
            "src/session.rs",
            "use crate::auth;\n\npub fn open(token: &str) {\n    auth::authenticate(token);\n}\n",
        ),
        (
            "src/login.rs",
            "pub fn login(token: &str) {\n    crate::auth::authenticate(token);\n}\n",
        ),
    ] {
        let full = dir.path().join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }
    dir
}

struct RecordingConfirmation {
    asked: AtomicUsize,
    approve: AtomicBool,
}

impl RecordingConfirmation {
    fn approving() -> Arc<Self> {
        Arc::new(Self {
            asked: AtomicUsize::new(0),
            approve: AtomicBool::new(true),
        })
    }

    fn declining() -> Arc<Self> {
        Arc::new(Self {
            asked: AtomicUsize::new(0),
            approve: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ConfirmationHandler for RecordingConfirmation {
    async fn confirm(&self, _preview: &str) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.approve.load(Ordering::SeqCst)
    }
}

fn plan_orchestrator(
    provider: Arc<MockProvider>,
    workspace: &Path,
    confirmation: Arc<RecordingConfirmation>,
) -> Arc<Orchestrator> {
    let registry = Arc::new(ToolRegistry::with_defaults(workspace.to_path_buf()));
    let fallback = Arc::new(FallbackEngine::with_defaults());
    let planner = Planner::new(
        Arc::new(WorkspaceScanner::new(workspace.to_path_buf())),
        workspace.to_path_buf(),
    );
    Arc::new(
        Orchestrator::new(provider, registry, planner, fallback)
            .with_confirmation_handler(confirmation)
            .with_session_log(SessionLog::disabled()),
    )
}

#[tokio::test]
async fn refactor_request_takes_plan_path_and_applies_renames() {
    let dir = auth_workspace();
    // If the plan path leaked to the LLM, this text would show up
    let provider = Arc::new(MockProvider::new(vec![]));
    let confirmation = RecordingConfirmation::approving();

    let orchestrator = plan_orchestrator(provider.clone(), dir.path(), confirmation.clone());
    let stream = orchestrator.process_user_message_stream(
        "Refactor across the auth module: rename authenticate to verify_identity".to_string(),
        CancellationFlag::new(),
    );
    let chunks = collect_stream(stream).await;
    let text = content_text(&chunks);

    // Preview came first, execution followed, the LLM was never consulted
    assert!(text.contains("Execution plan:"), "stream text: {}", text);
    assert!(text.contains("Plan completed"), "stream text: {}", text);
    assert_eq!(provider.call_count(), 0);
    assert_eq!(done_count(&chunks), 1);

    // High-risk plan required confirmation
    assert_eq!(confirmation.asked.load(Ordering::SeqCst), 1);

    // The rename landed in every dependent file
    for file in ["src/auth/mod.rs", "src/session.rs", "src/login.rs"] {
        let content = std::fs::read_to_string(dir.path().join(file)).unwrap();
        assert!(
            !content.contains("authenticate("),
            "{} still has the old name:\n{}",
            file,
            content
        );
        assert!(content.contains("verify_identity"));
    }
}

#[tokio::test]
async fn declined_confirmation_blocks_execution() {
    let dir = auth_workspace();
    let provider = Arc::new(MockProvider::new(vec![]));
    let confirmation = RecordingConfirmation::declining();

    let orchestrator = plan_orchestrator(provider.clone(), dir.path(), confirmation.clone());
    let stream = orchestrator.process_user_message_stream(
        "Refactor across the auth module: rename authenticate to verify_identity".to_string(),
        CancellationFlag::new(),
    );
    let chunks = collect_stream(stream).await;
    let text = content_text(&chunks);

    assert!(text.contains("Plan cancelled"));
    assert_eq!(confirmation.asked.load(Ordering::SeqCst), 1);

    // Nothing was touched
    let content = std::fs::read_to_string(dir.path().join("src/auth/mod.rs")).unwrap();
    assert!(content.contains("authenticate("));
}

#[tokio::test]
async fn failed_step_rolls_back_and_skips_dependents() {
    use grok_core::tools::{Tool, ToolResult};

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("service.rs");
    std::fs::write(&target, "fn handle() {}\n").unwrap();

    let registry = Arc::new(ToolRegistry::with_defaults(dir.path().to_path_buf()));

    struct ExplodingTool;
    #[async_trait]
    impl Tool for ExplodingTool {
        fn name(&self) -> &str {
            "exploding"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({})
        }
        async fn execute(&self, _args: &str) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::error("deliberate failure"))
        }
    }
    registry.register(Arc::new(ExplodingTool));

    // Edit succeeds and mutates the file, then the next step explodes
    let edit = PlanStep::new(
        StepType::Edit,
        "rewrite handler",
        "str_replace_edit",
        serde_json::json!({
            "path": "service.rs",
            "old_str": "fn handle() {}",
            "new_str": "fn handle() { todo!() }"
        })
        .to_string(),
    );
    let boom = PlanStep::new(StepType::Command, "run migration", "exploding", "{}")
        .with_dependencies(vec![edit.id.clone()]);
    let downstream = PlanStep::new(StepType::Test, "verify", "bash", r#"{"command":"true"}"#)
        .with_dependencies(vec![boom.id.clone()]);

    let mut plan = TaskPlan::new("failing plan", vec![edit, boom, downstream]);
    let executor = PlanExecutor::new(registry).with_config(ExecutorConfig::default());
    let report = executor.execute(&mut plan, &|_| {}).await.unwrap();

    assert!(!report.success);
    assert!(report.rolled_back);
    assert_eq!(plan.steps[0].status, StepStatus::Completed);
    assert_eq!(plan.steps[1].status, StepStatus::Failed);
    assert_eq!(plan.steps[2].status, StepStatus::Skipped);

    // Rollback restored the pre-run bytes of the edited file
    assert_eq!(
        std::fs::read_to_string(&target).unwrap(),
        "fn handle() {}\n"
    );
}
