//! Public façade: guards, plan-vs-loop routing, streaming surface
//!
//! The orchestrator owns the message history for a session and exposes
//! `process_user_message_stream`. Before any LLM work it applies three
//! guards (identical-request counter, operation-loop detection, plan
//! scoring); planned requests run through the validator/executor with a
//! confirmation gate, everything else goes to the agent loop. Planner and
//! executor failures degrade to the loop with a warning; the session
//! always stays alive.

use super::agent_loop::{AgentLoop, ChunkSender};
use super::cancel::CancellationFlag;
use super::events::{ChatEntry, StreamingChunk};
use crate::llm::{LlmProvider, Message};
use crate::mcp::{refresh_mcp_tools, McpTransport};
use crate::planner::{
    ExecutorEvent, PlanExecutor, PlanOutcome, Planner, PlanValidator, RiskLevel,
};
use crate::storage::SessionLog;
use crate::tools::{FallbackEngine, ToolRegistry};
use crate::tracking::{operation_tracker, DEFAULT_LOOP_WINDOW};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

/// Default system prompt for the coding assistant
const SYSTEM_PROMPT: &str = "You are an AI coding assistant with access to tools for reading, \
searching, editing, and running code in the user's workspace. Use tools immediately instead of \
describing what you would do; read before you edit; prefer small precise edits. Report what you \
changed when you finish.";

/// Decides whether a risky plan may execute
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    /// Present the preview and return whether to proceed
    async fn confirm(&self, preview: &str) -> bool;
}

/// Approves every plan (library default; CLIs install a prompting handler)
pub struct AutoApprove;

#[async_trait]
impl ConfirmationHandler for AutoApprove {
    async fn confirm(&self, _preview: &str) -> bool {
        true
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Identical requests tolerated before the guard trips
    pub max_identical_requests: u32,
    /// Window for operation-loop detection
    pub loop_detection_window: usize,
    /// Plan-detection score at or above which the planner path runs
    pub plan_score_threshold: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_identical_requests: 2,
            loop_detection_window: DEFAULT_LOOP_WINDOW,
            plan_score_threshold: 3,
        }
    }
}

static SOURCE_FILE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[\w./-]+\.(rs|ts|tsx|js|jsx|py|go|java|rb|c|cpp|h)\b")
        .expect("valid source file regex")
});

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

const ARCHITECTURE_KEYWORDS: &[&str] = &[
    "architecture",
    "module",
    "service",
    "component",
    "dependency injection",
    "interface",
];

/// Score a request for plan-worthiness
///
/// Complexity keywords +2, two or more source-file names +2, architecture
/// keywords +1, scope words +1.
pub fn plan_score(request: &str) -> u32 {
    let lower = request.to_lowercase();
    let mut score = 0;

    if COMPLEXITY_KEYWORDS.iter().any(|k| lower.contains(k)) {
        score += 2;
    }
    if SOURCE_FILE_PATTERN.find_iter(request).count() >= 2 {
        score += 2;
    }
    if ARCHITECTURE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        score += 1;
    }
    if lower.contains("across") || lower.contains("throughout") {
        score += 1;
    }
    score
}

fn request_hash(request: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Glues the loop, planner, executor, and guards into one session surface
pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    agent_loop: AgentLoop,
    planner: Planner,
    validator: PlanValidator,
    executor: PlanExecutor,
    confirmation: Arc<dyn ConfirmationHandler>,
    config: OrchestratorConfig,
    /// Hash -> consecutive submissions of the identical request
    request_counts: DashMap<String, u32>,
    history: Mutex<Vec<Message>>,
    session_log: SessionLog,
    /// Remote tool sources re-listed between rounds
    mcp_transports: Vec<Arc<dyn McpTransport>>,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        planner: Planner,
        fallback: Arc<FallbackEngine>,
    ) -> Self {
        let agent_loop = AgentLoop::new(llm, registry.clone(), fallback.clone());
        let executor = PlanExecutor::new(registry.clone()).with_fallback_engine(fallback);
        Self {
            registry,
            agent_loop,
            planner,
            validator: PlanValidator::new(),
            executor,
            confirmation: Arc::new(AutoApprove),
            config: OrchestratorConfig::default(),
            request_counts: DashMap::new(),
            history: Mutex::new(vec![Message::system(SYSTEM_PROMPT)]),
            session_log: SessionLog::default_location(),
            mcp_transports: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_confirmation_handler(mut self, handler: Arc<dyn ConfirmationHandler>) -> Self {
        self.confirmation = handler;
        self
    }

    pub fn with_agent_loop(mut self, agent_loop: AgentLoop) -> Self {
        self.agent_loop = agent_loop;
        self
    }

    pub fn with_session_log(mut self, log: SessionLog) -> Self {
        self.session_log = log;
        self
    }

    pub fn with_mcp_transports(mut self, transports: Vec<Arc<dyn McpTransport>>) -> Self {
        self.mcp_transports = transports;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Process one user message, streaming chunks as they materialize
    pub fn process_user_message_stream(
        self: &Arc<Self>,
        user_message: String,
        cancel: CancellationFlag,
    ) -> UnboundedReceiverStream<StreamingChunk> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let this = self.clone();
        tokio::spawn(async move {
            this.handle_request(&user_message, &cancel, &tx).await;
        });
        UnboundedReceiverStream::new(rx)
    }

    /// Non-streaming sugar: collect the stream into chat entries
    pub async fn process_user_message(
        self: &Arc<Self>,
        user_message: String,
    ) -> Vec<ChatEntry> {
        let mut stream =
            self.process_user_message_stream(user_message, CancellationFlag::new());

        let mut entries = Vec::new();
        let mut assistant_text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                StreamingChunk::Content { content } => assistant_text.push_str(&content),
                StreamingChunk::ToolCalls { tool_calls } => {
                    entries.push(ChatEntry::tool_calls(tool_calls.len()));
                }
                StreamingChunk::ToolResult {
                    tool_call,
                    tool_result,
                } => {
                    entries.push(ChatEntry::tool_result(
                        tool_call.id,
                        tool_result.llm_text(),
                    ));
                }
                StreamingChunk::TokenCount { .. } => {}
                StreamingChunk::Done => break,
            }
        }
        if !assistant_text.is_empty() {
            entries.push(ChatEntry::assistant(assistant_text));
        }
        entries
    }

    async fn handle_request(
        &self,
        user_message: &str,
        cancel: &CancellationFlag,
        emit: &ChunkSender,
    ) {
        self.session_log.append(&ChatEntry::user(user_message));

        // Remote tools may have changed between rounds; the batch in
        // flight keeps the registry it started with
        if !self.mcp_transports.is_empty() {
            let refreshed = refresh_mcp_tools(&self.registry, &self.mcp_transports).await;
            tracing::debug!("Refreshed {} MCP tool(s)", refreshed);
        }

        let hash = request_hash(user_message);

        // Guard 1: identical-request counter
        let repeats = {
            let mut entry = self.request_counts.entry(hash.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if repeats >= self.config.max_identical_requests {
            self.request_counts.remove(&hash);
            self.finish_with_notice(
                emit,
                "Loop detected: this exact request was just processed. \
                 Rephrase or add detail if you want me to try again.",
            );
            return;
        }

        // Guard 2: operation-loop detection
        let loop_check = operation_tracker().detect_loop(self.config.loop_detection_window);
        if loop_check.is_loop {
            let suggestion = loop_check.suggestion.unwrap_or_default();
            self.finish_with_notice(
                emit,
                &format!(
                    "Loop detected: recent file operations are repeating. {}",
                    suggestion
                ),
            );
            return;
        }

        // Guard 3: plan-worthiness
        if plan_score(user_message) >= self.config.plan_score_threshold {
            match self.run_plan_path(user_message, emit).await {
                Ok(handled) => {
                    if handled {
                        let _ = emit.send(StreamingChunk::Done);
                        return;
                    }
                    // Planner declined; fall through to the loop below
                }
                Err(e) => {
                    tracing::warn!("Planner path failed, degrading to agent loop: {:#}", e);
                    let _ = emit.send(StreamingChunk::Content {
                        content: format!(
                            "Planning failed ({}); handling this directly instead.\n",
                            e
                        ),
                    });
                }
            }
        }

        // Agent loop path
        let mut history = self.history.lock().await;
        match self
            .agent_loop
            .run(&mut history, user_message, &hash, cancel, emit)
            .await
        {
            Ok(()) => {
                if let Some(last) = history.last() {
                    if last.role == crate::llm::Role::Assistant {
                        self.session_log
                            .append(&ChatEntry::assistant(last.content.clone()));
                    }
                }
            }
            Err(e) => {
                // Fatal taxonomy: surface as an assistant entry, keep the
                // session alive
                let notice = format!("I encountered an error: {:#}", e);
                history.push(Message::assistant(notice.clone()));
                self.session_log.append(&ChatEntry::assistant(notice.clone()));
                let _ = emit.send(StreamingChunk::Content { content: notice });
                let _ = emit.send(StreamingChunk::Done);
            }
        }
    }

    /// Run the planner path; returns Ok(false) when no plan materialized
    /// and the agent loop should take over
    async fn run_plan_path(&self, user_message: &str, emit: &ChunkSender) -> Result<bool> {
        let PlanOutcome {
            mut plan,
            validation,
            analysis,
        } = self.planner.create_plan(user_message, &self.registry).await?;

        tracing::debug!(
            intent = ?analysis.intent,
            steps = plan.steps.len(),
            risk = plan.overall_risk_level.label(),
            "Plan synthesized"
        );

        if plan.steps.len() < 2 {
            // Not enough structure to justify a plan
            return Ok(false);
        }

        if !validation.is_valid {
            let _ = emit.send(StreamingChunk::Content {
                content: format!(
                    "The request produced an invalid plan and will not be executed:\n- {}\n",
                    validation.errors.join("\n- ")
                ),
            });
            return Ok(true);
        }

        let preview = self.validator.format_preview(&plan);
        let _ = emit.send(StreamingChunk::Content {
            content: format!(
                "{}\nEstimated success rate: {:.0}%\n",
                preview,
                validation.estimated_success_rate * 100.0
            ),
        });

        if plan.overall_risk_level >= RiskLevel::High
            && !self.confirmation.confirm(&preview).await
        {
            let _ = emit.send(StreamingChunk::Content {
                content: "Plan cancelled before execution.\n".to_string(),
            });
            return Ok(true);
        }

        let progress_sender = emit.clone();
        let report = self
            .executor
            .execute(&mut plan, &move |event| {
                let line = match event {
                    ExecutorEvent::Phase { phase } => format!("[plan] {}\n", phase),
                    ExecutorEvent::Progress {
                        completed,
                        total,
                        step_id,
                        status,
                    } => format!(
                        "[plan] {}/{} {} -> {:?}\n",
                        completed, total, step_id, status
                    ),
                };
                let _ = progress_sender.send(StreamingChunk::Content { content: line });
            })
            .await?;

        let summary = if report.success {
            format!(
                "Plan completed: {} step(s) done, {} skipped.\n",
                report.completed, report.skipped
            )
        } else {
            format!(
                "Plan failed at step {}; {} step(s) completed, {} skipped{}.\n",
                report.failed_step.as_deref().unwrap_or("?"),
                report.completed,
                report.skipped,
                if report.rolled_back {
                    ", all changes rolled back"
                } else {
                    ""
                }
            )
        };
        self.session_log.append(&ChatEntry::assistant(summary.clone()));
        let _ = emit.send(StreamingChunk::Content { content: summary });
        Ok(true)
    }

    fn finish_with_notice(&self, emit: &ChunkSender, notice: &str) {
        self.session_log.append(&ChatEntry::assistant(notice));
        let _ = emit.send(StreamingChunk::Content {
            content: notice.to_string(),
        });
        let _ = emit.send(StreamingChunk::Done);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_score_keywords() {
        // Complexity keyword alone is not enough
        assert!(plan_score("refactor this") < 3);
        // Complexity + architecture + scope crosses the threshold
        assert!(plan_score("Refactor the auth module across the codebase") >= 3);
        // Two file names + keyword
        assert!(plan_score("move helpers from utils.ts to helpers.ts") >= 3);
        // Plain question stays below
        assert_eq!(plan_score("show me package.json"), 0);
    }

    #[test]
    fn test_plan_score_canonical_example() {
        let score = plan_score("Refactor authentication module to use dependency injection");
        assert!(score >= 3, "score was {}", score);
    }

    #[test]
    fn test_request_hash_stability() {
        assert_eq!(request_hash("same"), request_hash("same"));
        assert_ne!(request_hash("same"), request_hash("different"));
    }
}
