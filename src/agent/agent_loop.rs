//! The LLM chat / tool execution loop
//!
//! Drives one user request through CHAT and TOOLS states until the
//! assistant stops emitting tool calls, the round cap trips, or the
//! request is cancelled. Every tool invocation flows through the metrics
//! collector and, on recoverable failure, the fallback engine; structured
//! self-correct failures re-engage the LLM with a synthetic user prompt
//! instead of the raw error.

use super::cancel::CancellationFlag;
use super::events::{estimate_history_tokens, StreamingChunk};
use super::rate_limit::{RequestPacer, DEFAULT_MIN_REQUEST_INTERVAL};
use crate::llm::{LlmProvider, Message, StreamCallback, StreamEvent, ToolCall};
use crate::metrics::metrics_collector;
use crate::tools::{FallbackEngine, SelfCorrectError, ToolRegistry, ToolResult};
use anyhow::Result;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Notice emitted when the user cancels mid-request
pub const CANCELLED_NOTICE: &str = "[Operation cancelled by user]";

/// Notice emitted when the round cap trips
pub const MAX_ROUNDS_NOTICE: &str =
    "Maximum tool execution rounds reached. Stopping here; ask me to continue if needed.";

/// Loop configuration
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    /// Ceiling on CHAT/TOOLS cycles per request
    pub max_tool_rounds: usize,
    /// Tool calls dispatched concurrently per batch
    pub max_concurrent_tool_calls: usize,
    /// Minimum spacing between LLM calls
    pub min_request_interval: Duration,
    /// Ceiling on LLM re-engagements after self-correct failures
    pub max_correction_attempts: u32,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 400,
            max_concurrent_tool_calls: 2,
            min_request_interval: DEFAULT_MIN_REQUEST_INTERVAL,
            max_correction_attempts: 3,
        }
    }
}

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopOutcome {
    Finished,
    MaxRounds,
    Cancelled,
}

/// Sender side of the request's chunk stream
pub type ChunkSender = UnboundedSender<StreamingChunk>;

/// Executes the chat/tool round-trip cycle for one request at a time
pub struct AgentLoop {
    llm: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    fallback: Arc<FallbackEngine>,
    config: AgentLoopConfig,
    pacer: RequestPacer,
    /// Correction attempts per request hash; cleared when the request ends
    correction_attempts: DashMap<String, u32>,
}

impl AgentLoop {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        fallback: Arc<FallbackEngine>,
    ) -> Self {
        let config = AgentLoopConfig::default();
        let pacer = RequestPacer::new(config.min_request_interval);
        Self {
            llm,
            registry,
            fallback,
            config,
            pacer,
            correction_attempts: DashMap::new(),
        }
    }

    pub fn with_config(mut self, config: AgentLoopConfig) -> Self {
        self.pacer = RequestPacer::new(config.min_request_interval);
        self.config = config;
        self
    }

    /// Run the loop for one user message
    ///
    /// Appends to `history` in LLM-delivery order; all of a round's tool
    /// results land in the history before the next LLM call. Exactly one
    /// `done` chunk is emitted, including on cancellation.
    pub async fn run(
        &self,
        history: &mut Vec<Message>,
        user_message: &str,
        request_hash: &str,
        cancel: &CancellationFlag,
        emit: &ChunkSender,
    ) -> Result<()> {
        history.push(Message::user(user_message));
        let _ = emit.send(StreamingChunk::TokenCount {
            token_count: estimate_history_tokens(history),
        });

        let outcome = self.drive(history, request_hash, cancel, emit).await;

        match outcome {
            Ok(LoopOutcome::Cancelled) => {
                history.push(Message::assistant(CANCELLED_NOTICE));
                let _ = emit.send(StreamingChunk::Content {
                    content: CANCELLED_NOTICE.to_string(),
                });
            }
            Ok(_) => {}
            Err(e) => {
                // The caller surfaces the error and closes the stream
                self.correction_attempts.remove(request_hash);
                return Err(e);
            }
        }

        self.correction_attempts.remove(request_hash);
        let _ = emit.send(StreamingChunk::Done);
        Ok(())
    }

    async fn drive(
        &self,
        history: &mut Vec<Message>,
        request_hash: &str,
        cancel: &CancellationFlag,
        emit: &ChunkSender,
    ) -> Result<LoopOutcome> {
        let tool_definitions = self.registry.definitions();
        let mut rounds = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Ok(LoopOutcome::Cancelled);
            }
            if rounds >= self.config.max_tool_rounds {
                history.push(Message::assistant(MAX_ROUNDS_NOTICE));
                let _ = emit.send(StreamingChunk::Content {
                    content: MAX_ROUNDS_NOTICE.to_string(),
                });
                return Ok(LoopOutcome::MaxRounds);
            }

            self.pacer.pace().await;

            let chunk_sender = emit.clone();
            let callback: StreamCallback = Box::new(move |event| {
                if let StreamEvent::TextDelta(text) = event {
                    let _ = chunk_sender.send(StreamingChunk::Content { content: text });
                }
            });
            let cancel_probe = cancel.clone();
            let interrupt_check = move || cancel_probe.is_cancelled();
            let interrupt_ref: &(dyn Fn() -> bool + Send + Sync) = &interrupt_check;

            let response = self
                .llm
                .chat_streaming(history, Some(&tool_definitions), callback, Some(interrupt_ref))
                .await?;

            if cancel.is_cancelled() {
                return Ok(LoopOutcome::Cancelled);
            }

            let text = response.text().unwrap_or_default().to_string();
            let calls = response.tool_calls().to_vec();

            if calls.is_empty() {
                history.push(Message::assistant(text));
                return Ok(LoopOutcome::Finished);
            }

            history.push(Message::assistant_tool_calls(text, calls.clone()));
            let _ = emit.send(StreamingChunk::ToolCalls {
                tool_calls: calls.clone(),
            });
            rounds += 1;

            let batch_size = self.config.max_concurrent_tool_calls.max(1);
            for batch in calls.chunks(batch_size) {
                if cancel.is_cancelled() {
                    return Ok(LoopOutcome::Cancelled);
                }

                // Batch dispatched in parallel; results applied in input
                // order regardless of completion order
                let results =
                    join_all(batch.iter().map(|call| self.execute_tool_call(call))).await;

                for (call, result) in batch.iter().zip(results) {
                    if self.try_queue_correction(history, request_hash, call, &result, emit) {
                        continue;
                    }
                    history.push(Message::tool_result(&call.id, result.llm_text()));
                    let _ = emit.send(StreamingChunk::ToolResult {
                        tool_call: call.clone(),
                        tool_result: result,
                    });
                }

                if cancel.is_cancelled() {
                    return Ok(LoopOutcome::Cancelled);
                }
            }
        }
    }

    /// Handle a self-correct failure by re-engaging the LLM
    ///
    /// Returns true when a retry was queued: the raw error is withheld
    /// from the history (a short notice stands in under the original
    /// `tool_call_id`) and a synthetic user message carries the guidance.
    fn try_queue_correction(
        &self,
        history: &mut Vec<Message>,
        request_hash: &str,
        call: &ToolCall,
        result: &ToolResult,
        emit: &ChunkSender,
    ) -> bool {
        let Some(correction) = SelfCorrectError::extract(result) else {
            return false;
        };

        let attempts = {
            let mut entry = self
                .correction_attempts
                .entry(request_hash.to_string())
                .or_insert(0);
            *entry += 1;
            *entry
        };
        if attempts > self.config.max_correction_attempts {
            tracing::warn!(
                tool = %call.name,
                "Correction attempts exhausted; surfacing the raw failure"
            );
            return false;
        }

        let notice = format!(
            "Retrying with a corrected approach (attempt {}/{})\n",
            attempts, self.config.max_correction_attempts
        );
        let _ = emit.send(StreamingChunk::Content { content: notice });

        history.push(Message::tool_result(
            &call.id,
            "The previous attempt failed; a corrected approach was requested.",
        ));
        history.push(Message::user(compose_correction_prompt(&correction)));
        true
    }

    /// Execute one call through metrics and the fallback engine
    async fn execute_tool_call(&self, call: &ToolCall) -> ToolResult {
        let op_id = metrics_collector().start_operation(
            &call.name,
            Some(serde_json::json!({ "toolCallId": call.id })),
        );

        let mut result = self.registry.execute(&call.name, &call.arguments).await;
        let mut fallback_used = None;

        if !result.success {
            if let Some(strategy) = self.fallback.strategy_for(&call.name) {
                let fallback_tool = strategy.fallback_tools.first().cloned();
                metrics_collector().record_retry(&op_id);
                let error = result.error.clone().unwrap_or_default();
                let rescued = self
                    .fallback
                    .attempt_fallback(call, &error, &self.registry)
                    .await;
                if rescued.success {
                    fallback_used = fallback_tool;
                    result = rescued;
                }
            } else if SelfCorrectError::extract(&result).is_some() {
                // The correction path re-engages the LLM; count it as a retry
                metrics_collector().record_retry(&op_id);
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
}

fn compose_correction_prompt(correction: &SelfCorrectError) -> String {
    let mut prompt = String::from("Previous approach failed. ");
    if !correction.hint.is_empty() {
        prompt.push_str(&correction.hint);
        if !correction.hint.ends_with('.') {
            prompt.push('.');
        }
        prompt.push(' ');
    }
    if !correction.suggested_fallbacks.is_empty() {
        prompt.push_str(&format!(
            "Consider using: {}. ",
            correction.suggested_fallbacks.join(", ")
        ));
    }
    prompt.push_str("Please try again with the suggested approach.");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, ToolDefinition};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Scripted provider: pops one response per chat call
    struct ScriptedProvider {
        responses: Mutex<Vec<LlmResponse>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<LlmResponse>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
        ) -> Result<LlmResponse> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(LlmResponse::Text {
                    text: "done".to_string(),
                    usage: None,
                })
            } else {
                Ok(responses.remove(0))
            }
        }
        async fn chat_streaming(
            &self,
            messages: &[Message],
            tools: Option<&[ToolDefinition]>,
            _callback: StreamCallback,
            _interrupt_check: Option<&(dyn Fn() -> bool + Send + Sync)>,
        ) -> Result<LlmResponse> {
            self.chat(messages, tools).await
        }
    }

    struct CountingTool {
        count: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl crate::tools::Tool for CountingTool {
        fn name(&self) -> &str {
            "probe"
        }
        fn description(&self) -> &str {
            "counts"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({})
        }
        async fn execute(&self, _args: &str) -> Result<ToolResult> {
            self.count
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(ToolResult::success("probed"))
        }
    }

    fn tool_call(name: &str) -> ToolCall {
        ToolCall::synthetic(name, "{}")
    }

    fn collect_chunks(
        receiver: &mut tokio::sync::mpsc::UnboundedReceiver<StreamingChunk>,
    ) -> Vec<StreamingChunk> {
        let mut chunks = Vec::new();
        while let Ok(chunk) = receiver.try_recv() {
            chunks.push(chunk);
        }
        chunks
    }

    fn loop_with(
        provider: ScriptedProvider,
        registry: ToolRegistry,
        config: AgentLoopConfig,
    ) -> AgentLoop {
        AgentLoop::new(
            Arc::new(provider),
            Arc::new(registry),
            Arc::new(FallbackEngine::new()),
        )
        .with_config(config)
    }

    fn fast_config() -> AgentLoopConfig {
        AgentLoopConfig {
            min_request_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_text_only_round_finishes() {
        let provider = ScriptedProvider::new(vec![LlmResponse::Text {
            text: "hello there".to_string(),
            usage: None,
        }]);
        let registry = ToolRegistry::new(PathBuf::from("."));
        let agent = loop_with(provider, registry, fast_config());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut history = vec![Message::system("sys")];
        let cancel = CancellationFlag::new();
        agent
            .run(&mut history, "hi", "hash1", &cancel, &tx)
            .await
            .unwrap();

        // History: system, user, assistant
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].content, "hello there");

        let chunks = collect_chunks(&mut rx);
        assert!(matches!(chunks.first(), Some(StreamingChunk::TokenCount { .. })));
        assert!(matches!(chunks.last(), Some(StreamingChunk::Done)));
        let dones = chunks
            .iter()
            .filter(|c| matches!(c, StreamingChunk::Done))
            .count();
        assert_eq!(dones, 1);
    }

    #[tokio::test]
    async fn test_tool_round_then_answer() {
        let call = tool_call("probe");
        let provider = ScriptedProvider::new(vec![
            LlmResponse::ToolCalls {
                calls: vec![call.clone()],
                usage: None,
            },
            LlmResponse::Text {
                text: "all done".to_string(),
                usage: None,
            },
        ]);
        let registry = ToolRegistry::new(PathBuf::from("."));
        registry.register(Arc::new(CountingTool {
            count: std::sync::atomic::AtomicUsize::new(0),
        }));
        let agent = loop_with(provider, registry, fast_config());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut history = vec![Message::system("sys")];
        agent
            .run(&mut history, "probe it", "hash2", &CancellationFlag::new(), &tx)
            .await
            .unwrap();

        // system, user, assistant(with calls), tool result, assistant
        assert_eq!(history.len(), 5);
        assert_eq!(history[3].tool_call_id.as_deref(), Some(call.id.as_str()));
        assert_eq!(history[4].content, "all done");

        let chunks = collect_chunks(&mut rx);
        let tool_calls_at = chunks
            .iter()
            .position(|c| matches!(c, StreamingChunk::ToolCalls { .. }))
            .unwrap();
        let tool_result_at = chunks
            .iter()
            .position(|c| matches!(c, StreamingChunk::ToolResult { .. }))
            .unwrap();
        assert!(tool_calls_at < tool_result_at);
    }

    #[tokio::test]
    async fn test_max_rounds_cap() {
        // Provider that always asks for another tool call
        struct RelentlessProvider;
        #[async_trait]
        impl LlmProvider for RelentlessProvider {
            fn name(&self) -> &str {
                "relentless"
            }
            async fn chat(
                &self,
                _messages: &[Message],
                _tools: Option<&[ToolDefinition]>,
            ) -> Result<LlmResponse> {
                Ok(LlmResponse::ToolCalls {
                    calls: vec![tool_call("probe")],
                    usage: None,
                })
            }
            async fn chat_streaming(
                &self,
                messages: &[Message],
                tools: Option<&[ToolDefinition]>,
                _callback: StreamCallback,
                _interrupt_check: Option<&(dyn Fn() -> bool + Send + Sync)>,
            ) -> Result<LlmResponse> {
                self.chat(messages, tools).await
            }
        }

        let registry = ToolRegistry::new(PathBuf::from("."));
        let counter = Arc::new(CountingTool {
            count: std::sync::atomic::AtomicUsize::new(0),
        });
        registry.register(counter.clone());

        let agent = AgentLoop::new(
            Arc::new(RelentlessProvider),
            Arc::new(registry),
            Arc::new(FallbackEngine::new()),
        )
        .with_config(AgentLoopConfig {
            max_tool_rounds: 3,
            min_request_interval: Duration::ZERO,
            ..Default::default()
        });

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut history = vec![Message::system("sys")];
        agent
            .run(&mut history, "go", "hash3", &CancellationFlag::new(), &tx)
            .await
            .unwrap();

        // Exactly the capped number of tool rounds ran
        assert_eq!(counter.count.load(std::sync::atomic::Ordering::SeqCst), 3);
        let assistant_tool_rounds = history
            .iter()
            .filter(|m| m.tool_calls.is_some())
            .count();
        assert_eq!(assistant_tool_rounds, 3);
        assert_eq!(history.last().unwrap().content, MAX_ROUNDS_NOTICE);

        let chunks = collect_chunks(&mut rx);
        assert!(chunks.iter().any(|c| matches!(
            c,
            StreamingChunk::Content { content } if content == MAX_ROUNDS_NOTICE
        )));
    }

    #[tokio::test]
    async fn test_self_correct_injects_synthetic_user_message() {
        struct SelfCorrectingTool;
        #[async_trait]
        impl crate::tools::Tool for SelfCorrectingTool {
            fn name(&self) -> &str {
                "edit"
            }
            fn description(&self) -> &str {
                "fails recoverably"
            }
            fn parameters(&self) -> serde_json::Value {
                serde_json::json!({})
            }
            async fn execute(&self, _args: &str) -> Result<ToolResult> {
                Ok(SelfCorrectError::new(
                    "edit",
                    vec!["view_file".to_string()],
                    "Read the file first",
                )
                .into_tool_result("String not found: 'foo'"))
            }
        }

        let call = tool_call("edit");
        let provider = ScriptedProvider::new(vec![
            LlmResponse::ToolCalls {
                calls: vec![call.clone()],
                usage: None,
            },
            LlmResponse::Text {
                text: "recovered".to_string(),
                usage: None,
            },
        ]);
        let registry = ToolRegistry::new(PathBuf::from("."));
        registry.register(Arc::new(SelfCorrectingTool));
        let agent = loop_with(provider, registry, fast_config());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut history = vec![Message::system("sys")];
        agent
            .run(&mut history, "edit foo", "hash4", &CancellationFlag::new(), &tx)
            .await
            .unwrap();

        // The raw error never reaches the history; the stand-in notice
        // holds the tool_call_id slot and a synthetic user prompt follows
        let tool_message = history
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some(call.id.as_str()))
            .unwrap();
        assert!(!tool_message.content.contains("String not found"));

        let synthetic = history
            .iter()
            .filter(|m| m.role == crate::llm::Role::User)
            .last()
            .unwrap();
        assert!(synthetic.content.starts_with("Previous approach failed."));
        assert!(synthetic.content.contains("Read the file first"));
        assert!(synthetic.content.contains("view_file"));

        // The retrying notice replaced the tool_result chunk
        let chunks = collect_chunks(&mut rx);
        assert!(chunks.iter().any(|c| matches!(
            c,
            StreamingChunk::Content { content } if content.starts_with("Retrying")
        )));
        assert!(!chunks
            .iter()
            .any(|c| matches!(c, StreamingChunk::ToolResult { .. })));
    }

    #[tokio::test]
    async fn test_correction_attempts_bounded() {
        struct AlwaysFailingTool;
        #[async_trait]
        impl crate::tools::Tool for AlwaysFailingTool {
            fn name(&self) -> &str {
                "edit"
            }
            fn description(&self) -> &str {
                "fails recoverably forever"
            }
            fn parameters(&self) -> serde_json::Value {
                serde_json::json!({})
            }
            async fn execute(&self, _args: &str) -> Result<ToolResult> {
                Ok(SelfCorrectError::new("edit", vec![], "try harder")
                    .into_tool_result("String not found: 'x'"))
            }
        }

        // Four failing rounds, then text
        let responses: Vec<LlmResponse> = (0..4)
            .map(|_| LlmResponse::ToolCalls {
                calls: vec![tool_call("edit")],
                usage: None,
            })
            .chain(std::iter::once(LlmResponse::Text {
                text: "giving up".to_string(),
                usage: None,
            }))
            .collect();

        let provider = ScriptedProvider::new(responses);
        let registry = ToolRegistry::new(PathBuf::from("."));
        registry.register(Arc::new(AlwaysFailingTool));
        let agent = loop_with(provider, registry, fast_config());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut history = vec![Message::system("sys")];
        agent
            .run(&mut history, "edit x", "hash5", &CancellationFlag::new(), &tx)
            .await
            .unwrap();

        // Attempts 1-3 queue corrections; the fourth surfaces the raw error
        let synthetic_count = history
            .iter()
            .filter(|m| m.content.starts_with("Previous approach failed."))
            .count();
        assert_eq!(synthetic_count, 3);

        let chunks = collect_chunks(&mut rx);
        let raw_results = chunks
            .iter()
            .filter(|c| matches!(c, StreamingChunk::ToolResult { .. }))
            .count();
        assert_eq!(raw_results, 1);
    }

    #[tokio::test]
    async fn test_cancellation_before_round_emits_notice_and_done() {
        let provider = ScriptedProvider::new(vec![]);
        let registry = ToolRegistry::new(PathBuf::from("."));
        let agent = loop_with(provider, registry, fast_config());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut history = vec![Message::system("sys")];
        let cancel = CancellationFlag::new();
        cancel.cancel();

        agent
            .run(&mut history, "hi", "hash6", &cancel, &tx)
            .await
            .unwrap();

        assert_eq!(history.last().unwrap().content, CANCELLED_NOTICE);
        let chunks = collect_chunks(&mut rx);
        assert!(chunks.iter().any(|c| matches!(
            c,
            StreamingChunk::Content { content } if content == CANCELLED_NOTICE
        )));
        assert!(matches!(chunks.last(), Some(StreamingChunk::Done)));
    }

    #[tokio::test]
    async fn test_history_is_append_only_with_system_first() {
        let provider = ScriptedProvider::new(vec![
            LlmResponse::ToolCalls {
                calls: vec![tool_call("probe")],
                usage: None,
            },
            LlmResponse::Text {
                text: "done".to_string(),
                usage: None,
            },
        ]);
        let registry = ToolRegistry::new(PathBuf::from("."));
        registry.register(Arc::new(CountingTool {
            count: std::sync::atomic::AtomicUsize::new(0),
        }));
        let agent = loop_with(provider, registry, fast_config());

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut history = vec![Message::system("sys")];
        let before: Vec<String> = history.iter().map(|m| m.content.clone()).collect();

        agent
            .run(&mut history, "go", "hash7", &CancellationFlag::new(), &tx)
            .await
            .unwrap();

        // Existing prefix unchanged, system message still index 0
        assert_eq!(history[0].role, crate::llm::Role::System);
        for (i, content) in before.iter().enumerate() {
            assert_eq!(&history[i].content, content);
        }
    }
}
