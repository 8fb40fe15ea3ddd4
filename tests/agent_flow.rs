//! End-to-end agent loop scenarios with a scripted LLM

mod common;

use common::*;
use grok_core::agent::{
    AgentLoopConfig, CancellationFlag, StreamingChunk, CANCELLED_NOTICE, MAX_ROUNDS_NOTICE,
};
use grok_core::llm::LlmResponse;
use grok_core::metrics::metrics_collector;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn happy_path_single_tool() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("package.json"),
        r#"{"name": "demo", "version": "1.0.0"}"#,
    )
    .unwrap();

    let provider = Arc::new(MockProvider::new(vec![
        LlmResponse::ToolCalls {
            calls: vec![call(
                "call_1",
                "view_file",
                serde_json::json!({"path": "package.json"}),
            )],
            usage: None,
        },
        LlmResponse::Text {
            text: "That is a minimal package manifest.".to_string(),
            usage: None,
        },
    ]));

    let orchestrator = orchestrator_with(provider.clone(), dir.path(), fast_loop_config());
    let stream = orchestrator
        .process_user_message_stream("show me package.json".to_string(), CancellationFlag::new());
    let chunks = collect_stream(stream).await;

    // One tool_result carrying the file contents
    let results: Vec<_> = chunks
        .iter()
        .filter_map(|c| match c {
            StreamingChunk::ToolResult {
                tool_call,
                tool_result,
            } => Some((tool_call, tool_result)),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0.name, "view_file");
    assert!(results[0]
        .1
        .output
        .as_deref()
        .unwrap()
        .contains("\"name\": \"demo\""));

    // Final assistant text and exactly one done
    assert!(content_text(&chunks).contains("minimal package manifest"));
    assert_eq!(done_count(&chunks), 1);
    assert_eq!(provider.call_count(), 2);
}

#[tokio::test]
async fn self_correction_recovers_failed_edit() {
    let dir = TempDir::new().unwrap();
    let app = dir.path().join("app.ts");
    std::fs::write(&app, "const foo = 1;\n").unwrap();

    let provider = Arc::new(MockProvider::new(vec![
        // Wrong old_str: exact-match miss triggers the self-correct path
        LlmResponse::ToolCalls {
            calls: vec![call(
                "call_1",
                "str_replace_edit",
                serde_json::json!({"path": "app.ts", "old_str": "const fooo = 1;", "new_str": "const bar = 1;"}),
            )],
            usage: None,
        },
        // Re-engaged LLM inspects the file
        LlmResponse::ToolCalls {
            calls: vec![call(
                "call_2",
                "view_file",
                serde_json::json!({"path": "app.ts"}),
            )],
            usage: None,
        },
        // Corrected edit succeeds
        LlmResponse::ToolCalls {
            calls: vec![call(
                "call_3",
                "str_replace_edit",
                serde_json::json!({"path": "app.ts", "old_str": "const foo = 1;", "new_str": "const bar = 1;"}),
            )],
            usage: None,
        },
        LlmResponse::Text {
            text: "Renamed foo to bar.".to_string(),
            usage: None,
        },
    ]));

    let orchestrator = orchestrator_with(provider.clone(), dir.path(), fast_loop_config());
    let stream = orchestrator.process_user_message_stream(
        "change foo to bar in app.ts".to_string(),
        CancellationFlag::new(),
    );
    let chunks = collect_stream(stream).await;

    // The retrying notice replaced the raw failure on the stream
    let text = content_text(&chunks);
    assert!(text.contains("Retrying"), "stream text: {}", text);
    assert!(!text.contains("String not found"));

    // The corrected edit landed on disk
    assert_eq!(std::fs::read_to_string(&app).unwrap(), "const bar = 1;\n");
    assert_eq!(done_count(&chunks), 1);

    // The failed attempt was counted as a retry
    assert!(metrics_collector().aggregated().total_retries >= 1);
}

#[tokio::test]
async fn identical_request_guard_trips_before_llm() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new(vec![
        LlmResponse::Text {
            text: "Hello!".to_string(),
            usage: None,
        },
    ]));

    let orchestrator = orchestrator_with(provider.clone(), dir.path(), fast_loop_config());

    let first = orchestrator
        .process_user_message("greet me please".to_string())
        .await;
    assert!(first.iter().any(|e| e.content.contains("Hello!")));
    assert_eq!(provider.call_count(), 1);

    // The identical request is refused without reaching the LLM
    let second = orchestrator
        .process_user_message("greet me please".to_string())
        .await;
    assert!(second.iter().any(|e| e.content.contains("Loop detected")));
    assert_eq!(provider.call_count(), 1);

    // The guard clears its counter on trip; a later retry goes through
    let third = orchestrator
        .process_user_message("greet me please".to_string())
        .await;
    assert!(third.iter().any(|e| !e.content.contains("Loop detected")));
    assert_eq!(provider.call_count(), 2);
}

#[tokio::test]
async fn cancellation_between_batches_stops_tools() {
    use async_trait::async_trait;
    use grok_core::tools::{Tool, ToolResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    let dir = TempDir::new().unwrap();

    // The first tool execution cancels the request; later batches must
    // never run
    struct CancellingTool {
        cancel: CancellationFlag,
        executions: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for CancellingTool {
        fn name(&self) -> &str {
            "slow_probe"
        }
        fn description(&self) -> &str {
            "cancels the request"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({})
        }
        async fn execute(&self, _args: &str) -> anyhow::Result<ToolResult> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            self.cancel.cancel();
            Ok(ToolResult::success("probed"))
        }
    }

    let provider = Arc::new(MockProvider::new(vec![LlmResponse::ToolCalls {
        calls: vec![
            call("call_1", "slow_probe", serde_json::json!({})),
            call("call_2", "slow_probe", serde_json::json!({})),
            call("call_3", "slow_probe", serde_json::json!({})),
        ],
        usage: None,
    }]));

    let cancel = CancellationFlag::new();
    let executions = Arc::new(AtomicUsize::new(0));

    let config = AgentLoopConfig {
        max_concurrent_tool_calls: 1,
        min_request_interval: Duration::ZERO,
        ..Default::default()
    };
    let orchestrator = orchestrator_with(provider.clone(), dir.path(), config);
    orchestrator.registry().register(Arc::new(CancellingTool {
        cancel: cancel.clone(),
        executions: executions.clone(),
    }));

    let stream =
        orchestrator.process_user_message_stream("probe everything".to_string(), cancel);
    let chunks = collect_stream(stream).await;

    // Only the first batch ran
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert!(content_text(&chunks).contains(CANCELLED_NOTICE));
    assert_eq!(done_count(&chunks), 1);
}

#[tokio::test]
async fn max_rounds_terminates_relentless_tool_calls() {
    use async_trait::async_trait;
    use grok_core::llm::{LlmProvider, Message, StreamCallback, ToolDefinition};

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
        ) -> anyhow::Result<LlmResponse> {
            Ok(LlmResponse::ToolCalls {
                calls: vec![grok_core::llm::ToolCall::synthetic(
                    "list_directory",
                    "{}",
                )],
                usage: None,
            })
        }
        async fn chat_streaming(
            &self,
            messages: &[Message],
            tools: Option<&[ToolDefinition]>,
            _callback: StreamCallback,
            _interrupt_check: Option<&(dyn Fn() -> bool + Send + Sync)>,
        ) -> anyhow::Result<LlmResponse> {
            self.chat(messages, tools).await
        }
    }

    let dir = TempDir::new().unwrap();
    let registry = Arc::new(grok_core::tools::ToolRegistry::with_defaults(
        dir.path().to_path_buf(),
    ));
    let fallback = Arc::new(grok_core::tools::FallbackEngine::new());
    let agent_loop = grok_core::agent::AgentLoop::new(
        Arc::new(RelentlessProvider),
        registry.clone(),
        fallback,
    )
    .with_config(AgentLoopConfig {
        max_tool_rounds: 4,
        min_request_interval: Duration::ZERO,
        ..Default::default()
    });

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let mut history = vec![Message::system("sys")];
    agent_loop
        .run(
            &mut history,
            "never stop",
            "hash",
            &CancellationFlag::new(),
            &tx,
        )
        .await
        .unwrap();
    drop(tx);

    let chunks =
        collect_stream(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)).await;
    assert!(content_text(&chunks).contains(MAX_ROUNDS_NOTICE));

    let tool_rounds = history.iter().filter(|m| m.tool_calls.is_some()).count();
    assert_eq!(tool_rounds, 4);
}
