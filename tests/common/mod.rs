//! Shared fixtures for integration tests

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use grok_core::agent::{AgentLoop, AgentLoopConfig, Orchestrator, StreamingChunk};
use grok_core::llm::{
    LlmProvider, LlmResponse, Message, StreamCallback, StreamEvent, ToolCall, ToolDefinition,
};
use grok_core::planner::{Planner, WorkspaceScanner};
use grok_core::storage::SessionLog;
use grok_core::tools::{FallbackEngine, ToolRegistry};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::StreamExt;

/// Scripted LLM provider: pops one response per chat call and counts calls
pub struct MockProvider {
    responses: Mutex<Vec<LlmResponse>>,
    pub calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat(
        &self,
        _messages: &[Message],
        _tools: Option<&[ToolDefinition]>,
    ) -> Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(LlmResponse::Text {
                text: "Done.".to_string(),
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
        callback: StreamCallback,
        _interrupt_check: Option<&(dyn Fn() -> bool + Send + Sync)>,
    ) -> Result<LlmResponse> {
        let response = self.chat(messages, tools).await?;
        // Mirror a real endpoint: text arrives as stream deltas
        if let Some(text) = response.text() {
            if !text.is_empty() {
                callback(StreamEvent::TextDelta(text.to_string()));
            }
        }
        callback(StreamEvent::Done);
        Ok(response)
    }
}

/// A tool call with fixed id for scripted responses
pub fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: args.to_string(),
    }
}

/// Orchestrator wired with the mock provider over a workspace directory
pub fn orchestrator_with(
    provider: Arc<MockProvider>,
    workspace: &Path,
    loop_config: AgentLoopConfig,
) -> Arc<Orchestrator> {
    let registry = Arc::new(ToolRegistry::with_defaults(workspace.to_path_buf()));
    let fallback = Arc::new(FallbackEngine::with_defaults());
    let planner = Planner::new(
        Arc::new(WorkspaceScanner::new(workspace.to_path_buf())),
        workspace.to_path_buf(),
    );
    let agent_loop = AgentLoop::new(provider.clone(), registry.clone(), fallback.clone())
        .with_config(loop_config);

    Arc::new(
        Orchestrator::new(provider, registry, planner, fallback)
            .with_agent_loop(agent_loop)
            .with_session_log(SessionLog::disabled()),
    )
}

/// Loop config without pacing delays for fast tests
pub fn fast_loop_config() -> AgentLoopConfig {
    AgentLoopConfig {
        min_request_interval: Duration::ZERO,
        ..Default::default()
    }
}

/// Drain a request stream into a chunk list
pub async fn collect_stream(
    mut stream: tokio_stream::wrappers::UnboundedReceiverStream<StreamingChunk>,
) -> Vec<StreamingChunk> {
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        let is_done = matches!(chunk, StreamingChunk::Done);
        chunks.push(chunk);
        if is_done {
            break;
        }
    }
    chunks
}

/// All content chunks concatenated
pub fn content_text(chunks: &[StreamingChunk]) -> String {
    chunks
        .iter()
        .filter_map(|c| match c {
            StreamingChunk::Content { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

pub fn done_count(chunks: &[StreamingChunk]) -> usize {
    chunks
        .iter()
        .filter(|c| matches!(c, StreamingChunk::Done))
        .count()
}
