//! OpenAI-chat-compatible LLM transport
//!
//! Works against any endpoint speaking the chat-completions format
//! (tool calls included). Streaming uses SSE with incremental tool-call
//! fragments reduced by index.

use super::streaming::ToolCallReducer;
use super::{
    LlmError, LlmProvider, LlmResponse, Message, Role, StreamCallback, StreamEvent, TokenUsage,
    ToolCall, ToolDefinition,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default request timeout for non-streaming calls (6 minutes)
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(360);
/// Default overall timeout for streaming calls (60 minutes, long-reasoning models)
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(3600);

/// Splits an SSE byte stream into `data:` payloads
///
/// Network chunks land mid-event or carry several events at once, so
/// unterminated input stays buffered until more bytes arrive; `tail()`
/// flushes whatever the stream left behind without a final newline.
/// Comment lines and non-`data:` fields are dropped, CRLF tolerated.
#[derive(Debug, Default)]
struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    /// Absorb bytes and return every `data:` payload completed by them
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            if let Some(payload) = Self::data_payload(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flush payloads from any unterminated final line
    fn tail(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.pending);
        rest.split(|&b| b == b'\n')
            .filter_map(Self::data_payload)
            .collect()
    }

    fn data_payload(line: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(line);
        let payload = text.trim().strip_prefix("data:")?.trim();
        (!payload.is_empty()).then(|| payload.to_string())
    }
}

/// Configuration for an OpenAI-compatible endpoint
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub request_timeout: Duration,
    pub stream_timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: None,
            temperature: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_timeouts(mut self, request: Duration, stream: Duration) -> Self {
        self.request_timeout = request;
        self.stream_timeout = stream;
        self
    }
}

/// OpenAI-compatible provider
pub struct OpenAiProvider {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                let tool_calls = msg.tool_calls.as_ref().map(|calls| {
                    calls
                        .iter()
                        .map(|tc| WireToolCall {
                            id: tc.id.clone(),
                            call_type: "function".to_string(),
                            function: WireFunctionCall {
                                name: tc.name.clone(),
                                arguments: tc.arguments.clone(),
                            },
                        })
                        .collect()
                });
                WireMessage {
                    role: role.to_string(),
                    content: Some(msg.content.clone()),
                    tool_calls,
                    tool_call_id: msg.tool_call_id.clone(),
                }
            })
            .collect()
    }

    fn convert_tools(&self, tools: &[ToolDefinition]) -> Vec<WireTool> {
        tools
            .iter()
            .map(|t| WireTool {
                tool_type: "function".to_string(),
                function: WireFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn build_request(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        stream: bool,
    ) -> WireRequest {
        let mut request = WireRequest {
            model: self.config.model.clone(),
            messages: self.convert_messages(messages),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            tools: None,
            tool_choice: None,
            stream: if stream { Some(true) } else { None },
        };

        if let Some(tools) = tools {
            if !tools.is_empty() {
                request.tools = Some(self.convert_tools(tools));
                request.tool_choice = Some("auto".to_string());
            }
        }

        request
    }

    fn parse_response(&self, response: WireResponse) -> LlmResponse {
        let usage = response.usage.map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        let Some(choice) = response.choices.into_iter().next() else {
            return LlmResponse::Text {
                text: String::new(),
                usage,
            };
        };

        let text = choice.message.content;
        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        if tool_calls.is_empty() {
            LlmResponse::Text {
                text: text.unwrap_or_default(),
                usage,
            }
        } else if text.as_deref().map(str::is_empty).unwrap_or(true) {
            LlmResponse::ToolCalls {
                calls: tool_calls,
                usage,
            }
        } else {
            LlmResponse::Mixed {
                text,
                tool_calls,
                usage,
            }
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai-compat"
    }

    async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<LlmResponse> {
        tracing::debug!(
            target: "llm",
            model = %self.config.model,
            messages = messages.len(),
            "Sending chat request"
        );

        let request = self.build_request(messages, tools, false);
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .timeout(self.config.request_timeout)
            .json(&request)
            .send()
            .await
            .context("Failed to send chat request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::endpoint(status, error_text).into());
        }

        let api_response: WireResponse = response
            .json()
            .await
            .context("Failed to parse chat response")?;

        Ok(self.parse_response(api_response))
    }

    async fn chat_streaming(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        callback: StreamCallback,
        interrupt_check: Option<&(dyn Fn() -> bool + Send + Sync)>,
    ) -> Result<LlmResponse> {
        use futures::StreamExt;
        use tokio::time::timeout;

        const STREAM_CHUNK_TIMEOUT: Duration = Duration::from_secs(60);
        const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

        tracing::debug!(
            target: "llm",
            model = %self.config.model,
            messages = messages.len(),
            "Sending streaming request"
        );

        let request = self.build_request(messages, tools, true);
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .timeout(self.config.stream_timeout)
            .json(&request)
            .send()
            .await
            .context("Failed to send streaming request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            callback(StreamEvent::Error(format!(
                "API error ({}): {}",
                status, error_text
            )));
            return Err(LlmError::endpoint(status, error_text).into());
        }

        let mut stream = response.bytes_stream();
        let mut decoder = SseLineBuffer::default();
        let mut reducer = ToolCallReducer::new();
        let mut text = String::new();
        let mut usage: Option<TokenUsage> = None;

        let mut last_activity_at = std::time::Instant::now();
        'stream: loop {
            if let Some(check) = interrupt_check {
                if check() {
                    break 'stream;
                }
            }

            if last_activity_at.elapsed() >= STREAM_CHUNK_TIMEOUT {
                return Err(LlmError::Stream(format!(
                    "no data for {} seconds",
                    STREAM_CHUNK_TIMEOUT.as_secs()
                ))
                .into());
            }

            // Short poll so interrupts stay responsive between chunks
            let chunk_result = match timeout(INTERRUPT_POLL_INTERVAL, stream.next()).await {
                Ok(Some(res)) => res,
                Ok(None) => break 'stream,
                Err(_) => continue,
            };

            last_activity_at = std::time::Instant::now();
            let chunk = chunk_result.context("Error reading stream chunk")?;

            for payload in decoder.feed(&chunk) {
                if payload == "[DONE]" {
                    callback(StreamEvent::Done);
                    continue;
                }
                process_stream_payload(&payload, &mut text, &mut usage, &mut reducer, &callback);
            }
        }

        for payload in decoder.tail() {
            if payload == "[DONE]" {
                continue;
            }
            process_stream_payload(&payload, &mut text, &mut usage, &mut reducer, &callback);
        }

        for event in reducer.completion_events() {
            callback(event);
        }

        let tool_calls = reducer.into_calls();
        Ok(if tool_calls.is_empty() {
            LlmResponse::Text { text, usage }
        } else if text.is_empty() {
            LlmResponse::ToolCalls {
                calls: tool_calls,
                usage,
            }
        } else {
            LlmResponse::Mixed {
                text: Some(text),
                tool_calls,
                usage,
            }
        })
    }
}

fn process_stream_payload(
    payload: &str,
    text: &mut String,
    usage: &mut Option<TokenUsage>,
    reducer: &mut ToolCallReducer,
    callback: &StreamCallback,
) {
    let Ok(chunk) = serde_json::from_str::<WireStreamChunk>(payload) else {
        tracing::warn!("Unparseable stream payload: {}", payload);
        return;
    };

    if let Some(choice) = chunk.choices.first() {
        if let Some(content) = &choice.delta.content {
            if !content.is_empty() {
                text.push_str(content);
                callback(StreamEvent::TextDelta(content.clone()));
            }
        }

        if let Some(tool_calls) = &choice.delta.tool_calls {
            for tc in tool_calls {
                let events = reducer.apply(
                    tc.index,
                    tc.id.as_deref(),
                    tc.function.as_ref().and_then(|f| f.name.as_deref()),
                    tc.function.as_ref().and_then(|f| f.arguments.as_deref()),
                );
                for event in events {
                    callback(event);
                }
            }
        }
    }

    if let Some(u) = chunk.usage {
        *usage = Some(TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });
    }
}

// ============================================================================
// Wire types (OpenAI chat-completions format)
// ============================================================================

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireStreamChunk {
    choices: Vec<WireStreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    delta: WireDelta,
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}
