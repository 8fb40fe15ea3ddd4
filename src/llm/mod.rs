//! LLM transport layer
//!
//! The core talks to any OpenAI-chat-compatible endpoint through the
//! [`LlmProvider`] trait; `OpenAiProvider` is the shipped implementation.

mod error;
pub mod openai;
pub mod streaming;
mod types;

pub use error::LlmError;
pub use openai::{OpenAiConfig, OpenAiProvider};
pub use types::{
    LlmResponse, Message, Role, StreamCallback, StreamEvent, TokenUsage, ToolCall, ToolDefinition,
};

use anyhow::Result;
use async_trait::async_trait;

/// Abstract LLM transport
///
/// `chat` is a single round trip; `chat_streaming` delivers incremental
/// deltas through the callback and still returns the assembled response.
/// The optional `interrupt_check` is polled between chunks so callers can
/// cancel mid-stream.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &str;

    /// Send a chat request and wait for the complete response
    async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<LlmResponse>;

    /// Send a chat request, streaming deltas through `callback`
    async fn chat_streaming(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        callback: StreamCallback,
        interrupt_check: Option<&(dyn Fn() -> bool + Send + Sync)>,
    ) -> Result<LlmResponse>;
}
