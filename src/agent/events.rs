//! Outgoing stream chunks and persisted chat entries

use crate::llm::{Message, ToolCall};
use crate::tools::ToolResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tagged union streamed to the consumer of a request
///
/// Chunk order within a round is `content* -> tool_calls -> tool_result*`,
/// with exactly one `done` closing the request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamingChunk {
    Content {
        content: String,
    },
    TokenCount {
        #[serde(rename = "tokenCount")]
        token_count: usize,
    },
    ToolCalls {
        #[serde(rename = "toolCalls")]
        tool_calls: Vec<ToolCall>,
    },
    ToolResult {
        #[serde(rename = "toolCall")]
        tool_call: ToolCall,
        #[serde(rename = "toolResult")]
        tool_result: ToolResult,
    },
    Done,
}

/// One line of the persisted session log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "toolCallId", skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(rename = "toolCallsCount", skip_serializing_if = "Option::is_none")]
    pub tool_calls_count: Option<usize>,
}

impl ChatEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            entry_type: "user".to_string(),
            content: content.into(),
            timestamp: Utc::now(),
            tool_call_id: None,
            tool_calls_count: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            entry_type: "assistant".to_string(),
            content: content.into(),
            timestamp: Utc::now(),
            tool_call_id: None,
            tool_calls_count: None,
        }
    }

    pub fn tool_calls(count: usize) -> Self {
        Self {
            entry_type: "tool_calls".to_string(),
            content: format!("{} tool call(s)", count),
            timestamp: Utc::now(),
            tool_call_id: None,
            tool_calls_count: Some(count),
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            entry_type: "tool_result".to_string(),
            content: content.into(),
            timestamp: Utc::now(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls_count: None,
        }
    }
}

/// Rough token estimate: one token per four characters, rounded up
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Estimate across a message history, including tool-call payloads
pub fn estimate_history_tokens(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| {
            let call_chars: usize = m
                .tool_calls
                .iter()
                .flatten()
                .map(|c| c.name.len() + c.arguments.len())
                .sum();
            estimate_tokens(&m.content) + call_chars.div_ceil(4)
        })
        .sum()
}
