//! Structured recoverable-failure envelope
//!
//! A tool that fails in a way the agent can recover from returns a
//! [`SelfCorrectError`] carried inside `ToolResult.metadata`. The envelope
//! is plain JSON so it survives any boundary (transport, IPC, log files).
//! A legacy string marker (`SELF_CORRECT_ATTEMPT: …`) in the error text is
//! still accepted on ingest.

use super::ToolResult;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Metadata key marking a recoverable error
pub const SELF_CORRECT_KEY: &str = "isSelfCorrectError";

/// Metadata key holding the serialized envelope
const ENVELOPE_KEY: &str = "selfCorrect";

static LEGACY_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"SELF_CORRECT_ATTEMPT: (.+)").expect("valid legacy marker regex"));

/// A recoverable tool failure with guidance for retrying
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelfCorrectError {
    /// Tool whose invocation failed
    pub original_tool: String,
    /// Tools worth trying instead, in preference order
    pub suggested_fallbacks: Vec<String>,
    /// LLM-actionable guidance
    pub hint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl SelfCorrectError {
    pub fn new(
        original_tool: impl Into<String>,
        suggested_fallbacks: Vec<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self {
            original_tool: original_tool.into(),
            suggested_fallbacks,
            hint: hint.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Wrap into a failed `ToolResult` with the envelope in metadata
    ///
    /// The error text stays human/LLM-readable; the structured envelope is
    /// what the extraction path prefers.
    pub fn into_tool_result(self, error_text: impl Into<String>) -> ToolResult {
        let envelope = serde_json::to_value(&self).unwrap_or(serde_json::Value::Null);
        ToolResult::error(error_text)
            .with_metadata(SELF_CORRECT_KEY, serde_json::Value::Bool(true))
            .with_metadata(ENVELOPE_KEY, envelope)
    }

    /// Extract a self-correct error from a tool result
    ///
    /// Prefers the metadata envelope; falls back to the legacy string
    /// marker in the error text.
    pub fn extract(result: &ToolResult) -> Option<SelfCorrectError> {
        if result.success {
            return None;
        }

        if let Some(metadata) = &result.metadata {
            let marked = metadata
                .get(SELF_CORRECT_KEY)
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if marked {
                if let Some(envelope) = metadata.get(ENVELOPE_KEY) {
                    if let Ok(err) = serde_json::from_value(envelope.clone()) {
                        return Some(err);
                    }
                }
                // Marked but no parseable envelope: recover what we can
                return Some(SelfCorrectError::new(
                    "",
                    Vec::new(),
                    result.error.clone().unwrap_or_default(),
                ));
            }
        }

        let error_text = result.error.as_deref()?;
        let captures = LEGACY_MARKER.captures(error_text)?;
        let hint = captures.get(1)?.as_str().trim().to_string();
        Some(SelfCorrectError::new("", Vec::new(), hint))
    }
}
