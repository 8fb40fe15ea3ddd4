//! Read-only tool exposing the recorded operation history

use super::{Tool, ToolResult};
use crate::tracking::operation_tracker;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

const DEFAULT_LIMIT: usize = 20;

/// Tool that reports recent tracked file operations
pub struct OperationHistoryTool;

impl OperationHistoryTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OperationHistoryTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for OperationHistoryTool {
    fn name(&self) -> &str {
        "operation_history"
    }

    fn description(&self) -> &str {
        "Show recent file operations performed in this session (type, path, content hash, timestamp)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": {
                    "type": "integer",
                    "description": "Maximum operations to show (default: 20)"
                }
            }
        })
    }

    async fn execute(&self, args: &str) -> Result<ToolResult> {
        #[derive(Deserialize, Default)]
        struct Params {
            limit: Option<usize>,
        }

        let params: Params = if args.trim().is_empty() {
            Params::default()
        } else {
            serde_json::from_str(args).unwrap_or_default()
        };
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT);

        let operations = operation_tracker().recent_operations(limit);
        if operations.is_empty() {
            return Ok(ToolResult::success("No operations recorded yet."));
        }

        let lines: Vec<String> = operations
            .iter()
            .map(|op| {
                format!(
                    "{} {} {} {}",
                    op.timestamp.format("%H:%M:%S"),
                    op.op_type.label(),
                    op.file_path.display(),
                    op.content_hash
                        .as_deref()
                        .map(|h| &h[..12.min(h.len())])
                        .unwrap_or("-")
                )
            })
            .collect();

        Ok(ToolResult::success(lines.join("\n")))
    }
}
