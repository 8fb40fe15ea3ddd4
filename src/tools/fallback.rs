//! Fallback strategies for failed tool calls
//!
//! When a tool fails recoverably, the engine transforms the call into one
//! or more invocations of a related tool. Retries are counted per
//! `tool_name:tool_call_id`, capped at [`MAX_FALLBACK_RETRIES`], with
//! exponential backoff between attempts (1s, 2s, 4s). Counters clear on
//! success or exhaustion and are never shared across requests.

use super::{ToolRegistry, ToolResult};
use crate::llm::ToolCall;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Maximum fallback attempts per tool call
pub const MAX_FALLBACK_RETRIES: u32 = 3;

/// How a failed call is transformed into fallback invocations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Split a batch call into one fallback invocation per in-scope file
    DecomposeAndRetry,
    /// Re-issue an atomic batch one operation at a time; abort on failure
    SequentialExecution,
    /// Re-issue the original arguments against the fallback tool unchanged
    SimplerTool,
    /// Synthesize an equivalent shell command (grep/find)
    BashFallback,
}

/// A registered fallback rule for one tool
#[derive(Debug, Clone)]
pub struct FallbackStrategy {
    /// Fallback tools in preference order; dispatch uses the first
    pub fallback_tools: Vec<String>,
    pub strategy: StrategyKind,
    pub description: String,
}

/// Dispatches fallback strategies with bounded, backed-off retries
pub struct FallbackEngine {
    strategies: HashMap<String, FallbackStrategy>,
    retry_counts: DashMap<String, u32>,
}

impl FallbackEngine {
    /// Engine with no registered strategies
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
            retry_counts: DashMap::new(),
        }
    }

    /// Engine pre-loaded with strategies for the built-in tools
    pub fn with_defaults() -> Self {
        let mut engine = Self::new();
        engine.register_strategy(
            "batch_refactor",
            FallbackStrategy {
                fallback_tools: vec!["str_replace_edit".to_string()],
                strategy: StrategyKind::DecomposeAndRetry,
                description: "Apply the refactoring file by file".to_string(),
            },
        );
        engine.register_strategy(
            "multi_file_edit",
            FallbackStrategy {
                fallback_tools: vec!["str_replace_edit".to_string()],
                strategy: StrategyKind::SequentialExecution,
                description: "Apply the batch one edit at a time".to_string(),
            },
        );
        engine.register_strategy(
            "search",
            FallbackStrategy {
                fallback_tools: vec!["bash".to_string()],
                strategy: StrategyKind::BashFallback,
                description: "Approximate the search with grep".to_string(),
            },
        );
        engine.register_strategy(
            "find_files",
            FallbackStrategy {
                fallback_tools: vec!["bash".to_string()],
                strategy: StrategyKind::BashFallback,
                description: "Approximate the lookup with find".to_string(),
            },
        );
        engine
    }

    /// Register (or replace) a strategy for a tool
    pub fn register_strategy(&mut self, tool: &str, strategy: FallbackStrategy) {
        self.strategies.insert(tool.to_string(), strategy);
    }

    /// Strategy registered for a tool, if any
    pub fn strategy_for(&self, tool: &str) -> Option<&FallbackStrategy> {
        self.strategies.get(tool)
    }

    /// Current retry count for a call (diagnostics and tests)
    pub fn retry_count(&self, call: &ToolCall) -> u32 {
        self.retry_counts
            .get(&retry_key(call))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Attempt to rescue a failed call
    ///
    /// Increments the retry counter first; once the cap is reached the
    /// counter is cleared and a terminal failure returned. Otherwise the
    /// registered strategy runs after the backoff delay.
    pub async fn attempt_fallback(
        &self,
        call: &ToolCall,
        original_error: &str,
        registry: &ToolRegistry,
    ) -> ToolResult {
        let Some(strategy) = self.strategies.get(&call.name) else {
            return ToolResult::error(format!(
                "No fallback strategy registered for '{}': {}",
                call.name, original_error
            ));
        };
        let Some(fallback_tool) = strategy.fallback_tools.first() else {
            return ToolResult::error(format!(
                "Fallback strategy for '{}' names no tools",
                call.name
            ));
        };

        let key = retry_key(call);
        let attempt = {
            let mut count = self.retry_counts.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if attempt > MAX_FALLBACK_RETRIES {
            self.retry_counts.remove(&key);
            return ToolResult::error(format!(
                "All fallback attempts failed for '{}' after {} retries: {}",
                call.name, MAX_FALLBACK_RETRIES, original_error
            ));
        }

        // Backoff 2^(n-1) seconds: 1s, 2s, 4s
        let delay = Duration::from_secs(1 << (attempt - 1));
        tracing::debug!(
            tool = %call.name,
            fallback = %fallback_tool,
            attempt,
            delay_secs = delay.as_secs(),
            "Attempting fallback"
        );
        tokio::time::sleep(delay).await;

        let result = match strategy.strategy {
            StrategyKind::SimplerTool => registry.execute(fallback_tool, &call.arguments).await,
            StrategyKind::DecomposeAndRetry => {
                self.decompose_and_retry(call, fallback_tool, registry).await
            }
            StrategyKind::SequentialExecution => {
                self.sequential_execution(call, fallback_tool, registry).await
            }
            StrategyKind::BashFallback => self.bash_fallback(call, fallback_tool, registry).await,
        };

        if result.success {
            self.retry_counts.remove(&key);
        }
        result
    }

    /// Translate each in-scope file into a separate fallback invocation
    async fn decompose_and_retry(
        &self,
        call: &ToolCall,
        fallback_tool: &str,
        registry: &ToolRegistry,
    ) -> ToolResult {
        let args: Value = match serde_json::from_str(&call.arguments) {
            Ok(v) => v,
            Err(e) => return ToolResult::error(format!("Cannot decompose arguments: {}", e)),
        };

        let Some(files) = args.get("files").and_then(|f| f.as_array()).cloned() else {
            return ToolResult::error(
                "Cannot decompose: arguments carry no 'files' array".to_string(),
            );
        };

        let mut outputs = Vec::new();
        for file in &files {
            let Some(path) = file.as_str() else { continue };
            let mut per_file = args.clone();
            if let Some(obj) = per_file.as_object_mut() {
                obj.remove("files");
                obj.insert("path".to_string(), Value::String(path.to_string()));
            }
            let result = registry.execute(fallback_tool, &per_file.to_string()).await;
            if !result.success {
                return ToolResult::error(format!(
                    "Decomposed fallback failed on {}: {}",
                    path,
                    result.error.unwrap_or_default()
                ));
            }
            outputs.push(format!("{}: {}", path, result.output.unwrap_or_default()));
        }

        ToolResult::success(format!(
            "Applied to {} file(s):\n{}",
            outputs.len(),
            outputs.join("\n")
        ))
    }

    /// Re-issue an atomic batch one operation at a time
    async fn sequential_execution(
        &self,
        call: &ToolCall,
        fallback_tool: &str,
        registry: &ToolRegistry,
    ) -> ToolResult {
        let args: Value = match serde_json::from_str(&call.arguments) {
            Ok(v) => v,
            Err(e) => return ToolResult::error(format!("Cannot sequence arguments: {}", e)),
        };

        let Some(operations) = args.get("operations").and_then(|o| o.as_array()) else {
            return ToolResult::error(
                "Cannot sequence: arguments carry no 'operations' array".to_string(),
            );
        };

        let mut outputs = Vec::new();
        for (index, operation) in operations.iter().enumerate() {
            let result = registry.execute(fallback_tool, &operation.to_string()).await;
            if !result.success {
                return ToolResult::error(format!(
                    "Sequential fallback aborted at step {}: {}",
                    index,
                    result.error.unwrap_or_default()
                ));
            }
            outputs.push(result.output.unwrap_or_default());
        }

        ToolResult::success(format!(
            "Executed {} operation(s) sequentially:\n{}",
            outputs.len(),
            outputs.join("\n")
        ))
    }

    /// Synthesize a shell equivalent of the original intent
    async fn bash_fallback(
        &self,
        call: &ToolCall,
        fallback_tool: &str,
        registry: &ToolRegistry,
    ) -> ToolResult {
        let args: Value = serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
        let pattern = args
            .get("pattern")
            .and_then(|p| p.as_str())
            .unwrap_or_default();
        if pattern.is_empty() {
            return ToolResult::error("Cannot build a shell fallback without a pattern".to_string());
        }
        // Single-quote the pattern; embedded quotes are closed around
        let quoted = format!("'{}'", pattern.replace('\'', r"'\''"));

        let command = if call.name == "find_files" {
            format!("find . -type f -name '*{}*'", pattern.replace('\'', ""))
        } else {
            let path = args.get("path").and_then(|p| p.as_str()).unwrap_or(".");
            format!("grep -rn {} {}", quoted, path)
        };

        let shell_args = serde_json::json!({ "command": command }).to_string();
        registry.execute(fallback_tool, &shell_args).await
    }
}

impl Default for FallbackEngine {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn retry_key(call: &ToolCall) -> String {
    format!("{}:{}", call.name, call.id)
}
