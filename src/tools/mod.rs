//! Agent tools for file system and shell operations
//!
//! Tools are a flat capability set behind the [`Tool`] trait; the
//! [`ToolRegistry`] maps names to handlers and advertises their schemas to
//! the LLM. Handlers receive the JSON-encoded argument string exactly as
//! the model emitted it and report failures as values, never as `Err`.

mod fallback;
mod file_ops;
mod history;
mod io_pool;
mod search;
mod self_correct;
mod shell;

pub use fallback::{FallbackEngine, FallbackStrategy, StrategyKind, MAX_FALLBACK_RETRIES};
pub use file_ops::{CreateFileTool, DeleteFileTool, ListDirectoryTool, StrReplaceEditTool, ViewFileTool};
pub use history::OperationHistoryTool;
pub use io_pool::{acquire_read_permit, acquire_write_permit, READ_POOL_SIZE, WRITE_POOL_SIZE};
pub use search::{FindFilesTool, SearchTool};
pub use self_correct::SelfCorrectError;
pub use shell::BashTool;

use crate::llm::ToolDefinition;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

/// Result of executing a tool
///
/// Invariant: `success` implies `output` is populated; `!success` implies
/// `error` is populated. `metadata` carries structured side-channel data
/// such as the self-correct envelope.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, Value>>,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            metadata: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(message.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), value);
        self
    }

    /// Text to feed back to the LLM as the tool message body
    pub fn llm_text(&self) -> String {
        if self.success {
            self.output.clone().unwrap_or_default()
        } else {
            self.error.clone().unwrap_or_else(|| "Tool failed".to_string())
        }
    }
}

/// Trait for agent tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name
    fn name(&self) -> &str;

    /// Get the tool description
    fn description(&self) -> &str;

    /// Get the JSON schema for parameters
    fn parameters(&self) -> Value;

    /// Execute the tool with the JSON-encoded argument string
    async fn execute(&self, args: &str) -> Result<ToolResult>;

    /// Convert to LLM tool definition
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Prefix for dynamically discovered remote tools
pub const MCP_TOOL_PREFIX: &str = "mcp__";

/// Registry of available tools
///
/// Shared behind `Arc`; registration and MCP refresh use interior
/// mutability so the agent loop can refresh between rounds without
/// re-wiring anything.
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
    working_dir: PathBuf,
}

impl ToolRegistry {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            tools: DashMap::new(),
            working_dir,
        }
    }

    /// Create a registry with all built-in tools
    pub fn with_defaults(working_dir: PathBuf) -> Self {
        let registry = Self::new(working_dir.clone());

        registry.register(Arc::new(ViewFileTool::new(working_dir.clone())));
        registry.register(Arc::new(CreateFileTool::new(working_dir.clone())));
        registry.register(Arc::new(StrReplaceEditTool::new(working_dir.clone())));
        registry.register(Arc::new(DeleteFileTool::new(working_dir.clone())));
        registry.register(Arc::new(ListDirectoryTool::new(working_dir.clone())));
        registry.register(Arc::new(SearchTool::new(working_dir.clone())));
        registry.register(Arc::new(FindFilesTool::new(working_dir.clone())));
        registry.register(Arc::new(BashTool::new(working_dir)));
        registry.register(Arc::new(OperationHistoryTool::new()));

        let tool_names: Vec<_> = registry.tool_names();
        tracing::debug!("Tool registry created with tools: {:?}", tool_names);

        registry
    }

    /// Register a tool (replaces any existing tool with the same name)
    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|entry| entry.value().clone())
    }

    /// Check whether a tool exists
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted for deterministic output
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Execute a tool by name with the JSON-encoded argument string
    ///
    /// Unknown names and handler errors both surface as failed results;
    /// this method never returns `Err`.
    pub async fn execute(&self, name: &str, args: &str) -> ToolResult {
        let Some(tool) = self.get(name) else {
            return ToolResult::error(format!("Unknown tool: {}", name));
        };

        match tool.execute(args).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Tool '{}' failed: {:#}", name, e);
                ToolResult::error(format!("{:#}", e))
            }
        }
    }

    /// Get all tool definitions for the LLM, sorted by name
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.iter().map(|e| e.value().to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Remove all `mcp__*` tools (precedes a refresh from transports)
    pub fn clear_mcp_tools(&self) {
        self.tools.retain(|name, _| !name.starts_with(MCP_TOOL_PREFIX));
    }

    /// Get working directory
    pub fn working_dir(&self) -> &PathBuf {
        &self.working_dir
    }
}
