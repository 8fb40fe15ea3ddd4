//! MCP (Model Context Protocol) tool surface
//!
//! The transport itself is an external collaborator; this module defines
//! the seam ([`McpTransport`]) and the adapter that exposes remote tools
//! through the regular [`Tool`] contract under `mcp__<server>__<tool>`
//! names. The registry can be refreshed from transports between agent
//! rounds; a tool batch in flight keeps the registry it started with.

use crate::tools::{Tool, ToolRegistry, ToolResult, MCP_TOOL_PREFIX};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Default timeout for remote tool calls
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Tool definition advertised by an MCP server
#[derive(Debug, Clone)]
pub struct McpToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Result of a remote tool call
#[derive(Debug, Clone)]
pub struct McpCallResult {
    pub is_error: bool,
    pub text: String,
}

/// Abstract MCP server connection
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Server identifier used in tool names
    fn server_name(&self) -> &str;

    /// List the tools the server currently advertises
    async fn list_tools(&self) -> Result<Vec<McpToolDef>>;

    /// Invoke a tool with the JSON-encoded argument string
    async fn call_tool(&self, tool: &str, args: &str) -> Result<McpCallResult>;
}

/// Compose the registry-facing name for a remote tool
pub fn mcp_tool_name(server: &str, tool: &str) -> String {
    format!("{}{}__{}", MCP_TOOL_PREFIX, server, tool)
}

/// Adapter exposing one remote tool through the local `Tool` contract
pub struct McpTool {
    transport: Arc<dyn McpTransport>,
    def: McpToolDef,
    full_name: String,
    timeout: Duration,
}

impl McpTool {
    pub fn new(transport: Arc<dyn McpTransport>, def: McpToolDef) -> Self {
        let full_name = mcp_tool_name(transport.server_name(), &def.name);
        Self {
            transport,
            def,
            full_name,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.full_name
    }

    fn description(&self) -> &str {
        &self.def.description
    }

    fn parameters(&self) -> Value {
        self.def.input_schema.clone()
    }

    async fn execute(&self, args: &str) -> Result<ToolResult> {
        let call = self.transport.call_tool(&self.def.name, args);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(result)) => {
                if result.is_error {
                    Ok(ToolResult::error(result.text))
                } else {
                    Ok(ToolResult::success(result.text))
                }
            }
            Ok(Err(e)) => Ok(ToolResult::error(format!(
                "MCP call to '{}' failed: {:#}",
                self.full_name, e
            ))),
            Err(_) => Ok(ToolResult::error(format!(
                "MCP call to '{}' timed out after {}s",
                self.full_name,
                self.timeout.as_secs()
            ))),
        }
    }
}

/// Re-discover remote tools and swap them into the registry
///
/// Existing `mcp__*` registrations are dropped first; a transport that
/// fails to list keeps its tools out of this round and is logged.
pub async fn refresh_mcp_tools(
    registry: &ToolRegistry,
    transports: &[Arc<dyn McpTransport>],
) -> usize {
    registry.clear_mcp_tools();

    let mut registered = 0;
    for transport in transports {
        match transport.list_tools().await {
            Ok(defs) => {
                for def in defs {
                    registry.register(Arc::new(McpTool::new(transport.clone(), def)));
                    registered += 1;
                }
            }
            Err(e) => {
                tracing::warn!(
                    server = transport.server_name(),
                    "Failed to list MCP tools: {:#}",
                    e
                );
            }
        }
    }
    registered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct StubTransport {
        name: String,
        tools: Vec<McpToolDef>,
    }

    #[async_trait]
    impl McpTransport for StubTransport {
        fn server_name(&self) -> &str {
            &self.name
        }
        async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
            Ok(self.tools.clone())
        }
        async fn call_tool(&self, tool: &str, args: &str) -> Result<McpCallResult> {
            Ok(McpCallResult {
                is_error: false,
                text: format!("{} <- {}", tool, args),
            })
        }
    }

    fn stub_def(name: &str) -> McpToolDef {
        McpToolDef {
            name: name.to_string(),
            description: "remote stub".to_string(),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    #[test]
    fn test_tool_naming_rule() {
        assert_eq!(mcp_tool_name("github", "create_issue"), "mcp__github__create_issue");
    }

    #[tokio::test]
    async fn test_refresh_registers_prefixed_tools() {
        let registry = ToolRegistry::new(PathBuf::from("."));
        let transport: Arc<dyn McpTransport> = Arc::new(StubTransport {
            name: "github".to_string(),
            tools: vec![stub_def("create_issue"), stub_def("list_prs")],
        });

        let count = refresh_mcp_tools(&registry, &[transport]).await;
        assert_eq!(count, 2);
        assert!(registry.contains("mcp__github__create_issue"));

        let result = registry
            .execute("mcp__github__list_prs", r#"{"repo":"x"}"#)
            .await;
        assert!(result.success);
        assert!(result.output.unwrap().contains("list_prs"));
    }

    #[tokio::test]
    async fn test_refresh_replaces_previous_round() {
        let registry = ToolRegistry::new(PathBuf::from("."));
        let first: Arc<dyn McpTransport> = Arc::new(StubTransport {
            name: "a".to_string(),
            tools: vec![stub_def("one")],
        });
        refresh_mcp_tools(&registry, &[first]).await;
        assert!(registry.contains("mcp__a__one"));

        let second: Arc<dyn McpTransport> = Arc::new(StubTransport {
            name: "b".to_string(),
            tools: vec![stub_def("two")],
        });
        refresh_mcp_tools(&registry, &[second]).await;
        assert!(!registry.contains("mcp__a__one"));
        assert!(registry.contains("mcp__b__two"));
    }
}
