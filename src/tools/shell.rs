//! Shell command execution tool

use super::{Tool, ToolResult};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

/// Default timeout for shell commands
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Dangerous command patterns that are refused before spawn
const DANGEROUS_PATTERNS: &[&str] = &[
    // Destructive file operations
    "rm -rf /",
    "rm -rf ~",
    "rm -rf /*",
    "rm -rf $HOME",
    "dd if=",
    "mkfs",
    "format ",
    // System modification
    "chmod -R 777",
    "chmod 777 /",
    "chown -R",
    // Privilege escalation
    "sudo rm",
    "sudo dd",
    "sudo mkfs",
    "su -c",
    "su root",
    // Fork bomb
    ":(){ :|:& };:",
    // Dangerous redirects
    "> /etc/",
    ">> /etc/",
    "> /var/",
    "> /usr/",
    "> /boot/",
    "> /sys/",
    "> /proc/",
    // Shutdown/reboot
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
];

/// Check if a command matches the denylist
fn is_dangerous_command(cmd: &str) -> Option<&'static str> {
    let cmd_lower = cmd.to_lowercase();
    DANGEROUS_PATTERNS
        .iter()
        .find(|pattern| cmd_lower.contains(&pattern.to_lowercase()))
        .copied()
}

/// Tool for executing shell commands
pub struct BashTool {
    working_dir: PathBuf,
}

impl BashTool {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the working directory. Returns captured stdout; failures carry the exit code and stderr."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: &str) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Params {
            command: String,
        }

        let params: Params = match serde_json::from_str(args) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(format!("Invalid arguments: {}", e))),
        };

        if let Some(pattern) = is_dangerous_command(&params.command) {
            return Ok(ToolResult::error(format!(
                "Command refused: matches dangerous pattern '{}'",
                pattern
            )));
        }

        tracing::debug!("Executing shell command: {}", params.command);

        let spawned = Command::new("bash")
            .arg("-c")
            .arg(&params.command)
            .current_dir(&self.working_dir)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(COMMAND_TIMEOUT, spawned).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Ok(ToolResult::error(format!("Failed to spawn command: {}", e)))
            }
            Err(_) => {
                return Ok(ToolResult::error(format!(
                    "Command timed out after {} seconds",
                    COMMAND_TIMEOUT.as_secs()
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            Ok(ToolResult::success(if stdout.is_empty() {
                "(no output)".to_string()
            } else {
                stdout
            }))
        } else {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Ok(ToolResult::error(format!(
                "Command exited with code {}: {}",
                code,
                if stderr.is_empty() { stdout } else { stderr }
            )))
        }
    }
}
