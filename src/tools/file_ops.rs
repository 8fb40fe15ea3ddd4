//! File operation tools: view, create, edit, delete, list
//!
//! Every mutating tool consults the operation tracker before touching
//! disk; idempotency blocks come back as successful no-op results so the
//! LLM sees what would have happened and why. Writes run under the pooled
//! write permit.

use super::{acquire_read_permit, acquire_write_permit, SelfCorrectError, Tool, ToolResult};
use crate::tracking::{operation_tracker, OperationType};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

fn resolve_path(working_dir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path)
    }
}

fn truncate_for_message(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

/// Tool for reading file contents
pub struct ViewFileTool {
    working_dir: PathBuf,
}

impl ViewFileTool {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }
}

#[async_trait]
impl Tool for ViewFileTool {
    fn name(&self) -> &str {
        "view_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file, optionally restricted to a line range."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file (relative to working directory or absolute)"
                },
                "start_line": {
                    "type": "integer",
                    "description": "Optional: first line to read (1-indexed)"
                },
                "end_line": {
                    "type": "integer",
                    "description": "Optional: last line to read (1-indexed, inclusive)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: &str) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Params {
            path: String,
            start_line: Option<usize>,
            end_line: Option<usize>,
        }

        let params: Params = match serde_json::from_str(args) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(format!("Invalid arguments: {}", e))),
        };
        let path = resolve_path(&self.working_dir, &params.path);

        let _permit = acquire_read_permit().await?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let content = String::from_utf8_lossy(&bytes).into_owned();
                let output = match (params.start_line, params.end_line) {
                    (None, None) => content,
                    (start, end) => {
                        let lines: Vec<&str> = content.lines().collect();
                        let start = start.unwrap_or(1).saturating_sub(1);
                        let end = end.unwrap_or(lines.len()).min(lines.len());
                        if start >= end {
                            String::new()
                        } else {
                            lines[start..end].join("\n")
                        }
                    }
                };
                Ok(ToolResult::success(output))
            }
            Err(e) => Ok(ToolResult::error(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Tool for creating new files
pub struct CreateFileTool {
    working_dir: PathBuf,
}

impl CreateFileTool {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }
}

#[async_trait]
impl Tool for CreateFileTool {
    fn name(&self) -> &str {
        "create_file"
    }

    fn description(&self) -> &str {
        "Create a new file with the given content. Fails as a no-op if the file already exists."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file to create"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the new file"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: &str) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Params {
            path: String,
            content: String,
        }

        let params: Params = match serde_json::from_str(args) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(format!("Invalid arguments: {}", e))),
        };
        let path = resolve_path(&self.working_dir, &params.path);

        let check = operation_tracker().check_idempotency(OperationType::Create, &path, None);
        if check.is_duplicate {
            return Ok(ToolResult::success(format!(
                "No-op: create_file skipped. {}{}",
                check.reason.unwrap_or_default(),
                check
                    .suggestion
                    .map(|s| format!(" ({})", s))
                    .unwrap_or_default()
            )));
        }

        let _permit = acquire_write_permit().await?;
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Ok(ToolResult::error(format!(
                    "Failed to create directories: {}",
                    e
                )));
            }
        }

        match tokio::fs::write(&path, &params.content).await {
            Ok(()) => {
                operation_tracker().record_operation(OperationType::Create, &path, None);
                Ok(ToolResult::success(format!(
                    "Created {} ({} bytes)",
                    path.display(),
                    params.content.len()
                )))
            }
            Err(e) => Ok(ToolResult::error(format!(
                "Failed to create {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Tool for exact-match string edits
pub struct StrReplaceEditTool {
    working_dir: PathBuf,
}

impl StrReplaceEditTool {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }
}

#[async_trait]
impl Tool for StrReplaceEditTool {
    fn name(&self) -> &str {
        "str_replace_edit"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing an exact string match, or replace the whole file when `content` is given."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file to edit"
                },
                "old_str": {
                    "type": "string",
                    "description": "Exact text to find (must match the file verbatim)"
                },
                "new_str": {
                    "type": "string",
                    "description": "Replacement text"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence instead of the first (default: false)"
                },
                "content": {
                    "type": "string",
                    "description": "Full replacement content; overrides old_str/new_str when present"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: &str) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Params {
            path: String,
            old_str: Option<String>,
            new_str: Option<String>,
            replace_all: Option<bool>,
            content: Option<String>,
        }

        let params: Params = match serde_json::from_str(args) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(format!("Invalid arguments: {}", e))),
        };
        let path = resolve_path(&self.working_dir, &params.path);

        let current = {
            let _permit = acquire_read_permit().await?;
            match tokio::fs::read(&path).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    return Ok(SelfCorrectError::new(
                        self.name(),
                        vec!["find_files".to_string(), "view_file".to_string()],
                        format!(
                            "The file {} could not be read ({}). Locate the right path with find_files, then retry.",
                            path.display(),
                            e
                        ),
                    )
                    .into_tool_result(format!("Failed to read {}: {}", path.display(), e)));
                }
            }
        };

        let new_content = if let Some(content) = params.content {
            content
        } else {
            let Some(old_str) = params.old_str else {
                return Ok(ToolResult::error(
                    "Either `content` or `old_str`/`new_str` is required",
                ));
            };
            let new_str = params.new_str.unwrap_or_default();

            if !current.contains(&old_str) {
                let shown = truncate_for_message(&old_str, 120);
                return Ok(SelfCorrectError::new(
                    self.name(),
                    vec!["view_file".to_string()],
                    format!(
                        "The exact text was not found in {}. View the file to get the verbatim text (watch whitespace), then retry the edit.",
                        path.display()
                    ),
                )
                .into_tool_result(format!(
                    "String not found in {}: '{}'",
                    path.display(),
                    shown
                )));
            }

            if params.replace_all.unwrap_or(false) {
                current.replace(&old_str, &new_str)
            } else {
                current.replacen(&old_str, &new_str, 1)
            }
        };

        let check =
            operation_tracker().check_idempotency(OperationType::Edit, &path, Some(&new_content));
        if check.is_duplicate {
            return Ok(ToolResult::success(format!(
                "No-op: edit skipped for {}. {}{}",
                path.display(),
                check.reason.unwrap_or_default(),
                check
                    .suggestion
                    .map(|s| format!(" ({})", s))
                    .unwrap_or_default()
            )));
        }

        let _permit = acquire_write_permit().await?;
        match tokio::fs::write(&path, &new_content).await {
            Ok(()) => {
                operation_tracker().record_operation(OperationType::Edit, &path, None);
                Ok(ToolResult::success(format!(
                    "Edited {} ({} bytes)",
                    path.display(),
                    new_content.len()
                )))
            }
            Err(e) => Ok(ToolResult::error(format!(
                "Failed to write {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Tool for deleting files
pub struct DeleteFileTool {
    working_dir: PathBuf,
}

impl DeleteFileTool {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file to delete"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: &str) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Params {
            path: String,
        }

        let params: Params = match serde_json::from_str(args) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(format!("Invalid arguments: {}", e))),
        };
        let path = resolve_path(&self.working_dir, &params.path);

        let check = operation_tracker().check_idempotency(OperationType::Delete, &path, None);
        if check.is_duplicate {
            return Ok(ToolResult::success(format!(
                "No-op: delete skipped. {}",
                check.reason.unwrap_or_default()
            )));
        }

        if !path.exists() {
            return Ok(ToolResult::error(format!(
                "File does not exist: {}",
                path.display()
            )));
        }

        let _permit = acquire_write_permit().await?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                operation_tracker().record_operation(OperationType::Delete, &path, None);
                Ok(ToolResult::success(format!("Deleted {}", path.display())))
            }
            Err(e) => Ok(ToolResult::error(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Tool for listing directory entries
pub struct ListDirectoryTool {
    working_dir: PathBuf,
}

impl ListDirectoryTool {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List files and directories at a path. Directories are suffixed with '/'."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (default: working directory)"
                }
            }
        })
    }

    async fn execute(&self, args: &str) -> Result<ToolResult> {
        #[derive(Deserialize, Default)]
        struct Params {
            path: Option<String>,
        }

        let params: Params = if args.trim().is_empty() {
            Params::default()
        } else {
            match serde_json::from_str(args) {
                Ok(p) => p,
                Err(e) => return Ok(ToolResult::error(format!("Invalid arguments: {}", e))),
            }
        };

        let path = params
            .path
            .map(|p| resolve_path(&self.working_dir, &p))
            .unwrap_or_else(|| self.working_dir.clone());

        let _permit = acquire_read_permit().await?;
        let mut read_dir = match tokio::fs::read_dir(&path).await {
            Ok(rd) => rd,
            Err(e) => {
                return Ok(ToolResult::error(format!(
                    "Failed to list {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let mut entries = Vec::new();
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push(if is_dir { format!("{}/", name) } else { name });
        }
        entries.sort();

        if entries.is_empty() {
            Ok(ToolResult::success(format!(
                "{} is empty",
                path.display()
            )))
        } else {
            Ok(ToolResult::success(entries.join("\n")))
        }
    }
}
