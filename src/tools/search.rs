//! Search tools: content grep and filename search
//!
//! Both walk the tree gitignore-aware; the content search uses the
//! grep-searcher engine for regex matching with line numbers.

use super::{acquire_read_permit, Tool, ToolResult};
use anyhow::Result;
use async_trait::async_trait;
use grep_regex::RegexMatcherBuilder;
use grep_searcher::sinks::Lossy;
use grep_searcher::SearcherBuilder;
use ignore::WalkBuilder;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

const DEFAULT_MAX_RESULTS: usize = 100;

/// Tool for searching content within files
pub struct SearchTool {
    working_dir: PathBuf,
}

impl SearchTool {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Regex search for a pattern in file contents. Returns matching lines with file paths and line numbers."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regex pattern to search for"
                },
                "path": {
                    "type": "string",
                    "description": "Optional: file or directory to search in (default: working directory)"
                },
                "case_sensitive": {
                    "type": "boolean",
                    "description": "Optional: case sensitive search (default: false)"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum matching lines to return (default: 100)"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: &str) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Params {
            pattern: String,
            path: Option<String>,
            case_sensitive: Option<bool>,
            max_results: Option<usize>,
        }

        let params: Params = match serde_json::from_str(args) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(format!("Invalid arguments: {}", e))),
        };

        let search_path = params
            .path
            .map(|p| self.working_dir.join(p))
            .unwrap_or_else(|| self.working_dir.clone());
        let max_results = params.max_results.unwrap_or(DEFAULT_MAX_RESULTS);

        let matcher = match RegexMatcherBuilder::new()
            .case_insensitive(!params.case_sensitive.unwrap_or(false))
            .build(&params.pattern)
        {
            Ok(m) => m,
            Err(e) => return Ok(ToolResult::error(format!("Invalid regex pattern: {}", e))),
        };

        let _permit = acquire_read_permit().await?;

        let mut results: Vec<String> = Vec::new();

        if search_path.is_file() {
            search_file(&matcher, &search_path, &self.working_dir, &mut results, max_results);
        } else {
            let walker = WalkBuilder::new(&search_path)
                .hidden(false)
                .git_ignore(true)
                .git_global(true)
                .git_exclude(true)
                .build();

            for entry in walker.filter_map(|e| e.ok()) {
                if results.len() >= max_results {
                    break;
                }
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                search_file(&matcher, path, &self.working_dir, &mut results, max_results);
            }
        }

        if results.is_empty() {
            Ok(ToolResult::success("No matches found."))
        } else {
            let truncated = results.len() >= max_results;
            let mut output = results.join("\n");
            if truncated {
                output.push_str(&format!("\n... (results truncated at {})", max_results));
            }
            Ok(ToolResult::success(output))
        }
    }
}

fn search_file(
    matcher: &grep_regex::RegexMatcher,
    path: &Path,
    working_dir: &Path,
    results: &mut Vec<String>,
    max_results: usize,
) {
    let relative = path.strip_prefix(working_dir).unwrap_or(path);
    let display = relative.display().to_string();
    let mut searcher = SearcherBuilder::new().line_number(true).build();

    let _ = searcher.search_path(
        matcher,
        path,
        Lossy(|line_number, line| {
            if results.len() >= max_results {
                return Ok(false);
            }
            results.push(format!("{}:{}: {}", display, line_number, line.trim_end()));
            Ok(true)
        }),
    );
}

/// Tool for finding files by name pattern
pub struct FindFilesTool {
    working_dir: PathBuf,
}

impl FindFilesTool {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }
}

#[async_trait]
impl Tool for FindFilesTool {
    fn name(&self) -> &str {
        "find_files"
    }

    fn description(&self) -> &str {
        "Find files whose names contain a pattern. Respects .gitignore."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Substring to match against file names (case-insensitive)"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum files to return (default: 100)"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: &str) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Params {
            pattern: String,
            max_results: Option<usize>,
        }

        let params: Params = match serde_json::from_str(args) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(format!("Invalid arguments: {}", e))),
        };
        let needle = params.pattern.to_lowercase();
        let max_results = params.max_results.unwrap_or(DEFAULT_MAX_RESULTS);

        let _permit = acquire_read_permit().await?;

        let walker = WalkBuilder::new(&self.working_dir)
            .hidden(false)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .build();

        let mut matches = Vec::new();
        for entry in walker.filter_map(|e| e.ok()) {
            if matches.len() >= max_results {
                break;
            }
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("")
                .to_lowercase();
            if file_name.contains(&needle) {
                let relative = path.strip_prefix(&self.working_dir).unwrap_or(path);
                matches.push(relative.display().to_string());
            }
        }
        matches.sort();

        if matches.is_empty() {
            Ok(ToolResult::success(format!(
                "No files matching '{}'",
                params.pattern
            )))
        } else {
            Ok(ToolResult::success(matches.join("\n")))
        }
    }
}
