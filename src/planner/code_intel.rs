//! Code-intelligence seam for the planner
//!
//! The planner asks for candidate files by category (routes, controllers,
//! services, dependents of a symbol). Richer engines plug in behind the
//! trait; the shipped [`WorkspaceScanner`] ranks files with directory and
//! name heuristics over a gitignore-aware walk.

use async_trait::async_trait;
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

/// What kind of files the planner is looking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Routes,
    Controllers,
    Services,
    /// Files referencing a symbol by name
    Dependents,
}

/// Candidate-file lookup used during plan synthesis
#[async_trait]
pub trait CodeIntelligence: Send + Sync {
    /// Files relevant to a category, filtered by the hint (symbol or topic)
    ///
    /// Results are ranked most-relevant first; implementations should
    /// return a bounded list.
    async fn candidate_files(&self, category: FileCategory, hint: &str) -> Vec<PathBuf>;
}

const MAX_CANDIDATES: usize = 20;

/// Heuristic scanner over the workspace tree
pub struct WorkspaceScanner {
    root: PathBuf,
}

impl WorkspaceScanner {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn directory_markers(category: FileCategory) -> &'static [&'static str] {
        match category {
            FileCategory::Routes => &["routes", "router", "api", "endpoints"],
            FileCategory::Controllers => &["controllers", "handlers", "views"],
            FileCategory::Services => &["services", "service", "domain", "core"],
            FileCategory::Dependents => &[],
        }
    }

    fn is_source_file(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("rs" | "ts" | "tsx" | "js" | "jsx" | "py" | "go" | "java" | "rb")
        )
    }

    fn file_references_symbol(path: &Path, symbol: &str) -> bool {
        std::fs::read_to_string(path)
            .map(|content| content.contains(symbol))
            .unwrap_or(false)
    }
}

#[async_trait]
impl CodeIntelligence for WorkspaceScanner {
    async fn candidate_files(&self, category: FileCategory, hint: &str) -> Vec<PathBuf> {
        let markers = Self::directory_markers(category);
        let hint_lower = hint.to_lowercase();

        // (score, path); higher score sorts first
        let mut scored: Vec<(i32, PathBuf)> = Vec::new();

        let walker = WalkBuilder::new(&self.root)
            .hidden(false)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .build();

        for entry in walker.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() || !Self::is_source_file(path) {
                continue;
            }

            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let relative_lower = relative.display().to_string().to_lowercase();

            let mut score = 0;
            for marker in markers {
                if relative_lower
                    .split(['/', '\\'])
                    .any(|component| component.contains(marker))
                {
                    score += 2;
                }
            }
            if !hint_lower.is_empty() && relative_lower.contains(&hint_lower) {
                score += 3;
            }
            if category == FileCategory::Dependents
                && !hint.is_empty()
                && Self::file_references_symbol(path, hint)
            {
                score += 4;
            }

            if score > 0 {
                scored.push((score, path.to_path_buf()));
            }
        }

        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored
            .into_iter()
            .take(MAX_CANDIDATES)
            .map(|(_, path)| path)
            .collect()
    }
}
