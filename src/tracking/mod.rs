//! Operation tracking: content-hash idempotency and loop detection
//!
//! Answers two questions for every file mutation the agent wants to make:
//! "would this operation be a no-op?" and "are we repeating ourselves?".
//! State is process-wide; per-file history is capped at
//! [`OPERATION_HISTORY_CAP`] records with FIFO eviction.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum recorded operations kept per file
pub const OPERATION_HISTORY_CAP: usize = 10;

/// How many recent per-file hashes the edit duplicate check consults
const RECENT_HASH_WINDOW: usize = 3;

/// Default window for cross-file loop detection
pub const DEFAULT_LOOP_WINDOW: usize = 5;

/// Kind of file mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Edit,
    Delete,
    Rename,
    Move,
}

impl OperationType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Edit => "edit",
            Self::Delete => "delete",
            Self::Rename => "rename",
            Self::Move => "move",
        }
    }
}

/// One recorded file operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: String,
    pub op_type: OperationType,
    /// Absolute path of the file the operation touched
    pub file_path: PathBuf,
    /// SHA-256 of the post-operation file bytes, when the file exists
    pub content_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Process-wide sequence number; orders records whose timestamps collide
    #[serde(skip)]
    seq: u64,
}

impl OperationRecord {
    /// Loop-detection signature: `type:path:hash`
    fn signature(&self) -> String {
        format!(
            "{}:{}:{}",
            self.op_type.label(),
            self.file_path.display(),
            self.content_hash.as_deref().unwrap_or("-")
        )
    }
}

/// Result of an idempotency check
#[derive(Debug, Clone, Default)]
pub struct IdempotencyCheck {
    pub is_duplicate: bool,
    pub reason: Option<String>,
    pub previous_operation: Option<OperationRecord>,
    pub suggestion: Option<String>,
}

impl IdempotencyCheck {
    fn not_duplicate() -> Self {
        Self::default()
    }
}

/// Result of loop detection
#[derive(Debug, Clone, Default)]
pub struct LoopCheck {
    pub is_loop: bool,
    pub repeated_operations: Vec<String>,
    pub suggestion: Option<String>,
}

/// Content-hash-based idempotency and loop detection
#[derive(Debug, Default)]
pub struct OperationTracker {
    history: DashMap<PathBuf, VecDeque<OperationRecord>>,
    seq: AtomicU64,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// SHA-256 hex digest of UTF-8 content
    pub fn hash_content(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Hash of the file's current bytes; `None` when the file is missing
    pub fn file_hash(path: &Path) -> Option<String> {
        let bytes = std::fs::read(path).ok()?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Some(format!("{:x}", hasher.finalize()))
    }

    /// Resolve to an absolute path without requiring the file to exist
    pub fn resolve_path(path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    }

    /// Would this operation be a no-op?
    pub fn check_idempotency(
        &self,
        op_type: OperationType,
        file_path: &Path,
        new_content: Option<&str>,
    ) -> IdempotencyCheck {
        let path = Self::resolve_path(file_path);

        match op_type {
            OperationType::Create => {
                if path.exists() {
                    IdempotencyCheck {
                        is_duplicate: true,
                        reason: Some(format!("File already exists: {}", path.display())),
                        previous_operation: self.last_operation(&path),
                        suggestion: Some(
                            "Use an edit operation to modify the existing file".to_string(),
                        ),
                    }
                } else {
                    IdempotencyCheck::not_duplicate()
                }
            }
            OperationType::Edit => {
                let Some(new_content) = new_content else {
                    return IdempotencyCheck::not_duplicate();
                };
                let new_hash = Self::hash_content(new_content);

                if Self::file_hash(&path).as_deref() == Some(new_hash.as_str()) {
                    return IdempotencyCheck {
                        is_duplicate: true,
                        reason: Some("New content is identical to the current file".to_string()),
                        previous_operation: self.last_operation(&path),
                        suggestion: Some("No write is needed; the file already matches".to_string()),
                    };
                }

                let recently_applied = self
                    .history
                    .get(&path)
                    .map(|records| {
                        records
                            .iter()
                            .rev()
                            .take(RECENT_HASH_WINDOW)
                            .any(|r| r.content_hash.as_deref() == Some(new_hash.as_str()))
                    })
                    .unwrap_or(false);

                if recently_applied {
                    IdempotencyCheck {
                        is_duplicate: true,
                        reason: Some(
                            "This exact content was produced by a recent operation on the file"
                                .to_string(),
                        ),
                        previous_operation: self.last_operation(&path),
                        suggestion: Some(
                            "The file was already brought to this state; re-read it before editing again"
                                .to_string(),
                        ),
                    }
                } else {
                    IdempotencyCheck::not_duplicate()
                }
            }
            OperationType::Delete => {
                let last = self.last_operation(&path);
                let last_was_delete = last
                    .as_ref()
                    .map(|r| r.op_type == OperationType::Delete)
                    .unwrap_or(false);
                if !path.exists() && last_was_delete {
                    IdempotencyCheck {
                        is_duplicate: true,
                        reason: Some(format!(
                            "File does not exist and was already deleted: {}",
                            path.display()
                        )),
                        previous_operation: last,
                        suggestion: None,
                    }
                } else {
                    IdempotencyCheck::not_duplicate()
                }
            }
            OperationType::Rename | OperationType::Move => IdempotencyCheck::not_duplicate(),
        }
    }

    /// Append a record for an executed operation
    ///
    /// Recomputes the file's hash so the record reflects post-operation bytes.
    pub fn record_operation(
        &self,
        op_type: OperationType,
        file_path: &Path,
        metadata: Option<serde_json::Value>,
    ) -> OperationRecord {
        let path = Self::resolve_path(file_path);
        let record = OperationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            op_type,
            file_path: path.clone(),
            content_hash: Self::file_hash(&path),
            timestamp: Utc::now(),
            metadata,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };

        let mut records = self.history.entry(path).or_default();
        records.push_back(record.clone());
        while records.len() > OPERATION_HISTORY_CAP {
            records.pop_front();
        }

        record
    }

    /// Most recent recorded operation for a path
    pub fn last_operation(&self, file_path: &Path) -> Option<OperationRecord> {
        let path = Self::resolve_path(file_path);
        self.history
            .get(&path)
            .and_then(|records| records.back().cloned())
    }

    /// Recent operations across all files, oldest first
    pub fn recent_operations(&self, limit: usize) -> Vec<OperationRecord> {
        let mut all: Vec<OperationRecord> = self
            .history
            .iter()
            .flat_map(|entry| entry.value().iter().cloned().collect::<Vec<_>>())
            .collect();
        all.sort_by_key(|r| r.seq);
        if all.len() > limit {
            all.split_off(all.len() - limit)
        } else {
            all
        }
    }

    /// Flag a loop when the most recent `window` operation signatures repeat
    /// the `window` before them exactly
    pub fn detect_loop(&self, window: usize) -> LoopCheck {
        if window == 0 {
            return LoopCheck::default();
        }

        let recent = self.recent_operations(window * 2);
        if recent.len() < window * 2 {
            return LoopCheck::default();
        }

        let signatures: Vec<String> = recent.iter().map(|r| r.signature()).collect();
        let (earlier, latest) = signatures.split_at(window);

        if earlier == latest {
            LoopCheck {
                is_loop: true,
                repeated_operations: latest.to_vec(),
                suggestion: Some(
                    "The same sequence of file operations is repeating; stop and reassess the approach"
                        .to_string(),
                ),
            }
        } else {
            LoopCheck::default()
        }
    }

    /// Total recorded operations (test and diagnostics hook)
    pub fn len(&self) -> usize {
        self.history.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all recorded history (explicit reset hook for tests)
    pub fn reset(&self) {
        self.history.clear();
    }
}

static TRACKER: Lazy<OperationTracker> = Lazy::new(OperationTracker::new);

/// Process-wide tracker instance
pub fn operation_tracker() -> &'static OperationTracker {
    &TRACKER
}
