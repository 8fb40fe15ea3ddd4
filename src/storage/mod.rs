//! Persistent session storage
//!
//! One JSONL log per user, `~/.grok/session.log`, one chat entry per
//! line. Appends are best-effort: a missing home directory or a full
//! disk degrades to a warning, never an error.

use crate::agent::ChatEntry;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Directory under the home directory holding session state
pub const GROK_DIR: &str = ".grok";

/// Append-only JSONL chat log
pub struct SessionLog {
    path: Option<PathBuf>,
    file: Mutex<Option<std::fs::File>>,
}

impl SessionLog {
    /// Log at `~/.grok/session.log`
    pub fn default_location() -> Self {
        let path = dirs::home_dir().map(|home| home.join(GROK_DIR).join("session.log"));
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    /// Log at an explicit path (tests and embedders)
    pub fn at_path(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            file: Mutex::new(None),
        }
    }

    /// Disabled log that drops every entry
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Append one entry; failures are logged and swallowed
    pub fn append(&self, entry: &ChatEntry) {
        let Some(path) = &self.path else {
            return;
        };
        let Ok(line) = serde_json::to_string(entry) else {
            return;
        };

        let Ok(mut guard) = self.file.lock() else {
            return;
        };
        if guard.is_none() {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            *guard = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok();
        }
        match guard.as_mut() {
            Some(file) => {
                if let Err(e) = writeln!(file, "{}", line) {
                    tracing::warn!("Session log write failed: {}", e);
                }
            }
            None => tracing::warn!("Session log unavailable at {}", path.display()),
        }
    }

    /// Read all entries back (diagnostics and tests)
    pub fn read_entries(&self) -> Vec<ChatEntry> {
        let Some(path) = &self.path else {
            return Vec::new();
        };
        let Ok(content) = std::fs::read_to_string(path) else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}
