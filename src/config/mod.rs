//! Settings and configuration
//!
//! Two JSON settings files: global `~/.grok/user-settings.json` and
//! per-project `<cwd>/.grok/settings.json`; the project file overrides
//! the global one key by key. Field names stay camelCase on disk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global settings file name under `~/.grok/`
pub const USER_SETTINGS_FILE: &str = "user-settings.json";

/// Project settings path relative to the working directory
pub const PROJECT_SETTINGS_FILE: &str = ".grok/settings.json";

/// User-facing settings, all optional on disk
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub api_key: Option<String>,
    #[serde(rename = "baseURL")]
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub models: Option<Vec<String>>,
    pub parallel_tool_calls: Option<bool>,
    pub max_concurrent_tools: Option<usize>,
    /// Non-streaming request timeout in milliseconds
    pub timeout: Option<u64>,
    /// Streaming request timeout in milliseconds
    pub stream_timeout: Option<u64>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl Settings {
    /// Load global settings overlaid with project settings
    pub fn load(working_dir: &Path) -> Result<Self> {
        let mut settings = Self::default();

        if let Some(home) = dirs::home_dir() {
            let global = home.join(crate::storage::GROK_DIR).join(USER_SETTINGS_FILE);
            if global.exists() {
                settings = Self::read_file(&global)?;
            }
        }

        let project = working_dir.join(PROJECT_SETTINGS_FILE);
        if project.exists() {
            settings.merge_from(Self::read_file(&project)?);
        }

        Ok(settings)
    }

    fn read_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings at {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings at {}", path.display()))
    }

    /// Overlay: any key present in `other` wins
    pub fn merge_from(&mut self, other: Settings) {
        macro_rules! take_if_set {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take_if_set!(
            api_key,
            base_url,
            default_model,
            models,
            parallel_tool_calls,
            max_concurrent_tools,
            timeout,
            stream_timeout,
            temperature,
            max_tokens
        );
    }

    pub fn base_url_or_default(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| "https://api.x.ai/v1".to_string())
    }

    pub fn model_or_default(&self) -> String {
        self.default_model
            .clone()
            .unwrap_or_else(|| "grok-3-latest".to_string())
    }

    pub fn request_timeout(&self) -> Duration {
        self.timeout
            .map(Duration::from_millis)
            .unwrap_or(crate::llm::openai::DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn stream_timeout(&self) -> Duration {
        self.stream_timeout
            .map(Duration::from_millis)
            .unwrap_or(crate::llm::openai::DEFAULT_STREAM_TIMEOUT)
    }
}
