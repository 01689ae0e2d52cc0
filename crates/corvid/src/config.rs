//! Runtime configuration.
//!
//! [`CoreConfig`] is built once at startup and passed by reference to the
//! components that need it. It loads from a JSON file in which every field
//! is optional:
//!
//! ```json
//! {
//!   "default_model": "gemini-2.5-pro",
//!   "context": { "token_budget": 20000 },
//!   "quotas": { "web_search": 3 },
//!   "providers": [
//!     { "provider_id": "local", "endpoint": "http://localhost:8080/v1/chat/completions",
//!       "model_prefixes": ["qwen"] }
//!   ]
//! }
//! ```
//!
//! `CORVID_MODEL`, `CORVID_SUMMARY_MODEL` and `CORVID_TOKEN_BUDGET`
//! override the file.

use crate::agent::LoopConfig;
use crate::api::{ProviderProfile, RetryConfig};
use crate::context::compression::{DEFAULT_KEEP_TAIL, DEFAULT_TOKEN_BUDGET};
use crate::context::tokens::DEFAULT_CHARS_PER_TOKEN;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Default model for compression summaries.
pub const DEFAULT_SUMMARY_MODEL: &str = "gpt-4.1-mini";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Backoff settings as they appear in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            ..RetryConfig::with_attempts(self.max_attempts)
        }
    }
}

/// Context window settings. Read-only and shared by every thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub token_budget: usize,
    /// Most recent messages never compressed.
    pub keep_tail: usize,
    /// Messages returned when the full history cannot be used.
    pub fallback_recent: usize,
    /// Cap on messages loaded per turn; `None` loads the whole thread.
    pub history_limit: Option<usize>,
    pub summary_timeout_secs: u64,
    pub chars_per_token: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: DEFAULT_TOKEN_BUDGET,
            keep_tail: DEFAULT_KEEP_TAIL,
            fallback_recent: 10,
            history_limit: None,
            summary_timeout_secs: 30,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub default_model: String,
    pub summary_model: String,
    pub request_timeout_secs: u64,
    pub retry: RetrySettings,
    pub context: ContextConfig,
    /// Tool loop settings. The model comes from `default_model`.
    #[serde(rename = "loop")]
    pub tool_loop: LoopConfig,
    /// Per-tool call limits for the life of a thread.
    pub quotas: HashMap<String, u32>,
    /// Extra provider profiles, consulted before the built-in table.
    pub providers: Vec<ProviderProfile>,
    /// Where the binary keeps thread files.
    pub storage_dir: PathBuf,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_model: crate::DEFAULT_MODEL.into(),
            summary_model: DEFAULT_SUMMARY_MODEL.into(),
            request_timeout_secs: 120,
            retry: RetrySettings::default(),
            context: ContextConfig::default(),
            tool_loop: LoopConfig::default(),
            quotas: HashMap::from([("web_search".to_string(), 5)]),
            providers: Vec::new(),
            storage_dir: PathBuf::from(".corvid/threads"),
        }
    }
}

impl CoreConfig {
    /// Read `path`, or return the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `CORVID_*` environment overrides.
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Unparseable values are ignored
    /// with a warning.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(model) = lookup("CORVID_MODEL").filter(|v| !v.is_empty()) {
            self.default_model = model;
        }
        if let Some(model) = lookup("CORVID_SUMMARY_MODEL").filter(|v| !v.is_empty()) {
            self.summary_model = model;
        }
        if let Some(raw) = lookup("CORVID_TOKEN_BUDGET") {
            match raw.trim().parse() {
                Ok(budget) => self.context.token_budget = budget,
                Err(e) => warn!("Ignoring CORVID_TOKEN_BUDGET={raw:?}: {e}"),
            }
        }
        self
    }

    /// Loop settings for the configured default model.
    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            model: self.default_model.clone(),
            ..self.tool_loop.clone()
        }
    }
}
