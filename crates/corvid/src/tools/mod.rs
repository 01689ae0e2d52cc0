//! Tool execution seam and built-in tools.
//!
//! The tool loop only sees a [`ToolExecutor`]: something that lists tool
//! definitions and runs a tool by name. [`ToolSet`] is the standard
//! implementation; [`fs`] holds read-only workspace tools the binary
//! registers.

pub mod core;
pub mod fs;

pub use self::core::{FnTool, Tool, ToolSet, truncate_result, validate_tool_arguments};
pub use self::fs::{ListFiles, ReadFile, SearchCode};

use crate::ToolDef;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by tool execution. Boxed so the traits stay
/// dyn-compatible.
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send + 'a>>;

/// Why a tool call produced no result. Never fatal to the loop: the
/// message becomes the tool's content and the call is recorded as failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid arguments for tool '{tool}': {detail}")]
    InvalidArguments { tool: String, detail: String },

    #[error("tool '{tool}' timed out after {secs} seconds")]
    Timeout { tool: String, secs: u64 },

    #[error("usage quota for tool '{tool}' exhausted ({limit} call(s) per session)")]
    QuotaExceeded { tool: String, limit: u32 },

    #[error("tool panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    pub fn failed(detail: impl std::fmt::Display) -> Self {
        ToolError::Failed(detail.to_string())
    }
}

/// Runs tools on behalf of the tool loop.
pub trait ToolExecutor: Send + Sync {
    /// Definitions advertised to the model.
    fn definitions(&self) -> Vec<ToolDef>;

    /// Run `name` with parsed JSON arguments.
    fn execute<'a>(&'a self, name: &'a str, args: &'a Value) -> ToolFuture<'a>;
}
