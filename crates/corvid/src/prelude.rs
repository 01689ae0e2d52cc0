//! Convenience re-exports for common `corvid` types.
//!
//! ```ignore
//! use corvid::prelude::*;
//! ```
//!
//! Covers what a typical embedding needs: the client, the loop and the
//! conversation facade, storage backends, the context manager and the tool
//! traits. Strategy internals and parsing helpers stay in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{ChatRequest, Message, MessageRole, NormalizedResponse, ToolCall, ToolDef, json_schema_for};

// ── Provider layer ──────────────────────────────────────────────────
pub use crate::api::{ApiError, ProfileRegistry, ProviderClient, ProviderProfile, ReasoningMode, RetryConfig};

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{
    CompositeEventHandler, Conversation, EventHandler, FnEventHandler, LoggingHandler, LoopConfig,
    LoopError, LoopEvent, LoopResult, NoopHandler, ToolCallRecord, ToolLoop, Turn,
};

// ── Context and storage ─────────────────────────────────────────────
pub use crate::context::{ContextWindowManager, HistoryOutcome, HistorySource};
pub use crate::storage::{FileStorage, HistoryMessage, MemoryStorage, NewMessage, Storage, Thread};

// ── Configuration ───────────────────────────────────────────────────
pub use crate::config::CoreConfig;

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{FnTool, Tool, ToolError, ToolExecutor, ToolFuture, ToolSet};
