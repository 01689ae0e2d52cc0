//! Agent runtime: the tool loop and the per-thread conversation facade.
//!
//! - [`orchestrator::ToolLoop`]: the bounded model/tool state machine.
//!   Start here.
//! - [`conversation::Conversation`]: one turn against a persisted thread
//!   (lock, optimized history, loop, persist).
//! - [`config::LoopConfig`]: model, sampling and iteration settings.
//! - [`events`]: [`EventHandler`] and [`LoopEvent`] for observing a run.
//! - [`quota`]: per-tool usage limits.
//! - [`execution`]: running a single tool call into a [`ToolCallRecord`].

pub mod config;
pub mod conversation;
pub mod events;
pub mod execution;
pub mod orchestrator;
pub mod quota;

pub use config::{DEFAULT_FINALIZATION_PROMPT, LoopConfig};
pub use conversation::{Conversation, Turn, to_wire};
pub use events::{
    CompositeEventHandler, EventHandler, FnEventHandler, LoggingHandler, LoopEvent, NoopHandler,
};
pub use execution::{ToolCallRecord, parse_arguments};
pub use orchestrator::{LoopError, LoopResult, ToolLoop};
pub use quota::QuotaTracker;
