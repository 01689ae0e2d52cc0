//! Context window management.
//!
//! A thread's history grows without bound; the model's window does not.
//! Before each turn the [`ContextWindowManager`] shapes the stored history:
//!
//! 1. **[`compression`]**: over budget, old assistant and tool messages
//!    are summarized by a fast auxiliary model. User messages and code
//!    are never rewritten.
//! 2. **[`pruning`]**: tool output about files the current query does not
//!    mention is replaced by a short marker.
//!
//! Both stages are pure functions of their input and fail safe: a failure
//! leaves the affected messages as they were.

pub mod compression;
pub mod manager;
pub mod pruning;
pub mod tokens;

pub use compression::{
    COMPRESSED_MARKER, ClientSummarizer, CompressionEngine, CompressionError, Summarizer,
    SummaryFuture, SummaryKind, SummaryRequest,
};
pub use manager::{ContextWindowManager, HistoryOutcome, HistorySource, ThreadGuard, ThreadLocks};
pub use pruning::{PRUNED_MARKER, RelevancePruner, extract_file_paths};
pub use tokens::{CharRatioCounter, DEFAULT_CHARS_PER_TOKEN, TokenCounter};

/// Whether `content` was already rewritten by compression or pruning.
pub fn is_marked(content: &str) -> bool {
    content.starts_with(COMPRESSED_MARKER) || content.starts_with(PRUNED_MARKER)
}
