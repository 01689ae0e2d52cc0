//! LLM-assisted compression of old history.
//!
//! When a thread's history exceeds the token budget, every message except
//! the last `keep_tail` is considered for summarization:
//!
//! | Message | Treatment |
//! |---------|-----------|
//! | user | unchanged |
//! | contains a fenced code block | unchanged |
//! | already marked | unchanged |
//! | assistant | summarized to ~30%, keeping the reasoning |
//! | tool | summarized to ~20%, keeping facts, file names, errors |
//! | anything else | unchanged |
//!
//! Compression is pure: it returns a new list and never touches its
//! input. A failed summarization keeps the original message and logs a
//! warning; nothing is propagated to the caller.

use super::is_marked;
use super::tokens::TokenCounter;
use crate::api::{ApiError, ProviderClient};
use crate::storage::HistoryMessage;
use crate::{AUXILIARY_MAX_TOKENS, ChatRequest, Message, MessageRole};
use futures::future::join_all;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Prefix of every compressed message.
pub const COMPRESSED_MARKER: &str = "[compressed]";

pub const DEFAULT_TOKEN_BUDGET: usize = 30_000;
pub const DEFAULT_KEEP_TAIL: usize = 3;
pub const DEFAULT_SUMMARY_TIMEOUT: Duration = Duration::from_secs(30);

/// What a summary must keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryKind {
    /// Assistant turns: the reasoning and logic.
    Reasoning,
    /// Tool output: facts, file names and errors.
    Facts,
}

impl SummaryKind {
    pub fn for_role(role: MessageRole) -> Option<Self> {
        match role {
            MessageRole::Assistant => Some(Self::Reasoning),
            MessageRole::Tool => Some(Self::Facts),
            MessageRole::User | MessageRole::System => None,
        }
    }

    /// Target length as a fraction of the original.
    pub fn target_ratio(self) -> f64 {
        match self {
            Self::Reasoning => 0.30,
            Self::Facts => 0.20,
        }
    }

    fn instruction(self, target_chars: usize) -> String {
        match self {
            Self::Reasoning => format!(
                "Summarize the following assistant message in at most {target_chars} characters. \
                 Preserve the reasoning and logic: what was concluded and why. \
                 Reply with the summary only."
            ),
            Self::Facts => format!(
                "Condense the following tool output to at most {target_chars} characters. \
                 Keep only facts, file names, and errors, verbatim where possible. \
                 Reply with the condensed output only."
            ),
        }
    }
}

/// One summarization job.
#[derive(Debug, Clone, Copy)]
pub struct SummaryRequest<'a> {
    pub kind: SummaryKind,
    pub content: &'a str,
    pub target_chars: usize,
}

impl<'a> SummaryRequest<'a> {
    pub fn new(kind: SummaryKind, content: &'a str) -> Self {
        let chars = content.chars().count() as f64;
        Self {
            kind,
            content,
            target_chars: ((chars * kind.target_ratio()).ceil() as usize).max(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("summarizer timed out after {0:?}")]
    Timeout(Duration),

    #[error("summarizer call failed: {0}")]
    Api(#[from] ApiError),

    #[error("summarizer returned no text")]
    Empty,

    #[error("summary is not shorter than the original")]
    NotShorter,

    #[error("{0}")]
    Failed(String),
}

pub type SummaryFuture<'a> = Pin<Box<dyn Future<Output = Result<String, CompressionError>> + Send + 'a>>;

/// Produces summaries for compression.
pub trait Summarizer: Send + Sync {
    fn summarize<'a>(&'a self, request: SummaryRequest<'a>) -> SummaryFuture<'a>;
}

/// Summarizer backed by a fast auxiliary model.
pub struct ClientSummarizer {
    client: ProviderClient,
    model: String,
    timeout: Duration,
}

impl ClientSummarizer {
    pub fn new(client: ProviderClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            timeout: DEFAULT_SUMMARY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Summarizer for ClientSummarizer {
    fn summarize<'a>(&'a self, request: SummaryRequest<'a>) -> SummaryFuture<'a> {
        Box::pin(async move {
            let chat = ChatRequest::new(
                &self.model,
                vec![
                    Message::system(request.kind.instruction(request.target_chars)),
                    Message::user(request.content),
                ],
            )
            .with_max_tokens(AUXILIARY_MAX_TOKENS)
            .with_temperature(Some(0.0));

            let response = tokio::time::timeout(self.timeout, self.client.call(&chat))
                .await
                .map_err(|_| CompressionError::Timeout(self.timeout))??;
            Ok(response.content)
        })
    }
}

/// Shrinks history that exceeds a token budget.
#[derive(Clone)]
pub struct CompressionEngine {
    summarizer: Arc<dyn Summarizer>,
    counter: Arc<dyn TokenCounter>,
    token_budget: usize,
    keep_tail: usize,
}

impl CompressionEngine {
    pub fn new(summarizer: Arc<dyn Summarizer>, counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            summarizer,
            counter,
            token_budget: DEFAULT_TOKEN_BUDGET,
            keep_tail: DEFAULT_KEEP_TAIL,
        }
    }

    pub fn with_budget(mut self, token_budget: usize) -> Self {
        self.token_budget = token_budget;
        self
    }

    pub fn with_keep_tail(mut self, keep_tail: usize) -> Self {
        self.keep_tail = keep_tail;
        self
    }

    pub fn budget(&self) -> usize {
        self.token_budget
    }

    pub fn keep_tail(&self) -> usize {
        self.keep_tail
    }

    pub fn counter(&self) -> &dyn TokenCounter {
        self.counter.as_ref()
    }

    /// Compressed copy of `history`. Within budget, an unmodified copy.
    pub async fn compress(&self, history: &[HistoryMessage]) -> Vec<HistoryMessage> {
        let total = self.counter.total(history);
        if total <= self.token_budget {
            return history.to_vec();
        }

        let split = history.len().saturating_sub(self.keep_tail);
        let (old, tail) = history.split_at(split);
        debug!(
            "Compressing history: {total} tokens over budget {}, {} old message(s), {} kept",
            self.token_budget,
            old.len(),
            tail.len()
        );

        let mut out: Vec<HistoryMessage> =
            join_all(old.iter().map(|message| self.compress_message(message))).await;
        out.extend_from_slice(tail);

        info!(
            "Compression: {total} -> {} tokens",
            self.counter.total(&out)
        );
        out
    }

    async fn compress_message(&self, message: &HistoryMessage) -> HistoryMessage {
        let Some(kind) = SummaryKind::for_role(message.role) else {
            return message.clone();
        };
        if has_code_fence(&message.content) || is_marked(&message.content) {
            return message.clone();
        }

        match self.summarize(kind, &message.content).await {
            Ok(summary) => message.with_content(
                format!("{COMPRESSED_MARKER} {summary}"),
                self.counter.as_ref(),
            ),
            Err(e) => {
                warn!(
                    "Compression of {} message {} failed, keeping original: {e}",
                    message.role, message.id
                );
                message.clone()
            }
        }
    }

    async fn summarize(&self, kind: SummaryKind, content: &str) -> Result<String, CompressionError> {
        let summary = self
            .summarizer
            .summarize(SummaryRequest::new(kind, content))
            .await?;
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(CompressionError::Empty);
        }
        if summary.chars().count() >= content.chars().count() {
            return Err(CompressionError::NotShorter);
        }
        Ok(summary.to_string())
    }
}

fn has_code_fence(content: &str) -> bool {
    content.contains("```")
}
