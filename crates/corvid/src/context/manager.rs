//! History assembly for one turn.
//!
//! [`ContextWindowManager::get_session_history`] loads a thread, compresses
//! it if it is over budget, prunes tool output unrelated to the query and
//! returns the result. It never fails. Each stage falls back to a safer
//! prior state:
//!
//! ```text
//! optimized ──(compression fails)──> raw ──(over budget)──> last K raw
//!     └─────(pruning fails)──> compressed
//! storage read fails ──> last K ──(fails again)──> empty
//! ```
//!
//! Work on one thread is serialized through [`ThreadLocks`]; different
//! threads proceed in parallel.

use super::compression::{ClientSummarizer, CompressionEngine};
use super::pruning::RelevancePruner;
use super::tokens::{CharRatioCounter, TokenCounter};
use crate::api::ProviderClient;
use crate::config::{ContextConfig, CoreConfig};
use crate::storage::{HistoryMessage, Storage, StorageError};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

/// One async mutex per thread id.
#[derive(Default, Clone)]
pub struct ThreadLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

/// Exclusive access to one thread until dropped.
pub struct ThreadGuard {
    thread_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl ThreadGuard {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `thread_id`.
    pub async fn acquire(&self, thread_id: &str) -> ThreadGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Forget locks nobody holds or waits on.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(thread_id.to_string()).or_default().clone()
        };
        ThreadGuard {
            thread_id: thread_id.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Threads with a live lock.
    pub fn active(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or_default()
    }
}

/// Which stage produced the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistorySource {
    /// Compressed and pruned as needed.
    Optimized,
    /// Raw history; optimization failed and it fit the budget.
    Raw,
    /// The most recent raw messages only.
    Recent,
    /// Nothing could be loaded.
    Empty,
}

/// History for one turn plus how it was produced.
#[derive(Debug, Clone)]
pub struct HistoryOutcome {
    pub messages: Vec<HistoryMessage>,
    pub source: HistorySource,
    /// Tokens in the loaded history before optimization.
    pub original_tokens: usize,
    pub tokens: usize,
}

/// Keeps thread history inside the token budget.
pub struct ContextWindowManager {
    storage: Arc<dyn Storage>,
    engine: CompressionEngine,
    pruner: RelevancePruner,
    counter: Arc<dyn TokenCounter>,
    config: ContextConfig,
    locks: ThreadLocks,
}

impl ContextWindowManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        engine: CompressionEngine,
        pruner: RelevancePruner,
        counter: Arc<dyn TokenCounter>,
        config: ContextConfig,
    ) -> Self {
        Self {
            storage,
            engine,
            pruner,
            counter,
            config,
            locks: ThreadLocks::new(),
        }
    }

    /// Manager that summarizes with the configured summary model.
    pub fn from_config(storage: Arc<dyn Storage>, client: &ProviderClient, config: &CoreConfig) -> Self {
        let context = config.context.clone();
        let counter: Arc<dyn TokenCounter> = Arc::new(CharRatioCounter::new(context.chars_per_token));
        let summarizer = ClientSummarizer::new(client.clone(), &config.summary_model)
            .with_timeout(Duration::from_secs(context.summary_timeout_secs));
        let engine = CompressionEngine::new(Arc::new(summarizer), counter.clone())
            .with_budget(context.token_budget)
            .with_keep_tail(context.keep_tail);
        let pruner = RelevancePruner::new(counter.clone());
        Self::new(storage, engine, pruner, counter, context)
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn counter(&self) -> &dyn TokenCounter {
        self.counter.as_ref()
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Exclusive access to a thread, for callers that must hold it across
    /// reading history and writing the turn back.
    pub async fn lock_thread(&self, thread_id: &str) -> ThreadGuard {
        self.locks.acquire(thread_id).await
    }

    /// Optimized history for `thread_id` given the new `query`.
    pub async fn get_session_history(&self, thread_id: &str, query: &str) -> HistoryOutcome {
        let guard = self.lock_thread(thread_id).await;
        self.history_locked(&guard, query).await
    }

    /// [`get_session_history`](Self::get_session_history) for a thread the
    /// caller already holds.
    pub async fn history_locked(&self, guard: &ThreadGuard, query: &str) -> HistoryOutcome {
        let thread_id = guard.thread_id();
        let raw = match self.load(thread_id, self.config.history_limit).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Loading history for {thread_id} failed: {e}; trying recent messages");
                return match self.load(thread_id, Some(self.config.fallback_recent)).await {
                    Ok(recent) => self.outcome(recent, HistorySource::Recent, None),
                    Err(e) => {
                        warn!("Loading recent history for {thread_id} failed: {e}; using none");
                        self.outcome(Vec::new(), HistorySource::Empty, None)
                    }
                };
            }
        };
        let original_tokens = self.counter.total(&raw);

        let compressed = match AssertUnwindSafe(self.engine.compress(&raw))
            .catch_unwind()
            .await
        {
            Ok(compressed) => compressed,
            Err(_) => {
                warn!("Compression for {thread_id} panicked; using raw history");
                return self.raw_fallback(raw, original_tokens);
            }
        };

        let optimized = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.pruner.prune(&compressed, query)
        })) {
            Ok(pruned) => pruned,
            Err(_) => {
                warn!("Pruning for {thread_id} panicked; keeping compressed history");
                compressed
            }
        };

        let outcome = self.outcome(optimized, HistorySource::Optimized, Some(original_tokens));
        debug!(
            "History for {thread_id}: {} message(s), {} -> {} tokens",
            outcome.messages.len(),
            outcome.original_tokens,
            outcome.tokens
        );
        outcome
    }

    fn raw_fallback(&self, raw: Vec<HistoryMessage>, original_tokens: usize) -> HistoryOutcome {
        if original_tokens <= self.config.token_budget {
            return self.outcome(raw, HistorySource::Raw, Some(original_tokens));
        }
        let start = raw.len().saturating_sub(self.config.fallback_recent);
        self.outcome(raw[start..].to_vec(), HistorySource::Recent, Some(original_tokens))
    }

    fn outcome(
        &self,
        messages: Vec<HistoryMessage>,
        source: HistorySource,
        original_tokens: Option<usize>,
    ) -> HistoryOutcome {
        let tokens = self.counter.total(&messages);
        HistoryOutcome {
            messages,
            source,
            original_tokens: original_tokens.unwrap_or(tokens),
            tokens,
        }
    }

    /// Read messages off the async runtime, recounting tokens so the
    /// budget is enforced on current counts.
    async fn load(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryMessage>, StorageError> {
        let storage = self.storage.clone();
        let id = thread_id.to_string();
        let messages = tokio::task::spawn_blocking(move || storage.get_messages(&id, limit))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;
        Ok(messages
            .iter()
            .map(|m| {
                let tokens = self.counter.count(&m.content);
                if tokens == m.tokens {
                    m.clone()
                } else {
                    m.with_content(m.content.clone(), self.counter.as_ref())
                }
            })
            .collect())
    }
}
