//! Integration tests for history optimization: compression, pruning and the
//! manager's fallback chain, against scripted summarizers and storage.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use corvid::MessageRole;
use corvid::config::ContextConfig;
use corvid::context::{
    CharRatioCounter, CompressionEngine, ContextWindowManager, HistorySource, RelevancePruner,
    Summarizer, SummaryFuture, SummaryRequest, TokenCounter,
};
use corvid::storage::{HistoryMessage, MemoryStorage, NewMessage, Storage, StorageError, Thread};

/// Keeps the first `target_chars` characters and counts calls.
#[derive(Default)]
struct Truncating {
    calls: AtomicUsize,
}

impl Summarizer for Truncating {
    fn summarize<'a>(&'a self, request: SummaryRequest<'a>) -> SummaryFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(request.content.chars().take(request.target_chars).collect()) })
    }
}

fn counter() -> Arc<dyn TokenCounter> {
    Arc::new(CharRatioCounter::default())
}

fn message(role: MessageRole, content: &str) -> HistoryMessage {
    HistoryMessage {
        id: corvid::api::generate_id("msg"),
        thread_id: "th-test".into(),
        role,
        tokens: counter().count(content),
        content: content.to_string(),
        metadata: None,
        created_at: Utc::now(),
    }
}

/// 1050 characters is exactly 300 tokens at 3.5 characters per token.
fn block(label: &str) -> String {
    let mut text = format!("{label}: ");
    while text.chars().count() < 1050 {
        text.push_str("details ");
    }
    text.chars().take(1050).collect()
}

fn long_thread() -> Vec<HistoryMessage> {
    (0..13)
        .map(|i| {
            let role = match i % 3 {
                0 => MessageRole::User,
                1 => MessageRole::Assistant,
                _ => MessageRole::Tool,
            };
            message(role, &block(&format!("turn {i}")))
        })
        .collect()
}

// ── Compression ─────────────────────────────────────────────────────

#[tokio::test]
async fn over_budget_thread_is_compressed_with_tail_intact() {
    let history = long_thread();
    let counter = counter();
    assert!(history.iter().all(|m| m.tokens == 300));
    assert_eq!(counter.total(&history), 3900);

    let summarizer = Arc::new(Truncating::default());
    let engine = CompressionEngine::new(summarizer.clone(), counter.clone())
        .with_budget(2000)
        .with_keep_tail(3);
    let out = engine.compress(&history).await;

    assert_eq!(out.len(), history.len());
    assert_eq!(out[10..], history[10..]);
    for (before, after) in history[..10].iter().zip(&out[..10]) {
        assert_eq!(before.id, after.id);
        assert_eq!(after.tokens, counter.count(&after.content));
        match before.role {
            MessageRole::User => assert_eq!(before, after),
            _ => {
                assert!(after.content.starts_with("[compressed] "));
                assert!(after.tokens < before.tokens);
            }
        }
    }
    assert!(counter.total(&out) < 3900);
    // Six assistant/tool messages before the tail.
    assert_eq!(summarizer.calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn compressing_twice_changes_nothing_more() {
    let history = long_thread();
    let summarizer = Arc::new(Truncating::default());
    let engine = CompressionEngine::new(summarizer.clone(), counter())
        .with_budget(2000)
        .with_keep_tail(3);

    let once = engine.compress(&history).await;
    let calls = summarizer.calls.load(Ordering::SeqCst);
    let twice = engine.compress(&once).await;

    assert_eq!(once, twice);
    assert_eq!(summarizer.calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn code_blocks_survive_compression() {
    let mut history = long_thread();
    history[1] = message(
        MessageRole::Assistant,
        &format!("Here is the fix:\n```rust\nfn main() {{}}\n```\n{}", block("tail")),
    );
    let engine = CompressionEngine::new(Arc::new(Truncating::default()), counter())
        .with_budget(2000)
        .with_keep_tail(3);

    let out = engine.compress(&history).await;
    assert_eq!(out[1], history[1]);
}

// ── Pruning ─────────────────────────────────────────────────────────

#[test]
fn tool_output_about_other_files_is_pruned() {
    let history = vec![
        message(MessageRole::User, "Look at the login flow."),
        message(
            MessageRole::Tool,
            "File: src/auth.py\ndef login(user):\n    return check(user)",
        ),
        message(
            MessageRole::Tool,
            "File: src/logger.py\nimport logging\nlog = logging.getLogger()",
        ),
        message(MessageRole::Tool, "Command finished with exit code 0"),
        message(MessageRole::Assistant, "src/logger.py only configures logging."),
    ];
    let pruner = RelevancePruner::new(counter());

    let out = pruner.prune(&history, "Why does auth.py reject valid users?");

    assert_eq!(out[0], history[0]);
    assert_eq!(out[1], history[1]);
    assert_eq!(
        out[2].content,
        "[pruned] Tool output about src/logger.py, unrelated to the current request."
    );
    assert_eq!(out[2].tokens, counter().count(&out[2].content));
    assert!(out[3].content.starts_with("[pruned] Stale tool output"));
    // Only tool output is ever pruned.
    assert_eq!(out[4], history[4]);
}

#[test]
fn query_without_files_prunes_nothing() {
    let history = vec![message(MessageRole::Tool, "File: src/logger.py\nimport logging")];
    let out = RelevancePruner::new(counter()).prune(&history, "what does this project do?");
    assert_eq!(out, history);
}

// ── Manager fallbacks ───────────────────────────────────────────────

/// Full reads fail; bounded reads are served from the inner store.
struct FullReadFails {
    inner: MemoryStorage,
}

impl Storage for FullReadFails {
    fn create_thread(
        &self,
        user_id: &str,
        project_path: Option<&str>,
        title: &str,
    ) -> Result<Thread, StorageError> {
        self.inner.create_thread(user_id, project_path, title)
    }

    fn append_messages(
        &self,
        thread_id: &str,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<HistoryMessage>, StorageError> {
        self.inner.append_messages(thread_id, messages)
    }

    fn get_messages(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryMessage>, StorageError> {
        match limit {
            None => Err(StorageError::Io(std::io::Error::other("disk on fire"))),
            Some(_) => self.inner.get_messages(thread_id, limit),
        }
    }

    fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, StorageError> {
        self.inner.get_thread(thread_id)
    }

    fn list_threads(&self, user_id: &str) -> Result<Vec<Thread>, StorageError> {
        self.inner.list_threads(user_id)
    }

    fn delete_thread(&self, thread_id: &str) -> Result<bool, StorageError> {
        self.inner.delete_thread(thread_id)
    }
}

fn manager(storage: Arc<dyn Storage>, config: ContextConfig) -> ContextWindowManager {
    let counter = counter();
    let engine = CompressionEngine::new(Arc::new(Truncating::default()), counter.clone())
        .with_budget(config.token_budget)
        .with_keep_tail(config.keep_tail);
    let pruner = RelevancePruner::new(counter.clone());
    ContextWindowManager::new(storage, engine, pruner, counter, config)
}

fn seed(storage: &dyn Storage, count: usize) -> String {
    let thread = storage.create_thread("u1", None, "t").unwrap();
    for i in 0..count {
        let content = format!("message {i}");
        storage
            .add_message(&thread.id, MessageRole::User, &content, counter().count(&content), None)
            .unwrap();
    }
    thread.id
}

#[tokio::test]
async fn failed_full_read_falls_back_to_recent_messages() {
    let storage = Arc::new(FullReadFails {
        inner: MemoryStorage::new(),
    });
    let thread_id = seed(storage.as_ref(), 12);
    let config = ContextConfig {
        fallback_recent: 4,
        ..ContextConfig::default()
    };

    let outcome = manager(storage, config)
        .get_session_history(&thread_id, "continue")
        .await;

    assert_eq!(outcome.source, HistorySource::Recent);
    let contents: Vec<_> = outcome.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["message 8", "message 9", "message 10", "message 11"]);
}

#[tokio::test]
async fn unknown_thread_yields_empty_history() {
    let outcome = manager(Arc::new(MemoryStorage::new()), ContextConfig::default())
        .get_session_history("th-missing", "hello")
        .await;

    assert_eq!(outcome.source, HistorySource::Empty);
    assert!(outcome.messages.is_empty());
    assert_eq!(outcome.tokens, 0);
}

#[tokio::test]
async fn healthy_thread_is_optimized_within_budget() {
    let storage = Arc::new(MemoryStorage::new());
    let thread_id = seed(storage.as_ref(), 5);

    let outcome = manager(storage, ContextConfig::default())
        .get_session_history(&thread_id, "next")
        .await;

    assert_eq!(outcome.source, HistorySource::Optimized);
    assert_eq!(outcome.messages.len(), 5);
    assert_eq!(outcome.tokens, outcome.original_tokens);
}
