//! Thread and message persistence.
//!
//! The core only borrows persisted history: it reads a thread's messages
//! for one turn and appends the turn's results afterwards. Backends are
//! plain CRUD behind the [`Storage`] trait. Calls are synchronous; async
//! callers offload them with `tokio::task::spawn_blocking`.
//!
//! | Backend | Use case |
//! |---------|----------|
//! | [`MemoryStorage`] | Tests and short-lived processes |
//! | [`FileStorage`] | One JSON document per thread on disk |

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::MessageRole;
use crate::context::tokens::TokenCounter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// A persisted conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub total_tokens: usize,
}

impl Thread {
    pub(crate) fn new(user_id: &str, project_path: Option<&str>, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: crate::api::generate_id("th"),
            user_id: user_id.to_string(),
            project_path: project_path.map(str::to_string),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
            message_count: 0,
            total_tokens: 0,
        }
    }

    /// Account for one appended message.
    pub(crate) fn touch(&mut self, tokens: usize) {
        self.message_count += 1;
        self.total_tokens += tokens;
        self.updated_at = Utc::now();
    }
}

/// One persisted turn of a thread.
///
/// `tokens` always equals the token counter's count of `content`. Code that
/// rewrites content goes through [`HistoryMessage::with_content`], which
/// recounts in the same step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: String,
    pub thread_id: String,
    pub role: MessageRole,
    pub content: String,
    pub tokens: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl HistoryMessage {
    pub(crate) fn new(
        thread_id: &str,
        role: MessageRole,
        content: &str,
        tokens: usize,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            id: crate::api::generate_id("msg"),
            thread_id: thread_id.to_string(),
            role,
            content: content.to_string(),
            tokens,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Copy with new content and a recomputed token count.
    pub fn with_content(&self, content: String, counter: &dyn TokenCounter) -> Self {
        Self {
            tokens: counter.count(&content),
            content,
            ..self.clone()
        }
    }
}

/// A message to append, before the backend assigns its id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub tokens: usize,
    pub metadata: Option<Value>,
}

impl NewMessage {
    pub fn new(role: MessageRole, content: impl Into<String>, tokens: usize) -> Self {
        Self {
            role,
            content: content.into(),
            tokens,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt thread file {path}: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    #[error("storage lock poisoned")]
    Poisoned,
}

/// Thread/message CRUD.
///
/// Deleting a thread deletes its messages. `get_messages` with a limit
/// returns the most recent `limit` messages, oldest first.
pub trait Storage: Send + Sync {
    fn create_thread(
        &self,
        user_id: &str,
        project_path: Option<&str>,
        title: &str,
    ) -> Result<Thread, StorageError>;

    /// Append `messages` in order, all or nothing.
    fn append_messages(
        &self,
        thread_id: &str,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<HistoryMessage>, StorageError>;

    fn add_message(
        &self,
        thread_id: &str,
        role: MessageRole,
        content: &str,
        tokens: usize,
        metadata: Option<Value>,
    ) -> Result<HistoryMessage, StorageError> {
        let message = NewMessage {
            role,
            content: content.to_string(),
            tokens,
            metadata,
        };
        self.append_messages(thread_id, vec![message])?
            .pop()
            .ok_or_else(|| StorageError::Io(std::io::Error::other("backend stored no message")))
    }

    fn get_messages(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryMessage>, StorageError>;

    fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, StorageError>;

    /// Threads owned by `user_id`, most recently updated first.
    fn list_threads(&self, user_id: &str) -> Result<Vec<Thread>, StorageError>;

    /// Remove a thread and its messages. `false` if it did not exist.
    fn delete_thread(&self, thread_id: &str) -> Result<bool, StorageError>;
}

/// Most recent `limit` entries of `messages`, oldest first.
pub(crate) fn tail(messages: &[HistoryMessage], limit: Option<usize>) -> Vec<HistoryMessage> {
    let start = limit.map_or(0, |n| messages.len().saturating_sub(n));
    messages[start..].to_vec()
}

pub(crate) fn sort_by_recency(threads: &mut [Thread]) {
    threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| b.id.cmp(&a.id)));
}
