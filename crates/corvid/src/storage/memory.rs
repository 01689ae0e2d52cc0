//! In-memory storage.

use super::{HistoryMessage, NewMessage, Storage, StorageError, Thread, sort_by_recency, tail};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct State {
    threads: HashMap<String, Thread>,
    messages: HashMap<String, Vec<HistoryMessage>>,
}

/// Storage that lives and dies with the process.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StorageError> {
        self.state.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl Storage for MemoryStorage {
    fn create_thread(
        &self,
        user_id: &str,
        project_path: Option<&str>,
        title: &str,
    ) -> Result<Thread, StorageError> {
        let thread = Thread::new(user_id, project_path, title);
        let mut state = self.lock()?;
        state.messages.insert(thread.id.clone(), Vec::new());
        state.threads.insert(thread.id.clone(), thread.clone());
        Ok(thread)
    }

    fn append_messages(
        &self,
        thread_id: &str,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<HistoryMessage>, StorageError> {
        let mut state = self.lock()?;
        let thread = state
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| StorageError::ThreadNotFound(thread_id.to_string()))?;
        let stored: Vec<HistoryMessage> = messages
            .into_iter()
            .map(|m| {
                thread.touch(m.tokens);
                HistoryMessage::new(thread_id, m.role, &m.content, m.tokens, m.metadata)
            })
            .collect();
        state
            .messages
            .entry(thread_id.to_string())
            .or_default()
            .extend(stored.iter().cloned());
        Ok(stored)
    }

    fn get_messages(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryMessage>, StorageError> {
        let state = self.lock()?;
        let messages = state
            .messages
            .get(thread_id)
            .ok_or_else(|| StorageError::ThreadNotFound(thread_id.to_string()))?;
        Ok(tail(messages, limit))
    }

    fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, StorageError> {
        Ok(self.lock()?.threads.get(thread_id).cloned())
    }

    fn list_threads(&self, user_id: &str) -> Result<Vec<Thread>, StorageError> {
        let mut threads: Vec<Thread> = self
            .lock()?
            .threads
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        sort_by_recency(&mut threads);
        Ok(threads)
    }

    fn delete_thread(&self, thread_id: &str) -> Result<bool, StorageError> {
        let mut state = self.lock()?;
        state.messages.remove(thread_id);
        Ok(state.threads.remove(thread_id).is_some())
    }
}
