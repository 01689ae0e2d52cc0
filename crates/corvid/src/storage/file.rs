//! File-backed storage: one JSON document per thread.
//!
//! ```text
//! root/
//!   th-18c2f3a1b-0000.json
//!   th-18c2f3a1c-0001.json
//! ```
//!
//! Each write serializes the whole document to a hidden temp file and
//! renames it into place, so a crash never leaves a half-written thread.

use super::{HistoryMessage, NewMessage, Storage, StorageError, Thread, sort_by_recency, tail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

#[derive(Serialize, Deserialize)]
struct ThreadDocument {
    thread: Thread,
    #[serde(default)]
    messages: Vec<HistoryMessage>,
}

pub struct FileStorage {
    root: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileStorage {
    /// Open (and create if needed) a storage directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StorageError> {
        self.write_lock.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Path for a thread id. Ids that could escape the root resolve to
    /// `None` and are treated as unknown.
    fn path_for(&self, thread_id: &str) -> Option<PathBuf> {
        let safe = !thread_id.is_empty()
            && thread_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        safe.then(|| self.root.join(format!("{thread_id}.json")))
    }

    fn read_document(path: &Path) -> Result<Option<ThreadDocument>, StorageError> {
        let json = match std::fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })
    }

    fn load(&self, thread_id: &str) -> Result<ThreadDocument, StorageError> {
        self.path_for(thread_id)
            .map(|path| Self::read_document(&path))
            .transpose()?
            .flatten()
            .ok_or_else(|| StorageError::ThreadNotFound(thread_id.to_string()))
    }

    fn save(&self, doc: &ThreadDocument) -> Result<(), StorageError> {
        let path = self
            .path_for(&doc.thread.id)
            .ok_or_else(|| StorageError::ThreadNotFound(doc.thread.id.clone()))?;
        let tmp_path = self.root.join(format!(".{}.json.tmp", doc.thread.id));
        let json = serde_json::to_string_pretty(doc).map_err(|e| StorageError::Corrupt {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn create_thread(
        &self,
        user_id: &str,
        project_path: Option<&str>,
        title: &str,
    ) -> Result<Thread, StorageError> {
        let _guard = self.lock()?;
        let doc = ThreadDocument {
            thread: Thread::new(user_id, project_path, title),
            messages: Vec::new(),
        };
        self.save(&doc)?;
        Ok(doc.thread)
    }

    fn append_messages(
        &self,
        thread_id: &str,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<HistoryMessage>, StorageError> {
        let _guard = self.lock()?;
        let mut doc = self.load(thread_id)?;
        let stored: Vec<HistoryMessage> = messages
            .into_iter()
            .map(|m| {
                doc.thread.touch(m.tokens);
                HistoryMessage::new(thread_id, m.role, &m.content, m.tokens, m.metadata)
            })
            .collect();
        doc.messages.extend(stored.iter().cloned());
        self.save(&doc)?;
        Ok(stored)
    }

    fn get_messages(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryMessage>, StorageError> {
        Ok(tail(&self.load(thread_id)?.messages, limit))
    }

    fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, StorageError> {
        match self.load(thread_id) {
            Ok(doc) => Ok(Some(doc.thread)),
            Err(StorageError::ThreadNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn list_threads(&self, user_id: &str) -> Result<Vec<Thread>, StorageError> {
        let mut threads = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            let is_thread = path.extension().is_some_and(|ext| ext == "json")
                && !path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if !is_thread {
                continue;
            }
            // One unreadable file should not hide every other thread.
            match Self::read_document(&path) {
                Ok(Some(doc)) if doc.thread.user_id == user_id => threads.push(doc.thread),
                Ok(_) => {}
                Err(e) => warn!("Skipping thread file {}: {e}", path.display()),
            }
        }
        sort_by_recency(&mut threads);
        Ok(threads)
    }

    fn delete_thread(&self, thread_id: &str) -> Result<bool, StorageError> {
        let _guard = self.lock()?;
        let Some(path) = self.path_for(thread_id) else {
            return Ok(false);
        };
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
