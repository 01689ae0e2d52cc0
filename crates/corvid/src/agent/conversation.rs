//! One user turn against a persisted thread.
//!
//! [`Conversation::respond`] holds the thread's lock for the whole turn:
//! it builds the optimized history, runs the [`ToolLoop`], and only when
//! the loop succeeds writes the user query, the tool outputs and the final
//! answer back to storage in one append. A failed turn leaves the thread
//! untouched.
//!
//! Tool quotas span the whole thread. Each turn starts from the counts of
//! the thread's stored tool rows.

use super::config::LoopConfig;
use super::events::{EventHandler, NoopHandler};
use super::orchestrator::{LoopResult, ToolLoop};
use crate::api::ProviderClient;
use crate::config::CoreConfig;
use crate::context::{ContextWindowManager, HistorySource};
use crate::error::Result;
use crate::storage::{HistoryMessage, NewMessage, Storage, StorageError, Thread};
use crate::tools::ToolExecutor;
use crate::{Message, MessageRole};
use serde_json::json;
use std::collections::HashMap;
use tracing::{info, warn};

/// Header for stored tool output replayed as user-role context.
const TOOL_CONTEXT_HEADER: &str = "[earlier tool output]";

/// Result of one [`Conversation::respond`] call.
#[derive(Debug, Clone)]
pub struct Turn {
    pub thread_id: String,
    pub result: LoopResult,
    /// How the history sent to the model was produced.
    pub history_source: HistorySource,
    pub history_tokens: usize,
    /// Messages written to storage, in order.
    pub persisted: Vec<HistoryMessage>,
}

/// Wire message for a stored one.
///
/// Stored tool output has no live call id to answer, so it is replayed as
/// user-role context.
pub fn to_wire(message: &HistoryMessage) -> Message {
    match message.role {
        MessageRole::User => Message::user(&message.content),
        MessageRole::Assistant => Message::assistant_text(&message.content),
        MessageRole::System => Message::system(&message.content),
        MessageRole::Tool => Message::user(format!("{TOOL_CONTEXT_HEADER}\n{}", message.content)),
    }
}

/// Quota-counted tool calls recorded in stored history, per tool.
pub fn quota_usage(messages: &[HistoryMessage]) -> HashMap<String, u32> {
    let mut used = HashMap::new();
    for message in messages.iter().filter(|m| m.role == MessageRole::Tool) {
        let Some(metadata) = &message.metadata else {
            continue;
        };
        let counted = metadata["quota_counted"].as_bool().unwrap_or(true);
        if let Some(tool) = metadata["tool"].as_str()
            && counted
        {
            *used.entry(tool.to_string()).or_insert(0) += 1;
        }
    }
    used
}

pub struct Conversation<'a> {
    client: &'a ProviderClient,
    context: &'a ContextWindowManager,
    tools: &'a dyn ToolExecutor,
    loop_config: LoopConfig,
    quotas: HashMap<String, u32>,
    system_prompt: Option<String>,
    event_handler: &'a dyn EventHandler,
}

impl<'a> Conversation<'a> {
    pub fn new(
        client: &'a ProviderClient,
        context: &'a ContextWindowManager,
        tools: &'a dyn ToolExecutor,
        config: &CoreConfig,
    ) -> Self {
        Self {
            client,
            context,
            tools,
            loop_config: config.loop_config(),
            quotas: config.quotas.clone(),
            system_prompt: None,
            event_handler: &NoopHandler,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_loop_config(mut self, config: LoopConfig) -> Self {
        self.loop_config = config;
        self
    }

    pub fn with_event_handler(mut self, handler: &'a dyn EventHandler) -> Self {
        self.event_handler = handler;
        self
    }

    async fn blocking<T, F>(&self, f: F) -> std::result::Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Storage) -> std::result::Result<T, StorageError> + Send + 'static,
    {
        let storage = self.context.storage().clone();
        tokio::task::spawn_blocking(move || f(storage.as_ref()))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
    }

    pub async fn start_thread(
        &self,
        user_id: &str,
        project_path: Option<&str>,
        title: &str,
    ) -> Result<Thread> {
        let (user_id, project_path, title) = (
            user_id.to_string(),
            project_path.map(str::to_string),
            title.to_string(),
        );
        let thread = self
            .blocking(move |s| s.create_thread(&user_id, project_path.as_deref(), &title))
            .await?;
        info!("Started thread {} for {}", thread.id, thread.user_id);
        Ok(thread)
    }

    pub async fn threads(&self, user_id: &str) -> Result<Vec<Thread>> {
        let user_id = user_id.to_string();
        Ok(self.blocking(move |s| s.list_threads(&user_id)).await?)
    }

    /// Stored messages of a thread, oldest first.
    pub async fn history(&self, thread_id: &str, limit: Option<usize>) -> Result<Vec<HistoryMessage>> {
        let thread_id = thread_id.to_string();
        Ok(self
            .blocking(move |s| s.get_messages(&thread_id, limit))
            .await?)
    }

    /// Answer `query` in `thread_id` and record the turn.
    pub async fn respond(&self, thread_id: &str, query: &str) -> Result<Turn> {
        let guard = self.context.lock_thread(thread_id).await;

        let id = thread_id.to_string();
        self.blocking(move |s| s.get_thread(&id))
            .await?
            .ok_or_else(|| StorageError::ThreadNotFound(thread_id.to_string()))?;

        let quota_used = self.quota_used(thread_id).await;
        let history = self.context.history_locked(&guard, query).await;
        let mut messages = Vec::with_capacity(history.messages.len() + 2);
        if let Some(prompt) = &self.system_prompt {
            messages.push(Message::system(prompt));
        }
        messages.extend(history.messages.iter().map(to_wire));
        messages.push(Message::user(query));

        let result = ToolLoop::new(self.client, self.tools, self.loop_config.clone())
            .with_quotas(self.quotas.clone())
            .with_quota_usage(quota_used)
            .with_event_handler(self.event_handler)
            .run(messages)
            .await?;

        let persisted = self.persist(thread_id, query, &result).await?;
        drop(guard);

        Ok(Turn {
            thread_id: thread_id.to_string(),
            result,
            history_source: history.source,
            history_tokens: history.tokens,
            persisted,
        })
    }

    /// Earlier usage of quota-limited tools in this thread. A failed read
    /// is logged and counts as no usage.
    async fn quota_used(&self, thread_id: &str) -> HashMap<String, u32> {
        if self.quotas.is_empty() {
            return HashMap::new();
        }
        let id = thread_id.to_string();
        match self.blocking(move |s| s.get_messages(&id, None)).await {
            Ok(messages) => quota_usage(&messages),
            Err(e) => {
                warn!("Could not read quota usage for thread {thread_id}: {e}");
                HashMap::new()
            }
        }
    }

    async fn persist(
        &self,
        thread_id: &str,
        query: &str,
        result: &LoopResult,
    ) -> std::result::Result<Vec<HistoryMessage>, StorageError> {
        let counter = self.context.counter();
        let row = |role, content: &str| NewMessage::new(role, content, counter.count(content));

        let mut rows = Vec::with_capacity(result.tool_calls.len() + 2);
        rows.push(row(MessageRole::User, query));
        for call in &result.tool_calls {
            rows.push(row(MessageRole::Tool, &call.output).with_metadata(json!({
                "tool": call.name,
                "call_id": call.call_id,
                "arguments": call.arguments,
                "success": call.success,
                "quota_counted": call.quota_counted,
            })));
        }
        rows.push(row(MessageRole::Assistant, &result.content).with_metadata(json!({
            "trace_id": result.trace_id,
            "iterations": result.iterations,
            "forced_finalization": result.forced_finalization,
            "cost_usd": result.cost.estimated_cost_usd,
        })));

        let thread_id = thread_id.to_string();
        self.blocking(move |s| s.append_messages(&thread_id, rows))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ProfileRegistry, RetryConfig, ScriptedTransport};
    use crate::storage::MemoryStorage;
    use crate::tools::{FnTool, ToolSet};
    use crate::ToolDef;
    use serde_json::Value;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Refuses to store the row at `reject_at` (counted across all writes).
    /// A batch that contains it is rejected whole.
    struct RejectsRow {
        inner: MemoryStorage,
        written: AtomicUsize,
        reject_at: usize,
    }

    impl Storage for RejectsRow {
        fn create_thread(&self, u: &str, p: Option<&str>, t: &str) -> std::result::Result<Thread, StorageError> {
            self.inner.create_thread(u, p, t)
        }
        fn append_messages(
            &self,
            id: &str,
            messages: Vec<NewMessage>,
        ) -> std::result::Result<Vec<HistoryMessage>, StorageError> {
            let start = self.written.load(Ordering::SeqCst);
            if (start..start + messages.len()).contains(&self.reject_at) {
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
            self.written.fetch_add(messages.len(), Ordering::SeqCst);
            self.inner.append_messages(id, messages)
        }
        fn get_messages(&self, id: &str, limit: Option<usize>) -> std::result::Result<Vec<HistoryMessage>, StorageError> {
            self.inner.get_messages(id, limit)
        }
        fn get_thread(&self, id: &str) -> std::result::Result<Option<Thread>, StorageError> {
            self.inner.get_thread(id)
        }
        fn list_threads(&self, u: &str) -> std::result::Result<Vec<Thread>, StorageError> {
            self.inner.list_threads(u)
        }
        fn delete_thread(&self, id: &str) -> std::result::Result<bool, StorageError> {
            self.inner.delete_thread(id)
        }
    }

    struct Fixture {
        transport: Arc<ScriptedTransport>,
        client: ProviderClient,
        context: ContextWindowManager,
        tools: ToolSet,
        config: CoreConfig,
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryStorage::new()), CoreConfig::default())
    }

    fn fixture_with(storage: Arc<dyn Storage>, config: CoreConfig) -> Fixture {
        let transport = Arc::new(ScriptedTransport::new());
        let client = ProviderClient::new(
            transport.clone(),
            ProfileRegistry::builtin(),
            RetryConfig::immediate(1),
        )
        .with_api_key("openai", "sk-test");
        let context = ContextWindowManager::from_config(storage, &client, &config);
        let tools = ToolSet::new()
            .with(FnTool::new(
                ToolDef::new("read_file", "Read", json!({"type": "object"})),
                |_: Value| async move { Ok("File: src/lib.rs\npub mod a;".to_string()) },
            ))
            .with(FnTool::new(
                ToolDef::new("web_search", "Search", json!({"type": "object"})),
                |_: Value| async move { Ok("3 results".to_string()) },
            ));
        Fixture {
            transport,
            client,
            context,
            tools,
            config,
        }
    }

    fn reply(content: &str) -> Value {
        json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
    }

    fn call(id: &str, name: &str) -> Value {
        json!({"choices": [{"message": {"role": "assistant", "content": "",
            "tool_calls": [{"id": id, "type": "function",
                "function": {"name": name, "arguments": "{}"}}]}}]})
    }

    #[tokio::test]
    async fn turn_persists_user_tool_and_answer() {
        let f = fixture();
        f.transport
            .push_json(&json!({"choices": [{"message": {"role": "assistant", "content": "",
                "tool_calls": [{"id": "c1", "type": "function",
                    "function": {"name": "read_file", "arguments": "{}"}}]}}]}))
            .push_json(&reply("lib.rs declares module a."));
        let conversation = Conversation::new(&f.client, &f.context, &f.tools, &f.config)
            .with_system_prompt("You are terse.");

        let thread = conversation.start_thread("u1", Some("/repo"), "t").await.unwrap();
        let turn = conversation
            .respond(&thread.id, "what is in src/lib.rs?")
            .await
            .unwrap();

        assert_eq!(turn.result.content, "lib.rs declares module a.");
        let roles: Vec<_> = turn.persisted.iter().map(|m| m.role).collect();
        assert_eq!(roles, [MessageRole::User, MessageRole::Tool, MessageRole::Assistant]);
        assert_eq!(turn.persisted[1].metadata.as_ref().unwrap()["call_id"], "c1");

        let stored = conversation.history(&thread.id, None).await.unwrap();
        assert_eq!(stored, turn.persisted);
        let first = &f.transport.requests()[0].body;
        assert_eq!(first["messages"][0]["role"], "system");
    }

    #[tokio::test]
    async fn second_turn_replays_history() {
        let f = fixture();
        f.transport.push_json(&reply("first")).push_json(&reply("second"));
        let conversation = Conversation::new(&f.client, &f.context, &f.tools, &f.config);
        let thread = conversation.start_thread("u1", None, "t").await.unwrap();

        conversation.respond(&thread.id, "one").await.unwrap();
        conversation.respond(&thread.id, "two").await.unwrap();

        let second = &f.transport.requests()[1].body;
        let contents: Vec<_> = second["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["content"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(contents, ["one", "first", "two"]);
    }

    #[tokio::test]
    async fn failed_turn_writes_nothing() {
        let f = fixture();
        f.transport.push(400, "bad request");
        let conversation = Conversation::new(&f.client, &f.context, &f.tools, &f.config);
        let thread = conversation.start_thread("u1", None, "t").await.unwrap();

        let err = conversation.respond(&thread.id, "q").await.unwrap_err();
        assert_eq!(err.api_error().and_then(|e| e.status()), Some(400));
        assert!(conversation.history(&thread.id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_mid_turn_stores_no_rows() {
        let storage = Arc::new(RejectsRow {
            inner: MemoryStorage::new(),
            written: AtomicUsize::new(0),
            reject_at: 1,
        });
        let f = fixture_with(storage.clone(), CoreConfig::default());
        f.transport
            .push_json(&call("c1", "read_file"))
            .push_json(&reply("done"));
        let conversation = Conversation::new(&f.client, &f.context, &f.tools, &f.config);
        let thread = conversation.start_thread("u1", None, "t").await.unwrap();

        let err = conversation.respond(&thread.id, "q").await.unwrap_err();
        assert!(matches!(err, crate::Error::Storage(StorageError::Io(_))));
        assert!(storage.inner.get_messages(&thread.id, None).unwrap().is_empty());
        assert_eq!(
            storage.inner.get_thread(&thread.id).unwrap().unwrap().message_count,
            0
        );
    }

    #[tokio::test]
    async fn quota_spans_turns_of_a_thread() {
        let mut config = CoreConfig::default();
        config.quotas = HashMap::from([("web_search".to_string(), 1)]);
        let f = fixture_with(Arc::new(MemoryStorage::new()), config);
        f.transport
            .push_json(&call("s1", "web_search"))
            .push_json(&reply("found it"))
            .push_json(&call("s2", "web_search"))
            .push_json(&reply("no more searches"));
        let conversation = Conversation::new(&f.client, &f.context, &f.tools, &f.config);
        let thread = conversation.start_thread("u1", None, "t").await.unwrap();

        let first = conversation.respond(&thread.id, "search once").await.unwrap();
        assert!(first.result.tool_calls[0].success);

        let second = conversation.respond(&thread.id, "search again").await.unwrap();
        let refused = &second.result.tool_calls[0];
        assert!(!refused.success);
        assert!(refused.output.contains("quota"), "{}", refused.output);

        // The refusal is stored but does not count as usage.
        let stored = conversation.history(&thread.id, None).await.unwrap();
        assert_eq!(quota_usage(&stored), HashMap::from([("web_search".to_string(), 1)]));
    }

    #[tokio::test]
    async fn other_threads_keep_their_own_quota() {
        let mut config = CoreConfig::default();
        config.quotas = HashMap::from([("web_search".to_string(), 1)]);
        let f = fixture_with(Arc::new(MemoryStorage::new()), config);
        f.transport
            .push_json(&call("s1", "web_search"))
            .push_json(&reply("a"))
            .push_json(&call("s2", "web_search"))
            .push_json(&reply("b"));
        let conversation = Conversation::new(&f.client, &f.context, &f.tools, &f.config);
        let a = conversation.start_thread("u1", None, "a").await.unwrap();
        let b = conversation.start_thread("u1", None, "b").await.unwrap();

        conversation.respond(&a.id, "search").await.unwrap();
        let turn = conversation.respond(&b.id, "search").await.unwrap();
        assert!(turn.result.tool_calls[0].success);
    }

    #[test]
    fn usage_counts_only_quota_counted_tool_rows() {
        let row = |tool: &str, counted: bool| {
            HistoryMessage::new(
                "th",
                MessageRole::Tool,
                "out",
                1,
                Some(json!({"tool": tool, "quota_counted": counted})),
            )
        };
        let legacy = HistoryMessage::new("th", MessageRole::Tool, "out", 1, Some(json!({"tool": "grep"})));
        let messages = vec![
            row("web_search", true),
            row("web_search", false),
            row("grep", true),
            legacy,
            HistoryMessage::new("th", MessageRole::User, "q", 1, Some(json!({"tool": "grep"}))),
        ];

        let used = quota_usage(&messages);
        assert_eq!(used.get("web_search"), Some(&1));
        assert_eq!(used.get("grep"), Some(&2));
    }

    #[tokio::test]
    async fn unknown_thread_fails_before_calling_provider() {
        let f = fixture();
        let conversation = Conversation::new(&f.client, &f.context, &f.tools, &f.config);
        let err = conversation.respond("th-nope", "q").await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Storage(StorageError::ThreadNotFound(_))
        ));
        assert_eq!(f.transport.request_count(), 0);
    }

    #[test]
    fn stored_tool_output_replays_as_user_context() {
        let stored = HistoryMessage::new("th", MessageRole::Tool, "File: a.rs", 3, None);
        let wire = to_wire(&stored);
        assert_eq!(wire.role, MessageRole::User);
        assert_eq!(wire.text(), "[earlier tool output]\nFile: a.rs");
        assert!(wire.tool_call_id.is_none());
    }
}
