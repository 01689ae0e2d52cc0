//! Runtime core for LLM-backed coding agents.
//!
//! `corvid` turns a user query plus a persisted conversation into a bounded
//! sequence of model calls and tool executions. It is built from three
//! tightly coupled pieces:
//!
//! - **Provider normalization** ([`api`]): one [`ProviderClient`](api::ProviderClient)
//!   talks to any OpenAI-chat-completions-compatible endpoint, tolerates the
//!   field-name differences between vendors, classifies failures into a fixed
//!   taxonomy and retries the transient ones. The [`reasoning`] module replays
//!   provider reasoning payloads (reasoning content, thought signatures)
//!   byte-exact on the next request.
//! - **Tool orchestration** ([`agent`]): the [`ToolLoop`](agent::ToolLoop) is a
//!   bounded state machine that alternates model calls and tool executions,
//!   enforces per-tool quotas and never aborts on a single tool failure.
//! - **Context window management** ([`context`]): compression and
//!   relevance pruning keep a growing thread inside a token budget. Both are
//!   pure and fail-safe; the [`ContextWindowManager`](context::ContextWindowManager)
//!   always returns a usable message list.
//!
//! Persistence ([`storage`]) and tool implementations ([`tools`]) are
//! collaborators behind traits.
//!
//! # Getting started
//!
//! ```ignore
//! use corvid::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), corvid::Error> {
//!     let config = CoreConfig::load(None)?.apply_env_overrides();
//!     let client = ProviderClient::from_config(&config)?;
//!     let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
//!     let context = ContextWindowManager::from_config(storage.clone(), &client, &config);
//!     let tools = ToolSet::new();
//!
//!     let conversation = Conversation::new(&client, &context, &tools, &config);
//!     let thread = conversation.start_thread("me", None, "scratch").await?;
//!     let turn = conversation
//!         .respond(&thread.id, "Where is the retry policy defined?")
//!         .await?;
//!     println!("{}", turn.result.content);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod prelude;
pub mod reasoning;
pub mod storage;
pub mod tools;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

pub use error::Error;

// ── Constants ──────────────────────────────────────────────────────

/// Default model for all LLM calls.
pub const DEFAULT_MODEL: &str = "gpt-4.1";

/// Maximum tokens for auxiliary calls (summarization).
pub const AUXILIARY_MAX_TOKENS: u32 = 1024;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`, for use as [`ToolDef`] parameters.
///
/// # Example
///
/// ```
/// use corvid::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct SearchArgs {
///     query: String,
///     #[serde(default)]
///     limit: Option<u32>,
/// }
///
/// let schema = json_schema_for::<SearchArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"query".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message on the wire.
///
/// `extra` holds provider-specific fields (reasoning content, thought
/// signatures) that must be sent back exactly as they were received. It is
/// flattened into the JSON object, so unknown fields survive a
/// deserialize/serialize cycle untouched.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

impl Message {
    fn with_role(role: MessageRole, content: Option<String>) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            extra: Map::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, Some(content.into()))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, Some(content.into()))
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, Some(content.into()))
    }

    /// Assistant turn that requested tool calls. `content` is whatever text
    /// the model produced alongside the calls, if any.
    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::with_role(MessageRole::Assistant, content)
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::with_role(MessageRole::Tool, Some(content.into()))
        }
    }

    /// Text content, or `""` when absent.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// Tool calls carried by this message (empty for non-assistant turns).
    pub fn calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition sent to the API (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    /// Create a function-calling tool definition.
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub enum CallType {
    #[serde(rename = "function")]
    #[default]
    Function,
}

/// A tool call returned by the model.
///
/// Signature sub-fields attached by the provider (e.g.
/// `extra_content.google.thought_signature`) land in `extra` and are
/// replayed without modification.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default)]
    pub call_type: CallType,
    pub function: FunctionCallData,
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: name.into(),
                arguments: arguments.into(),
                extra: Map::new(),
            },
            extra: Map::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionCallData {
    pub name: String,
    /// Raw argument string exactly as the model produced it.
    #[serde(default, deserialize_with = "arguments_as_string")]
    pub arguments: String,
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

/// Some providers send `arguments` as a JSON object instead of a string.
/// Strings pass through untouched; anything else is serialized once.
fn arguments_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

// ── Request types ──────────────────────────────────────────────────

/// Provider-independent chat request. The [`ProviderClient`](api::ProviderClient)
/// turns it into a provider-specific body according to the model's
/// [`ProviderProfile`](api::ProviderProfile).
#[derive(Serialize, Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: Option<f32>) -> Self {
        self.top_p = top_p;
        self
    }
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

// ── Response types ─────────────────────────────────────────────────

/// Token usage statistics reported by the provider.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageInfo {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Provider-independent view of one completion.
///
/// Recomputed on every call and never persisted. `raw` keeps the parsed
/// response body for debugging and for fields no strategy knows about yet.
#[derive(Debug, Clone)]
pub struct NormalizedResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    /// Reasoning text (`reasoning_content` / `reasoning`), if the provider sent one.
    pub reasoning_content: Option<String>,
    /// Signature attached to the first tool call, or to a `parts` entry
    /// when no call carries one.
    pub thought_signature: Option<String>,
    /// Per-call signatures, index-aligned with `tool_calls`.
    pub thought_signatures: Vec<Option<String>>,
    /// Signature attached to the final text part.
    pub text_signature: Option<String>,
    pub usage: UsageInfo,
    pub finish_reason: Option<String>,
    /// Estimated cost in USD from the per-model pricing table.
    pub cost: f64,
    pub latency: Duration,
    pub provider: String,
    pub raw: Value,
}

impl NormalizedResponse {
    /// Whether the model asked for any tool calls.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Text that preceded this response's tool calls: reasoning if present,
    /// otherwise the visible content.
    pub fn thinking(&self) -> &str {
        match self.reasoning_content.as_deref() {
            Some(r) if !r.is_empty() => r,
            _ => self.content.as_str(),
        }
    }
}
