//! The tool-calling loop.
//!
//! [`ToolLoop`] drives one user turn as an explicit state machine:
//!
//! ```text
//! AwaitingModel ──(no tool calls)──────────────> Terminal(Answered)
//!      │  ^
//!      v  │
//! ExecutingTools                     cap reached > Terminal(IterationLimit)
//! ```
//!
//! The only suspension points are the provider call and each tool's own
//! execution. Tool failures never end the run; a provider failure that
//! survives the retry policy ends it with a [`LoopError`]. The loop works on
//! its own copy of the message list, so the caller's persisted history is
//! untouched either way.

use super::config::LoopConfig;
use super::events::{EventHandler, LoopEvent, NoopHandler};
use super::execution::{ToolCallRecord, execute_tool_call};
use super::quota::QuotaTracker;
use crate::api::{
    ApiError, CostTracker, ProviderClient, ProviderProfile, generate_span_id, generate_trace_id,
};
use crate::reasoning::assistant_message;
use crate::tools::ToolExecutor;
use crate::{ChatRequest, Message, MessageRole, NormalizedResponse};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct LoopResult {
    pub trace_id: String,
    /// Final answer text.
    pub content: String,
    /// One record per tool invocation, in execution order.
    pub tool_calls: Vec<ToolCallRecord>,
    /// Input messages followed by everything the loop appended.
    pub messages: Vec<Message>,
    initial_len: usize,
    /// Model calls made, excluding a forced final call.
    pub iterations: u32,
    /// The iteration cap was hit and the answer was forced.
    pub forced_finalization: bool,
    pub cost: CostTracker,
}

impl LoopResult {
    /// Messages appended during the run: assistant turns and tool results.
    pub fn appended(&self) -> &[Message] {
        &self.messages[self.initial_len.min(self.messages.len())..]
    }

    pub fn failed_calls(&self) -> impl Iterator<Item = &ToolCallRecord> {
        self.tool_calls.iter().filter(|c| !c.success)
    }
}

/// A provider failure that ended the run. Carries the audit trail gathered
/// before the failure.
#[derive(Debug, thiserror::Error)]
#[error("provider call failed after {iterations} iteration(s): {source}")]
pub struct LoopError {
    pub source: ApiError,
    pub tool_calls: Vec<ToolCallRecord>,
    pub iterations: u32,
    pub trace_id: String,
}

enum State {
    AwaitingModel,
    ExecutingTools(NormalizedResponse),
    Terminal(Termination),
}

enum Termination {
    Answered(String),
    IterationLimit,
}

/// Mutable bookkeeping for one run.
struct Run {
    trace_id: String,
    messages: Vec<Message>,
    records: Vec<ToolCallRecord>,
    cost: CostTracker,
    iterations: u32,
}

impl Run {
    fn fail(self, source: ApiError) -> LoopError {
        LoopError {
            source,
            tool_calls: self.records,
            iterations: self.iterations,
            trace_id: self.trace_id,
        }
    }
}

/// Bounded model/tool loop for one turn.
///
/// # Example
///
/// ```ignore
/// let result = ToolLoop::new(&client, &tools, LoopConfig::new("gpt-4.1"))
///     .with_quotas(HashMap::from([("web_search".into(), 5)]))
///     .with_event_handler(&LoggingHandler)
///     .run(vec![Message::system(prompt), Message::user(query)])
///     .await?;
/// println!("{}", result.content);
/// ```
pub struct ToolLoop<'a> {
    client: &'a ProviderClient,
    tools: &'a dyn ToolExecutor,
    config: LoopConfig,
    quotas: HashMap<String, u32>,
    quota_usage: HashMap<String, u32>,
    event_handler: &'a dyn EventHandler,
}

impl<'a> ToolLoop<'a> {
    pub fn new(client: &'a ProviderClient, tools: &'a dyn ToolExecutor, config: LoopConfig) -> Self {
        Self {
            client,
            tools,
            config,
            quotas: HashMap::new(),
            quota_usage: HashMap::new(),
            event_handler: &NoopHandler,
        }
    }

    /// Per-tool call limits.
    pub fn with_quotas(mut self, quotas: HashMap<String, u32>) -> Self {
        self.quotas = quotas;
        self
    }

    /// Calls already made earlier in the session, charged against the quotas.
    pub fn with_quota_usage(mut self, used: HashMap<String, u32>) -> Self {
        self.quota_usage = used;
        self
    }

    pub fn with_event_handler(mut self, handler: &'a dyn EventHandler) -> Self {
        self.event_handler = handler;
        self
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    fn request(&self, messages: Vec<Message>) -> ChatRequest {
        ChatRequest::new(&self.config.model, messages)
            .with_max_tokens(self.config.max_tokens)
            .with_temperature(self.config.temperature)
            .with_top_p(self.config.top_p)
    }

    /// Run until the model answers, the cap is reached or the provider
    /// fails for good.
    pub async fn run(&self, messages: Vec<Message>) -> Result<LoopResult, LoopError> {
        let profile = self.client.profile_for(&self.config.model);
        let max_iterations = self
            .config
            .max_iterations
            .unwrap_or_else(|| profile.iteration_cap());
        let definitions = self.tools.definitions();
        let mut quota =
            QuotaTracker::new(self.quotas.clone()).with_used(self.quota_usage.clone());
        let initial_len = messages.len();
        let mut run = Run {
            trace_id: generate_trace_id(),
            messages,
            records: Vec::new(),
            cost: CostTracker::new(),
            iterations: 0,
        };

        info!(
            "Tool loop started: trace_id={}, model={}, provider={}, max_iterations={max_iterations}",
            run.trace_id, self.config.model, profile.provider_id
        );

        let mut state = State::AwaitingModel;
        let termination = loop {
            state = match state {
                State::AwaitingModel if run.iterations >= max_iterations => {
                    State::Terminal(Termination::IterationLimit)
                }
                State::AwaitingModel => {
                    run.iterations += 1;
                    self.event_handler.on_event(&LoopEvent::IterationStart {
                        iteration: run.iterations,
                        max_iterations,
                        messages: run.messages.len(),
                    });
                    let request = self.request(run.messages.clone());
                    let response = match self.client.call_with_tools(&request, &definitions).await {
                        Ok(response) => response,
                        Err(error) => {
                            self.event_handler
                                .on_event(&LoopEvent::ProviderFailed { error: &error });
                            return Err(run.fail(error));
                        }
                    };
                    debug!(
                        "Model call complete: span={}, tool_calls={}",
                        generate_span_id(&run.trace_id, run.iterations),
                        response.tool_calls.len()
                    );
                    self.observe(&mut run, &response);
                    if response.has_tool_calls() {
                        State::ExecutingTools(response)
                    } else {
                        run.messages.push(assistant_message(&response, &profile));
                        State::Terminal(Termination::Answered(response.content))
                    }
                }
                State::ExecutingTools(response) => {
                    self.event_handler.on_event(&LoopEvent::ToolCallsReceived {
                        iteration: run.iterations,
                        count: response.tool_calls.len(),
                    });
                    let thinking = response.thinking();
                    let mut batch = Vec::with_capacity(response.tool_calls.len());
                    for call in &response.tool_calls {
                        batch.push(
                            execute_tool_call(
                                self.tools,
                                &mut quota,
                                call,
                                thinking,
                                self.event_handler,
                            )
                            .await,
                        );
                    }
                    run.messages.push(assistant_message(&response, &profile));
                    run.messages.extend(
                        batch
                            .iter()
                            .map(|record| Message::tool_result(&record.call_id, &record.output)),
                    );
                    run.records.extend(batch);
                    State::AwaitingModel
                }
                State::Terminal(termination) => break termination,
            };
        };

        let (content, forced_finalization) = match termination {
            Termination::Answered(content) => {
                self.event_handler.on_event(&LoopEvent::Finished {
                    iterations: run.iterations,
                });
                (content, false)
            }
            Termination::IterationLimit => {
                self.event_handler
                    .on_event(&LoopEvent::IterationLimitReached { max_iterations });
                (self.finalize(&mut run, &profile, initial_len).await, true)
            }
        };

        info!(
            "Tool loop finished: trace_id={}, iterations={}, tool_calls={}, forced={forced_finalization}, {}",
            run.trace_id,
            run.iterations,
            run.records.len(),
            run.cost.summary()
        );

        Ok(LoopResult {
            trace_id: run.trace_id,
            content,
            tool_calls: run.records,
            messages: run.messages,
            initial_len,
            iterations: run.iterations,
            forced_finalization,
            cost: run.cost,
        })
    }

    fn observe(&self, run: &mut Run, response: &NormalizedResponse) {
        run.cost.record(&response.usage, response.cost);
        self.event_handler.on_event(&LoopEvent::TokenUsage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            cost: response.cost,
        });
        if let Some(reasoning) = response.reasoning_content.as_deref()
            && !reasoning.is_empty()
        {
            self.event_handler.on_event(&LoopEvent::Reasoning(reasoning));
        }
        if !response.content.is_empty() {
            self.event_handler
                .on_event(&LoopEvent::Text(&response.content));
        }
    }

    /// One tool-less call asking for a best-effort answer. The instruction
    /// itself is not kept in the history. On failure the last assistant
    /// text, or a summary of the tools that ran, stands in.
    async fn finalize(&self, run: &mut Run, profile: &ProviderProfile, initial_len: usize) -> String {
        let mut messages = run.messages.clone();
        messages.push(Message::user(&self.config.finalization_prompt));

        match self.client.call(&self.request(messages)).await {
            Ok(mut response) if !response.content.trim().is_empty() => {
                self.observe(run, &response);
                // Calls made here are never executed.
                response.tool_calls.clear();
                response.thought_signatures.clear();
                run.messages.push(assistant_message(&response, profile));
                response.content
            }
            Ok(_) => {
                warn!("Forced final call returned no text; using fallback answer");
                self.fallback_answer(run, initial_len)
            }
            Err(e) => {
                warn!("Forced final call failed: {e}; using fallback answer");
                self.fallback_answer(run, initial_len)
            }
        }
    }

    fn fallback_answer(&self, run: &mut Run, initial_len: usize) -> String {
        let text = run.messages[initial_len.min(run.messages.len())..]
            .iter()
            .rev()
            .filter(|m| m.role == MessageRole::Assistant)
            .map(|m| m.text().trim())
            .find(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| summarize_records(&run.records, run.iterations));
        run.messages.push(Message::assistant_text(text.clone()));
        text
    }
}

fn summarize_records(records: &[ToolCallRecord], iterations: u32) -> String {
    let mut out = format!(
        "Stopped after {iterations} iteration(s) without a final answer."
    );
    if !records.is_empty() {
        let calls: Vec<String> = records
            .iter()
            .map(|r| format!("{} ({})", r.name, if r.success { "ok" } else { "failed" }))
            .collect();
        out.push_str(&format!(" Tools run: {}.", calls.join(", ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::config::DEFAULT_FINALIZATION_PROMPT;
    use crate::api::{ProfileRegistry, RetryConfig, ScriptedTransport};
    use crate::tools::{FnTool, ToolError, ToolSet};
    use crate::{ToolDef, json_schema_for};
    use schemars::JsonSchema;
    use serde::Deserialize;
    use serde_json::{Value, json};
    use std::sync::Arc;

    #[derive(Deserialize, JsonSchema)]
    struct PathArgs {
        path: String,
    }

    fn tools() -> ToolSet {
        ToolSet::new()
            .with(FnTool::new(
                ToolDef::new("read_file", "Read a file", json_schema_for::<PathArgs>()),
                |args: PathArgs| async move { Ok(format!("File: {}\ncontents", args.path)) },
            ))
            .with(FnTool::new(
                ToolDef::new("web_search", "Search", json!({"type": "object"})),
                |_: Value| async move { Ok("results".to_string()) },
            ))
            .with(FnTool::new(
                ToolDef::new("broken", "Always fails", json!({"type": "object"})),
                |_: Value| async move { Err(ToolError::failed("permission denied")) },
            ))
    }

    fn client(transport: Arc<ScriptedTransport>) -> ProviderClient {
        ProviderClient::new(transport, ProfileRegistry::builtin(), RetryConfig::immediate(1))
            .with_api_key("openai", "sk-test")
            .with_api_key("gemini", "g-test")
    }

    fn text_reply(content: &str) -> Value {
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        })
    }

    fn calls_reply(calls: &[(&str, &str, &str)]) -> Value {
        let calls: Vec<Value> = calls
            .iter()
            .map(|(id, name, args)| {
                json!({"id": id, "type": "function", "function": {"name": name, "arguments": args}})
            })
            .collect();
        json!({
            "choices": [{"message": {"role": "assistant", "content": "Let me look.", "tool_calls": calls}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        })
    }

    #[tokio::test]
    async fn two_tool_calls_produce_two_records_and_two_tool_messages() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .push_json(&calls_reply(&[
                ("call_a", "read_file", r#"{"path":"src/a.rs"}"#),
                ("call_b", "read_file", r#"{"path":"src/b.rs"}"#),
            ]))
            .push_json(&text_reply("Both files are fine."));
        let client = client(transport.clone());
        let tools = tools();

        let result = ToolLoop::new(&client, &tools, LoopConfig::new("gpt-4.1"))
            .run(vec![Message::user("check a and b")])
            .await
            .unwrap();

        assert_eq!(result.content, "Both files are fine.");
        assert_eq!(result.tool_calls.len(), 2);
        assert!(result.tool_calls.iter().all(|c| c.success));
        assert_eq!(result.tool_calls[0].thinking, "Let me look.");

        let appended = result.appended();
        assert_eq!(appended.len(), 4);
        assert_eq!(appended[0].calls().len(), 2);
        let tool_ids: Vec<_> = appended
            .iter()
            .filter(|m| m.role == MessageRole::Tool)
            .map(|m| m.tool_call_id.as_deref().unwrap())
            .collect();
        assert_eq!(tool_ids, ["call_a", "call_b"]);
        assert_eq!(appended[3].text(), "Both files are fine.");
        assert_eq!(result.iterations, 2);
        assert!(!result.forced_finalization);
        assert_eq!(result.cost.calls, 2);

        // Second request replays the tool results after the assistant turn.
        let second = &transport.requests()[1].body;
        assert_eq!(second["messages"][2]["tool_call_id"], "call_a");
        assert_eq!(second["tools"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failing_tool_does_not_abort() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .push_json(&calls_reply(&[
                ("c1", "broken", "{}"),
                ("c2", "no_such_tool", "{}"),
            ]))
            .push_json(&text_reply("done"));
        let client = client(transport);
        let tools = tools();

        let result = ToolLoop::new(&client, &tools, LoopConfig::new("gpt-4.1"))
            .run(vec![Message::user("go")])
            .await
            .unwrap();

        assert_eq!(result.failed_calls().count(), 2);
        assert_eq!(result.tool_calls[0].output, "Error: permission denied");
        assert!(result.tool_calls[1].output.contains("no_such_tool"));
        assert_eq!(result.content, "done");
    }

    #[tokio::test]
    async fn quota_refuses_extra_searches() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .push_json(&calls_reply(&[
                ("s1", "web_search", "{}"),
                ("s2", "web_search", "{}"),
            ]))
            .push_json(&text_reply("ok"));
        let client = client(transport);
        let tools = tools();

        let result = ToolLoop::new(&client, &tools, LoopConfig::new("gpt-4.1"))
            .with_quotas(HashMap::from([("web_search".to_string(), 1)]))
            .run(vec![Message::user("search twice")])
            .await
            .unwrap();

        assert!(result.tool_calls[0].success);
        assert!(!result.tool_calls[1].success);
        assert!(result.tool_calls[1].output.contains("quota"));
        // The refusal still answers its call id.
        assert_eq!(result.appended()[2].tool_call_id.as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn earlier_usage_counts_against_quota() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .push_json(&calls_reply(&[("s1", "web_search", "{}")]))
            .push_json(&text_reply("ok"));
        let client = client(transport);
        let tools = tools();

        let result = ToolLoop::new(&client, &tools, LoopConfig::new("gpt-4.1"))
            .with_quotas(HashMap::from([("web_search".to_string(), 2)]))
            .with_quota_usage(HashMap::from([("web_search".to_string(), 2)]))
            .run(vec![Message::user("search again")])
            .await
            .unwrap();

        assert!(!result.tool_calls[0].success);
        assert!(!result.tool_calls[0].quota_counted);
    }

    #[tokio::test]
    async fn iteration_cap_forces_final_answer() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .push_json(&calls_reply(&[("c1", "web_search", "{}")]))
            .push_json(&calls_reply(&[("c2", "web_search", "{}")]))
            .push_json(&text_reply("Best effort: nothing conclusive."));
        let client = client(transport.clone());
        let tools = tools();

        let result = ToolLoop::new(&client, &tools, LoopConfig::new("gpt-4.1").with_max_iterations(2))
            .run(vec![Message::user("keep searching")])
            .await
            .unwrap();

        assert!(result.forced_finalization);
        assert_eq!(result.iterations, 2);
        assert_eq!(result.content, "Best effort: nothing conclusive.");
        assert_eq!(result.tool_calls.len(), 2);

        let last = &transport.requests()[2].body;
        assert!(last.get("tools").is_none());
        let sent = last["messages"].as_array().unwrap();
        assert_eq!(sent.last().unwrap()["role"], "user");
        // The finalization instruction is not kept in the history.
        assert!(
            result
                .messages
                .iter()
                .all(|m| m.text() != DEFAULT_FINALIZATION_PROMPT)
        );
        assert_eq!(result.messages.last().unwrap().role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn failed_finalization_falls_back_to_summary() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .push_json(&json!({
                "choices": [{"message": {"role": "assistant", "content": null,
                    "tool_calls": [{"id": "c1", "type": "function",
                        "function": {"name": "web_search", "arguments": "{}"}}]}}]
            }))
            .push(400, "bad request");
        let client = client(transport);
        let tools = tools();

        let result = ToolLoop::new(&client, &tools, LoopConfig::new("gpt-4.1").with_max_iterations(1))
            .run(vec![Message::user("q")])
            .await
            .unwrap();

        assert!(result.forced_finalization);
        assert!(result.content.contains("web_search (ok)"), "{}", result.content);
    }

    #[tokio::test]
    async fn provider_failure_returns_error_with_audit() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .push_json(&calls_reply(&[("c1", "web_search", "{}")]))
            .push(401, "unauthorized");
        let client = client(transport);
        let tools = tools();
        let input = vec![Message::user("q")];

        let err = ToolLoop::new(&client, &tools, LoopConfig::new("gpt-4.1"))
            .run(input.clone())
            .await
            .unwrap_err();

        assert_eq!(err.source.status(), Some(401));
        assert_eq!(err.tool_calls.len(), 1);
        assert_eq!(err.iterations, 2);
        assert_eq!(input.len(), 1);
    }

    #[tokio::test]
    async fn gemini_signature_is_replayed_on_next_request() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .push_json(&json!({
                "choices": [{"message": {"role": "assistant", "content": "",
                    "tool_calls": [{
                        "id": "g1", "type": "function",
                        "function": {"name": "web_search", "arguments": "{}"},
                        "extra_content": {"google": {"thought_signature": "U0lHLTE="}}
                    }]}}]
            }))
            .push_json(&text_reply("answer"));
        let client = client(transport.clone());
        let tools = tools();

        ToolLoop::new(&client, &tools, LoopConfig::new("gemini-2.5-pro"))
            .run(vec![Message::user("q")])
            .await
            .unwrap();

        let second = &transport.requests()[1].body;
        assert_eq!(
            second["messages"][1]["tool_calls"][0]["extra_content"]["google"]["thought_signature"],
            "U0lHLTE="
        );
        assert!(second.get("temperature").is_none());
    }

    #[test]
    fn summary_lists_tools() {
        let record = ToolCallRecord {
            call_id: "c".into(),
            name: "grep".into(),
            arguments: "{}".into(),
            output: "Error: x".into(),
            success: false,
            quota_counted: true,
            thinking: String::new(),
            duration: std::time::Duration::ZERO,
        };
        assert_eq!(
            summarize_records(&[record], 3),
            "Stopped after 3 iteration(s) without a final answer. Tools run: grep (failed)."
        );
    }
}
