//! Integration tests for the provider client and the tool loop over a
//! scripted transport: retries, reasoning replay and a full tool round.

use std::sync::Arc;

use corvid::agent::{LoopConfig, ToolLoop};
use corvid::api::{ApiError, ProfileRegistry, ProviderClient, RetryConfig, ScriptedTransport};
use corvid::tools::{FnTool, ToolError, ToolSet};
use corvid::{ChatRequest, Message, MessageRole, ToolDef};
use serde_json::{Value, json};

fn client(transport: Arc<ScriptedTransport>, attempts: u32) -> ProviderClient {
    ProviderClient::new(transport, ProfileRegistry::builtin(), RetryConfig::immediate(attempts))
        .with_api_key("openai", "sk-test")
        .with_api_key("deepseek-reasoner", "ds-test")
        .with_api_key("gemini", "g-test")
}

fn text_reply(content: &str) -> Value {
    json!({
        "choices": [{"message": {"role": "assistant", "content": content}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 12, "completion_tokens": 4}
    })
}

fn workspace_tools() -> ToolSet {
    ToolSet::new()
        .with(FnTool::new(
            ToolDef::new(
                "read_file",
                "Read a file",
                json!({"type": "object", "properties": {"path": {"type": "string"}}, "required": ["path"]}),
            ),
            |args: Value| async move {
                match args["path"].as_str() {
                    Some("src/auth.py") => Ok("File: src/auth.py\ndef login(): ...".to_string()),
                    Some(other) => Err(ToolError::failed(format!("{other}: no such file"))),
                    None => Err(ToolError::failed("missing path")),
                }
            },
        ))
        .with(FnTool::new(
            ToolDef::new("list_files", "List a directory", json!({"type": "object"})),
            |_: Value| async move { Ok("src/auth.py\nsrc/logger.py".to_string()) },
        ))
}

// ── Retry classification ────────────────────────────────────────────

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .push(503, "overloaded")
        .push(503, "overloaded")
        .push_json(&text_reply("hello"));
    let client = client(transport.clone(), 3);

    let response = client
        .call(&ChatRequest::new("gpt-4.1", vec![Message::user("hi")]))
        .await
        .unwrap();

    assert_eq!(response.content, "hello");
    assert_eq!(transport.request_count(), 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(400, "invalid message").push_json(&text_reply("unused"));
    let client = client(transport.clone(), 3);

    let err = client
        .call(&ChatRequest::new("gpt-4.1", vec![Message::user("hi")]))
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(400));
    assert!(!err.is_retryable());
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test]
async fn exhausted_retries_surface_the_last_failure() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(502, "bad gateway").push(502, "bad gateway");
    let client = client(transport.clone(), 2);

    let err = client
        .call(&ChatRequest::new("gpt-4.1", vec![Message::user("hi")]))
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::RetriesExhausted { attempts: 2, .. }));
    assert_eq!(err.status(), Some(502));
    assert_eq!(transport.request_count(), 2);
}

// ── Reasoning replay ────────────────────────────────────────────────

#[tokio::test]
async fn deepseek_reasoning_is_replayed_on_the_tool_round() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .push_json(&json!({
            "choices": [{"message": {
                "role": "assistant",
                "content": "",
                "reasoning_content": "The login bug is probably in auth.py.",
                "tool_calls": [{"id": "d1", "type": "function",
                    "function": {"name": "read_file", "arguments": "{\"path\":\"src/auth.py\"}"}}]
            }}]
        }))
        .push_json(&text_reply("login() never checks the password."));
    let client = client(transport.clone(), 1);
    let tools = workspace_tools();

    let result = ToolLoop::new(&client, &tools, LoopConfig::new("deepseek-reasoner"))
        .run(vec![Message::user("why can anyone log in?")])
        .await
        .unwrap();

    assert_eq!(result.content, "login() never checks the password.");
    let second = &transport.requests()[1].body;
    let assistant = &second["messages"][1];
    assert_eq!(assistant["role"], "assistant");
    assert_eq!(
        assistant["reasoning_content"],
        "The login bug is probably in auth.py."
    );
    assert_eq!(assistant["tool_calls"][0]["id"], "d1");
    assert_eq!(transport.requests()[0].api_key.as_deref(), Some("ds-test"));
}

#[tokio::test]
async fn gemini_first_call_signature_round_trips() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .push_json(&json!({
            "choices": [{"message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [
                    {"id": "g1", "type": "function",
                     "function": {"name": "read_file", "arguments": "{\"path\":\"src/auth.py\"}"},
                     "extra_content": {"google": {"thought_signature": "c2lnLWZpcnN0"}}},
                    {"id": "g2", "type": "function",
                     "function": {"name": "list_files", "arguments": "{}"}}
                ]
            }}]
        }))
        .push_json(&text_reply("done"));
    let client = client(transport.clone(), 1);
    let tools = workspace_tools();

    ToolLoop::new(&client, &tools, LoopConfig::new("gemini-2.5-flash"))
        .run(vec![Message::user("inspect auth")])
        .await
        .unwrap();

    let second = &transport.requests()[1].body;
    let calls = second["messages"][1]["tool_calls"].as_array().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[0]["extra_content"]["google"]["thought_signature"],
        "c2lnLWZpcnN0"
    );
    assert!(calls[1].get("extra_content").is_none());
}

// ── Tool loop ───────────────────────────────────────────────────────

#[tokio::test]
async fn two_tool_round_then_answer() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .push_json(&json!({
            "choices": [{"message": {
                "role": "assistant",
                "content": "Checking both.",
                "tool_calls": [
                    {"id": "t1", "type": "function",
                     "function": {"name": "list_files", "arguments": "{}"}},
                    {"id": "t2", "type": "function",
                     "function": {"name": "read_file", "arguments": "{\"path\":\"src/missing.py\"}"}}
                ]
            }}],
            "usage": {"prompt_tokens": 40, "completion_tokens": 10}
        }))
        .push_json(&text_reply("Only auth.py and logger.py exist."));
    let client = client(transport.clone(), 1);
    let tools = workspace_tools();

    let result = ToolLoop::new(&client, &tools, LoopConfig::new("gpt-4.1"))
        .run(vec![Message::system("Be brief."), Message::user("what files exist?")])
        .await
        .unwrap();

    assert_eq!(result.iterations, 2);
    assert!(!result.forced_finalization);
    assert_eq!(result.tool_calls.len(), 2);
    assert!(result.tool_calls[0].success);
    assert!(!result.tool_calls[1].success);
    assert_eq!(result.tool_calls[1].output, "Error: src/missing.py: no such file");
    assert_eq!(result.failed_calls().count(), 1);
    assert_eq!(result.cost.calls, 2);

    // Input, assistant turn, two tool results, final answer.
    let roles: Vec<_> = result.messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        [
            MessageRole::System,
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::Tool,
            MessageRole::Tool,
            MessageRole::Assistant,
        ]
    );
    let second = &transport.requests()[1].body;
    assert_eq!(second["messages"][3]["tool_call_id"], "t1");
    assert_eq!(second["messages"][4]["tool_call_id"], "t2");
}

#[tokio::test]
async fn malformed_arguments_become_a_failed_record() {
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .push_json(&json!({
            "choices": [{"message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{"id": "m1", "type": "function",
                    "function": {"name": "read_file", "arguments": "{\"path\": "}}]
            }}]
        }))
        .push_json(&text_reply("I could not read it."));
    let client = client(transport, 1);
    let tools = workspace_tools();

    let result = ToolLoop::new(&client, &tools, LoopConfig::new("gpt-4.1"))
        .run(vec![Message::user("read it")])
        .await
        .unwrap();

    assert!(!result.tool_calls[0].success);
    assert!(result.tool_calls[0].output.contains("not valid JSON"));
    assert_eq!(result.content, "I could not read it.");
}
