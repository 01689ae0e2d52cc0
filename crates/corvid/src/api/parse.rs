//! Response normalization.
//!
//! Providers agree on `choices[0].message` and disagree on nearly
//! everything hanging off it. Where a value may live in several places the
//! candidate locations are listed as JSON pointers in priority order and the
//! first hit wins. Absence is never an error.

use super::error::{ApiError, classify_status};
use crate::{NormalizedResponse, ToolCall, UsageInfo};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Reasoning text, relative to the first choice.
const REASONING_POINTERS: &[&str] = &[
    "/message/reasoning_content",
    "/message/reasoning",
    "/delta/reasoning_content",
    "/delta/reasoning",
];

/// Signature locations inside one tool-call entry.
const CALL_SIGNATURE_POINTERS: &[&str] = &[
    "/extra_content/google/thought_signature",
    "/thought_signature",
    "/function/thought_signature",
];

/// Signature on the text part of the message, relative to the first choice.
const TEXT_SIGNATURE_POINTERS: &[&str] = &[
    "/message/extra_content/google/thought_signature",
    "/message/thought_signature",
];

/// Signature keys inside a `parts` entry.
const PART_SIGNATURE_KEYS: &[&str] = &["thoughtSignature", "thought_signature"];

fn first_string(value: &Value, pointers: &[&str]) -> Option<String> {
    pointers
        .iter()
        .filter_map(|p| value.pointer(p).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn part_signature(part: &Value) -> Option<String> {
    PART_SIGNATURE_KEYS
        .iter()
        .filter_map(|k| part.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

static NULL: Value = Value::Null;

/// Message body, falling back to a streaming delta.
fn message_of(choice: &Value) -> &Value {
    choice
        .get("message")
        .filter(|m| m.is_object())
        .or_else(|| choice.get("delta"))
        .unwrap_or(&NULL)
}

/// `content` as plain text: a string, or the concatenated `text` of a parts
/// array.
fn content_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

/// `parts` may live on the message itself or inside an array `content`.
fn parts_of(message: &Value) -> &[Value] {
    message
        .get("parts")
        .and_then(Value::as_array)
        .or_else(|| message.get("content").and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn parse_tool_calls(message: &Value) -> Result<(Vec<ToolCall>, Vec<Option<String>>), ApiError> {
    let Some(entries) = message.get("tool_calls").and_then(Value::as_array) else {
        return Ok((Vec::new(), Vec::new()));
    };
    let mut calls = Vec::with_capacity(entries.len());
    let mut signatures = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        signatures.push(first_string(entry, CALL_SIGNATURE_POINTERS));

        let mut entry = entry.clone();
        if let Some(obj) = entry.as_object_mut() {
            // Streaming position marker; meaningless once assembled.
            obj.remove("index");
            let has_id = obj.get("id").and_then(Value::as_str).is_some_and(|s| !s.is_empty());
            if !has_id {
                obj.insert("id".into(), Value::String(format!("call_{i}")));
            }
        }
        let call: ToolCall = serde_json::from_value(entry)
            .map_err(|e| ApiError::MalformedResponse(format!("tool call {i}: {e}")))?;
        calls.push(call);
    }
    Ok((calls, signatures))
}

fn parse_usage(raw: &Value) -> UsageInfo {
    let count = |keys: &[&str]| {
        keys.iter()
            .filter_map(|k| raw.pointer(&format!("/usage/{k}")).and_then(Value::as_u64))
            .next()
            .unwrap_or(0) as u32
    };
    UsageInfo {
        input_tokens: count(&["prompt_tokens", "input_tokens"]),
        output_tokens: count(&["completion_tokens", "output_tokens"]),
    }
}

/// An `error` object inside a 2xx body. Routers relay upstream failures
/// this way; a numeric code is classified like an HTTP status.
fn embedded_error(raw: &Value) -> Option<ApiError> {
    let err = raw.get("error").filter(|e| !e.is_null())?;
    let message = err
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string());
    let code = err.get("code").and_then(Value::as_u64);
    Some(
        code.and_then(|c| u16::try_from(c).ok())
            .and_then(|c| classify_status(c, &message))
            .unwrap_or_else(|| ApiError::MalformedResponse(format!("provider error: {message}"))),
    )
}

/// Normalize a parsed 2xx body. `cost` and `latency` are left for the
/// caller to fill.
pub fn normalize(raw: Value, provider: &str) -> Result<NormalizedResponse, ApiError> {
    if let Some(err) = embedded_error(&raw) {
        return Err(err);
    }
    let choice = raw
        .pointer("/choices/0")
        .cloned()
        .ok_or_else(|| ApiError::MalformedResponse("response has no choices".into()))?;
    let message = message_of(&choice);

    let content = content_text(message);
    let (tool_calls, thought_signatures) = parse_tool_calls(message)?;
    let reasoning_content = first_string(&choice, REASONING_POINTERS);

    let parts = parts_of(message);
    let thought_signature = thought_signatures
        .first()
        .cloned()
        .flatten()
        .or_else(|| parts.iter().find_map(part_signature));
    let text_signature = first_string(&choice, TEXT_SIGNATURE_POINTERS).or_else(|| {
        parts
            .iter()
            .filter(|p| p.get("text").is_some())
            .find_map(part_signature)
    });

    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(str::to_string);
    let usage = parse_usage(&raw);

    debug!(
        "Normalized {provider} response: {} chars text, {} tool call(s), reasoning={}, signature={}",
        content.len(),
        tool_calls.len(),
        reasoning_content.is_some(),
        thought_signature.is_some(),
    );

    Ok(NormalizedResponse {
        content,
        tool_calls,
        reasoning_content,
        thought_signature,
        thought_signatures,
        text_signature,
        usage,
        finish_reason,
        cost: 0.0,
        latency: Duration::ZERO,
        provider: provider.to_string(),
        raw,
    })
}
