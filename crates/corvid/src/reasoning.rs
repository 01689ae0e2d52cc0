//! Reasoning replay.
//!
//! Some providers hand back an opaque reasoning payload (a
//! `reasoning_content` string, a thought signature on a tool call) and
//! expect it on the assistant message of the next request. Strict ones
//! reject the request with HTTP 400 when it is missing; lenient ones just
//! reason worse.
//!
//! Each [`ReasoningMode`] maps to one [`ReasoningStrategy`] in a static
//! table. A new provider rule is a new strategy and a new table row; the
//! existing strategies are never touched.

use crate::api::profile::{ProviderProfile, ReasoningMode};
use crate::{Message, MessageRole, NormalizedResponse, ToolCall};
use serde_json::{Map, Value};
use tracing::warn;

/// Provider-specific reasoning rule.
pub trait ReasoningStrategy: Send + Sync {
    /// Attach whatever `response` carried that must be replayed to the
    /// assistant message recording it.
    fn annotate_assistant(
        &self,
        message: &mut Message,
        response: &NormalizedResponse,
        profile: &ProviderProfile,
    );

    /// Fix up outgoing messages right before a request is built.
    fn prepare_request(&self, messages: &mut [Message], profile: &ProviderProfile);
}

/// No reasoning payload to preserve.
struct Passthrough;

impl ReasoningStrategy for Passthrough {
    fn annotate_assistant(&self, _: &mut Message, _: &NormalizedResponse, _: &ProviderProfile) {}

    fn prepare_request(&self, _: &mut [Message], _: &ProviderProfile) {}
}

/// The reasoning field must be present on every assistant message. An empty
/// string satisfies the provider; a missing key does not.
struct ReasoningContentRequired;

impl ReasoningStrategy for ReasoningContentRequired {
    fn annotate_assistant(
        &self,
        message: &mut Message,
        response: &NormalizedResponse,
        profile: &ProviderProfile,
    ) {
        let reasoning = response.reasoning_content.clone().unwrap_or_default();
        message
            .extra
            .insert(profile.reasoning_field.clone(), Value::String(reasoning));
    }

    fn prepare_request(&self, messages: &mut [Message], profile: &ProviderProfile) {
        for message in messages
            .iter_mut()
            .filter(|m| m.role == MessageRole::Assistant)
        {
            message
                .extra
                .entry(profile.reasoning_field.clone())
                .or_insert_with(|| Value::String(String::new()));
        }
    }
}

/// The signature on the first tool call of a turn must come back unchanged
/// on that call. A text-part signature is kept when present.
struct ThoughtSignatureStrict;

impl ReasoningStrategy for ThoughtSignatureStrict {
    fn annotate_assistant(
        &self,
        message: &mut Message,
        response: &NormalizedResponse,
        profile: &ProviderProfile,
    ) {
        if let Some(calls) = message.tool_calls.as_mut() {
            let echo = if profile.signature_on_every_call {
                calls.len()
            } else {
                calls.len().min(1)
            };
            for (i, call) in calls.iter_mut().take(echo).enumerate() {
                if call_signature(call).is_some() {
                    // Already in the provider's own shape; leave it be.
                    continue;
                }
                let signature = response
                    .thought_signatures
                    .get(i)
                    .cloned()
                    .flatten()
                    .or_else(|| response.thought_signature.clone());
                match signature {
                    Some(sig) => set_google_signature(&mut call.extra, &sig),
                    None if i == 0 => warn!(
                        "{} returned tool call '{}' without a thought signature; the next request may be rejected",
                        profile.provider_id, call.function.name
                    ),
                    None => {}
                }
            }
        }
        if let Some(sig) = &response.text_signature
            && message.content.is_some()
        {
            set_google_signature(&mut message.extra, sig);
        }
    }

    fn prepare_request(&self, messages: &mut [Message], profile: &ProviderProfile) {
        let unsigned = messages
            .iter()
            .filter_map(|m| m.calls().first())
            .filter(|call| call_signature(call).is_none())
            .count();
        if unsigned > 0 {
            warn!(
                "{unsigned} assistant turn(s) sent to {} without a first-call thought signature",
                profile.provider_id
            );
        }
    }
}

static STRATEGIES: &[(ReasoningMode, &dyn ReasoningStrategy)] = &[
    (ReasoningMode::None, &Passthrough),
    (
        ReasoningMode::ReasoningContentRequired,
        &ReasoningContentRequired,
    ),
    (ReasoningMode::ThoughtSignatureStrict, &ThoughtSignatureStrict),
];

/// The strategy for `mode`.
pub fn strategy_for(mode: ReasoningMode) -> &'static dyn ReasoningStrategy {
    STRATEGIES
        .iter()
        .find(|(m, _)| *m == mode)
        .map(|(_, s)| *s)
        .unwrap_or(&Passthrough)
}

/// Assistant message recording `response`: original content, every tool
/// call as received, plus the reasoning payload the provider needs back.
pub fn assistant_message(response: &NormalizedResponse, profile: &ProviderProfile) -> Message {
    let mut message = if response.has_tool_calls() {
        let content = (!response.content.is_empty()).then(|| response.content.clone());
        Message::assistant_tool_calls(content, response.tool_calls.clone())
    } else {
        Message::assistant_text(response.content.clone())
    };
    strategy_for(profile.reasoning_mode).annotate_assistant(&mut message, response, profile);
    message
}

/// Signature attached to a tool call, wherever the provider put it.
pub fn call_signature(call: &ToolCall) -> Option<&str> {
    call.extra
        .get("extra_content")
        .and_then(|v| v.pointer("/google/thought_signature"))
        .and_then(Value::as_str)
        .or_else(|| call.extra.get("thought_signature").and_then(Value::as_str))
        .or_else(|| {
            call.function
                .extra
                .get("thought_signature")
                .and_then(Value::as_str)
        })
}

/// Write `extra_content.google.thought_signature`, creating the path.
fn set_google_signature(extra: &mut Map<String, Value>, signature: &str) {
    let content = extra
        .entry("extra_content")
        .or_insert_with(|| Value::Object(Map::new()));
    if !content.is_object() {
        *content = Value::Object(Map::new());
    }
    let Some(content) = content.as_object_mut() else {
        return;
    };
    let google = content
        .entry("google")
        .or_insert_with(|| Value::Object(Map::new()));
    if !google.is_object() {
        *google = Value::Object(Map::new());
    }
    if let Some(google) = google.as_object_mut() {
        google.insert(
            "thought_signature".into(),
            Value::String(signature.to_string()),
        );
    }
}
