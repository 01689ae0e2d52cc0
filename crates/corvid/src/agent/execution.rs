//! Execution of a single tool call inside the loop.
//!
//! Every path out of [`execute_tool_call`] yields a [`ToolCallRecord`]: a
//! refused quota, unparseable arguments, an executor error and a panic all
//! become failed records whose output is the error text. Nothing here can
//! abort the loop.

use super::events::{EventHandler, LoopEvent};
use super::quota::QuotaTracker;
use crate::ToolCall;
use crate::tools::{ToolError, ToolExecutor};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tracing::warn;

/// Audit record for one tool invocation. Not persisted by the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub name: String,
    /// Raw argument string as the model sent it.
    pub arguments: String,
    /// Tool output, or the error text on failure.
    pub output: String,
    pub success: bool,
    /// The call took a quota slot. Only quota refusals leave this unset.
    #[serde(default)]
    pub quota_counted: bool,
    /// Reasoning or visible text that preceded the call.
    pub thinking: String,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Parse the model's argument string. Empty means no arguments.
pub fn parse_arguments(tool: &str, raw: &str) -> Result<Value, ToolError> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments {
        tool: tool.to_string(),
        detail: format!("arguments are not valid JSON: {e}"),
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".into())
}

/// Run one call through quota, argument parsing and the executor.
pub(crate) async fn execute_tool_call(
    tools: &dyn ToolExecutor,
    quota: &mut QuotaTracker,
    call: &ToolCall,
    thinking: &str,
    event_handler: &dyn EventHandler,
) -> ToolCallRecord {
    let name = call.function.name.as_str();
    let arguments = call.function.arguments.as_str();
    let start = Instant::now();

    let acquired = quota.try_acquire(name);
    let quota_counted = acquired.is_ok();
    let outcome = match acquired {
        Err(e) => {
            if let ToolError::QuotaExceeded { limit, .. } = &e {
                event_handler.on_event(&LoopEvent::QuotaExceeded { name, limit: *limit });
            }
            Err(e)
        }
        Ok(()) => match parse_arguments(name, arguments) {
            Err(e) => Err(e),
            Ok(args) => {
                event_handler.on_event(&LoopEvent::ToolExecuting { name, arguments });
                AssertUnwindSafe(tools.execute(name, &args))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(ToolError::Panicked(panic_message(payload))))
            }
        },
    };

    let (output, success) = match outcome {
        Ok(output) => (output, true),
        Err(e) => {
            warn!("Tool call {} ({name}) failed: {e}", call.id);
            (format!("Error: {e}"), false)
        }
    };

    event_handler.on_event(&LoopEvent::ToolResult {
        name,
        call_id: &call.id,
        result: &output,
        success,
    });

    ToolCallRecord {
        call_id: call.id.clone(),
        name: name.to_string(),
        arguments: arguments.to_string(),
        output,
        success,
        quota_counted,
        thinking: thinking.to_string(),
        duration: start.elapsed(),
    }
}
