//! Events emitted by the [`ToolLoop`](super::ToolLoop).
//!
//! The loop reports its progress through [`LoopEvent`]s. Callers implement
//! [`EventHandler`] to observe them for logging, rendering or metrics.
//! Handlers are observers only; nothing they do changes the run.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures |
//! | [`CompositeEventHandler`] | Fan out to several handlers in order |

use crate::api::ApiError;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum LoopEvent<'a> {
    /// A model call is about to be made.
    IterationStart {
        iteration: u32,
        max_iterations: u32,
        messages: usize,
    },
    /// Visible text from the model (may accompany tool calls).
    Text(&'a str),
    /// Reasoning content returned by the model.
    Reasoning(&'a str),
    ToolCallsReceived { iteration: u32, count: usize },
    ToolExecuting { name: &'a str, arguments: &'a str },
    ToolResult {
        name: &'a str,
        call_id: &'a str,
        result: &'a str,
        success: bool,
    },
    /// A call was refused because the tool's usage quota is spent.
    QuotaExceeded { name: &'a str, limit: u32 },
    TokenUsage {
        input_tokens: u32,
        output_tokens: u32,
        cost: f64,
    },
    /// The model answered without requesting tools.
    Finished { iterations: u32 },
    /// The iteration cap was hit; a forced final answer follows.
    IterationLimitReached { max_iterations: u32 },
    /// The provider failed after retries; the run ends with an error.
    ProviderFailed { error: &'a ApiError },
}

/// Observer for loop events.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &LoopEvent<'_>) {
        let _ = event;
    }
}

pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event: &LoopEvent<'_>| {
///     if let LoopEvent::Text(text) = event {
///         println!("{text}");
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&LoopEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&LoopEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&LoopEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &LoopEvent<'_>) {
        (self.0)(event)
    }
}

/// Dispatches every event to each handler in registration order.
#[derive(Default)]
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &LoopEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

fn preview(text: &str, max: usize) -> String {
    let head: String = text.chars().take(max).collect();
    if head.len() < text.len() {
        format!("{head}...")
    } else {
        head
    }
}

/// Maps loop events onto `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &LoopEvent<'_>) {
        match event {
            LoopEvent::IterationStart {
                iteration,
                max_iterations,
                messages,
            } => {
                info!("[iteration {iteration}/{max_iterations}] {messages} message(s) in context");
            }
            LoopEvent::Text(text) => debug!("LLM text: {}", preview(text, 200)),
            LoopEvent::Reasoning(text) => debug!("LLM reasoning: {}", preview(text, 200)),
            LoopEvent::ToolCallsReceived { iteration, count } => {
                debug!("{count} tool call(s) in iteration {iteration}");
            }
            LoopEvent::ToolExecuting { name, arguments } => {
                debug!("Executing tool: {name}({})", preview(arguments, 120));
            }
            LoopEvent::ToolResult {
                name,
                result,
                success,
                ..
            } => {
                if *success {
                    debug!("Tool {name} result: {} bytes", result.len());
                } else {
                    warn!("Tool {name} failed: {}", preview(result, 200));
                }
            }
            LoopEvent::QuotaExceeded { name, limit } => {
                warn!("Tool {name} refused: quota of {limit} call(s) exhausted");
            }
            LoopEvent::TokenUsage {
                input_tokens,
                output_tokens,
                cost,
            } => {
                debug!("Tokens: input={input_tokens}, output={output_tokens}, cost=${cost:.4}");
            }
            LoopEvent::Finished { iterations } => {
                info!("Agent finished after {iterations} iteration(s)");
            }
            LoopEvent::IterationLimitReached { max_iterations } => {
                warn!("Agent hit iteration limit ({max_iterations}); forcing a final answer");
            }
            LoopEvent::ProviderFailed { error } => {
                warn!("Provider call failed: {error}");
            }
        }
    }
}
