//! Provider layer: everything between the tool loop and the upstream HTTP
//! endpoints.
//!
//! - [`profile`]: [`ProviderProfile`] data and the model-id lookup table.
//! - [`client`]: [`ProviderClient`], request shaping and the call path.
//! - [`parse`]: normalization of heterogeneous response shapes.
//! - [`error`]: the fixed failure taxonomy.
//! - [`retry`]: exponential backoff for the retryable part of that taxonomy.
//! - [`transport`]: the HTTP seam, with a scripted implementation for tests.
//! - [`tracing`]: trace ids, per-model pricing and [`CostTracker`].

pub mod client;
pub mod error;
pub mod parse;
pub mod profile;
pub mod retry;
pub mod tracing;
pub mod transport;

pub use client::{ProviderClient, build_request_body};
pub use error::{ApiError, classify_status};
pub use profile::{ProfileRegistry, ProviderProfile, ReasoningMode};
pub use retry::RetryConfig;
pub use tracing::{
    CostTracker, generate_id, generate_span_id, generate_trace_id, pricing_for_model,
};
pub use transport::{HttpReply, ReqwestTransport, ScriptedTransport, Transport};
