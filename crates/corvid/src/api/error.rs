//! Provider failure taxonomy.
//!
//! Classification is by HTTP status only and is the same for every
//! provider: 429 is [`ApiError::RateLimited`], 500/502/503 are
//! [`ApiError::UpstreamUnavailable`], any other non-2xx is
//! [`ApiError::UpstreamRejected`]. Timeouts and connection failures are
//! treated as unavailability. Only the first two are retried.

use thiserror::Error;

/// Errors produced by [`ProviderClient`](super::ProviderClient).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    /// HTTP 429.
    #[error("rate limited (HTTP {status}): {body}")]
    RateLimited { status: u16, body: String },

    /// HTTP 500/502/503, a request timeout, or a transport failure.
    #[error("upstream unavailable: {reason}")]
    UpstreamUnavailable { status: Option<u16>, reason: String },

    /// Any other non-2xx status: malformed request, bad credentials, a
    /// missing reasoning token the provider requires.
    #[error("upstream rejected request (HTTP {status}): {body}")]
    UpstreamRejected { status: u16, body: String },

    /// 2xx whose body could not be interpreted as a chat completion.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("no API key for provider '{provider}' (set {env_var})")]
    MissingApiKey { provider: String, env_var: String },

    /// A retryable error that persisted through every attempt. The wrapped
    /// error is the last one observed, unchanged.
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ApiError> },
}

impl ApiError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited { .. } | ApiError::UpstreamUnavailable { .. }
        )
    }

    /// HTTP status associated with the error, looking through
    /// [`ApiError::RetriesExhausted`].
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::RateLimited { status, .. } | ApiError::UpstreamRejected { status, .. } => {
                Some(*status)
            }
            ApiError::UpstreamUnavailable { status, .. } => *status,
            ApiError::RetriesExhausted { last, .. } => last.status(),
            ApiError::MalformedResponse(_) | ApiError::MissingApiKey { .. } => None,
        }
    }

    /// A request that did not complete within the client timeout.
    pub fn timeout(after: std::time::Duration) -> Self {
        ApiError::UpstreamUnavailable {
            status: None,
            reason: format!("request timed out after {:.0}s", after.as_secs_f64()),
        }
    }

    /// A connection-level failure (DNS, refused, reset).
    pub fn transport(detail: impl std::fmt::Display) -> Self {
        ApiError::UpstreamUnavailable {
            status: None,
            reason: format!("request failed: {detail}"),
        }
    }
}

/// Map an HTTP status to the taxonomy. Returns `None` for 2xx.
pub fn classify_status(status: u16, body: &str) -> Option<ApiError> {
    match status {
        200..=299 => None,
        429 => Some(ApiError::RateLimited {
            status,
            body: body.to_string(),
        }),
        500 | 502 | 503 => Some(ApiError::UpstreamUnavailable {
            status: Some(status),
            reason: format!("HTTP {status}: {body}"),
        }),
        _ => Some(ApiError::UpstreamRejected {
            status,
            body: body.to_string(),
        }),
    }
}
