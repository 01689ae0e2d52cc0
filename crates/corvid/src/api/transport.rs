//! HTTP seam between [`ProviderClient`](super::ProviderClient) and the network.
//!
//! The client only needs "POST this JSON, give me status and body back".
//! [`ReqwestTransport`] does that over the network; [`ScriptedTransport`]
//! replays canned replies and records what was sent, for tests and offline
//! runs.

use super::error::ApiError;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;
use tracing::trace;

/// Raw HTTP reply. Status classification happens in the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<HttpReply, ApiError>> + Send + 'a>>;

/// Sends one JSON POST.
///
/// Implementations report connection failures and timeouts as
/// [`ApiError::UpstreamUnavailable`]; any HTTP status, including errors,
/// is returned as an [`HttpReply`].
pub trait Transport: Send + Sync {
    fn post_json<'a>(
        &'a self,
        url: &'a str,
        api_key: Option<&'a str>,
        body: &'a Value,
    ) -> TransportFuture<'a>;
}

/// `reqwest`-backed transport with a fixed per-request timeout.
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("corvid/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(ApiError::transport)?;
        Ok(Self { client, timeout })
    }

    fn map_error(&self, e: reqwest::Error) -> ApiError {
        if e.is_timeout() {
            ApiError::timeout(self.timeout)
        } else {
            ApiError::transport(e)
        }
    }
}

impl Transport for ReqwestTransport {
    fn post_json<'a>(
        &'a self,
        url: &'a str,
        api_key: Option<&'a str>,
        body: &'a Value,
    ) -> TransportFuture<'a> {
        Box::pin(async move {
            let mut request = self.client.post(url).json(body);
            if let Some(key) = api_key {
                request = request.bearer_auth(key);
            }
            let resp = request.send().await.map_err(|e| self.map_error(e))?;
            let status = resp.status().as_u16();
            let body = resp.text().await.map_err(|e| self.map_error(e))?;
            trace!("HTTP {status} from {url} ({} bytes)", body.len());
            Ok(HttpReply { status, body })
        })
    }
}

/// A request observed by [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub api_key: Option<String>,
    pub body: Value,
}

/// Transport that replays queued replies in order.
///
/// Once the queue is empty every further request fails with
/// [`ApiError::UpstreamRejected`] so a test that makes one call too many
/// fails loudly instead of retrying.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<HttpReply, ApiError>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply with the given status and body.
    pub fn push(&self, status: u16, body: impl Into<String>) -> &Self {
        self.push_result(Ok(HttpReply::new(status, body)))
    }

    /// Queue a 200 reply with a JSON body.
    pub fn push_json(&self, body: &Value) -> &Self {
        self.push(200, body.to_string())
    }

    /// Queue a transport-level failure.
    pub fn push_error(&self, err: ApiError) -> &Self {
        self.push_result(Err(err))
    }

    fn push_result(&self, reply: Result<HttpReply, ApiError>) -> &Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
        self
    }

    /// Every request sent so far, oldest first.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    /// Replies not yet consumed.
    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|r| r.len()).unwrap_or_default()
    }
}

impl Transport for ScriptedTransport {
    fn post_json<'a>(
        &'a self,
        url: &'a str,
        api_key: Option<&'a str>,
        body: &'a Value,
    ) -> TransportFuture<'a> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(RecordedRequest {
                url: url.to_string(),
                api_key: api_key.map(str::to_string),
                body: body.clone(),
            });
        }
        let next = self.replies.lock().ok().and_then(|mut r| r.pop_front());
        Box::pin(async move {
            next.unwrap_or_else(|| {
                Err(ApiError::UpstreamRejected {
                    status: 599,
                    body: "scripted transport has no replies left".into(),
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scripted_replays_in_order_and_records() {
        let transport = ScriptedTransport::new();
        transport.push(503, "busy").push_json(&json!({"ok": true}));

        let body = json!({"model": "m"});
        let first = transport.post_json("http://x", Some("k"), &body).await.unwrap();
        assert_eq!(first.status, 503);
        let second = transport.post_json("http://x", None, &body).await.unwrap();
        assert_eq!(second.status, 200);

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].api_key.as_deref(), Some("k"));
        assert_eq!(requests[1].body["model"], "m");
        assert_eq!(transport.remaining(), 0);
    }

    #[tokio::test]
    async fn scripted_fails_when_exhausted() {
        let transport = ScriptedTransport::new();
        let err = transport
            .post_json("http://x", None, &json!({}))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn reqwest_transport_builds() {
        assert!(ReqwestTransport::new(Duration::from_secs(5)).is_ok());
    }
}
