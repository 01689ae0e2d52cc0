//! The provider-normalizing chat client.

use super::error::{ApiError, classify_status};
use super::parse::normalize;
use super::profile::{ProfileRegistry, ProviderProfile};
use super::retry::{RetryConfig, retry_api_call};
use super::tracing::pricing_for_model;
use super::transport::{ReqwestTransport, Transport};
use crate::config::CoreConfig;
use crate::reasoning::strategy_for;
use crate::{ChatRequest, NormalizedResponse, ToolDef};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Talks to every configured provider through one interface.
///
/// Each call looks up the model's [`ProviderProfile`] once, shapes the body
/// from it, retries transient failures and returns a
/// [`NormalizedResponse`]. The client holds no per-conversation state and
/// is shared freely between threads.
#[derive(Clone)]
pub struct ProviderClient {
    transport: Arc<dyn Transport>,
    registry: ProfileRegistry,
    retry: RetryConfig,
    /// Keys set programmatically, by provider id. Take precedence over the
    /// profile's environment variable.
    api_keys: HashMap<String, String>,
}

impl ProviderClient {
    pub fn new(transport: Arc<dyn Transport>, registry: ProfileRegistry, retry: RetryConfig) -> Self {
        Self {
            transport,
            registry,
            retry,
            api_keys: HashMap::new(),
        }
    }

    /// Network client with the configured timeout, retry policy and
    /// provider table.
    pub fn from_config(config: &CoreConfig) -> Result<Self, ApiError> {
        let transport =
            ReqwestTransport::new(Duration::from_secs(config.request_timeout_secs))?;
        Ok(Self::new(
            Arc::new(transport),
            ProfileRegistry::with_overrides(config.providers.clone()),
            config.retry.to_retry_config(),
        ))
    }

    pub fn with_api_key(mut self, provider_id: impl Into<String>, key: impl Into<String>) -> Self {
        self.api_keys.insert(provider_id.into(), key.into());
        self
    }

    /// Profile that will serve `model`.
    pub fn profile_for(&self, model: &str) -> ProviderProfile {
        self.registry.lookup(model)
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    fn api_key(&self, profile: &ProviderProfile) -> Result<Option<String>, ApiError> {
        if let Some(key) = self.api_keys.get(&profile.provider_id) {
            return Ok(Some(key.clone()));
        }
        let Some(var) = &profile.api_key_env else {
            return Ok(None);
        };
        match std::env::var(var) {
            Ok(key) if !key.is_empty() => Ok(Some(key)),
            _ => Err(ApiError::MissingApiKey {
                provider: profile.provider_id.clone(),
                env_var: var.clone(),
            }),
        }
    }

    /// Plain completion, no tools.
    pub async fn call(&self, request: &ChatRequest) -> Result<NormalizedResponse, ApiError> {
        self.call_with_tools(request, &[]).await
    }

    /// Completion with tool definitions. `tools` overrides any on `request`.
    pub async fn call_with_tools(
        &self,
        request: &ChatRequest,
        tools: &[ToolDef],
    ) -> Result<NormalizedResponse, ApiError> {
        let profile = self.registry.lookup(&request.model);
        let api_key = self.api_key(&profile)?;
        let tools = if tools.is_empty() {
            request.tools.as_deref().unwrap_or(&[])
        } else {
            tools
        };
        let body = build_request_body(request, tools, &profile);

        debug!(
            "LLM request: provider={}, model={}, messages={}, tools={}, max_tokens={}",
            profile.provider_id,
            request.model,
            request.messages.len(),
            tools.len(),
            request.max_tokens,
        );
        trace!("Request payload size: {} bytes", body.to_string().len());

        let start = Instant::now();
        let transport = &self.transport;
        let endpoint = profile.endpoint.as_str();
        let provider = profile.provider_id.as_str();
        let key = api_key.as_deref();
        let body = &body;
        let mut response = retry_api_call(&self.retry, || async move {
            let reply = transport.post_json(endpoint, key, body).await?;
            if let Some(err) = classify_status(reply.status, &reply.body) {
                return Err(err);
            }
            let raw: Value = serde_json::from_str(&reply.body)
                .map_err(|e| ApiError::MalformedResponse(format!("invalid JSON: {e}")))?;
            normalize(raw, provider)
        })
        .await?;

        response.latency = start.elapsed();
        response.cost = pricing_for_model(&request.model).estimate_cost(&response.usage);
        debug!(
            "LLM response: {} in {:.1}s, {} chars text, {} tool call(s), tokens {}/{}",
            profile.provider_id,
            response.latency.as_secs_f64(),
            response.content.len(),
            response.tool_calls.len(),
            response.usage.input_tokens,
            response.usage.output_tokens,
        );
        Ok(response)
    }
}

/// Provider-specific request body.
///
/// Starts from model, messages, `max_tokens` and `top_p`. `temperature` is
/// added only when the profile allows it. The profile's extra fields are
/// merged last and win on conflict.
pub fn build_request_body(
    request: &ChatRequest,
    tools: &[ToolDef],
    profile: &ProviderProfile,
) -> Value {
    let mut messages = request.messages.clone();
    strategy_for(profile.reasoning_mode).prepare_request(&mut messages, profile);

    let mut body = Map::new();
    body.insert("model".into(), json!(request.model));
    body.insert("messages".into(), json!(messages));
    if request.max_tokens > 0 {
        body.insert("max_tokens".into(), json!(request.max_tokens));
    }
    if let Some(top_p) = request.top_p {
        body.insert("top_p".into(), json!(top_p));
    }
    if profile.allows_temperature()
        && let Some(temperature) = request.temperature
    {
        body.insert("temperature".into(), json!(temperature));
    }
    if !tools.is_empty() {
        body.insert("tools".into(), json!(tools));
    }
    for (key, value) in &profile.extra_request_fields {
        body.insert(key.clone(), value.clone());
    }
    Value::Object(body)
}
