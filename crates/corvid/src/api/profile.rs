//! Provider profiles: which endpoint serves a model and how its wire format
//! differs from plain chat completions.
//!
//! A [`ProviderProfile`] is pure data. Request construction, response
//! parsing and reasoning replay all read it; none of them branch on
//! provider names. Adding a provider means adding a profile.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Default iteration cap for the tool loop.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// How a provider's reasoning payload must be replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningMode {
    /// Nothing to replay.
    #[default]
    None,
    /// Every assistant message must carry the reasoning field, even empty.
    ReasoningContentRequired,
    /// Tool-call thought signatures must be echoed back unchanged.
    ThoughtSignatureStrict,
}

/// Static description of one upstream provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub provider_id: String,
    /// Full chat-completions URL.
    pub endpoint: String,
    /// Environment variable holding the API key. `None` for unauthenticated
    /// local endpoints.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Model-id prefixes served by this profile.
    #[serde(default)]
    pub model_prefixes: Vec<String>,
    #[serde(default = "default_true")]
    pub supports_temperature: bool,
    #[serde(default)]
    pub reasoning_mode: ReasoningMode,
    /// Message field that carries reasoning text for
    /// [`ReasoningMode::ReasoningContentRequired`].
    #[serde(default = "default_reasoning_field")]
    pub reasoning_field: String,
    /// Echo signatures on every call of a parallel batch rather than only
    /// the first.
    #[serde(default)]
    pub signature_on_every_call: bool,
    /// Tool-loop iteration cap. Providers that reason longer get more.
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Merged verbatim into every request body.
    #[serde(default)]
    pub extra_request_fields: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

fn default_reasoning_field() -> String {
    "reasoning_content".into()
}

impl ProviderProfile {
    pub fn new(provider_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            endpoint: endpoint.into(),
            api_key_env: None,
            model_prefixes: Vec::new(),
            supports_temperature: true,
            reasoning_mode: ReasoningMode::None,
            reasoning_field: default_reasoning_field(),
            signature_on_every_call: false,
            max_iterations: None,
            extra_request_fields: Map::new(),
        }
    }

    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key_env = Some(var.into());
        self
    }

    pub fn with_prefixes(mut self, prefixes: &[&str]) -> Self {
        self.model_prefixes = prefixes.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_reasoning_mode(mut self, mode: ReasoningMode) -> Self {
        self.reasoning_mode = mode;
        self
    }

    pub fn without_temperature(mut self) -> Self {
        self.supports_temperature = false;
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn with_extra_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra_request_fields.insert(key.into(), value);
        self
    }

    /// Temperature is sent only when the provider accepts it and no
    /// reasoning mode is active; upstreams reject the combination.
    pub fn allows_temperature(&self) -> bool {
        self.supports_temperature && self.reasoning_mode == ReasoningMode::None
    }

    pub fn iteration_cap(&self) -> u32 {
        self.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS)
    }

    /// Whether `model` starts with one of this profile's prefixes.
    pub fn matches(&self, model: &str) -> bool {
        self.model_prefixes.iter().any(|p| model.starts_with(p.as_str()))
    }
}

/// Ordered profile table with a catch-all fallback.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: Vec<ProviderProfile>,
    fallback: ProviderProfile,
}

impl ProfileRegistry {
    pub fn new(profiles: Vec<ProviderProfile>, fallback: ProviderProfile) -> Self {
        Self { profiles, fallback }
    }

    /// Built-in table for the providers corvid knows about, with OpenRouter
    /// as the catch-all.
    pub fn builtin() -> Self {
        let openai = "https://api.openai.com/v1/chat/completions";
        let profiles = vec![
            ProviderProfile::new("openai-reasoning", openai)
                .with_api_key_env("OPENAI_API_KEY")
                .with_prefixes(&["o1", "o3", "o4"])
                .without_temperature()
                .with_max_iterations(15)
                .with_extra_field("reasoning_effort", json!("medium")),
            ProviderProfile::new("openai", openai)
                .with_api_key_env("OPENAI_API_KEY")
                .with_prefixes(&["gpt-", "chatgpt-"]),
            ProviderProfile::new("deepseek-reasoner", "https://api.deepseek.com/chat/completions")
                .with_api_key_env("DEEPSEEK_API_KEY")
                .with_prefixes(&["deepseek-reasoner"])
                .with_reasoning_mode(ReasoningMode::ReasoningContentRequired)
                .with_max_iterations(15),
            ProviderProfile::new("deepseek", "https://api.deepseek.com/chat/completions")
                .with_api_key_env("DEEPSEEK_API_KEY")
                .with_prefixes(&["deepseek-"]),
            ProviderProfile::new("moonshot", "https://api.moonshot.ai/v1/chat/completions")
                .with_api_key_env("MOONSHOT_API_KEY")
                .with_prefixes(&["kimi-k2-thinking"])
                .with_reasoning_mode(ReasoningMode::ReasoningContentRequired)
                .with_max_iterations(20),
            ProviderProfile::new(
                "gemini",
                "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions",
            )
            .with_api_key_env("GEMINI_API_KEY")
            .with_prefixes(&["gemini-"])
            .with_reasoning_mode(ReasoningMode::ThoughtSignatureStrict)
            .with_max_iterations(20),
            ProviderProfile::new("anthropic", "https://api.anthropic.com/v1/chat/completions")
                .with_api_key_env("ANTHROPIC_API_KEY")
                .with_prefixes(&["claude-"])
                .without_temperature()
                .with_extra_field("thinking", json!({"type": "enabled", "budget_tokens": 2048})),
        ];
        let fallback =
            ProviderProfile::new("openrouter", "https://openrouter.ai/api/v1/chat/completions")
                .with_api_key_env("OPENROUTER_KEY");
        Self::new(profiles, fallback)
    }

    /// Built-in table with `extra` profiles consulted first.
    pub fn with_overrides(extra: Vec<ProviderProfile>) -> Self {
        let mut registry = Self::builtin();
        let mut profiles = extra;
        profiles.append(&mut registry.profiles);
        registry.profiles = profiles;
        registry
    }

    /// Profile for `model`.
    ///
    /// Direct prefix matches win. A routed id such as `google/gemini-2.5-pro`
    /// goes to the fallback endpoint but inherits the reasoning behavior of
    /// the profile matching its model segment, since the router forwards
    /// the vendor's wire quirks.
    pub fn lookup(&self, model: &str) -> ProviderProfile {
        if let Some(profile) = self.profiles.iter().find(|p| p.matches(model)) {
            return profile.clone();
        }
        let mut profile = self.fallback.clone();
        if let Some((_, name)) = model.rsplit_once('/')
            && let Some(vendor) = self.profiles.iter().find(|p| p.matches(name))
        {
            profile.supports_temperature = vendor.supports_temperature;
            profile.reasoning_mode = vendor.reasoning_mode;
            profile.reasoning_field = vendor.reasoning_field.clone();
            profile.signature_on_every_call = vendor.signature_on_every_call;
            profile.max_iterations = vendor.max_iterations;
        }
        profile
    }

    pub fn profiles(&self) -> &[ProviderProfile] {
        &self.profiles
    }

    pub fn fallback(&self) -> &ProviderProfile {
        &self.fallback
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
