//! Configuration for the [`ToolLoop`](super::ToolLoop).
//!
//! ```ignore
//! let config = LoopConfig::new("gemini-2.5-pro")
//!     .with_max_tokens(8192)
//!     .with_max_iterations(25);
//! ```

use serde::{Deserialize, Serialize};

/// Instruction appended for the forced final call once the iteration cap is
/// reached.
pub const DEFAULT_FINALIZATION_PROMPT: &str = "You have reached the tool-call limit for this turn. \
Do not request any more tools. Using only the information gathered so far, give your best \
final answer now and say plainly what remains unverified.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Model id; selects the provider profile.
    pub model: String,
    pub max_tokens: u32,
    /// Dropped automatically for profiles that reject it.
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    /// Overrides the profile's iteration cap.
    pub max_iterations: Option<u32>,
    pub finalization_prompt: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            model: crate::DEFAULT_MODEL.into(),
            max_tokens: 4096,
            temperature: Some(0.3),
            top_p: None,
            max_iterations: None,
            finalization_prompt: DEFAULT_FINALIZATION_PROMPT.into(),
        }
    }
}

impl LoopConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: Option<f32>) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }
}
