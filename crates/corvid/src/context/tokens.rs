//! Token estimation.
//!
//! Budgets are enforced on estimates, not on a provider tokenizer. Most
//! tokenizers average 3-4 characters per token; 3.5 is the default.

use crate::storage::HistoryMessage;

pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Counts tokens in a piece of text.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;

    /// Sum of the stored counts of `messages`.
    fn total(&self, messages: &[HistoryMessage]) -> usize {
        messages.iter().map(|m| m.tokens).sum()
    }
}

/// Character-ratio estimate, rounded up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharRatioCounter {
    chars_per_token: f64,
}

impl CharRatioCounter {
    /// Ratios at or below zero fall back to the default.
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }
}

impl Default for CharRatioCounter {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl TokenCounter for CharRatioCounter {
    fn count(&self, text: &str) -> usize {
        (text.chars().count() as f64 / self.chars_per_token).ceil() as usize
    }
}
