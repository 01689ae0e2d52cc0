//! Identifiers and cost accounting.
//!
//! Every loop run gets a `trace_id`, every model call inside it a span id.
//! The same generator produces thread and message ids for the storage
//! backends. Cost is estimated from a coarse per-model pricing table and
//! accumulated per run in a [`CostTracker`].

use crate::UsageInfo;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Generate a unique id with the given prefix (`tr`, `th`, `msg`, ...).
pub fn generate_id(prefix: &str) -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    // Counter disambiguates ids generated within the same nanosecond.
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{ts:x}-{count:04x}")
}

/// Generate a unique trace ID for a loop run.
pub fn generate_trace_id() -> String {
    generate_id("tr")
}

/// Span ID for one model call within a run.
pub fn generate_span_id(trace_id: &str, iteration: u32) -> String {
    format!("{trace_id}:i{iteration}")
}

/// USD per 1M tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub fn estimate_cost(&self, usage: &UsageInfo) -> f64 {
        (usage.input_tokens as f64 / 1_000_000.0) * self.input_per_million
            + (usage.output_tokens as f64 / 1_000_000.0) * self.output_per_million
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self::new(3.0, 15.0)
    }
}

/// Ordered by specificity: the first needle contained in the model name wins.
const PRICING_TABLE: &[(&str, ModelPricing)] = &[
    ("opus", ModelPricing::new(15.0, 75.0)),
    ("sonnet", ModelPricing::new(3.0, 15.0)),
    ("haiku", ModelPricing::new(0.80, 4.0)),
    ("gpt-4.1-mini", ModelPricing::new(0.40, 1.60)),
    ("gpt-4.1", ModelPricing::new(2.0, 8.0)),
    ("gpt-4o-mini", ModelPricing::new(0.15, 0.60)),
    ("gpt-4o", ModelPricing::new(2.50, 10.0)),
    ("o4-mini", ModelPricing::new(1.10, 4.40)),
    ("o3", ModelPricing::new(2.0, 8.0)),
    ("o1", ModelPricing::new(15.0, 60.0)),
    ("gemini-2.5-flash", ModelPricing::new(0.30, 2.50)),
    ("gemini-2.5-pro", ModelPricing::new(1.25, 10.0)),
    ("gemini", ModelPricing::new(0.10, 0.40)),
    ("deepseek-reasoner", ModelPricing::new(0.55, 2.19)),
    ("deepseek", ModelPricing::new(0.27, 1.10)),
    ("kimi", ModelPricing::new(0.60, 2.50)),
];

/// Approximate pricing for a model id.
///
/// Only the segment after the last `/` is matched, so an org prefix like
/// `my-org/custom-sonnet` cannot masquerade as another vendor's model.
/// Unknown models get [`ModelPricing::default`]. The figures are for
/// spotting runaway loops, not billing.
pub fn pricing_for_model(model: &str) -> ModelPricing {
    let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();
    PRICING_TABLE
        .iter()
        .find(|(needle, _)| name.contains(needle))
        .map(|(_, pricing)| *pricing)
        .unwrap_or_default()
}

/// Cumulative usage and cost for one loop run.
#[derive(Debug, Default, Clone)]
pub struct CostTracker {
    pub calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one model call.
    pub fn record(&mut self, usage: &UsageInfo, cost: f64) {
        self.calls += 1;
        self.input_tokens += usage.input_tokens as u64;
        self.output_tokens += usage.output_tokens as u64;
        self.estimated_cost_usd += cost;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn summary(&self) -> String {
        format!(
            "{} call(s), tokens: {} in + {} out = {}, est. cost: ${:.4}",
            self.calls,
            self.input_tokens,
            self.output_tokens,
            self.total_tokens(),
            self.estimated_cost_usd,
        )
    }
}
