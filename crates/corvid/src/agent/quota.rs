//! Per-tool usage quotas.
//!
//! A quota caps how many times one tool may run in a thread (for example,
//! at most five web searches). Usage from earlier turns is seeded with
//! [`QuotaTracker::with_used`]. Tools without a limit are unrestricted.
//! Refused calls do not count against the quota.

use crate::tools::ToolError;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct QuotaTracker {
    limits: HashMap<String, u32>,
    used: HashMap<String, u32>,
}

impl QuotaTracker {
    pub fn new(limits: HashMap<String, u32>) -> Self {
        Self {
            limits,
            used: HashMap::new(),
        }
    }

    /// Start from usage already recorded elsewhere.
    pub fn with_used(mut self, used: HashMap<String, u32>) -> Self {
        self.used = used;
        self
    }

    /// Reserve one use of `tool`, or explain why it is refused.
    pub fn try_acquire(&mut self, tool: &str) -> Result<(), ToolError> {
        let used = self.used.entry(tool.to_string()).or_default();
        if let Some(&limit) = self.limits.get(tool)
            && *used >= limit
        {
            return Err(ToolError::QuotaExceeded {
                tool: tool.to_string(),
                limit,
            });
        }
        *used += 1;
        Ok(())
    }

    pub fn used(&self, tool: &str) -> u32 {
        self.used.get(tool).copied().unwrap_or(0)
    }

    /// Uses left for `tool`; `None` when unlimited.
    pub fn remaining(&self, tool: &str) -> Option<u32> {
        self.limits
            .get(tool)
            .map(|limit| limit.saturating_sub(self.used(tool)))
    }
}
