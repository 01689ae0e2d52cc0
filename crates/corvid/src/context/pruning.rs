//! Relevance pruning of stale tool output.
//!
//! Once the user asks about specific files, tool results about other files
//! (or about no identifiable file) are unlikely to matter. The pruner
//! replaces them with a short marker that still names what they covered.
//! Queries that mention no files leave the history alone.

use super::is_marked;
use super::tokens::TokenCounter;
use crate::MessageRole;
use crate::storage::HistoryMessage;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Prefix of every pruned message.
pub const PRUNED_MARKER: &str = "[pruned]";

/// How many former subjects a pruned marker names.
pub const DEFAULT_MARKER_SAMPLE: usize = 3;

const EXTENSIONS: &str = "rs|py|pyi|js|jsx|ts|tsx|mjs|go|java|kt|kts|rb|php|c|h|cc|cpp|hpp|cs|swift|scala|\
lua|sh|bash|zsh|sql|html|css|scss|vue|svelte|md|rst|txt|toml|yaml|yml|json|xml|ini|cfg|conf|lock|proto|graphql|env";

const SOURCE_ROOTS: &str = "src|app|lib|libs|tests?|pkg|cmd|internal|crates|packages|scripts|docs";

/// `None` only if the pattern fails to compile, in which case nothing is
/// ever pruned.
static FILE_PATH: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)(?:[\w.-]+/)*[\w-][\w.-]*\.(?:{EXTENSIONS})\b|\b(?:{SOURCE_ROOTS})/[\w.-]+(?:/[\w.-]+)*"
    ))
    .ok()
});

/// File-path-like tokens in `text`, normalized and deduplicated.
pub fn extract_file_paths(text: &str) -> BTreeSet<String> {
    let Some(regex) = FILE_PATH.as_ref() else {
        return BTreeSet::new();
    };
    regex
        .find_iter(text)
        .map(|m| normalize_path(m.as_str()))
        .filter(|p| !p.is_empty())
        .collect()
}

fn normalize_path(raw: &str) -> String {
    raw.trim_end_matches(['.', '/'])
        .trim_start_matches("./")
        .trim_start_matches('/')
        .to_string()
}

/// Same file, allowing either side to be a shorter suffix of the other
/// (`auth.py` matches `app/services/auth.py`), or one side is a directory
/// containing the other (`src/agent` matches `src/agent/mod.rs`).
/// Comparison ignores ASCII case, like extraction.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();
    same_file(&a, &b) || contains_path(&a, &b) || contains_path(&b, &a)
}

fn same_file(a: &str, b: &str) -> bool {
    a == b || a.ends_with(&format!("/{b}")) || b.ends_with(&format!("/{a}"))
}

/// `dir` is a whole-component directory prefix of `path`, possibly below
/// some leading components (`crates/x/src/agent/mod.rs` is inside `src/agent`).
fn contains_path(dir: &str, path: &str) -> bool {
    path.starts_with(&format!("{dir}/")) || path.contains(&format!("/{dir}/"))
}

/// Replaces tool output unrelated to the files a query mentions.
#[derive(Clone)]
pub struct RelevancePruner {
    counter: Arc<dyn TokenCounter>,
    marker_sample: usize,
}

impl RelevancePruner {
    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            counter,
            marker_sample: DEFAULT_MARKER_SAMPLE,
        }
    }

    pub fn with_marker_sample(mut self, sample: usize) -> Self {
        self.marker_sample = sample.max(1);
        self
    }

    /// Pruned copy of `history` for `query`.
    pub fn prune(&self, history: &[HistoryMessage], query: &str) -> Vec<HistoryMessage> {
        let mentioned = extract_file_paths(query);
        if mentioned.is_empty() {
            return history.to_vec();
        }

        let mut pruned = 0usize;
        let out: Vec<HistoryMessage> = history
            .iter()
            .map(|message| match self.marker_for(message, &mentioned) {
                Some(marker) => {
                    pruned += 1;
                    message.with_content(marker, self.counter.as_ref())
                }
                None => message.clone(),
            })
            .collect();

        if pruned > 0 {
            debug!(
                "Pruned {pruned} tool message(s) unrelated to {}",
                mentioned.iter().cloned().collect::<Vec<_>>().join(", ")
            );
        }
        out
    }

    /// Replacement content, or `None` to keep the message.
    fn marker_for(&self, message: &HistoryMessage, mentioned: &BTreeSet<String>) -> Option<String> {
        if message.role != MessageRole::Tool || is_marked(&message.content) {
            return None;
        }
        let files = extract_file_paths(&message.content);
        if files.is_empty() {
            return Some(format!(
                "{PRUNED_MARKER} Stale tool output with no identifiable file, omitted."
            ));
        }
        let relevant = files
            .iter()
            .any(|f| mentioned.iter().any(|m| paths_overlap(f, m)));
        if relevant {
            return None;
        }

        let sample: Vec<&str> = files
            .iter()
            .take(self.marker_sample)
            .map(String::as_str)
            .collect();
        let more = files.len().saturating_sub(sample.len());
        let suffix = if more > 0 {
            format!(" (+{more} more)")
        } else {
            String::new()
        };
        Some(format!(
            "{PRUNED_MARKER} Tool output about {}{suffix}, unrelated to the current request.",
            sample.join(", ")
        ))
    }
}
