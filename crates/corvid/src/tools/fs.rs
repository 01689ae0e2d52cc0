//! Read-only workspace tools.
//!
//! | Tool | Name | Purpose |
//! |------|------|---------|
//! | [`ReadFile`] | `read_file` | Read one file |
//! | [`ListFiles`] | `list_files` | List a directory |
//! | [`SearchCode`] | `search_code` | Regex search across files |
//!
//! Every tool is rooted at a working directory; `..` in a path is
//! rejected. Results name files by their workspace-relative path, which is
//! what relevance pruning later keys on.

use super::core::{DEFAULT_MAX_RESULT_BYTES, Tool, truncate_result};
use super::{ToolError, ToolFuture};
use crate::{ToolDef, json_schema_for};
use regex::RegexBuilder;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Default maximum matching lines for `search_code`.
pub const DEFAULT_MAX_MATCHES: usize = 200;

/// Directories `search_code` never descends into.
const SKIPPED_DIRS: &[&str] = &["target", "node_modules", "__pycache__", "dist", "build"];

#[derive(Deserialize, JsonSchema)]
pub struct ReadFileArgs {
    /// File path relative to the workspace root (e.g. 'src/main.rs').
    pub path: String,
}

#[derive(Deserialize, JsonSchema)]
pub struct ListFilesArgs {
    /// Directory path relative to the workspace root (default '.').
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Deserialize, JsonSchema)]
pub struct SearchCodeArgs {
    /// Regex pattern to search for.
    pub pattern: String,
    /// Directory or file to search in, relative to the workspace root (default '.').
    #[serde(default)]
    pub path: Option<String>,
    /// Case-insensitive search (default false).
    #[serde(default)]
    pub case_insensitive: Option<bool>,
}

fn parse<T: serde::de::DeserializeOwned>(tool: &str, args: &Value) -> Result<T, ToolError> {
    serde_json::from_value(args.clone()).map_err(|e| ToolError::InvalidArguments {
        tool: tool.to_string(),
        detail: e.to_string(),
    })
}

fn resolve(workdir: &Path, relative: &str) -> Result<PathBuf, ToolError> {
    if Path::new(relative)
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(ToolError::failed("path traversal not allowed"));
    }
    Ok(workdir.join(relative.trim_start_matches('/')))
}

fn display_path(workdir: &Path, path: &Path) -> String {
    path.strip_prefix(workdir)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

// ── ReadFile ────────────────────────────────────────────────────────

/// Read a file under the working directory.
pub struct ReadFile {
    workdir: PathBuf,
    max_result_bytes: usize,
}

impl ReadFile {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
        }
    }

    pub fn max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }
}

impl Tool for ReadFile {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            "read_file",
            "Read a file from the workspace. Use when you already know the path; \
             use search_code to find which files mention something.",
            json_schema_for::<ReadFileArgs>(),
        )
    }

    fn execute<'a>(&'a self, args: &'a Value) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: ReadFileArgs = parse("read_file", args)?;
            let full_path = resolve(&self.workdir, &args.path)?;
            if let Ok(meta) = fs::metadata(&full_path).await
                && meta.is_dir()
            {
                return Err(ToolError::failed(format!(
                    "'{}' is a directory, not a file. Use list_files to browse directories.",
                    args.path
                )));
            }
            let content = fs::read_to_string(&full_path)
                .await
                .map_err(|e| ToolError::failed(format!("reading '{}': {e}", args.path)))?;
            let header = format!("File: {}\n", display_path(&self.workdir, &full_path));
            Ok(truncate_result(header + &content, self.max_result_bytes))
        })
    }
}

// ── ListFiles ───────────────────────────────────────────────────────

/// List one directory under the working directory. Directories end with `/`.
pub struct ListFiles {
    workdir: PathBuf,
}

impl ListFiles {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

impl Tool for ListFiles {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            "list_files",
            "List the entries of a workspace directory, one per line, sorted by \
             name. Directories have a trailing '/'.",
            json_schema_for::<ListFilesArgs>(),
        )
    }

    fn execute<'a>(&'a self, args: &'a Value) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: ListFilesArgs = parse("list_files", args)?;
            let relative = args.path.unwrap_or_else(|| ".".into());
            let dir = resolve(&self.workdir, &relative)?;
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| ToolError::failed(format!("listing '{relative}': {e}")))?;

            let mut names = Vec::new();
            while let Some(entry) = entries.next_entry().await.map_err(ToolError::failed)? {
                let mut name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                    name.push('/');
                }
                names.push(name);
            }
            names.sort();
            if names.is_empty() {
                return Ok(format!("Directory {relative} is empty"));
            }
            Ok(names.join("\n"))
        })
    }
}

// ── SearchCode ──────────────────────────────────────────────────────

/// Regex search over file contents. Output lines are `path:line: text`.
pub struct SearchCode {
    workdir: PathBuf,
    max_matches: usize,
    max_result_bytes: usize,
}

impl SearchCode {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            max_matches: DEFAULT_MAX_MATCHES,
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
        }
    }

    pub fn max_matches(mut self, max: usize) -> Self {
        self.max_matches = max;
        self
    }

    pub fn max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }
}

impl Tool for SearchCode {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            "search_code",
            "Search file contents in the workspace with a regex. Returns \
             'path:line: text' for each match.",
            json_schema_for::<SearchCodeArgs>(),
        )
    }

    fn execute<'a>(&'a self, args: &'a Value) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: SearchCodeArgs = parse("search_code", args)?;
            let regex = RegexBuilder::new(&args.pattern)
                .case_insensitive(args.case_insensitive.unwrap_or(false))
                .build()
                .map_err(|e| ToolError::InvalidArguments {
                    tool: "search_code".into(),
                    detail: e.to_string(),
                })?;
            let root = resolve(&self.workdir, args.path.as_deref().unwrap_or("."))?;
            let workdir = self.workdir.clone();
            let max_matches = self.max_matches;

            // Directory walking and file reads are blocking.
            let lines = tokio::task::spawn_blocking(move || {
                let mut out = Vec::new();
                search_path(&workdir, &root, &regex, max_matches, &mut out);
                out
            })
            .await
            .map_err(ToolError::failed)?;

            if lines.is_empty() {
                return Ok(format!("No matches for /{}/", args.pattern));
            }
            let mut result = lines.join("\n");
            if lines.len() >= self.max_matches {
                result.push_str(&format!("\n[stopped after {} matches]", self.max_matches));
            }
            Ok(truncate_result(result, self.max_result_bytes))
        })
    }
}

fn search_path(
    workdir: &Path,
    path: &Path,
    regex: &regex::Regex,
    max: usize,
    out: &mut Vec<String>,
) {
    if out.len() >= max {
        return;
    }
    if path.is_dir() {
        let Ok(entries) = std::fs::read_dir(path) else {
            return;
        };
        let mut children: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        children.sort();
        for child in children {
            let name = child
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if name.starts_with('.') || (child.is_dir() && SKIPPED_DIRS.contains(&name.as_str())) {
                continue;
            }
            search_path(workdir, &child, regex, max, out);
        }
        return;
    }
    // Binary and non-UTF-8 files are skipped.
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    let shown = display_path(workdir, path);
    for (n, line) in content.lines().enumerate() {
        if regex.is_match(line) {
            out.push(format!("{shown}:{}: {}", n + 1, line.trim_end()));
            if out.len() >= max {
                return;
            }
        }
    }
}
