//! Filesystem tools offered to review conversations.
//!
//! Every path argument is resolved against the working directory and must
//! stay inside it after canonicalisation. Tool failures are returned to the
//! model as text rather than aborting the conversation.

use crate::llm::interfaces::Tool;
use crate::types::ToolAccess;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolLimits {
    pub max_file_bytes: u64,
    pub max_search_results: usize,
    pub max_list_depth: usize,
}

impl Default for ToolLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 256 * 1024,
            max_search_results: 200,
            max_list_depth: 4,
        }
    }
}

/// Tools scoped to one root directory with a fixed capability level.
#[derive(Debug, Clone)]
pub struct ToolBox {
    root: PathBuf,
    access: ToolAccess,
    limits: ToolLimits,
}

#[derive(Deserialize)]
struct PathArgs {
    path: String,
}

#[derive(Deserialize)]
struct ListArgs {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    max_depth: Option<usize>,
}

#[derive(Deserialize)]
struct SearchArgs {
    pattern: String,
    #[serde(default)]
    glob: Option<String>,
}

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

impl ToolBox {
    /// Returns `None` for `ToolAccess::None`.
    pub fn new(root: impl Into<PathBuf>, access: ToolAccess, limits: ToolLimits) -> Option<Self> {
        if !access.allows_read() {
            return None;
        }
        Some(Self {
            root: root.into(),
            access,
            limits,
        })
    }

    pub fn access(&self) -> ToolAccess {
        self.access
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn definitions(&self) -> Vec<Tool> {
        let mut tools = vec![
            Tool {
                name: "read_file".to_string(),
                description: "Read a UTF-8 file relative to the repository root.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"]
                }),
            },
            Tool {
                name: "list_files".to_string(),
                description: "List files under a directory relative to the repository root.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "max_depth": { "type": "integer", "minimum": 1 }
                    }
                }),
            },
            Tool {
                name: "search".to_string(),
                description: "Search file contents with a regular expression. Optional glob filters file paths.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "pattern": { "type": "string" },
                        "glob": { "type": "string" }
                    },
                    "required": ["pattern"]
                }),
            },
        ];

        if self.access.allows_write() {
            tools.push(Tool {
                name: "write_file".to_string(),
                description: "Create or overwrite a file relative to the repository root.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "content": { "type": "string" }
                    },
                    "required": ["path", "content"]
                }),
            });
        }

        tools
    }

    /// Run one tool call. The returned text is handed back to the model.
    pub async fn execute(&self, name: &str, arguments: &str) -> String {
        debug!("Executing tool {} with {}", name, arguments);
        let root = self.root.clone();
        let limits = self.limits.clone();
        let access = self.access;
        let name = name.to_string();
        let arguments = arguments.to_string();

        let outcome = tokio::task::spawn_blocking(move || {
            run_tool(&root, access, &limits, &name, &arguments)
        })
        .await;

        match outcome {
            Ok(Ok(text)) => text,
            Ok(Err(message)) => format!("error: {}", message),
            Err(e) => format!("error: tool task failed: {}", e),
        }
    }
}

fn run_tool(
    root: &Path,
    access: ToolAccess,
    limits: &ToolLimits,
    name: &str,
    arguments: &str,
) -> Result<String, String> {
    let arguments = if arguments.trim().is_empty() { "{}" } else { arguments };
    match name {
        "read_file" => {
            let args: PathArgs = parse_args(arguments)?;
            read_file(root, limits, &args.path)
        }
        "list_files" => {
            let args: ListArgs = parse_args(arguments)?;
            let depth = args
                .max_depth
                .unwrap_or(limits.max_list_depth)
                .min(limits.max_list_depth);
            list_files(root, args.path.as_deref().unwrap_or("."), depth, limits)
        }
        "search" => {
            let args: SearchArgs = parse_args(arguments)?;
            search(root, limits, &args.pattern, args.glob.as_deref())
        }
        "write_file" if access.allows_write() => {
            let args: WriteArgs = parse_args(arguments)?;
            write_file(root, &args.path, &args.content)
        }
        other => Err(format!("unknown or unavailable tool '{}'", other)),
    }
}

fn parse_args<'a, T: Deserialize<'a>>(arguments: &'a str) -> Result<T, String> {
    serde_json::from_str(arguments).map_err(|e| format!("invalid arguments: {}", e))
}

/// Resolve `relative` under `root`, rejecting anything that escapes it.
fn resolve_existing(root: &Path, relative: &str) -> Result<PathBuf, String> {
    let root = root
        .canonicalize()
        .map_err(|e| format!("repository root unavailable: {}", e))?;
    let candidate = root
        .join(relative)
        .canonicalize()
        .map_err(|e| format!("{}: {}", relative, e))?;
    if !candidate.starts_with(&root) {
        return Err(format!("{} is outside the repository", relative));
    }
    Ok(candidate)
}

/// Like `resolve_existing`, for paths that may not exist yet.
fn resolve_new(root: &Path, relative: &str) -> Result<PathBuf, String> {
    let relative_path = Path::new(relative);
    if relative_path.is_absolute()
        || relative_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(format!("{} is outside the repository", relative));
    }
    let root = root
        .canonicalize()
        .map_err(|e| format!("repository root unavailable: {}", e))?;
    Ok(root.join(relative_path))
}

fn read_file(root: &Path, limits: &ToolLimits, relative: &str) -> Result<String, String> {
    let path = resolve_existing(root, relative)?;
    let metadata = std::fs::metadata(&path).map_err(|e| e.to_string())?;
    if !metadata.is_file() {
        return Err(format!("{} is not a file", relative));
    }
    if metadata.len() > limits.max_file_bytes {
        return Err(format!(
            "{} is {} bytes, over the {} byte limit",
            relative,
            metadata.len(),
            limits.max_file_bytes
        ));
    }
    std::fs::read_to_string(&path).map_err(|e| format!("{}: {}", relative, e))
}

fn list_files(root: &Path, relative: &str, depth: usize, limits: &ToolLimits) -> Result<String, String> {
    let base = resolve_existing(root, relative)?;
    let canonical_root = root.canonicalize().map_err(|e| e.to_string())?;

    let mut entries = Vec::new();
    for entry in WalkDir::new(&base)
        .max_depth(depth.max(1))
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e.path(), &base))
        .filter_map(Result::ok)
    {
        if entry.path() == base {
            continue;
        }
        let shown = entry
            .path()
            .strip_prefix(&canonical_root)
            .unwrap_or(entry.path())
            .display()
            .to_string();
        if entry.file_type().is_dir() {
            entries.push(format!("{}/", shown));
        } else {
            entries.push(shown);
        }
        if entries.len() >= limits.max_search_results {
            entries.push("... (truncated)".to_string());
            break;
        }
    }

    Ok(entries.join("\n"))
}

fn search(root: &Path, limits: &ToolLimits, pattern: &str, glob: Option<&str>) -> Result<String, String> {
    let regex = Regex::new(pattern).map_err(|e| format!("invalid pattern: {}", e))?;
    let filter = glob
        .map(glob::Pattern::new)
        .transpose()
        .map_err(|e| format!("invalid glob: {}", e))?;
    let canonical_root = root.canonicalize().map_err(|e| e.to_string())?;

    let mut hits = Vec::new();
    for entry in WalkDir::new(&canonical_root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e.path(), &canonical_root))
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let relative = entry
            .path()
            .strip_prefix(&canonical_root)
            .unwrap_or(entry.path());
        if let Some(filter) = &filter {
            if !filter.matches_path(relative) {
                continue;
            }
        }
        if entry.metadata().map(|m| m.len()).unwrap_or(u64::MAX) > limits.max_file_bytes {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        for (line_no, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                hits.push(format!("{}:{}: {}", relative.display(), line_no + 1, line.trim()));
                if hits.len() >= limits.max_search_results {
                    hits.push("... (truncated)".to_string());
                    return Ok(hits.join("\n"));
                }
            }
        }
    }

    if hits.is_empty() {
        Ok("no matches".to_string())
    } else {
        Ok(hits.join("\n"))
    }
}

fn write_file(root: &Path, relative: &str, content: &str) -> Result<String, String> {
    let path = resolve_new(root, relative)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    std::fs::write(&path, content).map_err(|e| format!("{}: {}", relative, e))?;
    Ok(format!("wrote {} bytes to {}", content.len(), relative))
}

fn is_hidden(path: &Path, base: &Path) -> bool {
    path != base
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.') || n == "target" || n == "node_modules")
            .unwrap_or(false)
}
