//! Local tools the model may call
//!
//! Both tools operate inside the workspace root. The registry validates
//! required parameters against the advertised schema before executing.

use std::future::Future;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use serde_json::{json, Value};
use tracing_error::SpanTrace;
use walkdir::WalkDir;

use crate::types::{
    CellstreamError, FunctionDefinition, Result, ToolCallOutcome, ToolCallRequest, ToolCallResult,
    ToolDefinition,
};

const DEFAULT_INCLUDE: &str = "**/*.*";
const MAX_FIND_RESULTS: usize = 2000;

const IGNORED_DIRS: &[&str] = &[
    ".git",
    "target",
    "node_modules",
    ".venv",
    "__pycache__",
    ".ipynb_checkpoints",
];

pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON-schema `properties` object.
    fn properties(&self) -> Value;
    fn required(&self) -> &'static [&'static str];
    fn execute(&self, arguments: &Value) -> impl Future<Output = Result<String>> + Send;

    fn schema(&self) -> ToolDefinition {
        ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: self.name().to_string(),
                description: self.description().to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": self.properties(),
                    "required": self.required(),
                }),
            },
        }
    }
}

/// Glob over `/`-separated paths relative to the workspace root; `*` stays within one segment.
pub fn glob_matcher(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| CellstreamError::Protocol(format!("invalid glob '{}': {}", pattern, e)).into())
}

fn is_ignored_dir(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && IGNORED_DIRS.iter().any(|d| entry.file_name().to_string_lossy() == *d)
}

fn walk(root: &Path, matcher: &GlobMatcher) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let entries = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_ignored_dir(e));
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!("[TOOLS] Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = match entry.path().strip_prefix(root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if matcher.is_match(relative) {
            found.push(entry.into_path());
            if found.len() >= MAX_FIND_RESULTS {
                tracing::warn!("[TOOLS] findFiles truncated at {} results", MAX_FIND_RESULTS);
                break;
            }
        }
    }
    found
}

pub struct FindFilesTool {
    root: PathBuf,
}

impl FindFilesTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn find(&self, matcher: GlobMatcher) -> Result<Vec<PathBuf>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || walk(&root, &matcher))
            .await
            .map_err(|e| {
                CellstreamError::Internal(format!("findFiles walk failed: {}", e), SpanTrace::capture())
                    .into()
            })
    }
}

impl Tool for FindFilesTool {
    fn name(&self) -> &'static str {
        "findFiles"
    }

    fn description(&self) -> &'static str {
        "Find files across the workspace the notebook lives in (case-sensitive)"
    }

    fn properties(&self) -> Value {
        json!({
            "include": {
                "type": "string",
                "description": "A glob pattern that defines the files to search for, which is case-sensitive and must always search across multiple directory levels."
            }
        })
    }

    fn required(&self) -> &'static [&'static str] {
        &["include"]
    }

    async fn execute(&self, arguments: &Value) -> Result<String> {
        let include = match arguments.get("include").and_then(Value::as_str) {
            Some(p) if !p.trim().is_empty() => p.trim(),
            _ => DEFAULT_INCLUDE,
        };
        let matcher = glob_matcher(include)?;
        let files = self.find(matcher).await?;
        tracing::info!("[TOOLS] findFiles '{}' matched {} files", include, files.len());
        if files.is_empty() {
            return Ok(format!(
                "No results with findFile for your include parameter '{}'",
                include
            ));
        }
        Ok(files
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(","))
    }
}

pub struct ReadFileTool {
    root: PathBuf,
}

impl ReadFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let raw = raw.strip_prefix("file://").unwrap_or(raw);
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "readFile"
    }

    fn description(&self) -> &'static str {
        "Reads the content of a file in the workspace and returns it as string."
    }

    fn properties(&self) -> Value {
        json!({
            "absoluteFilePath": {
                "type": "string",
                "description": "Mandatory parameter. The absolute path to the file to read the content from."
            }
        })
    }

    fn required(&self) -> &'static [&'static str] {
        &["absoluteFilePath"]
    }

    async fn execute(&self, arguments: &Value) -> Result<String> {
        let raw = match arguments.get("absoluteFilePath").and_then(Value::as_str) {
            Some(p) => p,
            None => {
                return Err(
                    CellstreamError::Protocol("Couldn't parse a valid absoluteFilePath".into()).into(),
                )
            }
        };
        let path = self.resolve(raw);
        tracing::info!("[TOOLS] readFile {}", path.display());
        Ok(tokio::fs::read_to_string(&path).await?)
    }
}

/// The built-in tools, dispatched by name.
pub struct ToolRegistry {
    find_files: FindFilesTool,
    read_file: ReadFileTool,
}

impl ToolRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            find_files: FindFilesTool::new(root.clone()),
            read_file: ReadFileTool::new(root),
        }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        vec![self.find_files.schema(), self.read_file.schema()]
    }

    fn missing_required(required: &[&str], arguments: &Value) -> Vec<String> {
        required
            .iter()
            .filter(|p| arguments.get(**p).map_or(true, Value::is_null))
            .map(|p| p.to_string())
            .collect()
    }

    async fn run<T: Tool>(tool: &T, arguments: &Value) -> String {
        let missing = Self::missing_required(tool.required(), arguments);
        if !missing.is_empty() {
            tracing::warn!("[TOOLS] {} called without {:?}", tool.name(), missing);
            return format!(
                "The tool '{}' requires the parameter(s): {}",
                tool.name(),
                missing.join(", ")
            );
        }
        match tool.execute(arguments).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("[TOOLS] {} failed: {}", tool.name(), e.inner);
                format!("Error while executing '{}': {}", tool.name(), e.inner)
            }
        }
    }

    /// Executes one approved call. Failures become text for the model.
    pub async fn execute(&self, call: &ToolCallRequest) -> ToolCallResult {
        let arguments: Value = match serde_json::from_str(&call.function.arguments) {
            Ok(v) => v,
            Err(e) => {
                return ToolCallResult {
                    call: call.clone(),
                    outcome: ToolCallOutcome::Executed(format!("Invalid arguments: {}", e)),
                }
            }
        };

        let output = match call.function.name.as_str() {
            "findFiles" => Self::run(&self.find_files, &arguments).await,
            "readFile" => Self::run(&self.read_file, &arguments).await,
            other => {
                tracing::warn!("[TOOLS] Model requested unknown tool '{}'", other);
                format!("There is no tool named '{}'. Available tools: findFiles, readFile", other)
            }
        };

        ToolCallResult {
            call: call.clone(),
            outcome: ToolCallOutcome::Executed(output),
        }
    }

    pub fn declined(call: &ToolCallRequest) -> ToolCallResult {
        ToolCallResult {
            call: call.clone(),
            outcome: ToolCallOutcome::Declined,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FunctionCall;

    fn call(name: &str, args: &str) -> ToolCallRequest {
        ToolCallRequest {
            index: 0,
            id: "call_1".into(),
            call_type: "function".into(),
            function: FunctionCall {
                name: name.into(),
                arguments: args.into(),
            },
        }
    }

    #[test]
    fn test_glob_matching() {
        let m = glob_matcher("**/*.rs").unwrap();
        assert!(m.is_match("main.rs"));
        assert!(m.is_match("src/a/b.rs"));
        assert!(!m.is_match("src/a/b.rsx"));
        let m = glob_matcher("src/*.{md,txt}").unwrap();
        assert!(m.is_match("src/a.md"));
        assert!(m.is_match("src/a.txt"));
        assert!(!m.is_match("src/x/a.md"));
        let m = glob_matcher("data/run[0-9].csv").unwrap();
        assert!(m.is_match("data/run7.csv"));
        assert!(!m.is_match("data/runx.csv"));
        assert!(glob_matcher("src/[a-").is_err());
    }

    #[tokio::test]
    async fn test_find_skips_ignored_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/lib")).unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("node_modules/lib/index.js"), "").unwrap();
        std::fs::write(dir.path().join("src/app.js"), "").unwrap();

        let tool = FindFilesTool::new(dir.path());
        let files = tool.find(glob_matcher("**/*.js").unwrap()).await.unwrap();
        assert_eq!(files, vec![dir.path().join("src/app.js")]);
    }

    #[test]
    fn test_schema_shape() {
        let registry = ToolRegistry::new(".");
        let defs = registry.definitions();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].function.name, "findFiles");
        assert_eq!(defs[1].function.parameters["required"][0], "absoluteFilePath");
    }

    #[tokio::test]
    async fn test_find_and_read_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("pkg")).unwrap();
        std::fs::write(dir.path().join("pkg/data.csv"), "a,b\n1,2\n").unwrap();
        std::fs::write(dir.path().join("notes.md"), "x").unwrap();
        let registry = ToolRegistry::new(dir.path());

        let found = registry.execute(&call("findFiles", r#"{"include":"**/*.csv"}"#)).await;
        match &found.outcome {
            ToolCallOutcome::Executed(out) => {
                assert!(out.ends_with("data.csv"));
                assert!(!out.contains("notes.md"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let read = registry.execute(&call("readFile", r#"{"absoluteFilePath":"pkg/data.csv"}"#)).await;
        assert_eq!(read.outcome, ToolCallOutcome::Executed("a,b\n1,2\n".into()));
    }

    #[tokio::test]
    async fn test_unknown_tool_and_missing_param_are_explained() {
        let registry = ToolRegistry::new(".");
        let unknown = registry.execute(&call("deleteEverything", "{}")).await;
        assert!(unknown.outcome.as_message_content().contains("no tool named"));
        let missing = registry.execute(&call("readFile", "{}")).await;
        assert!(missing.outcome.as_message_content().contains("absoluteFilePath"));
    }
}
