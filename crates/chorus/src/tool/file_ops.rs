//! Workspace file tools — create, str_replace, view, and the line-oriented
//! extensions.
//!
//! All paths resolve through the workspace jail. Mutating ops take the
//! per-file lock from the branch manager before touching the file and
//! release it on every exit path.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::error::Error;
use crate::llm::types::ToolDefinition;
use crate::tool::{ExecContext, Tool, ToolOutput};
use crate::workspace::Workspace;

const CONTEXT_LINES: usize = 3;
const BINARY_CHECK_SIZE: usize = 8192;

/// Structured result returned by file tools.
#[derive(Debug, Clone, Serialize)]
pub struct FileResult {
    pub path: String,
    pub action: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_snippet: Option<String>,
}

impl FileResult {
    fn ok(path: &str, action: &str) -> Self {
        Self {
            path: path.to_string(),
            action: action.to_string(),
            success: true,
            content_snippet: None,
        }
    }

    fn with_snippet(mut self, snippet: String) -> Self {
        self.content_snippet = Some(snippet);
        self
    }

    fn to_output(&self) -> ToolOutput {
        ToolOutput::success(serde_json::to_string(self).expect("FileResult serializes"))
    }
}

// ---------------------------------------------------------------------------
// Core operations
// ---------------------------------------------------------------------------

/// Create (or overwrite) a file inside the workspace, creating intermediate
/// directories.
pub async fn create_file(ws: &Workspace, path: &str, content: &str) -> Result<FileResult, Error> {
    let resolved = ws.resolve(path)?;
    if let Some(parent) = resolved.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Agent(format!("failed to create {}: {e}", parent.display())))?;
    }
    tokio::fs::write(&resolved, content)
        .await
        .map_err(|e| Error::Agent(format!("failed to write {path}: {e}")))?;
    Ok(FileResult::ok(path, "created"))
}

/// Replace exactly one occurrence of `old_str` with `new_str`.
pub async fn str_replace(
    ws: &Workspace,
    path: &str,
    old_str: &str,
    new_str: &str,
) -> Result<FileResult, Error> {
    let resolved = ws.resolve(path)?;
    let content = read_text(&resolved, path).await?;

    let count = content.matches(old_str).count();
    if count == 0 {
        return Err(Error::StringNotFound(path.to_string()));
    }
    if count > 1 {
        return Err(Error::AmbiguousMatch {
            path: path.to_string(),
            count,
        });
    }

    let new_content = content.replacen(old_str, new_str, 1);
    write_preserving_mode(&resolved, &new_content).await?;

    let snippet = context_around(&new_content, new_str);
    Ok(FileResult::ok(path, "str_replace").with_snippet(snippet))
}

/// Replace every occurrence of `old_str`; returns the replacement count in
/// the snippet line.
pub async fn str_replace_all(
    ws: &Workspace,
    path: &str,
    old_str: &str,
    new_str: &str,
) -> Result<FileResult, Error> {
    let resolved = ws.resolve(path)?;
    let content = read_text(&resolved, path).await?;

    let count = content.matches(old_str).count();
    if count == 0 {
        return Err(Error::StringNotFound(path.to_string()));
    }

    let new_content = content.replace(old_str, new_str);
    write_preserving_mode(&resolved, &new_content).await?;
    Ok(FileResult::ok(path, "str_replace_all").with_snippet(format!("{count} replacements")))
}

/// Insert `content` before or after a 1-based line number.
pub async fn insert_at(
    ws: &Workspace,
    path: &str,
    line: usize,
    position: &str,
    content: &str,
) -> Result<FileResult, Error> {
    if line == 0 {
        return Err(Error::Agent("line numbers are 1-based".into()));
    }
    let resolved = ws.resolve(path)?;
    let existing = read_text(&resolved, path).await?;
    let mut lines: Vec<&str> = existing.lines().collect();
    if line > lines.len() {
        return Err(Error::Agent(format!(
            "line {line} is past the end of {path} ({} lines)",
            lines.len()
        )));
    }

    let index = match position {
        "before" => line - 1,
        "after" => line,
        other => {
            return Err(Error::Agent(format!(
                "position must be 'before' or 'after', got {other:?}"
            )));
        }
    };
    lines.insert(index, content);

    let new_content = join_lines(&lines, existing.ends_with('\n'));
    write_preserving_mode(&resolved, &new_content).await?;
    let snippet = numbered_window(&new_content, index, CONTEXT_LINES);
    Ok(FileResult::ok(path, "insert_at").with_snippet(snippet))
}

/// Replace the inclusive 1-based line range `[start, end]` with `content`.
pub async fn replace_lines(
    ws: &Workspace,
    path: &str,
    start: usize,
    end: usize,
    content: &str,
) -> Result<FileResult, Error> {
    if start == 0 || end < start {
        return Err(Error::Agent(format!("invalid line range {start}..{end}")));
    }
    let resolved = ws.resolve(path)?;
    let existing = read_text(&resolved, path).await?;
    let lines: Vec<&str> = existing.lines().collect();
    if end > lines.len() {
        return Err(Error::Agent(format!(
            "line {end} is past the end of {path} ({} lines)",
            lines.len()
        )));
    }

    let mut new_lines: Vec<&str> = Vec::with_capacity(lines.len());
    new_lines.extend(&lines[..start - 1]);
    new_lines.extend(content.lines());
    new_lines.extend(&lines[end..]);

    let new_content = join_lines(&new_lines, existing.ends_with('\n'));
    write_preserving_mode(&resolved, &new_content).await?;
    let snippet = numbered_window(&new_content, start - 1, CONTEXT_LINES);
    Ok(FileResult::ok(path, "replace_lines").with_snippet(snippet))
}

/// View a file with numbered lines, or list a directory.
pub async fn view(
    ws: &Workspace,
    path: &str,
    offset: Option<usize>,
    limit: Option<usize>,
) -> Result<FileResult, Error> {
    let resolved = ws.resolve(path)?;

    if !resolved.exists() {
        return Err(Error::FileNotFoundInWorkspace(path.to_string()));
    }

    if resolved.is_dir() {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|e| Error::Agent(format!("failed to list {path}: {e}")))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| Error::Agent(format!("failed to list {path}: {e}")))?
        {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();
        let listing = if entries.is_empty() {
            "(empty directory)".to_string()
        } else {
            entries.join("\n")
        };
        return Ok(FileResult::ok(path, "view")
            .with_snippet(format!("Directory listing of {path}/:\n{listing}")));
    }

    let raw = tokio::fs::read(&resolved)
        .await
        .map_err(|e| Error::Agent(format!("failed to read {path}: {e}")))?;
    if raw[..raw.len().min(BINARY_CHECK_SIZE)].contains(&0) {
        return Err(Error::BinaryFile(path.to_string()));
    }
    let content = String::from_utf8_lossy(&raw);
    let lines: Vec<&str> = content.lines().collect();

    let start = offset.unwrap_or(1).saturating_sub(1);
    let end = limit.map_or(lines.len(), |l| (start + l).min(lines.len()));
    let numbered: Vec<String> = lines
        .get(start..end.max(start))
        .unwrap_or(&[])
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{}\t{line}", start + i + 1))
        .collect();

    Ok(FileResult::ok(path, "view").with_snippet(numbered.join("\n")))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn read_text(resolved: &Path, path: &str) -> Result<String, Error> {
    if !resolved.exists() {
        return Err(Error::FileNotFoundInWorkspace(path.to_string()));
    }
    tokio::fs::read_to_string(resolved)
        .await
        .map_err(|e| Error::Agent(format!("failed to read {path}: {e}")))
}

/// Write content, keeping the file's existing permission bits (a replaced
/// executable script stays executable).
async fn write_preserving_mode(resolved: &Path, content: &str) -> Result<(), Error> {
    let mode = tokio::fs::metadata(resolved).await.ok().map(|m| m.permissions());
    tokio::fs::write(resolved, content)
        .await
        .map_err(|e| Error::Agent(format!("failed to write {}: {e}", resolved.display())))?;
    if let Some(perms) = mode {
        let _ = tokio::fs::set_permissions(resolved, perms).await;
    }
    Ok(())
}

fn join_lines(lines: &[&str], trailing_newline: bool) -> String {
    let mut out = lines.join("\n");
    if trailing_newline {
        out.push('\n');
    }
    out
}

/// Numbered lines around the first line containing `target`.
fn context_around(content: &str, target: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let target_line = target
        .lines()
        .next()
        .and_then(|first| lines.iter().position(|l| l.contains(first)));

    let (start, end) = match target_line {
        Some(i) => (
            i.saturating_sub(CONTEXT_LINES),
            (i + CONTEXT_LINES + 1).min(lines.len()),
        ),
        None => (0, (CONTEXT_LINES * 2 + 1).min(lines.len())),
    };

    lines[start..end]
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{}\t{line}", start + i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

fn numbered_window(content: &str, around: usize, radius: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = around.saturating_sub(radius);
    let end = (around + radius + 1).min(lines.len());
    lines[start..end]
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{}\t{line}", start + i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run a mutating op under the branch manager's per-file write lock.
///
/// Reads do not lock. A timeout surfaces as [`Error::LockTimeout`] so the
/// LLM can back off and retry.
async fn with_file_lock<F, Fut>(ctx: &ExecContext, path: &str, op: F) -> Result<FileResult, Error>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<FileResult, Error>>,
{
    let Some(branches) = &ctx.branches else {
        return op().await;
    };
    let canonical = ctx.workspace.resolve(path)?;
    branches.begin_step(ctx.branch_id, &format!("Awaiting file lock on {path}"));
    if !branches.acquire_file_lock(ctx.branch_id, &canonical, None).await {
        return Err(Error::LockTimeout(path.to_string()));
    }
    let result = op().await;
    branches.release_file_lock(ctx.branch_id, &canonical);
    result
}

fn require_str<'a>(input: &'a serde_json::Value, key: &str) -> Result<&'a str, Error> {
    input
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Agent(format!("{key} is required")))
}

fn path_detail(input: &serde_json::Value) -> String {
    input
        .get("path")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

// ---------------------------------------------------------------------------
// Tool wrappers
// ---------------------------------------------------------------------------

pub struct CreateFileTool;

impl Tool for CreateFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "create_file".into(),
            description: "Create or overwrite a file in the agent workspace. \
                          Intermediate directories are created automatically."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Relative path within the workspace"},
                    "content": {"type": "string", "description": "File content (UTF-8)"}
                },
                "required": ["path", "content"]
            }),
        }
    }

    fn detail(&self, input: &serde_json::Value) -> String {
        path_detail(input)
    }

    fn execute(
        &self,
        ctx: Arc<ExecContext>,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let path = require_str(&input, "path")?.to_string();
            let content = require_str(&input, "content")?.to_string();
            let result = with_file_lock(&ctx, &path, || async {
                create_file(&ctx.workspace, &path, &content).await
            })
            .await;
            Ok(match result {
                Ok(r) => r.to_output(),
                Err(e) => ToolOutput::from_error(&e),
            })
        })
    }
}

pub struct StrReplaceTool;

impl Tool for StrReplaceTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "str_replace".into(),
            description: "Replace exactly one occurrence of a string in a file. \
                          Fails if the string is not found or appears more than once."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Relative path within the workspace"},
                    "old_str": {"type": "string", "description": "Exact string to find (must be unique)"},
                    "new_str": {"type": "string", "description": "Replacement string"}
                },
                "required": ["path", "old_str", "new_str"]
            }),
        }
    }

    fn detail(&self, input: &serde_json::Value) -> String {
        path_detail(input)
    }

    fn execute(
        &self,
        ctx: Arc<ExecContext>,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let path = require_str(&input, "path")?.to_string();
            let old_str = require_str(&input, "old_str")?.to_string();
            let new_str = require_str(&input, "new_str")?.to_string();
            let result = with_file_lock(&ctx, &path, || async {
                str_replace(&ctx.workspace, &path, &old_str, &new_str).await
            })
            .await;
            Ok(match result {
                Ok(r) => r.to_output(),
                Err(e) => ToolOutput::from_error(&e),
            })
        })
    }
}

pub struct ViewTool;

impl Tool for ViewTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "view".into(),
            description: "View a file's contents with line numbers, or list a directory. \
                          Supports optional offset and limit for large files."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Relative path within the workspace"},
                    "offset": {"type": "integer", "description": "1-based line number to start from"},
                    "limit": {"type": "integer", "description": "Number of lines to return"}
                },
                "required": ["path"]
            }),
        }
    }

    fn detail(&self, input: &serde_json::Value) -> String {
        path_detail(input)
    }

    fn execute(
        &self,
        ctx: Arc<ExecContext>,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let path = require_str(&input, "path")?.to_string();
            let offset = input.get("offset").and_then(|v| v.as_u64()).map(|v| v as usize);
            let limit = input.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize);
            // Reads do not lock
            Ok(match view(&ctx.workspace, &path, offset, limit).await {
                Ok(r) => r.to_output(),
                Err(e) => ToolOutput::from_error(&e),
            })
        })
    }
}

pub struct StrReplaceAllTool;

impl Tool for StrReplaceAllTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "str_replace_all".into(),
            description: "Replace every occurrence of a string in a file.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "old_str": {"type": "string"},
                    "new_str": {"type": "string"}
                },
                "required": ["path", "old_str", "new_str"]
            }),
        }
    }

    fn detail(&self, input: &serde_json::Value) -> String {
        path_detail(input)
    }

    fn execute(
        &self,
        ctx: Arc<ExecContext>,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let path = require_str(&input, "path")?.to_string();
            let old_str = require_str(&input, "old_str")?.to_string();
            let new_str = require_str(&input, "new_str")?.to_string();
            let result = with_file_lock(&ctx, &path, || async {
                str_replace_all(&ctx.workspace, &path, &old_str, &new_str).await
            })
            .await;
            Ok(match result {
                Ok(r) => r.to_output(),
                Err(e) => ToolOutput::from_error(&e),
            })
        })
    }
}

pub struct InsertAtTool;

impl Tool for InsertAtTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "insert_at".into(),
            description: "Insert content before or after a 1-based line number.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "line": {"type": "integer"},
                    "position": {"type": "string", "enum": ["before", "after"]},
                    "content": {"type": "string"}
                },
                "required": ["path", "line", "position", "content"]
            }),
        }
    }

    fn detail(&self, input: &serde_json::Value) -> String {
        path_detail(input)
    }

    fn execute(
        &self,
        ctx: Arc<ExecContext>,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let path = require_str(&input, "path")?.to_string();
            let line = input
                .get("line")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| Error::Agent("line is required".into()))?
                as usize;
            let position = require_str(&input, "position")?.to_string();
            let content = require_str(&input, "content")?.to_string();
            let result = with_file_lock(&ctx, &path, || async {
                insert_at(&ctx.workspace, &path, line, &position, &content).await
            })
            .await;
            Ok(match result {
                Ok(r) => r.to_output(),
                Err(e) => ToolOutput::from_error(&e),
            })
        })
    }
}

pub struct ReplaceLinesTool;

impl Tool for ReplaceLinesTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "replace_lines".into(),
            description: "Replace an inclusive 1-based line range with new content.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "start": {"type": "integer"},
                    "end": {"type": "integer"},
                    "content": {"type": "string"}
                },
                "required": ["path", "start", "end", "content"]
            }),
        }
    }

    fn detail(&self, input: &serde_json::Value) -> String {
        path_detail(input)
    }

    fn execute(
        &self,
        ctx: Arc<ExecContext>,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let path = require_str(&input, "path")?.to_string();
            let start = input.get("start").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let end = input.get("end").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let content = require_str(&input, "content")?.to_string();
            let result = with_file_lock(&ctx, &path, || async {
                replace_lines(&ctx.workspace, &path, start, end, &content).await
            })
            .await;
            Ok(match result {
                Ok(r) => r.to_output(),
                Err(e) => ToolOutput::from_error(&e),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        (dir, ws)
    }

    #[tokio::test]
    async fn create_then_view_roundtrips() {
        let (_dir, ws) = ws();
        create_file(&ws, "notes.md", "line one\nline two\n").await.unwrap();

        let result = view(&ws, "notes.md", None, None).await.unwrap();
        let snippet = result.content_snippet.unwrap();
        assert_eq!(snippet, "1\tline one\n2\tline two");
    }

    #[tokio::test]
    async fn create_makes_intermediate_dirs() {
        let (_dir, ws) = ws();
        create_file(&ws, "a/b/c.txt", "x").await.unwrap();
        assert!(ws.root().join("a/b/c.txt").exists());
    }

    #[tokio::test]
    async fn create_overwrites() {
        let (_dir, ws) = ws();
        create_file(&ws, "f.txt", "old").await.unwrap();
        create_file(&ws, "f.txt", "new").await.unwrap();
        let content = std::fs::read_to_string(ws.root().join("f.txt")).unwrap();
        assert_eq!(content, "new");
    }

    #[tokio::test]
    async fn str_replace_unique_match() {
        let (_dir, ws) = ws();
        create_file(&ws, "f.md", "alpha\nbeta\ngamma\n").await.unwrap();

        let result = str_replace(&ws, "f.md", "beta", "BETA").await.unwrap();
        assert!(result.success);
        let snippet = result.content_snippet.unwrap();
        assert!(snippet.contains("BETA"), "snippet: {snippet}");
        assert!(snippet.contains("alpha"), "snippet has context: {snippet}");

        let content = std::fs::read_to_string(ws.root().join("f.md")).unwrap();
        assert_eq!(content, "alpha\nBETA\ngamma\n");
    }

    #[tokio::test]
    async fn str_replace_zero_matches() {
        let (_dir, ws) = ws();
        create_file(&ws, "f.md", "alpha\n").await.unwrap();
        let err = str_replace(&ws, "f.md", "missing", "x").await.unwrap_err();
        assert_eq!(err.kind(), "StringNotFound");
    }

    #[tokio::test]
    async fn str_replace_ambiguous() {
        let (_dir, ws) = ws();
        create_file(&ws, "f.md", "dup\ndup\n").await.unwrap();
        let err = str_replace(&ws, "f.md", "dup", "x").await.unwrap_err();
        assert_eq!(err.kind(), "AmbiguousMatch");
    }

    #[tokio::test]
    async fn str_replace_missing_file() {
        let (_dir, ws) = ws();
        let err = str_replace(&ws, "nope.md", "a", "b").await.unwrap_err();
        assert_eq!(err.kind(), "FileNotFoundInWorkspace");
    }

    #[tokio::test]
    async fn str_replace_is_reversible_for_unique_strings() {
        let (_dir, ws) = ws();
        let original = "one\ntwo\nthree\n";
        create_file(&ws, "f.md", original).await.unwrap();

        str_replace(&ws, "f.md", "two", "TWO").await.unwrap();
        str_replace(&ws, "f.md", "TWO", "two").await.unwrap();

        let content = std::fs::read_to_string(ws.root().join("f.md")).unwrap();
        assert_eq!(content, original);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn str_replace_preserves_mode() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, ws) = ws();
        create_file(&ws, "run.sh", "#!/bin/sh\necho hi\n").await.unwrap();
        let path = ws.root().join("run.sh");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        str_replace(&ws, "run.sh", "hi", "hello").await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn str_replace_all_counts() {
        let (_dir, ws) = ws();
        create_file(&ws, "f.md", "x x x\n").await.unwrap();
        let result = str_replace_all(&ws, "f.md", "x", "y").await.unwrap();
        assert_eq!(result.content_snippet.unwrap(), "3 replacements");
        let content = std::fs::read_to_string(ws.root().join("f.md")).unwrap();
        assert_eq!(content, "y y y\n");
    }

    #[tokio::test]
    async fn view_binary_rejected() {
        let (_dir, ws) = ws();
        std::fs::write(ws.root().join("blob.bin"), [0u8, 159, 146, 150]).unwrap();
        let err = view(&ws, "blob.bin", None, None).await.unwrap_err();
        assert_eq!(err.kind(), "BinaryFile");
    }

    #[tokio::test]
    async fn view_offset_and_limit() {
        let (_dir, ws) = ws();
        create_file(&ws, "f.md", "a\nb\nc\nd\ne\n").await.unwrap();
        let result = view(&ws, "f.md", Some(2), Some(2)).await.unwrap();
        assert_eq!(result.content_snippet.unwrap(), "2\tb\n3\tc");
    }

    #[tokio::test]
    async fn view_directory_lists_entries() {
        let (_dir, ws) = ws();
        create_file(&ws, "sub/inner.txt", "x").await.unwrap();
        create_file(&ws, "top.txt", "y").await.unwrap();
        let result = view(&ws, ".", None, None).await.unwrap();
        let snippet = result.content_snippet.unwrap();
        assert!(snippet.contains("sub/"));
        assert!(snippet.contains("top.txt"));
    }

    #[tokio::test]
    async fn view_missing_file() {
        let (_dir, ws) = ws();
        let err = view(&ws, "ghost.md", None, None).await.unwrap_err();
        assert_eq!(err.kind(), "FileNotFoundInWorkspace");
    }

    #[tokio::test]
    async fn path_traversal_rejected_on_all_ops() {
        let (_dir, ws) = ws();
        assert_eq!(
            create_file(&ws, "../out.txt", "x").await.unwrap_err().kind(),
            "PathTraversal"
        );
        assert_eq!(
            view(&ws, "../../etc/passwd", None, None).await.unwrap_err().kind(),
            "PathTraversal"
        );
    }

    #[tokio::test]
    async fn insert_at_before_and_after() {
        let (_dir, ws) = ws();
        create_file(&ws, "f.md", "one\ntwo\n").await.unwrap();

        insert_at(&ws, "f.md", 1, "before", "zero").await.unwrap();
        insert_at(&ws, "f.md", 3, "after", "three").await.unwrap();

        let content = std::fs::read_to_string(ws.root().join("f.md")).unwrap();
        assert_eq!(content, "zero\none\ntwo\nthree\n");
    }

    #[tokio::test]
    async fn replace_lines_range() {
        let (_dir, ws) = ws();
        create_file(&ws, "f.md", "a\nb\nc\nd\n").await.unwrap();
        replace_lines(&ws, "f.md", 2, 3, "B\nC").await.unwrap();
        let content = std::fs::read_to_string(ws.root().join("f.md")).unwrap();
        assert_eq!(content, "a\nB\nC\nd\n");
    }

    #[tokio::test]
    async fn replace_lines_invalid_range() {
        let (_dir, ws) = ws();
        create_file(&ws, "f.md", "a\n").await.unwrap();
        assert!(replace_lines(&ws, "f.md", 0, 1, "x").await.is_err());
        assert!(replace_lines(&ws, "f.md", 1, 9, "x").await.is_err());
    }

    #[tokio::test]
    async fn tool_wrapper_renders_error_payload() {
        use crate::config::ChorusHome;
        use crate::permission::preset;

        let (_dir, ws2) = ws();
        let home_dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(ExecContext::new(
            "alpha",
            ws2,
            Arc::new(preset("open").unwrap()),
            ChorusHome::new(home_dir.path()),
        ));

        let output = StrReplaceTool
            .execute(ctx, json!({"path": "nope.md", "old_str": "a", "new_str": "b"}))
            .await
            .unwrap();
        assert!(output.is_error);
        let payload: serde_json::Value = serde_json::from_str(&output.content).unwrap();
        assert_eq!(payload["error"], "FileNotFoundInWorkspace");
    }

    #[test]
    fn detail_is_the_relative_path() {
        let input = json!({"path": "src/main.rs", "content": "x"});
        assert_eq!(CreateFileTool.detail(&input), "src/main.rs");
        assert_eq!(ViewTool.detail(&json!({"path": "a.md"})), "a.md");
    }
}
