//! Git operations for agent workspaces.
//!
//! All operations delegate to the command executor — no git library.
//! Action strings take the form `tool:git:<operation> <args>`, which is
//! what the preset patterns split allow/ask on (`push` and `merge_request`
//! are the privileged ones).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::json;

use crate::error::Error;
use crate::llm::types::ToolDefinition;
use crate::tool::bash::{DEFAULT_MAX_OUTPUT_CHARS, DEFAULT_TIMEOUT_MS, bash_execute};
use crate::tool::{ExecContext, Tool, ToolOutput};

/// Operations the tool accepts; anything else is rejected before a shell
/// is involved.
pub const GIT_OPERATIONS: &[&str] = &[
    "init", "status", "add", "commit", "push", "pull", "fetch", "branch", "checkout", "diff",
    "log", "stash", "merge_request",
];

static COMMIT_HASH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[\w/.-]+\s+([0-9a-f]{7,40})\]").expect("valid regex"));

/// Structured result from a git operation.
#[derive(Debug, Clone, Serialize)]
pub struct GitResult {
    pub operation: String,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
}

/// Run a git operation in the workspace.
///
/// `merge_request` shells out to the forge CLI (`gh pr create`); everything
/// else is `git <op> <args>`.
pub async fn git_execute(ctx: &ExecContext, op: &str, args: &str) -> Result<GitResult, Error> {
    if !GIT_OPERATIONS.contains(&op) {
        return Err(Error::Agent(format!(
            "unsupported git operation {op:?}; supported: {}",
            GIT_OPERATIONS.join(", ")
        )));
    }

    let command = if op == "merge_request" {
        format!("gh pr create {args}")
    } else {
        format!("git {op} {args}").trim_end().to_string()
    };

    let result = bash_execute(
        &command,
        ctx.workspace.root(),
        DEFAULT_TIMEOUT_MS,
        DEFAULT_MAX_OUTPUT_CHARS,
        ctx.scope_path.as_deref(),
    )
    .await?;

    let commit_hash = (op == "commit")
        .then(|| {
            COMMIT_HASH_RE
                .captures(&result.stdout)
                .map(|c| c[1].to_string())
        })
        .flatten();

    Ok(GitResult {
        operation: op.to_string(),
        success: result.exit_code == Some(0),
        stdout: result.stdout,
        stderr: result.stderr,
        commit_hash,
    })
}

pub struct GitTool;

impl Tool for GitTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "git".into(),
            description: format!(
                "Run a git operation in the workspace. Supported operations: {}. \
                 merge_request opens a pull request via the forge CLI.",
                GIT_OPERATIONS.join(", ")
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "op": {
                        "type": "string",
                        "enum": GIT_OPERATIONS,
                        "description": "The git operation to run"
                    },
                    "args": {
                        "type": "string",
                        "description": "Arguments for the operation (e.g. '-m \"fix parser\"')"
                    }
                },
                "required": ["op"]
            }),
        }
    }

    fn detail(&self, input: &serde_json::Value) -> String {
        let op = input.get("op").and_then(|v| v.as_str()).unwrap_or_default();
        let args = input.get("args").and_then(|v| v.as_str()).unwrap_or_default();
        format!("{op} {args}").trim_end().to_string()
    }

    fn sample_details(&self) -> Vec<String> {
        // Cover both sides of the preset split so projection keeps the tool
        // whenever either is reachable.
        vec!["status ".into(), "push origin main".into()]
    }

    fn execute(
        &self,
        ctx: Arc<ExecContext>,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let op = input
                .get("op")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Agent("op is required".into()))?
                .to_string();
            let args = input
                .get("args")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            match git_execute(&ctx, &op, &args).await {
                Ok(r) => {
                    let payload = serde_json::to_string(&r)?;
                    Ok(if r.success {
                        ToolOutput::success(payload)
                    } else {
                        ToolOutput::error(payload)
                    })
                }
                Err(e) => Ok(ToolOutput::from_error(&e)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChorusHome;
    use crate::permission::preset;
    use crate::workspace::Workspace;

    fn ctx() -> (tempfile::TempDir, Arc<ExecContext>) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path().join("ws")).unwrap();
        let ctx = ExecContext::new(
            "alpha",
            ws,
            Arc::new(preset("open").unwrap()),
            ChorusHome::new(dir.path().join("home")),
        );
        (dir, Arc::new(ctx))
    }

    #[test]
    fn detail_is_op_and_args() {
        let input = json!({"op": "commit", "args": "-m wip"});
        assert_eq!(GitTool.detail(&input), "commit -m wip");
        assert_eq!(GitTool.detail(&json!({"op": "status"})), "status");
    }

    #[test]
    fn commit_hash_regex_extracts() {
        let stdout = "[main 3fa9c1d] fix parser\n 1 file changed";
        let caps = COMMIT_HASH_RE.captures(stdout).unwrap();
        assert_eq!(&caps[1], "3fa9c1d");
    }

    #[tokio::test]
    async fn unsupported_operation_rejected() {
        let (_dir, ctx) = ctx();
        let err = git_execute(&ctx, "rebase", "").await.unwrap_err();
        assert!(err.to_string().contains("unsupported git operation"));
    }

    #[tokio::test]
    async fn init_and_status_roundtrip() {
        let (_dir, ctx) = ctx();
        let result = git_execute(&ctx, "init", "").await.unwrap();
        assert!(result.success, "git init failed: {}", result.stderr);

        let result = git_execute(&ctx, "status", "").await.unwrap();
        assert!(result.success);
        assert!(
            result.stdout.to_lowercase().contains("no commits yet")
                || result.stdout.contains("branch"),
            "unexpected status output: {}",
            result.stdout
        );
    }

    #[tokio::test]
    async fn tool_wrapper_reports_failure_payload() {
        let (_dir, ctx) = ctx();
        // status outside a repo exits nonzero
        let output = GitTool
            .execute(ctx, json!({"op": "status"}))
            .await
            .unwrap();
        assert!(output.is_error);
        let payload: serde_json::Value = serde_json::from_str(&output.content).unwrap();
        assert_eq!(payload["operation"], "status");
        assert_eq!(payload["success"], false);
    }
}
