//! Sandboxed shell execution inside the agent workspace.
//!
//! Commands run with `cwd` set to the workspace, an allowlisted
//! environment with `HOME` re-pointed at the workspace, a two-phase
//! timeout kill (SIGTERM, grace, SIGKILL), front-truncated output capture,
//! and a best-effort blocklist. The blocklist is a safety filter, not a
//! security boundary.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Instant;

use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncReadExt;

use crate::error::Error;
use crate::llm::types::ToolDefinition;
use crate::tool::{ExecContext, Tool, ToolOutput};

pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 50_000;
const SIGTERM_GRACE_MS: u64 = 2_000;

/// Environment variables carried into agent subprocesses.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "LANG", "LC_ALL", "TERM", "SHELL", "TMPDIR", "SCOPE_PATH",
];

/// Structured result from a shell execution.
#[derive(Debug, Clone, Serialize)]
pub struct BashResult {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub truncated: bool,
}

static BLOCKED_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"rm\s+-[^\s]*r[^\s]*f[^\s]*\s+/\s*$", // rm -rf /
        r"rm\s+-[^\s]*f[^\s]*r[^\s]*\s+/\s*$", // rm -fr /
        r":\(\)\s*\{.*\}",                     // fork bomb
        r"dd\s+if=/dev/(zero|random)",         // disk fill
        r"mkfs",                               // format disk
        r">\s*/dev/sd[a-z]",                   // overwrite disk
    ]
    .iter()
    .map(|p| Regex::new(p).expect("blocklist patterns are valid"))
    .collect()
});

/// Reject commands matching the safety blocklist.
pub fn check_blocklist(command: &str) -> Result<(), Error> {
    for pattern in BLOCKED_PATTERNS.iter() {
        if pattern.is_match(command) {
            return Err(Error::BlocklistedCommand(command.to_string()));
        }
    }
    Ok(())
}

/// Build the allowlisted environment for a subprocess, with `HOME` jailed
/// to the workspace. `PYTHONUNBUFFERED` is forced so piped interpreters
/// flush line-by-line — output-match hooks need lines in real time.
pub fn sanitized_env(workspace: &Path, scope_path: Option<&Path>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars()
        .filter(|(k, _)| ALLOWED_ENV_VARS.contains(&k.as_str()))
        .collect();
    env.insert("HOME".into(), workspace.display().to_string());
    if let Some(scope) = scope_path {
        env.insert("SCOPE_PATH".into(), scope.display().to_string());
    }
    env.insert("PYTHONUNBUFFERED".into(), "1".into());
    env
}

/// Truncate from the front, keeping the tail.
fn truncate_output(output: String, max_len: usize) -> (String, bool) {
    if output.len() <= max_len {
        return (output, false);
    }
    let total = output.len();
    let mut start = total - max_len;
    while start < total && !output.is_char_boundary(start) {
        start += 1;
    }
    let truncated = format!(
        "[Output truncated: showing last {max_len} chars of {total} chars]\n{}",
        &output[start..]
    );
    (truncated, true)
}

/// Execute `command` in a subprocess within `workspace`.
pub async fn bash_execute(
    command: &str,
    workspace: &Path,
    timeout_ms: u64,
    max_output_len: usize,
    scope_path: Option<&Path>,
) -> Result<BashResult, Error> {
    check_blocklist(command)?;

    let env = sanitized_env(workspace, scope_path);
    let start = Instant::now();

    let mut child = tokio::process::Command::new("bash")
        .arg("-c")
        .arg(command)
        .current_dir(workspace)
        .env_clear()
        .envs(&env)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Agent(format!("failed to spawn bash: {e}")))?;

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let timeout = std::time::Duration::from_millis(timeout_ms);
    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            status.map_err(|e| Error::Agent(format!("failed to wait for bash: {e}")))?
        }
        Err(_) => {
            // Two-phase kill: SIGTERM, grace period, then SIGKILL.
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
            let grace = std::time::Duration::from_millis(SIGTERM_GRACE_MS);
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            stdout_task.abort();
            stderr_task.abort();
            return Ok(BashResult {
                command: command.to_string(),
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: true,
                duration_ms: start.elapsed().as_millis() as u64,
                truncated: false,
            });
        }
    };

    let stdout_raw = stdout_task.await.unwrap_or_default();
    let stderr_raw = stderr_task.await.unwrap_or_default();
    let (stdout, stdout_trunc) = truncate_output(
        String::from_utf8_lossy(&stdout_raw).into_owned(),
        max_output_len,
    );
    let (stderr, stderr_trunc) = truncate_output(
        String::from_utf8_lossy(&stderr_raw).into_owned(),
        max_output_len,
    );

    Ok(BashResult {
        command: command.to_string(),
        exit_code: status.code(),
        stdout,
        stderr,
        timed_out: false,
        duration_ms: start.elapsed().as_millis() as u64,
        truncated: stdout_trunc || stderr_trunc,
    })
}

pub struct BashTool;

impl Tool for BashTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "bash".into(),
            description: "Execute a shell command in the agent workspace. Captures stdout \
                          and stderr. Default timeout: 120s."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "The shell command to execute"},
                    "timeout_ms": {
                        "type": "integer",
                        "description": "Timeout in milliseconds (default 120000)"
                    }
                },
                "required": ["command"]
            }),
        }
    }

    fn detail(&self, input: &serde_json::Value) -> String {
        input
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }

    fn execute(
        &self,
        ctx: Arc<ExecContext>,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let command = input
                .get("command")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Agent("command is required".into()))?
                .to_string();
            let timeout_ms = input
                .get("timeout_ms")
                .and_then(|v| v.as_u64())
                .unwrap_or(DEFAULT_TIMEOUT_MS);

            let result = bash_execute(
                &command,
                ctx.workspace.root(),
                timeout_ms,
                DEFAULT_MAX_OUTPUT_CHARS,
                ctx.scope_path.as_deref(),
            )
            .await;

            match result {
                Ok(r) => {
                    let is_error = r.timed_out || r.exit_code != Some(0);
                    let payload = serde_json::to_string(&r)?;
                    Ok(if is_error {
                        ToolOutput::error(payload)
                    } else {
                        ToolOutput::success(payload)
                    })
                }
                Err(e) => {
                    // Blocked commands never reach a subprocess; record the
                    // refusal in the audit log.
                    if matches!(e, Error::BlocklistedCommand(_))
                        && let Some(store) = &ctx.store
                    {
                        let action = crate::permission::format_action("bash", &command);
                        if let Err(audit_err) = store
                            .append_audit(&ctx.agent, &action, "deny", None, "blocklist")
                            .await
                        {
                            tracing::warn!(error = %audit_err, "failed to audit blocked command");
                        }
                    }
                    Ok(ToolOutput::from_error(&e))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[tokio::test]
    async fn echo_captures_stdout() {
        let dir = workspace();
        let result = bash_execute("echo hello", dir.path(), 5_000, 1_000, None)
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.trim(), "hello");
        assert!(!result.timed_out);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn nonzero_exit_code_reported() {
        let dir = workspace();
        let result = bash_execute("exit 42", dir.path(), 5_000, 1_000, None)
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(42));
    }

    #[tokio::test]
    async fn stderr_captured_separately() {
        let dir = workspace();
        let result = bash_execute("echo oops >&2", dir.path(), 5_000, 1_000, None)
            .await
            .unwrap();
        assert_eq!(result.stderr.trim(), "oops");
        assert!(result.stdout.is_empty());
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let dir = workspace();
        let started = Instant::now();
        let result = bash_execute("sleep 30", dir.path(), 300, 1_000, None)
            .await
            .unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        // SIGTERM lands long before the 30s sleep would finish
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cwd_is_the_workspace() {
        let dir = workspace();
        let result = bash_execute("pwd", dir.path(), 5_000, 1_000, None)
            .await
            .unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(result.stdout.trim(), canonical.display().to_string());
    }

    #[tokio::test]
    async fn home_is_jailed_to_workspace() {
        let dir = workspace();
        let result = bash_execute("echo $HOME", dir.path(), 5_000, 1_000, None)
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), dir.path().display().to_string());
    }

    #[tokio::test]
    async fn env_is_allowlisted() {
        // SAFETY: test-only mutation before the subprocess spawns
        unsafe { std::env::set_var("CHORUS_SECRET_TEST_VAR", "leaky") };
        let dir = workspace();
        let result = bash_execute("env", dir.path(), 5_000, 50_000, None)
            .await
            .unwrap();
        assert!(!result.stdout.contains("CHORUS_SECRET_TEST_VAR"));
        unsafe { std::env::remove_var("CHORUS_SECRET_TEST_VAR") };
    }

    #[tokio::test]
    async fn output_truncated_from_front() {
        let dir = workspace();
        let result = bash_execute("seq 1 10000", dir.path(), 10_000, 2_000, None)
            .await
            .unwrap();
        assert!(result.truncated);
        assert!(result.stdout.starts_with("[Output truncated"));
        // The tail survives
        assert!(result.stdout.contains("10000"));
        assert!(!result.stdout.contains("\n1\n"));
    }

    #[test]
    fn blocklist_catches_rm_rf_root() {
        assert!(check_blocklist("rm -rf /").is_err());
        assert!(check_blocklist("rm -fr /").is_err());
        assert!(check_blocklist("rm -rf / ").is_err());
    }

    #[test]
    fn blocklist_catches_fork_bomb_and_disk_writes() {
        assert!(check_blocklist(":(){ :|:& };:").is_err());
        assert!(check_blocklist("dd if=/dev/zero of=/dev/sda").is_err());
        assert!(check_blocklist("mkfs.ext4 /dev/sda1").is_err());
        assert!(check_blocklist("echo x > /dev/sda").is_err());
    }

    #[test]
    fn blocklist_allows_normal_commands() {
        assert!(check_blocklist("ls -la").is_ok());
        assert!(check_blocklist("rm -rf ./build").is_ok());
        assert!(check_blocklist("cargo build").is_ok());
    }

    #[tokio::test]
    async fn blocked_command_never_spawns() {
        let dir = workspace();
        let err = bash_execute("rm -rf /", dir.path(), 5_000, 1_000, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BlocklistedCommand");
    }

    #[test]
    fn truncate_keeps_tail_and_flags() {
        let (out, truncated) = truncate_output("abcdefghij".into(), 4);
        assert!(truncated);
        assert!(out.ends_with("ghij"));
        assert!(out.starts_with("[Output truncated"));

        let (out, truncated) = truncate_output("short".into(), 100);
        assert!(!truncated);
        assert_eq!(out, "short");
    }

    #[test]
    fn truncate_respects_utf8_boundaries() {
        let text = "🦀".repeat(100);
        let (out, truncated) = truncate_output(text, 10);
        assert!(truncated);
        let _ = out.chars().count();
    }

    #[test]
    fn detail_is_the_command() {
        let input = json!({"command": "git status"});
        assert_eq!(BashTool.detail(&input), "git status");
    }
}
