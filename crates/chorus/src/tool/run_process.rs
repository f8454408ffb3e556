//! Process runner tools — `run_concurrent` and `run_background`.
//!
//! Both spawn a tracked subprocess through the process manager with an
//! optional structured callback array. A concurrent process is tied to the
//! spawning branch (hooks may inject context into it or stop it); a
//! background process outlives the branch and surfaces as a live status
//! card in the channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::json;

use crate::error::Error;
use crate::llm::types::ToolDefinition;
use crate::process::{ProcessCallback, SpawnKind};
use crate::tool::bash::check_blocklist;
use crate::tool::{ExecContext, Tool, ToolOutput};

fn callbacks_schema() -> serde_json::Value {
    json!({
        "type": "array",
        "description": "Callbacks evaluated as the process runs",
        "items": {
            "type": "object",
            "properties": {
                "trigger": {
                    "type": "object",
                    "properties": {
                        "type": {"type": "string", "enum": ["on_exit", "on_output_match", "on_timeout"]},
                        "exit_filter": {"type": "string", "enum": ["any", "success", "failure"]},
                        "pattern": {"type": "string", "description": "Regex for on_output_match"},
                        "timeout_seconds": {"type": "number", "description": "Seconds for on_timeout"}
                    },
                    "required": ["type"]
                },
                "action": {
                    "type": "string",
                    "enum": ["stop_process", "stop_branch", "inject_context", "spawn_branch", "notify_channel"]
                },
                "context_message": {
                    "type": "string",
                    "description": "Text delivered when the callback fires (the injected context, spawn instruction, or notification)"
                },
                "output_delay_seconds": {"type": "number"},
                "max_fires": {"type": "integer"}
            },
            "required": ["trigger", "action"]
        }
    })
}

fn parse_callbacks(input: &serde_json::Value) -> Result<Vec<ProcessCallback>, Error> {
    match input.get("callbacks") {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| Error::Agent(format!("invalid callbacks: {e}"))),
    }
}

async fn spawn_process(
    ctx: &ExecContext,
    input: &serde_json::Value,
    kind: SpawnKind,
) -> Result<ToolOutput, Error> {
    let command = input
        .get("command")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Agent("command is required".into()))?;
    let instructions = input
        .get("instructions")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    if let Err(e) = check_blocklist(command) {
        return Ok(ToolOutput::from_error(&e));
    }

    let Some(pm) = &ctx.processes else {
        return Err(Error::Agent("process manager not available".into()));
    };

    let callbacks = match parse_callbacks(input) {
        Ok(callbacks) => callbacks,
        Err(e) => return Ok(ToolOutput::from_error(&e)),
    };

    // A concurrent process belongs to the spawning branch; a background one
    // deliberately has no parent so stop_branch hooks are inert.
    let parent_branch = match kind {
        SpawnKind::Concurrent => Some(ctx.branch_id),
        SpawnKind::Background => None,
    };

    let tracked = pm
        .spawn(
            command,
            ctx.workspace.root(),
            &ctx.agent,
            kind,
            callbacks,
            instructions,
            parent_branch,
            0,
        )
        .await?;

    let note = match kind {
        SpawnKind::Concurrent => "It runs alongside this branch.",
        SpawnKind::Background => "It will continue after this branch ends.",
    };
    Ok(ToolOutput::success(
        json!({
            "pid": tracked.pid,
            "status": "running",
            "type": kind.as_str(),
            "callbacks": tracked.callbacks_snapshot(),
            "message": format!(
                "Process started (PID {}). {note} {} callback(s) configured.",
                tracked.pid,
                tracked.callbacks_snapshot().len(),
            ),
        })
        .to_string(),
    ))
}

pub struct RunConcurrentTool;

impl Tool for RunConcurrentTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "run_concurrent".into(),
            description: "Start a process that runs alongside this conversation branch. \
                          Callbacks can inject context into the branch, stop it, or react \
                          to output and exit events."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command to execute"},
                    "instructions": {"type": "string", "description": "What this process is for"},
                    "callbacks": callbacks_schema()
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
        Box::pin(async move { spawn_process(&ctx, &input, SpawnKind::Concurrent).await })
    }
}

pub struct RunBackgroundTool;

impl Tool for RunBackgroundTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "run_background".into(),
            description: "Start a long-running process that outlives this branch. Shows a \
                          live status card in the channel. spawn_branch callbacks start a \
                          fresh branch when they fire."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command to execute"},
                    "instructions": {"type": "string", "description": "What this process is for"},
                    "callbacks": callbacks_schema()
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
        Box::pin(async move { spawn_process(&ctx, &input, SpawnKind::Background).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChorusHome;
    use crate::permission::preset;
    use crate::process::manager::ProcessManager;
    use crate::process::{HookAction, TriggerType};
    use crate::workspace::Workspace;

    fn ctx_with_pm() -> (tempfile::TempDir, Arc<ExecContext>, Arc<ProcessManager>) {
        let dir = tempfile::tempdir().unwrap();
        let home = ChorusHome::new(dir.path().join("home"));
        home.ensure().unwrap();
        let ws = Workspace::open(dir.path().join("ws")).unwrap();
        let pm = ProcessManager::new(home.clone(), None);
        let ctx = ExecContext::new("alpha", ws, Arc::new(preset("open").unwrap()), home)
            .with_branch(5)
            .with_processes(pm.clone());
        (dir, Arc::new(ctx), pm)
    }

    #[tokio::test]
    async fn run_concurrent_attaches_branch() {
        let (_dir, ctx, pm) = ctx_with_pm();
        let output = RunConcurrentTool
            .execute(ctx, json!({"command": "true"}))
            .await
            .unwrap();
        assert!(!output.is_error, "{}", output.content);

        let payload: serde_json::Value = serde_json::from_str(&output.content).unwrap();
        let pid = payload["pid"].as_u64().unwrap() as u32;
        let tracked = pm.get(pid).unwrap();
        assert_eq!(tracked.parent_branch, Some(5));
        assert_eq!(tracked.spawn_kind, SpawnKind::Concurrent);
    }

    #[tokio::test]
    async fn run_background_has_no_parent_branch() {
        let (_dir, ctx, pm) = ctx_with_pm();
        let output = RunBackgroundTool
            .execute(
                ctx,
                json!({
                    "command": "true",
                    "instructions": "smoke test",
                    "callbacks": [{
                        "trigger": {"type": "on_exit", "exit_filter": "failure"},
                        "action": "spawn_branch",
                        "context_message": "it failed"
                    }]
                }),
            )
            .await
            .unwrap();
        assert!(!output.is_error, "{}", output.content);

        let payload: serde_json::Value = serde_json::from_str(&output.content).unwrap();
        let pid = payload["pid"].as_u64().unwrap() as u32;
        let tracked = pm.get(pid).unwrap();
        assert_eq!(tracked.parent_branch, None);
        assert_eq!(tracked.context, "smoke test");
        let callbacks = tracked.callbacks_snapshot();
        assert_eq!(callbacks.len(), 1);
        assert_eq!(callbacks[0].trigger.trigger_type, TriggerType::OnExit);
        assert_eq!(callbacks[0].action, HookAction::SpawnBranch);
    }

    #[tokio::test]
    async fn blocked_command_is_rejected() {
        let (_dir, ctx, _pm) = ctx_with_pm();
        let output = RunBackgroundTool
            .execute(ctx, json!({"command": "rm -rf /"}))
            .await
            .unwrap();
        assert!(output.is_error);
        let payload: serde_json::Value = serde_json::from_str(&output.content).unwrap();
        assert_eq!(payload["error"], "BlocklistedCommand");
    }

    #[tokio::test]
    async fn malformed_callbacks_surface_as_tool_error() {
        let (_dir, ctx, _pm) = ctx_with_pm();
        let output = RunConcurrentTool
            .execute(
                ctx,
                json!({"command": "true", "callbacks": [{"action": "stop_process"}]}),
            )
            .await
            .unwrap();
        assert!(output.is_error);
        assert!(output.content.contains("invalid callbacks"));
    }

    #[test]
    fn detail_is_the_command() {
        assert_eq!(
            RunBackgroundTool.detail(&json!({"command": "make test"})),
            "make test"
        );
    }
}
