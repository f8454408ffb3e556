//! Tool surface for agent self-modification.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::json;

use crate::agent::self_edit;
use crate::error::Error;
use crate::llm::types::ToolDefinition;
use crate::tool::{ExecContext, Tool, ToolOutput};

pub struct SelfEditTool;

impl Tool for SelfEditTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "self_edit".into(),
            description: "Modify this agent's own configuration: system prompt, docs files, \
                          permission preset, or model. Changes take effect on the next LLM \
                          call."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "kind": {
                        "type": "string",
                        "enum": ["system_prompt", "docs", "permissions", "model"],
                        "description": "What to edit"
                    },
                    "content": {
                        "type": "string",
                        "description": "New system prompt or docs file content"
                    },
                    "path": {
                        "type": "string",
                        "description": "Docs file path (for kind=docs)"
                    },
                    "profile": {
                        "type": "string",
                        "description": "Permission preset name (for kind=permissions)"
                    },
                    "model": {
                        "type": "string",
                        "description": "Model id (for kind=model)"
                    }
                },
                "required": ["kind"]
            }),
        }
    }

    fn detail(&self, input: &serde_json::Value) -> String {
        let kind = input.get("kind").and_then(|v| v.as_str()).unwrap_or_default();
        let target = match kind {
            "docs" => input.get("path").and_then(|v| v.as_str()),
            "permissions" => input.get("profile").and_then(|v| v.as_str()),
            "model" => input.get("model").and_then(|v| v.as_str()),
            _ => None,
        };
        match target {
            Some(target) => format!("{kind}:{target}"),
            None => kind.to_string(),
        }
    }

    fn sample_details(&self) -> Vec<String> {
        vec!["system_prompt".into(), "permissions:standard".into()]
    }

    fn execute(
        &self,
        ctx: Arc<ExecContext>,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let kind = input
                .get("kind")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Agent("kind is required".into()))?;
            let str_field = |key: &str| -> Result<String, Error> {
                input
                    .get(key)
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| Error::Agent(format!("{key} is required for kind={kind}")))
            };

            let result = match kind {
                "system_prompt" => {
                    self_edit::edit_system_prompt(
                        &ctx.home,
                        ctx.store.as_ref(),
                        &ctx.agent,
                        &str_field("content")?,
                        None,
                    )
                    .await?
                }
                "docs" => {
                    self_edit::edit_docs(
                        &ctx.home,
                        ctx.store.as_ref(),
                        &ctx.agent,
                        &str_field("path")?,
                        &str_field("content")?,
                        None,
                    )
                    .await?
                }
                "permissions" => {
                    self_edit::edit_permissions(
                        &ctx.home,
                        ctx.store.as_ref(),
                        &ctx.agent,
                        &str_field("profile")?,
                        ctx.is_admin,
                        None,
                    )
                    .await?
                }
                "model" => {
                    self_edit::edit_model(
                        &ctx.home,
                        ctx.store.as_ref(),
                        &ctx.agent,
                        &str_field("model")?,
                        None,
                    )
                    .await?
                }
                other => {
                    return Err(Error::Agent(format!("unknown self_edit kind {other:?}")));
                }
            };

            let payload = serde_json::to_string(&result)?;
            Ok(if result.success {
                ToolOutput::success(payload)
            } else {
                ToolOutput::error(payload)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::config::ChorusHome;
    use crate::permission::preset;
    use crate::workspace::Workspace;

    fn ctx(is_admin: bool) -> (tempfile::TempDir, Arc<ExecContext>) {
        let dir = tempfile::tempdir().unwrap();
        let home = ChorusHome::new(dir.path());
        home.ensure().unwrap();
        let agent = Agent::new("alpha", 42).unwrap();
        agent.save(&home).unwrap();
        let ws = Workspace::open(home.workspace_dir("alpha")).unwrap();
        let ctx = ExecContext::new("alpha", ws, Arc::new(preset("open").unwrap()), home)
            .with_admin(is_admin);
        (dir, Arc::new(ctx))
    }

    #[test]
    fn detail_includes_target() {
        let tool = SelfEditTool;
        assert_eq!(tool.detail(&json!({"kind": "system_prompt"})), "system_prompt");
        assert_eq!(
            tool.detail(&json!({"kind": "docs", "path": "README.md"})),
            "docs:README.md"
        );
        assert_eq!(
            tool.detail(&json!({"kind": "permissions", "profile": "open"})),
            "permissions:open"
        );
        assert_eq!(
            tool.detail(&json!({"kind": "model", "model": "gpt-4o"})),
            "model:gpt-4o"
        );
    }

    #[tokio::test]
    async fn system_prompt_edit_through_tool() {
        let (_dir, ctx) = ctx(false);
        let output = SelfEditTool
            .execute(
                ctx.clone(),
                json!({"kind": "system_prompt", "content": "Be terse."}),
            )
            .await
            .unwrap();
        assert!(!output.is_error, "{}", output.content);
        assert_eq!(
            Agent::load(&ctx.home, "alpha").unwrap().system_prompt,
            "Be terse."
        );
    }

    #[tokio::test]
    async fn permissions_gate_flows_through_tool() {
        let (_dir, ctx) = ctx(false);
        let output = SelfEditTool
            .execute(ctx, json!({"kind": "permissions", "profile": "open"}))
            .await
            .unwrap();
        assert!(output.is_error);
        assert!(output.content.contains("insufficient_role"));

        let (_dir, admin_ctx) = self::ctx(true);
        let output = SelfEditTool
            .execute(admin_ctx, json!({"kind": "permissions", "profile": "open"}))
            .await
            .unwrap();
        assert!(!output.is_error, "{}", output.content);
    }

    #[tokio::test]
    async fn missing_field_is_an_error() {
        let (_dir, ctx) = ctx(false);
        let err = SelfEditTool
            .execute(ctx, json!({"kind": "docs", "path": "x.md"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("content is required"));
    }
}
