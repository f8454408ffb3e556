//! Tool surface for inter-agent communication.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::json;

use crate::agent::comm;
use crate::error::Error;
use crate::llm::types::ToolDefinition;
use crate::tool::{ExecContext, Tool, ToolOutput};

pub struct AgentCommTool;

impl Tool for AgentCommTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "agent_comm".into(),
            description: "Communicate with other agents: send a fire-and-forget message \
                          (the target handles it as a new conversation under its own \
                          permissions), read another agent's docs, or list agents."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "op": {
                        "type": "string",
                        "enum": ["send", "read_docs", "list"],
                        "description": "The communication operation"
                    },
                    "target": {
                        "type": "string",
                        "description": "Target agent name (for send and read_docs)"
                    },
                    "message": {
                        "type": "string",
                        "description": "Message text (for send)"
                    }
                },
                "required": ["op"]
            }),
        }
    }

    fn detail(&self, input: &serde_json::Value) -> String {
        let op = input.get("op").and_then(|v| v.as_str()).unwrap_or_default();
        let target = input.get("target").and_then(|v| v.as_str()).unwrap_or_default();
        format!("{op} {target}").trim_end().to_string()
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
                .ok_or_else(|| Error::Agent("op is required".into()))?;

            let target = || -> Result<&str, Error> {
                input
                    .get("target")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::Agent(format!("target is required for op={op}")))
            };

            let result = match op {
                "send" => {
                    let message = input
                        .get("message")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| Error::Agent("message is required for op=send".into()))?;
                    comm::send_to_agent(
                        &ctx.home,
                        ctx.comm.as_deref(),
                        &ctx.agent,
                        target()?,
                        message,
                    )
                    .await?
                }
                "read_docs" => comm::read_target_docs(&ctx.home, &ctx.agent, target()?),
                "list" => comm::list_agents(&ctx.home, &ctx.agent),
                other => return Err(Error::Agent(format!("unknown agent_comm op {other:?}"))),
            };

            let is_error = result.get("error").is_some();
            let payload = result.to_string();
            Ok(if is_error {
                ToolOutput::error(payload)
            } else {
                ToolOutput::success(payload)
            })
        })
    }
}
