//! Function-call-structured wire adapter (OpenAI Chat Completions API).
//!
//! Tool arguments travel as JSON-encoded strings on this wire; the adapter
//! decodes them into structured values and flattens block-structured
//! messages into the role-per-row shape the API expects.

use reqwest::Client;
use serde::Deserialize;
use tracing::warn;

use crate::error::Error;
use crate::llm::LlmProvider;
use crate::llm::types::{
    ChatRequest, ChatResponse, ContentBlock, Role, StopReason, Usage,
};

const API_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

impl LlmProvider for OpenAiProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, Error> {
        let body = build_request_body(&self.model, &request)?;

        let response = self
            .client
            .post(API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = if status.as_u16() == 401 || status.as_u16() == 403 {
                format!("authentication failed (HTTP {})", status.as_u16())
            } else {
                response
                    .text()
                    .await
                    .unwrap_or_else(|e| format!("<body read error: {e}>"))
            };
            if status.as_u16() == 429 {
                return Err(Error::ProviderRateLimit(message));
            }
            return Err(Error::ProviderError {
                status: status.as_u16(),
                message,
            });
        }

        let api_response: ApiResponse = response.json().await?;
        into_chat_response(api_response)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn build_request_body(model: &str, request: &ChatRequest) -> Result<serde_json::Value, Error> {
    let mut messages = Vec::new();

    if !request.system.is_empty() {
        messages.push(serde_json::json!({
            "role": "system",
            "content": request.system,
        }));
    }

    for msg in &request.messages {
        match msg.role {
            Role::User => {
                // Tool results become their own role:"tool" rows; plain text
                // collapses into a single user row.
                let mut text_parts = Vec::new();
                for block in &msg.content {
                    match block {
                        ContentBlock::Text { text } => text_parts.push(text.as_str()),
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => {
                            // This wire has no is_error flag; prefix so the
                            // model still sees the failure.
                            let content = if *is_error {
                                format!("[ERROR] {content}")
                            } else {
                                content.clone()
                            };
                            messages.push(serde_json::json!({
                                "role": "tool",
                                "tool_call_id": tool_use_id,
                                "content": content,
                            }));
                        }
                        ContentBlock::ToolUse { .. } => {}
                    }
                }
                if !text_parts.is_empty() {
                    messages.push(serde_json::json!({
                        "role": "user",
                        "content": text_parts.join("\n\n"),
                    }));
                }
            }
            Role::Assistant => {
                let text: String = msg
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("");

                let tool_calls: Vec<serde_json::Value> = msg
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolUse { id, name, input } => Some(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        })),
                        _ => None,
                    })
                    .collect();

                let mut row = serde_json::json!({"role": "assistant"});
                row["content"] = if text.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::Value::String(text)
                };
                if !tool_calls.is_empty() {
                    row["tool_calls"] = serde_json::Value::Array(tool_calls);
                }
                messages.push(row);
            }
        }
    }

    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
        "max_tokens": request.max_tokens,
    });

    if !request.tools.is_empty() {
        let tools: Vec<serde_json::Value> = request
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(tools);
    }

    Ok(body)
}

// --- Response parsing ---

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    model: String,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize, Default)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize, Default)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

fn into_chat_response(api: ApiResponse) -> Result<ChatResponse, Error> {
    let choice = api.choices.into_iter().next().ok_or(Error::ProviderError {
        status: 0,
        message: "empty choices array in response".into(),
    })?;

    let mut content = Vec::new();

    if let Some(text) = choice.message.content
        && !text.is_empty()
    {
        content.push(ContentBlock::Text { text });
    }

    if let Some(tool_calls) = choice.message.tool_calls {
        for tc in tool_calls {
            let input: serde_json::Value = if tc.function.arguments.is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&tc.function.arguments).unwrap_or_else(|e| {
                    warn!(
                        tool = %tc.function.name,
                        error = %e,
                        "malformed tool arguments JSON, defaulting to empty object"
                    );
                    serde_json::json!({})
                })
            };
            content.push(ContentBlock::ToolUse {
                id: tc.id,
                name: tc.function.name,
                input,
            });
        }
    }

    let has_tool_calls = content
        .iter()
        .any(|c| matches!(c, ContentBlock::ToolUse { .. }));

    // Some gateways report "stop" even when tool calls are present.
    let stop_reason = match choice.finish_reason.as_deref() {
        Some("tool_calls") => StopReason::ToolUse,
        Some("stop") if has_tool_calls => StopReason::ToolUse,
        Some("stop") | None => StopReason::EndTurn,
        Some("length") => StopReason::MaxTokens,
        Some(other) => {
            warn!(finish_reason = other, "unknown finish_reason, treating as EndTurn");
            StopReason::EndTurn
        }
    };

    let usage = api.usage.map_or(Usage::default(), |u| Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
        cache_write_tokens: 0,
        cache_read_tokens: u.prompt_tokens_details.map_or(0, |d| d.cached_tokens),
    });

    Ok(ChatResponse {
        content,
        stop_reason,
        usage,
        model: api.model,
        raw_blocks: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{Message, ToolDefinition, ToolResult};
    use serde_json::json;

    #[test]
    fn tool_arguments_are_string_encoded_on_the_wire() {
        let messages = vec![Message {
            role: Role::Assistant,
            content: vec![ContentBlock::ToolUse {
                id: "c1".into(),
                name: "view".into(),
                input: json!({"path": "a.md"}),
            }],
            raw_content: None,
        }];
        let req = ChatRequest::new("sys", messages);
        let body = build_request_body("gpt-4o", &req).unwrap();

        let args = &body["messages"][1]["tool_calls"][0]["function"]["arguments"];
        assert!(args.is_string());
        let decoded: serde_json::Value = serde_json::from_str(args.as_str().unwrap()).unwrap();
        assert_eq!(decoded["path"], "a.md");
    }

    #[test]
    fn tool_results_become_tool_role_rows() {
        let messages = vec![Message::tool_results(vec![
            ToolResult::success("c1", "file contents"),
            ToolResult::error("c2", "boom"),
        ])];
        let req = ChatRequest::new("", messages);
        let body = build_request_body("gpt-4o", &req).unwrap();

        assert_eq!(body["messages"][0]["role"], "tool");
        assert_eq!(body["messages"][0]["tool_call_id"], "c1");
        assert_eq!(body["messages"][1]["content"], "[ERROR] boom");
    }

    #[test]
    fn tools_project_as_functions() {
        let mut req = ChatRequest::new("", vec![Message::user("hi")]);
        req.tools = vec![ToolDefinition {
            name: "bash".into(),
            description: "Run".into(),
            input_schema: json!({"type": "object"}),
        }];
        let body = build_request_body("gpt-4o", &req).unwrap();
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "bash");
    }

    #[test]
    fn parses_function_call_response() {
        let api: ApiResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "view", "arguments": "{\"path\": \"a.md\"}"},
                    }],
                },
                "finish_reason": "tool_calls",
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3,
                      "prompt_tokens_details": {"cached_tokens": 8}},
            "model": "gpt-4o",
        }))
        .unwrap();

        let response = into_chat_response(api).unwrap();
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        let calls = response.tool_calls();
        assert_eq!(calls[0].input["path"], "a.md");
        assert_eq!(response.usage.cache_read_tokens, 8);
    }

    #[test]
    fn stop_with_tool_calls_is_normalized_to_tool_use() {
        let api: ApiResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "c",
                        "function": {"name": "bash", "arguments": "{}"},
                    }],
                },
                "finish_reason": "stop",
            }],
            "model": "gpt-4o",
        }))
        .unwrap();
        let response = into_chat_response(api).unwrap();
        assert_eq!(response.stop_reason, StopReason::ToolUse);
    }

    #[test]
    fn malformed_arguments_default_to_empty_object() {
        let api: ApiResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "c",
                        "function": {"name": "bash", "arguments": "{not json"},
                    }],
                },
                "finish_reason": "tool_calls",
            }],
            "model": "gpt-4o",
        }))
        .unwrap();
        let response = into_chat_response(api).unwrap();
        assert_eq!(response.tool_calls()[0].input, json!({}));
    }

    #[test]
    fn empty_choices_is_provider_error() {
        let api: ApiResponse = serde_json::from_value(json!({
            "choices": [],
            "model": "gpt-4o",
        }))
        .unwrap();
        assert!(into_chat_response(api).is_err());
    }
}
