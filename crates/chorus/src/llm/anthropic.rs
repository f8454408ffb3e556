//! Block-structured wire adapter (Anthropic Messages API).
//!
//! Requests carry `cache_control: {"type": "ephemeral"}` markers on the
//! system prompt block and the trailing tool definition when caching is
//! requested, so the static prefix is reused across loop iterations.

use reqwest::Client;
use serde::Deserialize;
use tracing::warn;

use crate::error::Error;
use crate::llm::LlmProvider;
use crate::llm::types::{
    ChatRequest, ChatResponse, ContentBlock, Role, StopReason, Usage,
};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

impl LlmProvider for AnthropicProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, Error> {
        let body = build_request_body(&self.model, &request)?;

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            // Sanitize auth failures so key fragments never reach logs
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
        Ok(into_chat_response(api_response))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn build_request_body(model: &str, request: &ChatRequest) -> Result<serde_json::Value, Error> {
    let messages: Vec<serde_json::Value> = request
        .messages
        .iter()
        .map(|m| {
            let content = match &m.raw_content {
                Some(raw) => raw.clone(),
                None => serde_json::to_value(&m.content).expect("content serializes"),
            };
            serde_json::json!({
                "role": match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                "content": content,
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "messages": messages,
    });

    if !request.system.is_empty() {
        body["system"] = if request.cache {
            serde_json::json!([{
                "type": "text",
                "text": request.system,
                "cache_control": {"type": "ephemeral"},
            }])
        } else {
            serde_json::Value::String(request.system.clone())
        };
    }

    if !request.tools.is_empty() {
        let mut tools: Vec<serde_json::Value> = request
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        if request.cache {
            // The tool list is part of the static prefix; marking the last
            // definition caches everything up to and including it.
            if let Some(last) = tools.last_mut() {
                last["cache_control"] = serde_json::json!({"type": "ephemeral"});
            }
        }
        body["tools"] = serde_json::Value::Array(tools);
    }

    Ok(body)
}

// --- API response types ---

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    stop_reason: Option<String>,
    usage: ApiUsage,
    model: String,
}

#[derive(Deserialize)]
struct ApiContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<serde_json::Value>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

fn into_chat_response(api: ApiResponse) -> ChatResponse {
    let mut content = Vec::new();
    let mut has_server_blocks = false;

    for block in &api.content {
        match block.block_type.as_str() {
            "text" => {
                content.push(ContentBlock::Text {
                    text: block.text.clone().unwrap_or_default(),
                });
            }
            "tool_use" => {
                content.push(ContentBlock::ToolUse {
                    id: block.id.clone().unwrap_or_default(),
                    name: block.name.clone().unwrap_or_default(),
                    input: block.input.clone().unwrap_or(serde_json::Value::Null),
                });
            }
            "server_tool_use" | "web_search_tool_result" => {
                has_server_blocks = true;
            }
            other => {
                warn!(block_type = other, "unknown content block type, skipping");
            }
        }
    }

    // When the vendor executed tools server-side, keep the raw blocks so
    // the next request can replay them verbatim.
    let raw_blocks = has_server_blocks.then(|| {
        serde_json::Value::Array(
            api.content
                .iter()
                .map(|b| {
                    let mut obj = b.rest.clone();
                    obj.insert("type".into(), b.block_type.clone().into());
                    if let Some(text) = &b.text {
                        obj.insert("text".into(), text.clone().into());
                    }
                    if let Some(id) = &b.id {
                        obj.insert("id".into(), id.clone().into());
                    }
                    if let Some(name) = &b.name {
                        obj.insert("name".into(), name.clone().into());
                    }
                    if let Some(input) = &b.input {
                        obj.insert("input".into(), input.clone());
                    }
                    serde_json::Value::Object(obj)
                })
                .collect(),
        )
    });

    ChatResponse {
        content,
        stop_reason: parse_stop_reason(api.stop_reason.as_deref()),
        usage: Usage {
            input_tokens: api.usage.input_tokens,
            output_tokens: api.usage.output_tokens,
            cache_write_tokens: api.usage.cache_creation_input_tokens.unwrap_or(0),
            cache_read_tokens: api.usage.cache_read_input_tokens.unwrap_or(0),
        },
        model: api.model,
        raw_blocks,
    }
}

fn parse_stop_reason(s: Option<&str>) -> StopReason {
    match s {
        Some("end_turn") | None => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some(other) => {
            warn!(stop_reason = other, "unknown stop_reason, treating as EndTurn");
            StopReason::EndTurn
        }
    }
}
