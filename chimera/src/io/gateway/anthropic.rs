//! Anthropic Messages API backend.

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::{GatewayError, LlmGateway, check_status, http_client};
use crate::core::types::{ChatRequest, ChatResponse, StopReason, ToolCall, Turn};
use crate::io::config::LlmConfig;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicGateway {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: Option<f32>,
}

impl AnthropicGateway {
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self, GatewayError> {
        Ok(Self {
            client: http_client(config)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

impl LlmGateway for AnthropicGateway {
    #[instrument(skip_all, fields(model = %self.model, turns = request.messages.len()))]
    fn chat(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, GatewayError> {
        let body = request_body(&self.model, self.temperature, request);
        let response = self
            .client
            .post(format!("{}/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()?;
        let response = check_status(response)?;
        let raw: Value = response.json()?;
        let parsed = parse_response(raw)?;
        debug!(
            input_tokens = parsed.input_tokens,
            output_tokens = parsed.output_tokens,
            tool_calls = parsed.tool_calls.len(),
            "anthropic response"
        );
        Ok(parsed)
    }
}

/// Build the JSON body. Tool results travel as `tool_result` blocks inside user
/// messages, and consecutive same-role entries are merged into one message.
pub(crate) fn request_body(model: &str, temperature: Option<f32>, request: &ChatRequest<'_>) -> Value {
    let mut messages: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for turn in request.messages {
        let (role, blocks) = match turn {
            Turn::User { content } => ("user", vec![json!({"type": "text", "text": content})]),
            Turn::ToolResult {
                call_id,
                content,
                is_error,
            } => (
                "user",
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": call_id,
                    "content": content,
                    "is_error": is_error,
                })],
            ),
            Turn::Assistant { text, tool_calls } => {
                let mut blocks = Vec::new();
                if !text.is_empty() {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                for call in tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                ("assistant", blocks)
            }
        };
        if blocks.is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => last_blocks.extend(blocks),
            _ => messages.push((role, blocks)),
        }
    }

    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "system": request.system_prompt,
        "messages": messages
            .into_iter()
            .map(|(role, content)| json!({"role": role, "content": content}))
            .collect::<Vec<_>>(),
    });
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                })
            })
            .collect();
    }
    if let Some(temperature) = temperature {
        body["temperature"] = json!(temperature);
    }
    body
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

pub(crate) fn parse_response(raw: Value) -> Result<ChatResponse, GatewayError> {
    let parsed: MessagesResponse =
        serde_json::from_value(raw).map_err(|e| GatewayError::Decode(e.to_string()))?;
    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in parsed.content {
        match block {
            ContentBlock::Text { text } => texts.push(text),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                name,
                arguments: input,
            }),
            ContentBlock::Other => {}
        }
    }
    let stop_reason = match parsed.stop_reason.as_deref() {
        Some("end_turn") | Some("stop_sequence") => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some(other) => StopReason::Other(other.to_string()),
        None => StopReason::Other("unknown".to_string()),
    };
    Ok(ChatResponse {
        text: texts.join("\n"),
        tool_calls,
        input_tokens: parsed.usage.input_tokens,
        output_tokens: parsed.usage.output_tokens,
        stop_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ToolSchema;

    #[test]
    fn tool_results_and_follow_up_merge_into_one_user_message() {
        let turns = vec![
            Turn::user("start"),
            Turn::Assistant {
                text: "reading".to_string(),
                tool_calls: vec![ToolCall {
                    id: "toolu_1".to_string(),
                    name: "read_file".to_string(),
                    arguments: json!({"path": "a.txt"}),
                }],
            },
            Turn::ToolResult {
                call_id: "toolu_1".to_string(),
                content: "hello".to_string(),
                is_error: false,
            },
            Turn::user("continue"),
        ];
        let tools = vec![ToolSchema {
            name: "read_file",
            description: "Read a file",
            input_schema: json!({"type": "object"}),
        }];
        let request = ChatRequest {
            system_prompt: "sys",
            messages: &turns,
            max_tokens: 100,
            tools: &tools,
        };
        let body = request_body("claude", None, &request);

        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"][1]["type"], "tool_use");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "toolu_1");
        assert_eq!(messages[2]["content"][1]["text"], "continue");
        assert_eq!(body["tools"][0]["name"], "read_file");
        assert_eq!(body["system"], "sys");
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn parses_text_tool_use_and_usage() {
        let raw = json!({
            "id": "msg_1",
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "Let me write it."},
                {"type": "tool_use", "id": "toolu_9", "name": "write_file",
                 "input": {"path": "x", "content": "y"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 120, "output_tokens": 30}
        });
        let response = parse_response(raw).expect("parse");
        assert_eq!(response.text, "Let me write it.");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].arguments["path"], "x");
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.total_tokens(), 150);
    }

    #[test]
    fn missing_usage_is_a_decode_error() {
        let raw = json!({"content": [], "stop_reason": "end_turn"});
        assert!(matches!(parse_response(raw), Err(GatewayError::Decode(_))));
    }
}
