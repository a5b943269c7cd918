//! OpenAI-compatible chat completions backend (OpenAI, NVIDIA NIM, vLLM, Ollama).

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use super::{GatewayError, LlmGateway, check_status, http_client};
use crate::core::types::{ChatRequest, ChatResponse, StopReason, ToolCall, Turn};
use crate::io::config::LlmConfig;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiGateway {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: Option<f32>,
}

impl OpenAiGateway {
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

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

impl LlmGateway for OpenAiGateway {
    #[instrument(skip_all, fields(model = %self.model, turns = request.messages.len()))]
    fn chat(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, GatewayError> {
        let body = request_body(&self.model, self.temperature, request);
        let response = self
            .client
            .post(self.chat_completions_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()?;
        let response = check_status(response)?;
        let raw: Value = response.json()?;
        let parsed = parse_response(raw)?;
        debug!(
            input_tokens = parsed.input_tokens,
            output_tokens = parsed.output_tokens,
            tool_calls = parsed.tool_calls.len(),
            "openai response"
        );
        Ok(parsed)
    }
}

pub(crate) fn request_body(model: &str, temperature: Option<f32>, request: &ChatRequest<'_>) -> Value {
    let mut messages = vec![json!({"role": "system", "content": request.system_prompt})];
    for turn in request.messages {
        messages.push(match turn {
            Turn::User { content } => json!({"role": "user", "content": content}),
            Turn::Assistant { text, tool_calls } => {
                let mut message = json!({
                    "role": "assistant",
                    "content": if text.is_empty() { Value::Null } else { json!(text) },
                });
                if !tool_calls.is_empty() {
                    message["tool_calls"] = tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments.to_string(),
                                },
                            })
                        })
                        .collect();
                }
                message
            }
            Turn::ToolResult {
                call_id, content, ..
            } => json!({"role": "tool", "tool_call_id": call_id, "content": content}),
        });
    }

    let mut body = json!({
        "model": model,
        "messages": messages,
        "max_tokens": request.max_tokens,
    });
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    },
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
struct CompletionResponse {
    choices: Vec<Choice>,
    usage: Option<UsageResponse>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageResponse,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallResponse>,
}

#[derive(Debug, Deserialize)]
struct ToolCallResponse {
    id: String,
    function: FunctionResponse,
}

#[derive(Debug, Deserialize)]
struct FunctionResponse {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct UsageResponse {
    prompt_tokens: u64,
    completion_tokens: u64,
}

pub(crate) fn parse_response(raw: Value) -> Result<ChatResponse, GatewayError> {
    let parsed: CompletionResponse =
        serde_json::from_value(raw).map_err(|e| GatewayError::Decode(e.to_string()))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::Decode("no choices in response".to_string()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|call| {
            // Unparseable arguments are kept as a string so schema validation reports them.
            let arguments = serde_json::from_str(&call.function.arguments).unwrap_or_else(|err| {
                warn!(err = %err, tool = %call.function.name, "tool arguments are not valid JSON");
                Value::String(call.function.arguments.clone())
            });
            ToolCall {
                id: call.id,
                name: call.function.name,
                arguments,
            }
        })
        .collect();

    let stop_reason = match choice.finish_reason.as_deref() {
        Some("stop") => StopReason::EndTurn,
        Some("tool_calls") | Some("function_call") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        Some(other) => StopReason::Other(other.to_string()),
        None => StopReason::Other("unknown".to_string()),
    };
    let (input_tokens, output_tokens) = parsed
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();

    Ok(ChatResponse {
        text: choice.message.content.unwrap_or_default(),
        tool_calls,
        input_tokens,
        output_tokens,
        stop_reason,
    })
}
