//! Test-only helpers: a scripted gateway, canned replies, fixtures.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::core::types::{ChatRequest, ChatResponse, StopReason, ToolCall, Turn};
use crate::io::gateway::{GatewayError, LlmGateway};

/// Two top-level tasks in one phase; the first has a sub-task.
pub const SAMPLE_CHECKLIST: &str = "---\nstatus: incomplete\n---\n# Project Plan\n\n### Phase 1: Core\n> Build the core feature.\n- [ ] Implement feature X\n  - [ ] Add parser\n- [ ] Write docs\n";

/// What the gateway was asked, captured per call.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub system_prompt: String,
    pub messages: Vec<Turn>,
    pub tool_names: Vec<String>,
}

/// Replays canned responses in order and records every request.
///
/// Tool calls with an empty id get `call_<reply>_<index>`. Once the script is
/// exhausted every call fails.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    replies: Mutex<VecDeque<ChatResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedGateway {
    pub fn new(replies: Vec<ChatResponse>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }
}

impl LlmGateway for ScriptedGateway {
    fn chat(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, GatewayError> {
        let served = {
            let mut requests = self.requests.lock().expect("requests lock");
            requests.push(RecordedRequest {
                system_prompt: request.system_prompt.to_string(),
                messages: request.messages.to_vec(),
                tool_names: request.tools.iter().map(|t| t.name.to_string()).collect(),
            });
            requests.len() - 1
        };
        let mut reply = self
            .replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .ok_or_else(|| GatewayError::Decode("scripted gateway exhausted".to_string()))?;
        for (i, call) in reply.tool_calls.iter_mut().enumerate() {
            if call.id.is_empty() {
                call.id = format!("call_{served}_{i}");
            }
        }
        Ok(reply)
    }
}

/// Text-only reply costing `tokens` input tokens.
pub fn reply(text: &str, stop_reason: StopReason, tokens: u64) -> ChatResponse {
    ChatResponse {
        text: text.to_string(),
        tool_calls: Vec::new(),
        input_tokens: tokens,
        output_tokens: 0,
        stop_reason,
    }
}

/// Reply requesting tool calls, costing 10 tokens.
pub fn tool_reply(text: &str, calls: Vec<(&str, Value)>) -> ChatResponse {
    ChatResponse {
        text: text.to_string(),
        tool_calls: calls
            .into_iter()
            .map(|(name, arguments)| ToolCall {
                id: String::new(),
                name: name.to_string(),
                arguments,
            })
            .collect(),
        input_tokens: 10,
        output_tokens: 0,
        stop_reason: StopReason::ToolUse,
    }
}

pub fn with_tokens(mut response: ChatResponse, input_tokens: u64) -> ChatResponse {
    response.input_tokens = input_tokens;
    response
}

/// `git init` with a local identity so commits work on bare CI machines.
pub fn init_git_repo(path: &Path) -> Result<()> {
    for args in [
        &["init", "--quiet"][..],
        &["config", "user.email", "agent@example.com"][..],
        &["config", "user.name", "Agent"][..],
        &["config", "commit.gpgsign", "false"][..],
    ] {
        let status = Command::new("git").args(args).current_dir(path).status()?;
        if !status.success() {
            return Err(anyhow!("git {} failed", args.join(" ")));
        }
    }
    Ok(())
}
