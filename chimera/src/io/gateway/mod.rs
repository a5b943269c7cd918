//! LLM gateway: one blocking chat call per model turn, backend chosen once.

pub mod anthropic;
pub mod openai;

use std::env;

use thiserror::Error;
use tracing::info;

use crate::core::types::{ChatRequest, ChatResponse};
use crate::io::config::{Backend, LlmConfig};

pub use anthropic::AnthropicGateway;
pub use openai::OpenAiGateway;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing API key: environment variable {env} is not set")]
    MissingApiKey { env: String },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("malformed response: {0}")]
    Decode(String),
}

/// A chat-completion backend with tool calling.
pub trait LlmGateway {
    fn chat(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, GatewayError>;
}

impl<G: LlmGateway + ?Sized> LlmGateway for Box<G> {
    fn chat(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, GatewayError> {
        (**self).chat(request)
    }
}

/// Construct the configured backend. The API key is read from `config.api_key_env`.
pub fn build_gateway(config: &LlmConfig) -> Result<Box<dyn LlmGateway>, GatewayError> {
    let api_key = env::var(&config.api_key_env)
        .ok()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| GatewayError::MissingApiKey {
            env: config.api_key_env.clone(),
        })?;
    info!(backend = ?config.backend, model = %config.model, "building gateway");
    let gateway: Box<dyn LlmGateway> = match config.backend {
        Backend::Anthropic => Box::new(AnthropicGateway::new(config, api_key)?),
        Backend::Openai => Box::new(OpenAiGateway::new(config, api_key)?),
    };
    Ok(gateway)
}

fn http_client(config: &LlmConfig) -> Result<reqwest::blocking::Client, GatewayError> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(config.request_timeout())
        .build()?)
}

fn check_status(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(GatewayError::Status {
        code: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_reported_by_variable_name() {
        let config = LlmConfig {
            api_key_env: "CHIMERA_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..LlmConfig::default()
        };
        match build_gateway(&config) {
            Err(GatewayError::MissingApiKey { env }) => {
                assert_eq!(env, "CHIMERA_TEST_KEY_THAT_IS_NEVER_SET");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected missing key error"),
        }
    }
}
