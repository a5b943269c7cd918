//! Agent configuration stored in `chimera.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "chimera.toml";

/// Agent configuration (TOML).
///
/// Every section is optional; missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AgentConfig {
    pub workspace: WorkspaceConfig,
    pub llm: LlmConfig,
    pub context: ContextConfig,
    pub execution: ExecutionConfig,
    pub prompts: PromptsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Root the agent is confined to.
    pub directory: PathBuf,
    /// Checklist path, relative to the workspace root.
    pub checklist: String,
    /// Specification the planner reads, relative to the workspace root.
    pub spec: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            checklist: "instructions/plan.md".to_string(),
            spec: "spec.md".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Anthropic,
    /// Any OpenAI-compatible chat completions endpoint.
    Openai,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: Backend,
    pub model: String,
    /// Overrides the backend's default API base URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable that holds the API key.
    pub api_key_env: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Anthropic,
            model: "claude-sonnet-4-5".to_string(),
            base_url: None,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            max_tokens: 8000,
            temperature: None,
            request_timeout_secs: 600,
        }
    }
}

impl LlmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContextConfig {
    /// Rotate once this share of `max_context` has been consumed.
    pub threshold_percentage: f64,
    pub max_context: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            threshold_percentage: 10.0,
            max_context: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Outer driver steps per run.
    pub max_iterations: u32,
    /// Model turns per worker step.
    pub max_tool_turns: u32,
    pub planner_max_turns: u32,
    pub command_timeout_secs: u64,
    /// Truncate command stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_tool_turns: 1000,
            planner_max_turns: 10,
            command_timeout_secs: 30,
            output_limit_bytes: 100_000,
        }
    }
}

impl ExecutionConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Optional system prompt overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PromptsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planner: Option<PathBuf>,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        let ctx = &self.context;
        if !(ctx.threshold_percentage > 0.0 && ctx.threshold_percentage <= 100.0) {
            return Err(anyhow!(
                "context.threshold_percentage must be in (0, 100], got {}",
                ctx.threshold_percentage
            ));
        }
        if ctx.max_context == 0 {
            return Err(anyhow!("context.max_context must be > 0"));
        }
        let threshold = (ctx.max_context as f64 * ctx.threshold_percentage / 100.0).floor();
        if threshold < 1.0 {
            return Err(anyhow!(
                "context threshold rounds down to 0 tokens; raise max_context or threshold_percentage"
            ));
        }
        if self.llm.model.trim().is_empty() {
            return Err(anyhow!("llm.model must not be empty"));
        }
        if self.llm.max_tokens == 0 {
            return Err(anyhow!("llm.max_tokens must be > 0"));
        }
        if self.llm.request_timeout_secs == 0 {
            return Err(anyhow!("llm.request_timeout_secs must be > 0"));
        }
        if self.llm.api_key_env.trim().is_empty() {
            return Err(anyhow!("llm.api_key_env must not be empty"));
        }
        let exec = &self.execution;
        if exec.max_iterations == 0 {
            return Err(anyhow!("execution.max_iterations must be > 0"));
        }
        if exec.max_tool_turns == 0 {
            return Err(anyhow!("execution.max_tool_turns must be > 0"));
        }
        if exec.planner_max_turns == 0 {
            return Err(anyhow!("execution.planner_max_turns must be > 0"));
        }
        if exec.command_timeout_secs == 0 {
            return Err(anyhow!("execution.command_timeout_secs must be > 0"));
        }
        if exec.output_limit_bytes == 0 {
            return Err(anyhow!("execution.output_limit_bytes must be > 0"));
        }
        if self.workspace.checklist.trim().is_empty() {
            return Err(anyhow!("workspace.checklist must not be empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
