//! Tool executor: the name → operation table the model drives.
//!
//! Every outcome the model should react to (bad path, missing file, ambiguous
//! edit, failing command, unknown tool) comes back as a [`ToolResult`]. Only a
//! workspace escape is returned as an error, because it ends the session.

use std::collections::HashMap;

use anyhow::{Result, anyhow};
use jsonschema::Validator;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::core::checklist_update::CompletionUpdate;
use crate::core::types::{ToolCall, ToolSchema};
use crate::io::checklist_store::{ChecklistError, mark_task_complete};
use crate::io::sandbox::{EditMode, EditOutcome, EditRequest, SandboxError, Workspace};

pub const READ_FILE: &str = "read_file";
pub const WRITE_FILE: &str = "write_file";
pub const EDIT_FILE: &str = "edit_file";
pub const RUN_COMMAND: &str = "run_command";
pub const GIT_COMMIT: &str = "git_commit";
pub const UPDATE_CHECKLIST: &str = "update_checklist";

pub const WORKER_TOOLS: &[&str] = &[
    READ_FILE,
    WRITE_FILE,
    EDIT_FILE,
    RUN_COMMAND,
    GIT_COMMIT,
    UPDATE_CHECKLIST,
];
pub const PLANNER_TOOLS: &[&str] = &[READ_FILE, WRITE_FILE];

/// Outcome of one tool call. Both variants are shown to the model as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolResult {
    Success(String),
    Failure(String),
}

impl ToolResult {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolResult::Failure(_))
    }

    pub fn content(&self) -> &str {
        match self {
            ToolResult::Success(text) | ToolResult::Failure(text) => text,
        }
    }

    pub fn into_content(self) -> String {
        match self {
            ToolResult::Success(text) | ToolResult::Failure(text) => text,
        }
    }
}

/// A tool call tried to reach outside the workspace.
#[derive(Debug, Error)]
#[error("{tool} rejected: {source}")]
pub struct WorkspaceEscape {
    pub tool: String,
    #[source]
    pub source: SandboxError,
}

#[derive(Debug, Deserialize)]
struct PathArgs {
    path: String,
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct EditArgs {
    mode: String,
    path: String,
    old_text: Option<String>,
    new_text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommandArgs {
    command: String,
}

#[derive(Debug, Deserialize)]
struct CommitArgs {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ChecklistArgs {
    checklist_path: String,
    task_description: String,
    proof: String,
    commit_ref: Option<String>,
}

/// Declared interface of a known tool.
pub fn tool_schema(name: &str) -> Option<ToolSchema> {
    let path = json!({"type": "string", "description": "Path relative to the workspace root"});
    let schema = match name {
        READ_FILE => ToolSchema {
            name: READ_FILE,
            description: "Read the full contents of a file in the workspace.",
            input_schema: json!({
                "type": "object",
                "properties": {"path": path},
                "required": ["path"],
            }),
        },
        WRITE_FILE => ToolSchema {
            name: WRITE_FILE,
            description: "Write or overwrite a file in the workspace, creating parent directories.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": path,
                    "content": {"type": "string", "description": "Full file contents"},
                },
                "required": ["path", "content"],
            }),
        },
        EDIT_FILE => ToolSchema {
            name: EDIT_FILE,
            description: "Create a new file, or replace one exact snippet in an existing file. \
                          'replace' requires old_text to occur exactly once.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "mode": {"type": "string", "enum": ["create", "replace"]},
                    "path": path,
                    "old_text": {"type": "string", "description": "Exact text to replace (replace mode)"},
                    "new_text": {"type": "string", "description": "Replacement text, or file contents for create"},
                },
                "required": ["mode", "path"],
            }),
        },
        RUN_COMMAND => ToolSchema {
            name: RUN_COMMAND,
            description: "Run a shell command at the workspace root. Returns stdout, stderr and the exit code.",
            input_schema: json!({
                "type": "object",
                "properties": {"command": {"type": "string"}},
                "required": ["command"],
            }),
        },
        GIT_COMMIT => ToolSchema {
            name: GIT_COMMIT,
            description: "Stage all changes and create a git commit. Returns the short sha.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string", "description": "Conventional Commits message"},
                },
                "required": ["message"],
            }),
        },
        UPDATE_CHECKLIST => ToolSchema {
            name: UPDATE_CHECKLIST,
            description: "Mark a checklist task complete with proof of completion.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "checklist_path": path,
                    "task_description": {"type": "string", "description": "Text of the task to mark complete"},
                    "proof": {"type": "string", "description": "Evidence the task is done"},
                    "commit_ref": {"type": "string", "description": "Commit sha for this task"},
                },
                "required": ["checklist_path", "task_description", "proof"],
            }),
        },
        _ => return None,
    };
    Some(schema)
}

/// Dispatches tool calls against one workspace.
pub struct ToolExecutor {
    workspace: Workspace,
    schemas: Vec<ToolSchema>,
    validators: HashMap<&'static str, Validator>,
}

impl ToolExecutor {
    pub fn worker(workspace: Workspace) -> Result<Self> {
        Self::with_tools(workspace, WORKER_TOOLS)
    }

    /// Read and write only.
    pub fn planner(workspace: Workspace) -> Result<Self> {
        Self::with_tools(workspace, PLANNER_TOOLS)
    }

    fn with_tools(workspace: Workspace, names: &[&str]) -> Result<Self> {
        let mut schemas = Vec::with_capacity(names.len());
        let mut validators = HashMap::new();
        for name in names {
            let schema = tool_schema(name).ok_or_else(|| anyhow!("unknown tool {name}"))?;
            let validator = jsonschema::validator_for(&schema.input_schema)
                .map_err(|err| anyhow!("invalid schema for {name}: {err}"))?;
            validators.insert(schema.name, validator);
            schemas.push(schema);
        }
        Ok(Self {
            workspace,
            schemas,
            validators,
        })
    }

    pub fn schemas(&self) -> &[ToolSchema] {
        &self.schemas
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    fn tool_names(&self) -> Vec<&'static str> {
        self.schemas.iter().map(|s| s.name).collect()
    }

    #[instrument(skip_all, fields(tool = %call.name, call_id = %call.id))]
    pub fn execute(&self, call: &ToolCall) -> Result<ToolResult, WorkspaceEscape> {
        let Some(validator) = self.validators.get(call.name.as_str()) else {
            warn!("unknown tool requested");
            return Ok(ToolResult::Failure(format!(
                "Error: Unknown tool '{}'. Available tools: {}",
                call.name,
                self.tool_names().join(", ")
            )));
        };
        let violations: Vec<String> = validator
            .iter_errors(&call.arguments)
            .map(|err| err.to_string())
            .collect();
        if !violations.is_empty() {
            warn!(violations = violations.len(), "tool arguments rejected");
            return Ok(ToolResult::Failure(format!(
                "Error: invalid arguments for {}:\n- {}",
                call.name,
                violations.join("\n- ")
            )));
        }

        let result = match call.name.as_str() {
            READ_FILE => self.read_file(call),
            WRITE_FILE => self.write_file(call),
            EDIT_FILE => self.edit_file(call),
            RUN_COMMAND => self.run_command(call),
            GIT_COMMIT => self.git_commit(call),
            UPDATE_CHECKLIST => self.update_checklist(call),
            _ => unreachable!("validators only exist for dispatchable tools"),
        }?;
        info!(is_error = result.is_error(), bytes = result.content().len(), "tool finished");
        Ok(result)
    }

    fn read_file(&self, call: &ToolCall) -> Result<ToolResult, WorkspaceEscape> {
        let args: PathArgs = match parse_args(call) {
            Ok(args) => args,
            Err(failure) => return Ok(failure),
        };
        match self.workspace.read(&args.path) {
            Ok(content) => Ok(ToolResult::Success(content)),
            Err(err) => sandbox_failure(call, err),
        }
    }

    fn write_file(&self, call: &ToolCall) -> Result<ToolResult, WorkspaceEscape> {
        let args: WriteArgs = match parse_args(call) {
            Ok(args) => args,
            Err(failure) => return Ok(failure),
        };
        match self.workspace.write(&args.path, &args.content) {
            Ok(()) => Ok(ToolResult::Success(format!(
                "Successfully wrote {} bytes to {}",
                args.content.len(),
                args.path
            ))),
            Err(err) => sandbox_failure(call, err),
        }
    }

    fn edit_file(&self, call: &ToolCall) -> Result<ToolResult, WorkspaceEscape> {
        let args: EditArgs = match parse_args(call) {
            Ok(args) => args,
            Err(failure) => return Ok(failure),
        };
        let Some(mode) = EditMode::parse(&args.mode) else {
            return Ok(ToolResult::Failure(format!(
                "Error: unknown edit mode '{}'. Use 'create' or 'replace'.",
                args.mode
            )));
        };
        let request = EditRequest {
            mode,
            path: &args.path,
            old_text: args.old_text.as_deref(),
            new_text: args.new_text.as_deref(),
        };
        match self.workspace.edit(&request) {
            Ok(EditOutcome::Created) => Ok(ToolResult::Success(format!("Created {}", args.path))),
            Ok(EditOutcome::Replaced { removed, inserted }) => Ok(ToolResult::Success(format!(
                "Replaced {removed} bytes with {inserted} bytes in {}",
                args.path
            ))),
            Err(err) => sandbox_failure(call, err),
        }
    }

    fn run_command(&self, call: &ToolCall) -> Result<ToolResult, WorkspaceEscape> {
        let args: CommandArgs = match parse_args(call) {
            Ok(args) => args,
            Err(failure) => return Ok(failure),
        };
        let report = match self.workspace.run_command(&args.command) {
            Ok(report) => report,
            Err(err) => {
                return Ok(ToolResult::Failure(format!(
                    "Error executing {}: {err:#}",
                    call.name
                )));
            }
        };
        let text = to_pretty_json(&report);
        Ok(if report.success {
            ToolResult::Success(text)
        } else {
            ToolResult::Failure(text)
        })
    }

    fn git_commit(&self, call: &ToolCall) -> Result<ToolResult, WorkspaceEscape> {
        let args: CommitArgs = match parse_args(call) {
            Ok(args) => args,
            Err(failure) => return Ok(failure),
        };
        let report = self.workspace.commit(&args.message);
        let text = to_pretty_json(&report);
        Ok(if report.success {
            ToolResult::Success(text)
        } else {
            ToolResult::Failure(text)
        })
    }

    fn update_checklist(&self, call: &ToolCall) -> Result<ToolResult, WorkspaceEscape> {
        let args: ChecklistArgs = match parse_args(call) {
            Ok(args) => args,
            Err(failure) => return Ok(failure),
        };
        let update = CompletionUpdate {
            description: &args.task_description,
            proof: &args.proof,
            commit_ref: args.commit_ref.as_deref().filter(|s| !s.trim().is_empty()),
        };
        match mark_task_complete(&self.workspace, &args.checklist_path, &update) {
            Ok(checklist) => {
                let (done, total) = checklist.top_level_progress();
                Ok(ToolResult::Success(format!(
                    "Marked '{}' complete in {} ({done}/{total} top-level tasks complete)",
                    args.task_description, args.checklist_path
                )))
            }
            Err(ChecklistError::Sandbox(err)) => sandbox_failure(call, err),
            Err(err) => Ok(ToolResult::Failure(format!("Error: {err}"))),
        }
    }
}

fn parse_args<T: DeserializeOwned>(call: &ToolCall) -> Result<T, ToolResult> {
    serde_json::from_value(call.arguments.clone()).map_err(|err| {
        ToolResult::Failure(format!("Error: invalid arguments for {}: {err}", call.name))
    })
}

fn sandbox_failure(call: &ToolCall, err: SandboxError) -> Result<ToolResult, WorkspaceEscape> {
    if err.is_escape() {
        warn!(err = %err, "workspace escape attempt");
        return Err(WorkspaceEscape {
            tool: call.name.clone(),
            source: err,
        });
    }
    Ok(ToolResult::Failure(format!("Error: {err}")))
}

fn to_pretty_json(value: &impl serde::Serialize) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|err| format!("{{\"error\": \"{err}\"}}"))
}
