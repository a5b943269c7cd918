//! Checklist persistence: read and update the plan document inside the workspace.
//!
//! Every call goes back to disk. Updates are written immediately, one task at a time.

use thiserror::Error;
use tracing::{info, instrument};

use crate::core::checklist::{Checklist, ParseError, parse_checklist};
use crate::core::checklist_update::{CompletionUpdate, UpdateError, mark_complete};
use crate::io::sandbox::{SandboxError, Workspace};

#[derive(Debug, Error)]
pub enum ChecklistError {
    #[error("checklist {path} is malformed: {source}")]
    Parse {
        path: String,
        #[source]
        source: ParseError,
    },
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl ChecklistError {
    pub fn is_escape(&self) -> bool {
        matches!(self, ChecklistError::Sandbox(err) if err.is_escape())
    }
}

/// Raw text alongside its parsed form.
#[derive(Debug, Clone)]
pub struct LoadedChecklist {
    pub text: String,
    pub checklist: Checklist,
}

pub fn load_checklist(workspace: &Workspace, path: &str) -> Result<LoadedChecklist, ChecklistError> {
    let text = workspace.read(path)?;
    let checklist = parse_checklist(&text).map_err(|source| ChecklistError::Parse {
        path: path.to_string(),
        source,
    })?;
    Ok(LoadedChecklist { text, checklist })
}

/// Mark a task complete on disk and return the re-parsed checklist.
#[instrument(skip_all, fields(path, task = update.description))]
pub fn mark_task_complete(
    workspace: &Workspace,
    path: &str,
    update: &CompletionUpdate<'_>,
) -> Result<Checklist, ChecklistError> {
    let current = workspace.read(path)?;
    let updated = mark_complete(&current, update)?;
    let checklist = parse_checklist(&updated).map_err(|source| ChecklistError::Parse {
        path: path.to_string(),
        source,
    })?;
    if updated != current {
        workspace.write(path, &updated)?;
    }
    let (done, total) = checklist.top_level_progress();
    info!(done, total, "task marked complete");
    Ok(checklist)
}
