//! Workspace sandbox: every file, shell and git operation the agent can perform.
//!
//! Paths are always interpreted relative to a fixed root. Anything that would
//! resolve outside it (`..` segments, absolute paths, symlinks) is rejected with
//! [`SandboxError::OutsideWorkspace`] before touching the filesystem.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::io::git::Git;
use crate::io::process::run_shell;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 100_000;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Path {path} is outside workspace")]
    OutsideWorkspace { path: String },
    #[error("File not found: {path}")]
    NotFound { path: String },
    #[error("'{path}' is a directory, not a file")]
    IsDirectory { path: String },
    #[error("File already exists: {path}. Use replace mode or write_file to modify it.")]
    AlreadyExists { path: String },
    #[error("old_text not found in {path}. Make sure to copy the exact text.")]
    MatchNotFound { path: String },
    #[error("old_text appears {count} times in {path}. Make it more specific to match exactly once.")]
    AmbiguousMatch { path: String, count: usize },
    #[error("{argument} is required for {operation}")]
    MissingArgument {
        argument: &'static str,
        operation: &'static str,
    },
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    /// Escapes are a security violation, not a recoverable tool mistake.
    pub fn is_escape(&self) -> bool {
        matches!(self, SandboxError::OutsideWorkspace { .. })
    }

    fn io(action: &'static str, path: &str, source: std::io::Error) -> Self {
        SandboxError::Io {
            action,
            path: path.to_string(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditMode {
    /// Create a new file; refuses to overwrite.
    Create,
    /// Replace exactly one occurrence of `old_text`.
    Replace,
}

impl EditMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" => Some(EditMode::Create),
            "replace" => Some(EditMode::Replace),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EditRequest<'a> {
    pub mode: EditMode,
    pub path: &'a str,
    pub old_text: Option<&'a str>,
    pub new_text: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Created,
    Replaced { removed: usize, inserted: usize },
}

/// Result of a shell command, serialized verbatim into the tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandReport {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    pub success: bool,
    pub timed_out: bool,
}

/// Result of a commit attempt. `sha` is only present when a commit was made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub success: bool,
    pub sha: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Sandboxed view of a workspace directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    command_timeout: Duration,
    output_limit_bytes: usize,
}

impl Workspace {
    /// Open (creating if needed) the workspace rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("create workspace {}", root.display()))?;
        let root = fs::canonicalize(root)
            .with_context(|| format!("canonicalize workspace {}", root.display()))?;
        Ok(Self {
            root,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        })
    }

    pub fn with_command_limits(mut self, timeout: Duration, output_limit_bytes: usize) -> Self {
        self.command_timeout = timeout;
        self.output_limit_bytes = output_limit_bytes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` against the root, rejecting anything that escapes it.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let outside = || SandboxError::OutsideWorkspace {
            path: path.to_string(),
        };
        let requested = Path::new(path);
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };

        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::Prefix(_) | Component::RootDir => normalized.push(component.as_os_str()),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(outside());
                    }
                }
                Component::Normal(part) => normalized.push(part),
            }
        }
        if !normalized.starts_with(&self.root) {
            warn!(path, "rejected path outside workspace");
            return Err(outside());
        }

        // Symlinks: the deepest existing ancestor must still canonicalize under the root.
        let existing = normalized
            .ancestors()
            .find(|p| fs::symlink_metadata(p).is_ok())
            .unwrap_or(&self.root);
        let canonical = fs::canonicalize(existing).map_err(|_| outside())?;
        if !canonical.starts_with(&self.root) {
            warn!(path, "rejected symlink escaping workspace");
            return Err(outside());
        }
        Ok(normalized)
    }

    pub fn read(&self, path: &str) -> Result<String, SandboxError> {
        let file = self.resolve(path)?;
        if file.is_dir() {
            return Err(SandboxError::IsDirectory {
                path: path.to_string(),
            });
        }
        if !file.exists() {
            return Err(SandboxError::NotFound {
                path: path.to_string(),
            });
        }
        fs::read_to_string(&file).map_err(|e| SandboxError::io("read", path, e))
    }

    pub fn exists(&self, path: &str) -> Result<bool, SandboxError> {
        Ok(self.resolve(path)?.exists())
    }

    /// Write `content`, creating parent directories. Readers never observe a partial file.
    pub fn write(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let file = self.resolve(path)?;
        if file.is_dir() {
            return Err(SandboxError::IsDirectory {
                path: path.to_string(),
            });
        }
        write_atomic(&file, content).map_err(|e| SandboxError::io("write", path, e))?;
        debug!(path, bytes = content.len(), "file written");
        Ok(())
    }

    /// Create a file or replace exactly one occurrence of a snippet.
    pub fn edit(&self, request: &EditRequest<'_>) -> Result<EditOutcome, SandboxError> {
        let path = request.path;
        let file = self.resolve(path)?;
        match request.mode {
            EditMode::Create => {
                if file.exists() {
                    return Err(SandboxError::AlreadyExists {
                        path: path.to_string(),
                    });
                }
                self.write(path, request.new_text.unwrap_or_default())?;
                Ok(EditOutcome::Created)
            }
            EditMode::Replace => {
                let old = request
                    .old_text
                    .filter(|s| !s.is_empty())
                    .ok_or(SandboxError::MissingArgument {
                        argument: "old_text",
                        operation: "replace",
                    })?;
                let new = request.new_text.unwrap_or_default();
                let content = self.read(path)?;
                match content.matches(old).count() {
                    0 => Err(SandboxError::MatchNotFound {
                        path: path.to_string(),
                    }),
                    1 => {
                        self.write(path, &content.replacen(old, new, 1))?;
                        Ok(EditOutcome::Replaced {
                            removed: old.len(),
                            inserted: new.len(),
                        })
                    }
                    count => Err(SandboxError::AmbiguousMatch {
                        path: path.to_string(),
                        count,
                    }),
                }
            }
        }
    }

    /// Run a shell command at the workspace root. A timeout is a failed report, not an error.
    #[instrument(skip_all, fields(timeout_secs = self.command_timeout.as_secs()))]
    pub fn run_command(&self, command: &str) -> Result<CommandReport> {
        let output = run_shell(
            command,
            &self.root,
            self.command_timeout,
            self.output_limit_bytes,
        )?;
        let mut stderr = output.stderr_lossy();
        if output.timed_out {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "Command timed out after {} seconds",
                self.command_timeout.as_secs()
            ));
        }
        Ok(CommandReport {
            stdout: output.stdout_lossy(),
            stderr,
            return_code: output.exit_code(),
            success: output.success(),
            timed_out: output.timed_out,
        })
    }

    /// Stage everything and commit. Failures (including "nothing to commit") are
    /// reported through [`CommitReport::success`].
    #[instrument(skip_all)]
    pub fn commit(&self, message: &str) -> CommitReport {
        let git = Git::new(&self.root);
        let failed = |detail: String| CommitReport {
            success: false,
            sha: None,
            message: message.to_string(),
            detail: Some(detail),
        };
        if let Err(err) = git.add_all() {
            return failed(format!("{err:#}"));
        }
        match git.commit_staged(message) {
            Ok(true) => {
                let sha = match git.head_short_sha() {
                    Ok(sha) => Some(sha),
                    Err(err) => {
                        warn!(err = %err, "commit succeeded but HEAD sha unavailable");
                        None
                    }
                };
                CommitReport {
                    success: true,
                    sha,
                    message: message.to_string(),
                    detail: None,
                }
            }
            Ok(false) => failed("nothing to commit".to_string()),
            Err(err) => failed(format!("{err:#}")),
        }
    }
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".chimera.tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)
}
