//! Typed checklist model and line-oriented parser.
//!
//! A checklist document is markdown with an optional `---` front-matter block,
//! `### Phase <n>: <name>` headers, and `- [ ]` / `- [x]` task lines at any
//! indentation. Parsing is strict: anything that looks like a header or a
//! checkbox but does not match the grammar is reported, never skipped.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Front-matter status used when the document does not declare one.
pub const DEFAULT_STATUS: &str = "incomplete";

/// Prefix of the annotation line placed under a completed task.
pub const PROOF_PREFIX: &str = "- Proof:";

static PHASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^###\s+Phase\s+(\d+):\s+(.+?)\s*$").unwrap());
static TASK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)- \[([ xX])\]\s+(.+?)\s*$").unwrap());
static COMMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\(commit:\s*([^)]*?)\s*\)\s*$").unwrap());
static STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*status:\s*(\S+)").unwrap());

/// Structured parse failure. Line numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("line {line}: front matter opened but never closed")]
    UnterminatedFrontMatter { line: usize },
    #[error("line {line}: malformed phase header '{text}' (expected '### Phase <n>: <name>')")]
    MalformedPhaseHeader { line: usize, text: String },
    #[error("line {line}: malformed task '{text}' (expected '- [ ] <text>' or '- [x] <text>')")]
    MalformedTask { line: usize, text: String },
    #[error("line {line}: task appears before any phase header")]
    TaskOutsidePhase { line: usize },
}

/// One checkbox line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Task text without the checkbox and without a trailing commit annotation.
    pub description: String,
    pub complete: bool,
    /// Leading whitespace width; 0 marks a top-level task.
    pub indent: usize,
    /// 0-based line index in the source document.
    pub line: usize,
    pub proof: Option<String>,
    pub commit: Option<String>,
}

impl Task {
    pub fn is_top_level(&self) -> bool {
        self.indent == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub number: u32,
    pub name: String,
    pub description: Option<String>,
    pub tasks: Vec<Task>,
}

/// Parsed checklist document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checklist {
    pub status: String,
    pub phases: Vec<Phase>,
}

/// First incomplete top-level task, with the phase it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextTask<'a> {
    pub phase: &'a Phase,
    pub task: &'a Task,
}

impl Checklist {
    /// True iff every indentation-0 task across all phases is checked.
    ///
    /// Sub-tasks never gate completion. A checklist without top-level tasks is
    /// complete.
    pub fn top_level_complete(&self) -> bool {
        self.tasks().filter(|t| t.is_top_level()).all(|t| t.complete)
    }

    /// First incomplete top-level task in phase order.
    pub fn next_task(&self) -> Option<NextTask<'_>> {
        self.phases.iter().find_map(|phase| {
            phase
                .tasks
                .iter()
                .find(|t| t.is_top_level() && !t.complete)
                .map(|task| NextTask { phase, task })
        })
    }

    /// All tasks in document order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.phases.iter().flat_map(|p| p.tasks.iter())
    }

    /// `(completed, total)` over top-level tasks.
    pub fn top_level_progress(&self) -> (usize, usize) {
        let top: Vec<&Task> = self.tasks().filter(|t| t.is_top_level()).collect();
        let done = top.iter().filter(|t| t.complete).count();
        (done, top.len())
    }
}

/// A task line split into its parts, shared by the parser and the updater.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TaskLine<'a> {
    pub indent: &'a str,
    pub complete: bool,
    pub text: &'a str,
}

pub(crate) fn match_task_line(line: &str) -> Option<TaskLine<'_>> {
    let caps = TASK_RE.captures(line)?;
    Some(TaskLine {
        indent: caps.get(1).map_or("", |m| m.as_str()),
        complete: caps.get(2).is_some_and(|m| m.as_str() != " "),
        text: caps.get(3).map_or("", |m| m.as_str()),
    })
}

/// True for `- Proof: ...` lines nested deeper than `task_indent`.
pub(crate) fn is_proof_line(line: &str, task_indent: usize) -> bool {
    let trimmed = line.trim_start();
    let indent = line.len() - trimmed.len();
    indent > task_indent && trimmed.starts_with(PROOF_PREFIX)
}

fn looks_like_phase_header(line: &str) -> bool {
    line.trim_start()
        .strip_prefix("### Phase")
        .is_some_and(|rest| rest.starts_with(char::is_whitespace))
}

fn looks_like_task(line: &str) -> bool {
    line.trim_start().starts_with("- [")
}

/// Split `text (commit: abc)` into `("text", Some("abc"))`.
fn split_commit(text: &str) -> (String, Option<String>) {
    match COMMIT_RE.captures(text) {
        Some(caps) => {
            let whole = caps.get(0).map_or(text.len(), |m| m.start());
            let sha = caps
                .get(1)
                .map(|m| m.as_str().to_string())
                .filter(|s| !s.is_empty());
            (text[..whole].trim_end().to_string(), sha)
        }
        None => (text.to_string(), None),
    }
}

/// Parse a checklist document.
pub fn parse_checklist(document: &str) -> Result<Checklist, ParseError> {
    let lines: Vec<&str> = document.lines().collect();
    let mut status = DEFAULT_STATUS.to_string();
    let mut idx = 0;

    if lines.first().is_some_and(|l| l.trim() == "---") {
        let close = lines
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, l)| l.trim() == "---")
            .map(|(i, _)| i)
            .ok_or(ParseError::UnterminatedFrontMatter { line: 1 })?;
        if let Some(caps) = lines[1..close].iter().find_map(|l| STATUS_RE.captures(l)) {
            status = caps[1].to_string();
        }
        idx = close + 1;
    }

    let mut phases: Vec<Phase> = Vec::new();
    while idx < lines.len() {
        let line = lines[idx];

        if looks_like_phase_header(line) {
            let caps = PHASE_RE
                .captures(line.trim_start())
                .ok_or_else(|| ParseError::MalformedPhaseHeader {
                    line: idx + 1,
                    text: line.trim().to_string(),
                })?;
            let number = caps[1]
                .parse::<u32>()
                .map_err(|_| ParseError::MalformedPhaseHeader {
                    line: idx + 1,
                    text: line.trim().to_string(),
                })?;
            let description = lines
                .get(idx + 1)
                .and_then(|next| next.trim_start().strip_prefix('>'))
                .map(|d| d.trim().to_string());
            if description.is_some() {
                idx += 1;
            }
            phases.push(Phase {
                number,
                name: caps[2].to_string(),
                description,
                tasks: Vec::new(),
            });
        } else if looks_like_task(line) {
            let parsed = match_task_line(line).ok_or_else(|| ParseError::MalformedTask {
                line: idx + 1,
                text: line.trim().to_string(),
            })?;
            let phase = phases
                .last_mut()
                .ok_or(ParseError::TaskOutsidePhase { line: idx + 1 })?;
            let indent = parsed.indent.len();
            let proof = lines
                .get(idx + 1)
                .filter(|next| is_proof_line(next, indent))
                .map(|next| next.trim_start()[PROOF_PREFIX.len()..].trim().to_string());
            let (description, commit) = split_commit(parsed.text);
            phase.tasks.push(Task {
                description,
                complete: parsed.complete,
                indent,
                line: idx,
                proof,
                commit,
            });
        }
        idx += 1;
    }

    Ok(Checklist { status, phases })
}
