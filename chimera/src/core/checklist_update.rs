//! Pure, line-preserving checklist updates.
//!
//! Only the matched task line and its proof line are touched; every other line
//! of the document is emitted byte-for-byte.

use thiserror::Error;

use crate::core::checklist::{PROOF_PREFIX, is_proof_line, match_task_line};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    #[error("Task not found: {description}")]
    TaskNotFound { description: String },
    #[error("task description must not be empty")]
    EmptyDescription,
    #[error("proof must not be empty")]
    EmptyProof,
}

/// Request to mark one task complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionUpdate<'a> {
    pub description: &'a str,
    pub proof: &'a str,
    pub commit_ref: Option<&'a str>,
}

/// Mark the task matching `update.description` complete and attach its proof.
///
/// The first unchecked task whose text contains the description wins. When no
/// unchecked task matches, the first already-checked match is re-annotated, so
/// repeating an identical update leaves the document unchanged.
pub fn mark_complete(document: &str, update: &CompletionUpdate<'_>) -> Result<String, UpdateError> {
    let description = update.description.trim();
    if description.is_empty() {
        return Err(UpdateError::EmptyDescription);
    }
    let proof = normalize_proof(update.proof);
    if proof.is_empty() {
        return Err(UpdateError::EmptyProof);
    }

    let mut lines: Vec<String> = document.split('\n').map(str::to_string).collect();
    let find = |complete: bool| {
        lines.iter().position(|line| {
            match_task_line(line).is_some_and(|t| t.complete == complete && t.text.contains(description))
        })
    };
    let idx = find(false)
        .or_else(|| find(true))
        .ok_or_else(|| UpdateError::TaskNotFound {
            description: description.to_string(),
        })?;

    let (body, cr) = split_cr(&lines[idx]);
    let mut task_line = body.replacen("- [ ]", "- [x]", 1);
    if let Some(sha) = update.commit_ref.map(str::trim).filter(|s| !s.is_empty())
        && !task_line.contains("(commit:")
    {
        task_line = format!("{} (commit: {sha})", task_line.trim_end());
    }
    let indent = task_line.len() - task_line.trim_start().len();
    lines[idx] = format!("{task_line}{cr}");

    let proof_line = format!("{}{PROOF_PREFIX} {proof}{cr}", " ".repeat(indent + 2));
    match lines.get(idx + 1) {
        Some(next) if is_proof_line(next, indent) => lines[idx + 1] = proof_line,
        _ => lines.insert(idx + 1, proof_line),
    }

    Ok(lines.join("\n"))
}

/// Proof text must stay on one line to keep the document structure intact.
fn normalize_proof(proof: &str) -> String {
    proof
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn split_cr(line: &str) -> (&str, &str) {
    match line.strip_suffix('\r') {
        Some(body) => (body, "\r"),
        None => (line, ""),
    }
}
