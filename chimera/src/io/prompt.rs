//! Prompt rendering for the worker and planner sessions.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::signals::{COMPLETE_MARKER, GUTTER_MARKER};

const WORKER_SYSTEM_TEMPLATE: &str = include_str!("prompts/worker_system.md");
const WORKER_KICKOFF_TEMPLATE: &str = include_str!("prompts/worker_kickoff.md");
const NUDGE_TEMPLATE: &str = include_str!("prompts/nudge.md");
const PLANNER_SYSTEM_TEMPLATE: &str = include_str!("prompts/planner_system.md");
const PLANNER_KICKOFF_TEMPLATE: &str = include_str!("prompts/planner_kickoff.md");

/// A protocol document embedded in the kickoff turn.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolDoc {
    pub path: String,
    pub content: String,
}

/// Checklist snapshot shown to the worker.
#[derive(Debug, Clone, Copy)]
pub struct ChecklistView<'a> {
    pub path: &'a str,
    pub text: &'a str,
    pub next_task: Option<&'a str>,
    pub done: usize,
    pub total: usize,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("worker_system", WORKER_SYSTEM_TEMPLATE)
            .expect("worker_system template should be valid");
        env.add_template("worker_kickoff", WORKER_KICKOFF_TEMPLATE)
            .expect("worker_kickoff template should be valid");
        env.add_template("nudge", NUDGE_TEMPLATE)
            .expect("nudge template should be valid");
        env.add_template("planner_system", PLANNER_SYSTEM_TEMPLATE)
            .expect("planner_system template should be valid");
        env.add_template("planner_kickoff", PLANNER_KICKOFF_TEMPLATE)
            .expect("planner_kickoff template should be valid");
        Self { env }
    }

    /// Worker system prompt, from `override_path` when given.
    pub fn worker_system(&self, override_path: Option<&Path>) -> Result<String> {
        self.system_prompt("worker_system", override_path)
    }

    pub fn planner_system(&self, override_path: Option<&Path>) -> Result<String> {
        self.system_prompt("planner_system", override_path)
    }

    /// Override files are rendered too, so they can reference the signal markers.
    fn system_prompt(&self, name: &str, override_path: Option<&Path>) -> Result<String> {
        let ctx = context! {
            complete_marker => COMPLETE_MARKER,
            gutter_marker => GUTTER_MARKER,
        };
        match override_path {
            Some(path) => {
                let source = fs::read_to_string(path)
                    .with_context(|| format!("read prompt {}", path.display()))?;
                self.env
                    .render_str(&source, ctx)
                    .with_context(|| format!("render prompt {}", path.display()))
            }
            None => Ok(self.env.get_template(name)?.render(ctx)?),
        }
    }

    pub fn worker_kickoff(&self, protocol_docs: &[ProtocolDoc], checklist: &ChecklistView<'_>) -> Result<String> {
        let template = self.env.get_template("worker_kickoff")?;
        Ok(template.render(context! {
            protocol_docs => protocol_docs,
            checklist_path => checklist.path,
            checklist => checklist.text.trim_end(),
            next_task => checklist.next_task,
        })?)
    }

    pub fn nudge(&self, checklist: &ChecklistView<'_>) -> Result<String> {
        let template = self.env.get_template("nudge")?;
        Ok(template.render(context! {
            checklist_path => checklist.path,
            checklist => checklist.text.trim_end(),
            done => checklist.done,
            total => checklist.total,
        })?)
    }

    pub fn planner_kickoff(&self, spec_path: &str, spec: &str, checklist_path: &str) -> Result<String> {
        let template = self.env.get_template("planner_kickoff")?;
        Ok(template.render(context! {
            spec_path => spec_path,
            spec => spec.trim_end(),
            checklist_path => checklist_path,
        })?)
    }
}
