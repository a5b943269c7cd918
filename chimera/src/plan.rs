//! Planning session for `chimera plan`: turn the spec into a checklist.
//!
//! The planner only gets `read_file` and `write_file`. It succeeds when it has
//! written the checklist during this session and the result is substantial and
//! parses.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::checklist::parse_checklist;
use crate::core::types::{ChatRequest, ToolCall, Turn};
use crate::io::gateway::LlmGateway;
use crate::io::prompt::PromptEngine;
use crate::io::sandbox::Workspace;
use crate::session::tool_result_turn;
use crate::tools::{ToolExecutor, WRITE_FILE};

/// A generated checklist shorter than this is rejected.
pub const MIN_CHECKLIST_BYTES: usize = 100;

#[derive(Debug, Clone)]
pub struct PlanSettings {
    pub spec_path: String,
    pub checklist_path: String,
    pub max_turns: u32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    Created { phases: usize, tasks: usize },
    Failed { reason: String },
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanReport {
    pub outcome: PlanOutcome,
    pub model_turns: u32,
    pub tokens: u64,
}

/// Run the planner. `tools` should come from [`ToolExecutor::planner`].
#[instrument(skip_all, fields(spec = %settings.spec_path, checklist = %settings.checklist_path))]
pub fn run_planner<G: LlmGateway + ?Sized>(
    gateway: &G,
    tools: &ToolExecutor,
    prompts: &PromptEngine,
    system_prompt: &str,
    settings: &PlanSettings,
    interrupt: &AtomicBool,
) -> PlanReport {
    let mut report = PlanReport {
        outcome: PlanOutcome::Interrupted,
        model_turns: 0,
        tokens: 0,
    };
    let outcome = drive(gateway, tools, prompts, system_prompt, settings, interrupt, &mut report);
    info!(outcome = ?outcome, tokens = report.tokens, "planning finished");
    report.outcome = outcome;
    report
}

fn drive<G: LlmGateway + ?Sized>(
    gateway: &G,
    tools: &ToolExecutor,
    prompts: &PromptEngine,
    system_prompt: &str,
    settings: &PlanSettings,
    interrupt: &AtomicBool,
    report: &mut PlanReport,
) -> PlanOutcome {
    let failed = |reason: String| PlanOutcome::Failed { reason };
    let workspace = tools.workspace();

    let spec = match workspace.read(&settings.spec_path) {
        Ok(spec) => spec,
        Err(err) => return failed(format!("cannot read spec: {err}")),
    };
    let kickoff = match prompts.planner_kickoff(&settings.spec_path, &spec, &settings.checklist_path) {
        Ok(kickoff) => kickoff,
        Err(err) => return failed(format!("render kickoff: {err:#}")),
    };
    let mut conversation = vec![Turn::user(kickoff)];
    let mut checklist_written = false;

    for _ in 0..settings.max_turns {
        if interrupt.load(Ordering::SeqCst) {
            return PlanOutcome::Interrupted;
        }
        let request = ChatRequest {
            system_prompt,
            messages: &conversation,
            max_tokens: settings.max_tokens,
            tools: tools.schemas(),
        };
        let response = match gateway.chat(&request) {
            Ok(response) => response,
            Err(err) => return failed(format!("LLM gateway error: {err}")),
        };
        report.model_turns += 1;
        report.tokens += response.total_tokens();

        let calls = response.tool_calls.clone();
        conversation.push(Turn::Assistant {
            text: response.text,
            tool_calls: response.tool_calls,
        });
        if calls.is_empty() {
            break;
        }
        for call in &calls {
            let result = match tools.execute(call) {
                Ok(result) => result,
                Err(escape) => return failed(format!("security violation: {escape}")),
            };
            if !result.is_error() && writes_checklist(workspace, call, &settings.checklist_path) {
                checklist_written = true;
            }
            conversation.push(tool_result_turn(call, result));
        }
    }

    if !checklist_written {
        return failed("Planner did not create the checklist file".to_string());
    }
    let text = match workspace.read(&settings.checklist_path) {
        Ok(text) => text,
        Err(err) => return failed(format!("Checklist file error: {err}")),
    };
    if text.len() < MIN_CHECKLIST_BYTES {
        return failed(format!(
            "Generated checklist is too short ({} bytes, need {MIN_CHECKLIST_BYTES})",
            text.len()
        ));
    }
    let checklist = match parse_checklist(&text) {
        Ok(checklist) => checklist,
        Err(err) => return failed(format!("Generated checklist is malformed: {err}")),
    };
    let tasks = checklist.tasks().count();
    if tasks == 0 {
        return failed("Generated checklist has no tasks".to_string());
    }
    PlanOutcome::Created {
        phases: checklist.phases.len(),
        tasks,
    }
}

fn writes_checklist(workspace: &Workspace, call: &ToolCall, checklist_path: &str) -> bool {
    if call.name != WRITE_FILE {
        return false;
    }
    let Some(path) = call.arguments.get("path").and_then(Value::as_str) else {
        return false;
    };
    match (workspace.resolve(path), workspace.resolve(checklist_path)) {
        (Ok(written), Ok(target)) => written == target,
        _ => {
            warn!(path, "could not compare write target with checklist path");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StopReason;
    use crate::test_support::{SAMPLE_CHECKLIST, ScriptedGateway, reply, tool_reply};
    use serde_json::json;

    struct Fixture {
        _temp: tempfile::TempDir,
        tools: ToolExecutor,
        prompts: PromptEngine,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = Workspace::open(temp.path()).expect("open");
        ws.write("spec.md", "# JSON parser\nParse JSON into a tree.\n").expect("spec");
        Fixture {
            _temp: temp,
            tools: ToolExecutor::planner(ws).expect("tools"),
            prompts: PromptEngine::new(),
        }
    }

    fn settings() -> PlanSettings {
        PlanSettings {
            spec_path: "spec.md".to_string(),
            checklist_path: "instructions/plan.md".to_string(),
            max_turns: 4,
            max_tokens: 1000,
        }
    }

    fn plan(fx: &Fixture, gateway: &ScriptedGateway) -> PlanReport {
        run_planner(
            gateway,
            &fx.tools,
            &fx.prompts,
            "plan it",
            &settings(),
            &AtomicBool::new(false),
        )
    }

    #[test]
    fn writes_checklist_and_reports_shape() {
        let fx = fixture();
        let gateway = ScriptedGateway::new(vec![
            tool_reply(
                "Writing the plan.",
                vec![(
                    "write_file",
                    json!({"path": "./instructions/plan.md", "content": SAMPLE_CHECKLIST}),
                )],
            ),
            reply("Checklist written.", StopReason::EndTurn, 7),
        ]);
        let report = plan(&fx, &gateway);
        assert_eq!(report.outcome, PlanOutcome::Created { phases: 1, tasks: 3 });
        assert_eq!(report.model_turns, 2);
        assert_eq!(report.tokens, 17);

        let first = &gateway.requests()[0];
        assert_eq!(first.tool_names, vec!["read_file", "write_file"]);
        assert!(matches!(&first.messages[0], Turn::User { content } if content.contains("Parse JSON into a tree.")));
    }

    #[test]
    fn missing_write_is_a_failure() {
        let fx = fixture();
        let gateway = ScriptedGateway::new(vec![reply("Here is a plan: ...", StopReason::EndTurn, 5)]);
        let report = plan(&fx, &gateway);
        assert_eq!(
            report.outcome,
            PlanOutcome::Failed {
                reason: "Planner did not create the checklist file".to_string()
            }
        );
    }

    #[test]
    fn short_checklist_is_rejected() {
        let fx = fixture();
        let gateway = ScriptedGateway::new(vec![
            tool_reply(
                "",
                vec![("write_file", json!({"path": "instructions/plan.md", "content": "### Phase 1: A\n- [ ] a\n"}))],
            ),
            reply("done", StopReason::EndTurn, 5),
        ]);
        match plan(&fx, &gateway).outcome {
            PlanOutcome::Failed { reason } => assert!(reason.contains("too short")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn malformed_checklist_is_rejected() {
        let fx = fixture();
        let content = format!("- [ ] task before any phase\n{}", "filler line\n".repeat(10));
        let gateway = ScriptedGateway::new(vec![
            tool_reply("", vec![("write_file", json!({"path": "instructions/plan.md", "content": content}))]),
            reply("done", StopReason::EndTurn, 5),
        ]);
        match plan(&fx, &gateway).outcome {
            PlanOutcome::Failed { reason } => assert!(reason.contains("malformed")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn missing_spec_fails_before_calling_the_model() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fx = Fixture {
            tools: ToolExecutor::planner(Workspace::open(temp.path()).expect("open")).expect("tools"),
            _temp: temp,
            prompts: PromptEngine::new(),
        };
        let gateway = ScriptedGateway::new(vec![]);
        match plan(&fx, &gateway).outcome {
            PlanOutcome::Failed { reason } => assert!(reason.contains("cannot read spec")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(gateway.request_count(), 0);
    }
}
