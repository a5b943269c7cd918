//! One worker step: a bounded tool-calling conversation with the model.
//!
//! The step ends when the model signals completion or being stuck, when it ends
//! its turn without tool calls, when the turn cap is hit, or on a session-level
//! error. Conversation history lives in [`WorkerContext`] and survives between
//! steps until the driver rotates it.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, instrument, warn};

use crate::core::context_guard::ContextGuard;
use crate::core::signals::{Signal, detect_signal};
use crate::core::types::{ChatRequest, StopReason, ToolCall, Turn};
use crate::io::checklist_store::{ChecklistError, LoadedChecklist, load_checklist};
use crate::io::gateway::LlmGateway;
use crate::io::prompt::{ChecklistView, PromptEngine, ProtocolDoc};
use crate::io::sandbox::SandboxError;
use crate::tools::{ToolExecutor, ToolResult};

/// Files embedded in the first turn of every session when present.
pub const PROTOCOL_DOCS: &[&str] = &["AGENTS.md", "docs/conventions.md"];

/// Sent after a text-only reply that was cut off rather than finished.
pub const CONTINUE_PROMPT: &str = "Continue.";

/// Conversation state and token budget for one session. They are only ever
/// reset together, through [`WorkerContext::rotate`].
#[derive(Debug)]
pub struct WorkerContext {
    guard: ContextGuard,
    conversation: Vec<Turn>,
    files_read: HashSet<String>,
}

impl WorkerContext {
    pub fn new(guard: ContextGuard) -> Self {
        Self {
            guard,
            conversation: Vec::new(),
            files_read: HashSet::new(),
        }
    }

    pub fn guard(&self) -> &ContextGuard {
        &self.guard
    }

    pub fn conversation(&self) -> &[Turn] {
        &self.conversation
    }

    pub fn should_rotate(&self) -> bool {
        self.guard.should_rotate()
    }

    /// Start a fresh session. The checklist and the repository are untouched.
    pub fn rotate(&mut self) {
        self.guard.reset();
        self.conversation.clear();
        self.files_read.clear();
    }
}

/// How a step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The checklist is complete or the model signalled completion.
    Done { message: String },
    /// The model finished its turn with work remaining; a nudge is queued.
    Continue,
    Stuck,
    /// The per-step turn cap was reached.
    Exhausted { turns: u32 },
    Interrupted,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub outcome: StepOutcome,
    pub model_turns: u32,
    pub tool_calls: u32,
    pub tokens: u64,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub checklist_path: String,
    pub max_tool_turns: u32,
    pub max_tokens: u32,
}

/// Everything a worker step needs besides its [`WorkerContext`].
pub struct WorkerSession<'a, G: LlmGateway + ?Sized> {
    gateway: &'a G,
    tools: &'a ToolExecutor,
    prompts: &'a PromptEngine,
    system_prompt: String,
    settings: SessionSettings,
    interrupt: Arc<AtomicBool>,
}

impl<'a, G: LlmGateway + ?Sized> WorkerSession<'a, G> {
    pub fn new(
        gateway: &'a G,
        tools: &'a ToolExecutor,
        prompts: &'a PromptEngine,
        system_prompt: String,
        settings: SessionSettings,
    ) -> Self {
        Self {
            gateway,
            tools,
            prompts,
            system_prompt,
            settings,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an interrupt flag; it is polled before every model call.
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    pub fn checklist_path(&self) -> &str {
        &self.settings.checklist_path
    }

    #[instrument(skip_all, fields(turns_so_far = ctx.conversation.len()))]
    pub fn run_step(&self, ctx: &mut WorkerContext) -> StepReport {
        let mut report = StepReport {
            outcome: StepOutcome::Continue,
            model_turns: 0,
            tool_calls: 0,
            tokens: 0,
        };
        let outcome = self.drive(ctx, &mut report);
        report.outcome = outcome;
        info!(
            outcome = ?report.outcome,
            model_turns = report.model_turns,
            tool_calls = report.tool_calls,
            tokens = report.tokens,
            "step finished"
        );
        report
    }

    fn drive(&self, ctx: &mut WorkerContext, report: &mut StepReport) -> StepOutcome {
        let loaded = match self.load_checklist() {
            Ok(loaded) => loaded,
            Err(message) => return StepOutcome::Error { message },
        };
        if loaded.checklist.top_level_complete() {
            return StepOutcome::Done {
                message: "All tasks complete".to_string(),
            };
        }
        if ctx.conversation.is_empty() {
            match self.kickoff(ctx, &loaded) {
                Ok(kickoff) => ctx.conversation.push(Turn::user(kickoff)),
                Err(message) => return StepOutcome::Error { message },
            }
        }

        for _ in 0..self.settings.max_tool_turns {
            if self.interrupted() {
                return StepOutcome::Interrupted;
            }
            let request = ChatRequest {
                system_prompt: &self.system_prompt,
                messages: &ctx.conversation,
                max_tokens: self.settings.max_tokens,
                tools: self.tools.schemas(),
            };
            let response = match self.gateway.chat(&request) {
                Ok(response) => response,
                Err(err) => {
                    return StepOutcome::Error {
                        message: format!("LLM gateway error: {err}"),
                    };
                }
            };
            report.model_turns += 1;
            report.tokens += response.total_tokens();
            ctx.guard.add_tokens(response.total_tokens());
            debug!(
                stop_reason = ?response.stop_reason,
                tool_calls = response.tool_calls.len(),
                usage_pct = ctx.guard.usage_percentage(),
                "model turn"
            );

            let signal = detect_signal(&response.text);
            let has_tool_calls = !response.tool_calls.is_empty();
            let end_turn = response.stop_reason == StopReason::EndTurn;
            ctx.conversation.push(Turn::Assistant {
                text: response.text,
                tool_calls: response.tool_calls.clone(),
            });

            // Markers win over any tool calls issued alongside them.
            match signal {
                Some(Signal::Gutter) => return StepOutcome::Stuck,
                Some(Signal::Complete) => {
                    return StepOutcome::Done {
                        message: "Worker signaled completion".to_string(),
                    };
                }
                None => {}
            }

            if has_tool_calls {
                for call in &response.tool_calls {
                    report.tool_calls += 1;
                    match self.tools.execute(call) {
                        Ok(result) => ctx.conversation.push(tool_result_turn(call, result)),
                        Err(escape) => {
                            return StepOutcome::Error {
                                message: format!("security violation: {escape}"),
                            };
                        }
                    }
                }
                continue;
            }

            if !end_turn {
                ctx.conversation.push(Turn::user(CONTINUE_PROMPT));
                continue;
            }

            // The model's own claim is not trusted; the checklist decides.
            let loaded = match self.load_checklist() {
                Ok(loaded) => loaded,
                Err(message) => return StepOutcome::Error { message },
            };
            if loaded.checklist.top_level_complete() {
                return StepOutcome::Done {
                    message: "All tasks complete".to_string(),
                };
            }
            match self.prompts.nudge(&self.view(&loaded)) {
                Ok(nudge) => ctx.conversation.push(Turn::user(nudge)),
                Err(err) => {
                    return StepOutcome::Error {
                        message: format!("render nudge: {err:#}"),
                    };
                }
            }
            return StepOutcome::Continue;
        }

        warn!(cap = self.settings.max_tool_turns, "turn cap reached");
        StepOutcome::Exhausted {
            turns: self.settings.max_tool_turns,
        }
    }

    fn load_checklist(&self) -> Result<LoadedChecklist, String> {
        let path = &self.settings.checklist_path;
        load_checklist(self.tools.workspace(), path).map_err(|err| match err {
            ChecklistError::Sandbox(SandboxError::NotFound { .. }) => {
                format!("checklist {path} not found (run `chimera plan` first)")
            }
            other => other.to_string(),
        })
    }

    fn view<'c>(&'c self, loaded: &'c LoadedChecklist) -> ChecklistView<'c> {
        let (done, total) = loaded.checklist.top_level_progress();
        ChecklistView {
            path: &self.settings.checklist_path,
            text: &loaded.text,
            next_task: loaded
                .checklist
                .next_task()
                .map(|next| next.task.description.as_str()),
            done,
            total,
        }
    }

    fn kickoff(&self, ctx: &mut WorkerContext, loaded: &LoadedChecklist) -> Result<String, String> {
        let mut docs = Vec::new();
        for path in PROTOCOL_DOCS {
            if ctx.files_read.contains(*path) {
                continue;
            }
            match self.tools.workspace().read(path) {
                Ok(content) => {
                    ctx.files_read.insert((*path).to_string());
                    docs.push(ProtocolDoc {
                        path: (*path).to_string(),
                        content,
                    });
                }
                Err(SandboxError::NotFound { .. }) => debug!(path, "protocol doc absent"),
                Err(err) => warn!(path, err = %err, "protocol doc unreadable"),
            }
        }
        self.prompts
            .worker_kickoff(&docs, &self.view(loaded))
            .map_err(|err| format!("render kickoff: {err:#}"))
    }
}

pub(crate) fn tool_result_turn(call: &ToolCall, result: ToolResult) -> Turn {
    Turn::ToolResult {
        call_id: call.id.clone(),
        is_error: result.is_error(),
        content: result.into_content(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signals::{COMPLETE_MARKER, GUTTER_MARKER};
    use crate::io::sandbox::Workspace;
    use crate::test_support::{SAMPLE_CHECKLIST, ScriptedGateway, reply, tool_reply};
    use serde_json::json;

    struct Fixture {
        _temp: tempfile::TempDir,
        tools: ToolExecutor,
        prompts: PromptEngine,
    }

    fn fixture(checklist: &str) -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = Workspace::open(temp.path()).expect("open");
        ws.write("instructions/plan.md", checklist).expect("write");
        Fixture {
            _temp: temp,
            tools: ToolExecutor::worker(ws).expect("tools"),
            prompts: PromptEngine::new(),
        }
    }

    fn settings(max_tool_turns: u32) -> SessionSettings {
        SessionSettings {
            checklist_path: "instructions/plan.md".to_string(),
            max_tool_turns,
            max_tokens: 1000,
        }
    }

    fn context() -> WorkerContext {
        WorkerContext::new(ContextGuard::new(10.0, 1_000_000))
    }

    #[test]
    fn complete_checklist_short_circuits_without_model_call() {
        let fx = fixture("### Phase 1: A\n- [x] done\n");
        let gateway = ScriptedGateway::new(vec![]);
        let session = WorkerSession::new(&gateway, &fx.tools, &fx.prompts, "sys".into(), settings(5));
        let report = session.run_step(&mut context());
        assert!(matches!(report.outcome, StepOutcome::Done { .. }));
        assert_eq!(gateway.request_count(), 0);
    }

    #[test]
    fn gutter_marker_wins_over_tool_calls() {
        let fx = fixture(SAMPLE_CHECKLIST);
        let gateway = ScriptedGateway::new(vec![tool_reply(
            &format!("I cannot continue {GUTTER_MARKER}"),
            vec![("write_file", json!({"path": "side_effect.txt", "content": "x"}))],
        )]);
        let session = WorkerSession::new(&gateway, &fx.tools, &fx.prompts, "sys".into(), settings(5));
        let mut ctx = context();
        let report = session.run_step(&mut ctx);
        assert_eq!(report.outcome, StepOutcome::Stuck);
        assert_eq!(report.tool_calls, 0);
        assert!(!fx.tools.workspace().root().join("side_effect.txt").exists());
    }

    #[test]
    fn complete_marker_ends_step_as_done() {
        let fx = fixture(SAMPLE_CHECKLIST);
        let gateway = ScriptedGateway::new(vec![reply(COMPLETE_MARKER, StopReason::EndTurn, 10)]);
        let session = WorkerSession::new(&gateway, &fx.tools, &fx.prompts, "sys".into(), settings(5));
        let report = session.run_step(&mut context());
        assert_eq!(
            report.outcome,
            StepOutcome::Done {
                message: "Worker signaled completion".to_string()
            }
        );
    }

    #[test]
    fn tool_results_follow_calls_in_order() {
        let fx = fixture(SAMPLE_CHECKLIST);
        let gateway = ScriptedGateway::new(vec![
            tool_reply(
                "writing then reading",
                vec![
                    ("write_file", json!({"path": "a.txt", "content": "first"})),
                    ("read_file", json!({"path": "a.txt"})),
                ],
            ),
            reply("Done for now.", StopReason::EndTurn, 10),
        ]);
        let session = WorkerSession::new(&gateway, &fx.tools, &fx.prompts, "sys".into(), settings(5));
        let mut ctx = context();
        let report = session.run_step(&mut ctx);

        assert_eq!(report.outcome, StepOutcome::Continue);
        assert_eq!(report.tool_calls, 2);
        let results: Vec<_> = ctx
            .conversation()
            .iter()
            .filter_map(|turn| match turn {
                Turn::ToolResult { call_id, content, .. } => Some((call_id.clone(), content.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(results[0].0, "call_0_0");
        assert_eq!(results[1], ("call_0_1".to_string(), "first".to_string()));
        match ctx.conversation().last() {
            Some(Turn::User { content }) => assert!(content.contains("continue with the next task")),
            other => panic!("expected nudge, got {other:?}"),
        }
    }

    #[test]
    fn end_turn_with_complete_checklist_is_done() {
        let fx = fixture(SAMPLE_CHECKLIST);
        let gateway = ScriptedGateway::new(vec![
            tool_reply(
                "closing both tasks",
                vec![
                    (
                        "update_checklist",
                        json!({"checklist_path": "instructions/plan.md",
                               "task_description": "Implement feature X", "proof": "ok"}),
                    ),
                    (
                        "update_checklist",
                        json!({"checklist_path": "instructions/plan.md",
                               "task_description": "Write docs", "proof": "ok"}),
                    ),
                ],
            ),
            reply("All finished.", StopReason::EndTurn, 10),
        ]);
        let session = WorkerSession::new(&gateway, &fx.tools, &fx.prompts, "sys".into(), settings(5));
        let report = session.run_step(&mut context());
        assert_eq!(
            report.outcome,
            StepOutcome::Done {
                message: "All tasks complete".to_string()
            }
        );
    }

    #[test]
    fn turn_cap_is_reported_as_exhausted() {
        let fx = fixture(SAMPLE_CHECKLIST);
        let looping = (0..3)
            .map(|_| tool_reply("again", vec![("read_file", json!({"path": "instructions/plan.md"}))]))
            .collect();
        let gateway = ScriptedGateway::new(looping);
        let session = WorkerSession::new(&gateway, &fx.tools, &fx.prompts, "sys".into(), settings(3));
        let report = session.run_step(&mut context());
        assert_eq!(report.outcome, StepOutcome::Exhausted { turns: 3 });
        assert_eq!(report.model_turns, 3);
    }

    #[test]
    fn truncated_text_reply_gets_continue_prompt() {
        let fx = fixture(SAMPLE_CHECKLIST);
        let gateway = ScriptedGateway::new(vec![
            reply("partial", StopReason::MaxTokens, 10),
            reply("rest", StopReason::EndTurn, 10),
        ]);
        let session = WorkerSession::new(&gateway, &fx.tools, &fx.prompts, "sys".into(), settings(5));
        let mut ctx = context();
        let report = session.run_step(&mut ctx);
        assert_eq!(report.outcome, StepOutcome::Continue);
        assert_eq!(report.model_turns, 2);
        assert!(ctx.conversation().contains(&Turn::user(CONTINUE_PROMPT)));
    }

    #[test]
    fn escape_attempt_is_a_session_error() {
        let fx = fixture(SAMPLE_CHECKLIST);
        let gateway = ScriptedGateway::new(vec![tool_reply(
            "peek",
            vec![("read_file", json!({"path": "../../etc/passwd"}))],
        )]);
        let session = WorkerSession::new(&gateway, &fx.tools, &fx.prompts, "sys".into(), settings(5));
        match session.run_step(&mut context()).outcome {
            StepOutcome::Error { message } => assert!(message.contains("outside workspace")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn gateway_failure_is_a_session_error() {
        let fx = fixture(SAMPLE_CHECKLIST);
        let gateway = ScriptedGateway::new(vec![]);
        let session = WorkerSession::new(&gateway, &fx.tools, &fx.prompts, "sys".into(), settings(5));
        match session.run_step(&mut context()).outcome {
            StepOutcome::Error { message } => assert!(message.contains("LLM gateway error")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn protocol_docs_are_embedded_once_per_session() {
        let fx = fixture(SAMPLE_CHECKLIST);
        fx.tools.workspace().write("AGENTS.md", "agent rules").expect("write");
        let gateway = ScriptedGateway::new(vec![
            reply("thinking", StopReason::EndTurn, 10),
            reply("still thinking", StopReason::EndTurn, 10),
        ]);
        let session = WorkerSession::new(&gateway, &fx.tools, &fx.prompts, "sys".into(), settings(5));
        let mut ctx = context();
        session.run_step(&mut ctx);
        session.run_step(&mut ctx);

        let mentions = ctx
            .conversation()
            .iter()
            .filter(|turn| matches!(turn, Turn::User { content } if content.contains("=== AGENTS.md ===")))
            .count();
        assert_eq!(mentions, 1);

        ctx.rotate();
        assert!(ctx.conversation().is_empty());
        assert_eq!(ctx.guard().current_tokens(), 0);
    }

    #[test]
    fn interrupt_stops_before_the_model_is_called() {
        let fx = fixture(SAMPLE_CHECKLIST);
        let gateway = ScriptedGateway::new(vec![reply("x", StopReason::EndTurn, 10)]);
        let flag = Arc::new(AtomicBool::new(true));
        let session = WorkerSession::new(&gateway, &fx.tools, &fx.prompts, "sys".into(), settings(5))
            .with_interrupt(flag);
        assert_eq!(session.run_step(&mut context()).outcome, StepOutcome::Interrupted);
        assert_eq!(gateway.request_count(), 0);
    }

    #[test]
    fn missing_checklist_points_at_planner() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tools = ToolExecutor::worker(Workspace::open(temp.path()).expect("open")).expect("tools");
        let prompts = PromptEngine::new();
        let gateway = ScriptedGateway::new(vec![]);
        let session = WorkerSession::new(&gateway, &tools, &prompts, "sys".into(), settings(5));
        match session.run_step(&mut context()).outcome {
            StepOutcome::Error { message } => assert!(message.contains("chimera plan")),
            other => panic!("expected error, got {other:?}"),
        }
    }
}
