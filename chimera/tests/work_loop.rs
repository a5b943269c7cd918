//! End-to-end driver scenarios against a real workspace and a scripted model.
//!
//! Each test builds a temp workspace with a git repository and a checklist,
//! queues model replies, and drives `run_driver` to a terminal outcome.

use chimera::core::checklist::parse_checklist;
use chimera::core::context_guard::ContextGuard;
use chimera::core::signals::GUTTER_MARKER;
use chimera::core::types::{StopReason, Turn};
use chimera::driver::{RunOutcome, run_driver};
use chimera::exit_codes;
use chimera::io::git::Git;
use chimera::io::prompt::PromptEngine;
use chimera::io::sandbox::Workspace;
use chimera::session::{SessionSettings, WorkerContext, WorkerSession};
use chimera::test_support::{
    SAMPLE_CHECKLIST, ScriptedGateway, init_git_repo, reply, tool_reply, with_tokens,
};
use chimera::tools::ToolExecutor;
use serde_json::json;

const CHECKLIST: &str = "instructions/plan.md";

struct Harness {
    _temp: tempfile::TempDir,
    tools: ToolExecutor,
    prompts: PromptEngine,
}

impl Harness {
    fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        init_git_repo(temp.path()).expect("git");
        let ws = Workspace::open(temp.path()).expect("open");
        ws.write(CHECKLIST, SAMPLE_CHECKLIST).expect("checklist");
        ws.write("AGENTS.md", "Always run the tests before committing.\n")
            .expect("agents");
        Self {
            _temp: temp,
            tools: ToolExecutor::worker(ws).expect("tools"),
            prompts: PromptEngine::new(),
        }
    }

    fn workspace(&self) -> &Workspace {
        self.tools.workspace()
    }

    fn session<'a>(&'a self, gateway: &'a ScriptedGateway) -> WorkerSession<'a, ScriptedGateway> {
        WorkerSession::new(
            gateway,
            &self.tools,
            &self.prompts,
            "system".to_string(),
            SessionSettings {
                checklist_path: CHECKLIST.to_string(),
                max_tool_turns: 20,
                max_tokens: 1000,
            },
        )
    }
}

fn mark(task: &str, proof: &str, commit: Option<&str>) -> (&'static str, serde_json::Value) {
    let mut args = json!({
        "checklist_path": CHECKLIST,
        "task_description": task,
        "proof": proof,
    });
    if let Some(sha) = commit {
        args["commit_ref"] = json!(sha);
    }
    ("update_checklist", args)
}

/// Full lifecycle: implement, commit, mark complete, repeat, then the checklist
/// check ends the run as done.
#[test]
fn completes_checklist_through_tool_calls() {
    let harness = Harness::new();
    let gateway = ScriptedGateway::new(vec![
        tool_reply(
            "Implementing feature X.",
            vec![
                ("write_file", json!({"path": "src/x.rs", "content": "pub fn x() -> u8 { 1 }\n"})),
                ("run_command", json!({"command": "test -f src/x.rs && echo ok"})),
                ("git_commit", json!({"message": "feat: implement feature X"})),
            ],
        ),
        tool_reply(
            "Marking it done.",
            vec![
                mark("Implement feature X", "src/x.rs exists", Some("abc123")),
                mark("Add parser", "parser covered by x", None),
            ],
        ),
        reply("Feature X is finished.", StopReason::EndTurn, 10),
        tool_reply(
            "Writing docs.",
            vec![
                ("edit_file", json!({"mode": "create", "path": "README.md", "new_text": "# X\n"})),
                mark("Write docs", "README.md created", None),
            ],
        ),
        reply("Everything is done.", StopReason::EndTurn, 10),
    ]);
    let session = harness.session(&gateway);
    let mut ctx = WorkerContext::new(ContextGuard::new(10.0, 1_000_000));

    let mut steps = 0;
    let summary = run_driver(&session, &mut ctx, 10, |_, _, _| steps += 1);

    assert_eq!(summary.outcome, RunOutcome::Done);
    assert_eq!(summary.outcome.exit_code(), exit_codes::OK);
    assert!(summary.completed);
    assert_eq!(summary.iterations, 2);
    assert_eq!(steps, 2);
    assert_eq!(summary.rotations, 0);
    assert_eq!(gateway.request_count(), 5);

    let text = harness.workspace().read(CHECKLIST).expect("read");
    assert!(text.contains("- [x] Implement feature X (commit: abc123)\n  - Proof: src/x.rs exists\n"));
    let checklist = parse_checklist(&text).expect("parse");
    assert!(checklist.top_level_complete());
    assert_eq!(Git::new(harness.workspace().root()).commit_count().expect("count"), 1);

    let kickoff = &gateway.requests()[0].messages[0];
    assert!(matches!(kickoff, Turn::User { content }
        if content.contains("=== AGENTS.md ===") && content.contains("Implement feature X")));
}

/// A stuck marker alongside tool calls ends the run; none of the calls run.
#[test]
fn gutter_marker_stops_run_without_executing_tools() {
    let harness = Harness::new();
    let gateway = ScriptedGateway::new(vec![tool_reply(
        &format!("The toolchain is missing. {GUTTER_MARKER}"),
        vec![
            ("write_file", json!({"path": "should_not_exist.txt", "content": "x"})),
            mark("Implement feature X", "none", None),
        ],
    )]);
    let session = harness.session(&gateway);
    let mut ctx = WorkerContext::new(ContextGuard::new(10.0, 1_000_000));

    let summary = run_driver(&session, &mut ctx, 10, |_, report, _| {
        assert_eq!(report.tool_calls, 0);
    });

    assert_eq!(summary.outcome, RunOutcome::Stuck);
    assert_eq!(summary.outcome.exit_code(), exit_codes::STUCK);
    assert_eq!(gateway.request_count(), 1);
    assert!(!harness.workspace().root().join("should_not_exist.txt").exists());
    assert_eq!(harness.workspace().read(CHECKLIST).expect("read"), SAMPLE_CHECKLIST);
}

/// Rotation drops the conversation but keeps checklist progress.
#[test]
fn rotation_preserves_checklist_progress() {
    let harness = Harness::new();
    let gateway = ScriptedGateway::new(vec![
        with_tokens(
            tool_reply("Done with X.", vec![mark("Implement feature X", "tests pass", None)]),
            60,
        ),
        reply("Stopping here.", StopReason::EndTurn, 60),
        tool_reply("Docs now.", vec![mark("Write docs", "README written", None)]),
        reply("All set.", StopReason::EndTurn, 5),
    ]);
    let session = harness.session(&gateway);
    // Rotates at 100 tokens.
    let mut ctx = WorkerContext::new(ContextGuard::new(10.0, 1_000));

    let summary = run_driver(&session, &mut ctx, 10, |_, _, _| {});

    assert_eq!(summary.outcome, RunOutcome::Done);
    assert_eq!(summary.rotations, 1);
    assert_eq!(summary.total_tokens, 135);
    assert_eq!(summary.current_tokens, 15);

    let requests = gateway.requests();
    let fresh = &requests[2].messages;
    assert_eq!(fresh.len(), 1, "new session starts from a single kickoff turn");
    assert!(matches!(&fresh[0], Turn::User { content }
        if content.contains("- [x] Implement feature X") && content.contains("=== AGENTS.md ===")));
}

/// A model that never stops calling tools runs into the per-step cap.
#[test]
fn endless_tool_calls_exhaust_the_step() {
    let harness = Harness::new();
    let replies = (0..20)
        .map(|_| tool_reply("checking", vec![("run_command", json!({"command": "true"}))]))
        .collect();
    let gateway = ScriptedGateway::new(replies);
    let session = harness.session(&gateway);
    let mut ctx = WorkerContext::new(ContextGuard::new(10.0, 1_000_000));

    let summary = run_driver(&session, &mut ctx, 10, |_, _, _| {});

    assert_eq!(summary.outcome, RunOutcome::Exhausted);
    assert_eq!(summary.outcome.exit_code(), exit_codes::EXHAUSTED);
    assert_eq!(summary.iterations, 1);
    assert_eq!(gateway.request_count(), 20);
}

/// Tool-level failures are fed back and the loop keeps going.
#[test]
fn tool_failures_are_visible_to_the_model() {
    let harness = Harness::new();
    let gateway = ScriptedGateway::new(vec![
        tool_reply(
            "Trying things.",
            vec![
                ("read_file", json!({"path": "missing.rs"})),
                ("run_command", json!({"command": "exit 1"})),
                ("frobnicate", json!({})),
            ],
        ),
        reply("Let me think.", StopReason::EndTurn, 5),
    ]);
    let session = harness.session(&gateway);
    let mut ctx = WorkerContext::new(ContextGuard::new(10.0, 1_000_000));

    let summary = run_driver(&session, &mut ctx, 1, |_, _, _| {});
    assert_eq!(summary.outcome, RunOutcome::Exhausted);

    let second = &gateway.requests()[1].messages;
    let errors: Vec<_> = second
        .iter()
        .filter_map(|turn| match turn {
            Turn::ToolResult { content, is_error: true, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 3);
    assert!(errors[0].contains("File not found: missing.rs"));
    assert!(errors[1].contains("\"return_code\": 1"));
    assert!(errors[2].contains("Unknown tool 'frobnicate'"));
}

/// Reaching outside the workspace is a hard error for the run.
#[test]
fn escape_attempt_ends_run_with_error() {
    let harness = Harness::new();
    let gateway = ScriptedGateway::new(vec![tool_reply(
        "Peeking.",
        vec![("write_file", json!({"path": "/tmp/chimera-escape.txt", "content": "x"}))],
    )]);
    let session = harness.session(&gateway);
    let mut ctx = WorkerContext::new(ContextGuard::new(10.0, 1_000_000));

    let summary = run_driver(&session, &mut ctx, 10, |_, _, _| {});

    match summary.outcome {
        RunOutcome::Error { message } => assert!(message.contains("outside workspace")),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(summary.iterations, 1);
}
