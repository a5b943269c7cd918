//! Multi-step driver for `chimera work`.
//!
//! Repeats worker steps until a terminal outcome or the step limit, rotating the
//! session whenever the context guard asks for it. Rotation never ends the run.

use serde::Serialize;
use tracing::{info, warn};

use crate::core::context_guard::GuardStatus;
use crate::exit_codes;
use crate::io::gateway::LlmGateway;
use crate::session::{StepOutcome, StepReport, WorkerContext, WorkerSession};

/// Why the run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Done,
    Stuck,
    /// A step hit its turn cap, or the run hit its step limit.
    Exhausted,
    Interrupted,
    Error { message: String },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Done => exit_codes::OK,
            RunOutcome::Error { .. } => exit_codes::ERROR,
            RunOutcome::Exhausted => exit_codes::EXHAUSTED,
            RunOutcome::Stuck => exit_codes::STUCK,
            RunOutcome::Interrupted => exit_codes::INTERRUPTED,
        }
    }
}

/// End-of-run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// Steps executed.
    pub iterations: u32,
    /// Tokens across every session, rotations included.
    pub total_tokens: u64,
    /// Tokens in the session that was active at the end.
    pub current_tokens: u64,
    pub completed: bool,
    pub rotations: u32,
    pub outcome: RunOutcome,
}

/// Run worker steps until the checklist is done, the agent gives up, a budget
/// runs out, or an error occurs. `on_step` sees every step after it finishes.
pub fn run_driver<G, F>(
    session: &WorkerSession<'_, G>,
    ctx: &mut WorkerContext,
    max_iterations: u32,
    mut on_step: F,
) -> RunSummary
where
    G: LlmGateway + ?Sized,
    F: FnMut(u32, &StepReport, &GuardStatus),
{
    let mut iterations = 0u32;
    let mut total_tokens = 0u64;
    let mut rotations = 0u32;

    let outcome = loop {
        if iterations >= max_iterations {
            warn!(max_iterations, "step limit reached");
            break RunOutcome::Exhausted;
        }
        if session.interrupted() {
            break RunOutcome::Interrupted;
        }

        iterations += 1;
        let report = session.run_step(ctx);
        total_tokens += report.tokens;
        on_step(iterations, &report, &ctx.guard().status());

        match report.outcome {
            StepOutcome::Done { .. } => break RunOutcome::Done,
            StepOutcome::Stuck => break RunOutcome::Stuck,
            StepOutcome::Exhausted { .. } => break RunOutcome::Exhausted,
            StepOutcome::Interrupted => break RunOutcome::Interrupted,
            StepOutcome::Error { message } => break RunOutcome::Error { message },
            StepOutcome::Continue => {
                if ctx.should_rotate() {
                    let status = ctx.guard().status();
                    info!(
                        tokens = status.current_tokens,
                        threshold = status.threshold_tokens,
                        "rotating session"
                    );
                    ctx.rotate();
                    rotations += 1;
                }
            }
        }
    };

    RunSummary {
        iterations,
        total_tokens,
        current_tokens: ctx.guard().current_tokens(),
        completed: outcome == RunOutcome::Done,
        rotations,
        outcome,
    }
}
