//! Checklist-driven autonomous coding agent.
//!
//! `chimera plan` turns `spec.md` into a phased checklist; `chimera work` drives
//! the model through it one task at a time inside a sandboxed workspace.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chimera::core::context_guard::ContextGuard;
use chimera::driver::{RunOutcome, run_driver};
use chimera::exit_codes;
use chimera::io::checklist_store::load_checklist;
use chimera::io::config::{AgentConfig, DEFAULT_CONFIG_FILE, load_config};
use chimera::io::gateway::build_gateway;
use chimera::io::git::Git;
use chimera::io::prompt::PromptEngine;
use chimera::io::sandbox::Workspace;
use chimera::logging;
use chimera::plan::{PlanOutcome, PlanSettings, run_planner};
use chimera::session::{SessionSettings, StepOutcome, WorkerContext, WorkerSession};
use chimera::tools::ToolExecutor;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "chimera",
    version,
    about = "Checklist-driven autonomous coding agent"
)]
struct Cli {
    /// Config file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Workspace directory, overriding `[workspace] directory`.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    /// Log progress at info level (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Work through the checklist until it is complete, stuck or out of budget.
    Work {
        /// Override `[execution] max_iterations`.
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Generate the checklist from the workspace spec.
    Plan,
    /// Print checklist progress and the next task.
    Status,
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::ERROR
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut cfg = load_config(&cli.config)?;
    if let Some(dir) = cli.workspace {
        cfg.workspace.directory = dir;
    }
    let workspace = Workspace::open(&cfg.workspace.directory)?.with_command_limits(
        cfg.execution.command_timeout(),
        cfg.execution.output_limit_bytes,
    );

    match cli.command {
        Command::Work { max_iterations } => {
            if let Some(max) = max_iterations {
                cfg.execution.max_iterations = max;
            }
            cmd_work(&cfg, workspace)
        }
        Command::Plan => cmd_plan(&cfg, workspace),
        Command::Status => cmd_status(&cfg, &workspace),
    }
}

fn install_interrupt() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    ctrlc::set_handler(move || {
        eprintln!("\ninterrupt received, stopping after the current tool call");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("install Ctrl-C handler")?;
    Ok(flag)
}

fn cmd_work(cfg: &AgentConfig, workspace: Workspace) -> Result<i32> {
    let gateway = build_gateway(&cfg.llm)?;
    let interrupt = install_interrupt()?;
    let prompts = PromptEngine::new();
    let system_prompt = prompts.worker_system(cfg.prompts.worker.as_deref())?;
    let root = workspace.root().to_path_buf();
    let tools = ToolExecutor::worker(workspace)?;

    let git = Git::new(&root);
    if !git.is_repository()? {
        git.init().context("initialize workspace repository")?;
    }

    let session = WorkerSession::new(
        &gateway,
        &tools,
        &prompts,
        system_prompt,
        SessionSettings {
            checklist_path: cfg.workspace.checklist.clone(),
            max_tool_turns: cfg.execution.max_tool_turns,
            max_tokens: cfg.llm.max_tokens,
        },
    )
    .with_interrupt(interrupt);
    let mut ctx = WorkerContext::new(ContextGuard::new(
        cfg.context.threshold_percentage,
        cfg.context.max_context,
    ));

    println!("chimera work");
    println!("  workspace: {}", root.display());
    println!("  checklist: {}", cfg.workspace.checklist);
    println!("  model:     {} ({:?})", cfg.llm.model, cfg.llm.backend);
    println!(
        "  rotation:  {} tokens ({}% of {})",
        ctx.guard().threshold_tokens(),
        cfg.context.threshold_percentage,
        cfg.context.max_context
    );

    let summary = run_driver(
        &session,
        &mut ctx,
        cfg.execution.max_iterations,
        |iteration, report, status| {
            let label = match &report.outcome {
                StepOutcome::Done { message } => format!("done: {message}"),
                StepOutcome::Continue => "continue".to_string(),
                StepOutcome::Stuck => "stuck".to_string(),
                StepOutcome::Exhausted { turns } => format!("exhausted after {turns} turns"),
                StepOutcome::Interrupted => "interrupted".to_string(),
                StepOutcome::Error { message } => format!("error: {message}"),
            };
            println!(
                "[step {iteration}] {label} | turns {} | tools {} | tokens {} | context {:.1}%",
                report.model_turns, report.tool_calls, report.tokens, status.usage_percentage
            );
        },
    );

    let commits = git.commit_count().unwrap_or_default();
    println!();
    println!("run summary");
    println!("  outcome:        {}", describe(&summary.outcome));
    println!("  iterations:     {}", summary.iterations);
    println!("  rotations:      {}", summary.rotations);
    println!("  total tokens:   {}", summary.total_tokens);
    println!("  current tokens: {}", summary.current_tokens);
    println!("  completed:      {}", summary.completed);
    println!("  commits:        {commits}");
    Ok(summary.outcome.exit_code())
}

fn describe(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Done => "done".to_string(),
        RunOutcome::Stuck => "stuck".to_string(),
        RunOutcome::Exhausted => "exhausted".to_string(),
        RunOutcome::Interrupted => "interrupted".to_string(),
        RunOutcome::Error { message } => format!("error ({message})"),
    }
}

fn cmd_plan(cfg: &AgentConfig, workspace: Workspace) -> Result<i32> {
    let gateway = build_gateway(&cfg.llm)?;
    let interrupt = install_interrupt()?;
    let prompts = PromptEngine::new();
    let system_prompt = prompts.planner_system(cfg.prompts.planner.as_deref())?;
    let tools = ToolExecutor::planner(workspace)?;
    let settings = PlanSettings {
        spec_path: cfg.workspace.spec.clone(),
        checklist_path: cfg.workspace.checklist.clone(),
        max_turns: cfg.execution.planner_max_turns,
        max_tokens: cfg.llm.max_tokens,
    };

    println!("chimera plan: {} -> {}", settings.spec_path, settings.checklist_path);
    let report = run_planner(&gateway, &tools, &prompts, &system_prompt, &settings, &interrupt);
    println!("  turns: {} | tokens: {}", report.model_turns, report.tokens);
    match report.outcome {
        PlanOutcome::Created { phases, tasks } => {
            println!("  created {phases} phases, {tasks} tasks");
            Ok(exit_codes::OK)
        }
        PlanOutcome::Failed { reason } => {
            eprintln!("planning failed: {reason}");
            Ok(exit_codes::ERROR)
        }
        PlanOutcome::Interrupted => Ok(exit_codes::INTERRUPTED),
    }
}

fn cmd_status(cfg: &AgentConfig, workspace: &Workspace) -> Result<i32> {
    let path = &cfg.workspace.checklist;
    let loaded = load_checklist(workspace, path).with_context(|| format!("load checklist {path}"))?;
    let checklist = &loaded.checklist;
    let (done, total) = checklist.top_level_progress();

    println!("{path} (status: {})", checklist.status);
    for phase in &checklist.phases {
        let top: Vec<_> = phase.tasks.iter().filter(|t| t.is_top_level()).collect();
        let complete = top.iter().filter(|t| t.complete).count();
        println!("  Phase {}: {} [{complete}/{}]", phase.number, phase.name, top.len());
    }
    println!("progress: {done}/{total} top-level tasks");
    match checklist.next_task() {
        Some(next) => println!(
            "next: Phase {} - {}",
            next.phase.number, next.task.description
        ),
        None => println!("all top-level tasks complete"),
    }
    Ok(exit_codes::OK)
}
