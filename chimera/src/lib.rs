//! Checklist-driven autonomous coding agent.
//!
//! A model works through a phased markdown checklist using a small set of
//! sandboxed tools. The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (checklist parsing and updates,
//!   context accounting, signal detection, conversation types). No I/O.
//! - **[`io`]**: Side-effecting adapters (workspace sandbox, processes, git,
//!   config, LLM backends, prompt rendering).
//!
//! Orchestration modules ([`tools`], [`session`], [`driver`], [`plan`]) combine
//! the two to implement the CLI commands.

pub mod core;
pub mod driver;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod plan;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
