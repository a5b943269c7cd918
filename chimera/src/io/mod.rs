//! I/O adapters used by the agent loop and the CLI.

pub mod checklist_store;
pub mod config;
pub mod gateway;
pub mod git;
pub mod process;
pub mod prompt;
pub mod sandbox;
