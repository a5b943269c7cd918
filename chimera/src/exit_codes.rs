//! Stable exit codes for chimera CLI commands.

/// The checklist is complete, or the command succeeded.
pub const OK: i32 = 0;
/// Invalid config, missing files, gateway failures, workspace escapes.
pub const ERROR: i32 = 1;
/// A turn cap or the step limit ran out before the checklist was done.
pub const EXHAUSTED: i32 = 2;
/// The agent declared itself stuck.
pub const STUCK: i32 = 3;
/// Stopped by Ctrl-C.
pub const INTERRUPTED: i32 = 130;
