//! Diagnostic tracing.
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, output to stderr.
//! - **Operator output**: run banner, per-step lines and the run summary are
//!   printed to stdout by the CLI and are unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn`, or `chimera=info,warn` when `verbose`.
///
/// # Example
/// ```bash
/// RUST_LOG=chimera=debug chimera work
/// ```
pub fn init(verbose: bool) {
    let default = if verbose { "chimera=info,warn" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
