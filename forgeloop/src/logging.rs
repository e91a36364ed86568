//! Diagnostic tracing for the loop.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, written to stderr.
//!   Not persisted.
//!
//! - **Iteration logging (`io/iteration_log`)**: inspection artifacts in
//!   `<workspace>/.forgeloop/iterations/`. Written regardless of `RUST_LOG`.
//!
//! - **Console report (`main`)**: the per-iteration status lines on stdout.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `forgeloop=info` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=forgeloop=debug forgeloop run "todo api"
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("forgeloop=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
