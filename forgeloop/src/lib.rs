//! Automated build-fix loop.
//!
//! Each iteration asks an external generator for file mutations and shell
//! commands, applies them inside a sandboxed project directory, runs the
//! commands, and classifies the transcript to decide whether to continue.
//!
//! - **[`core`]**: pure, deterministic logic (parsing, classification, path
//!   resolution, transcript rendering). No I/O.
//! - **[`io`]**: side-effecting collaborators (processes, filesystem,
//!   generators, configuration). Injected into the engine so tests can script
//!   them.
//! - **[`cycle`]**: the engine that drives one run.

pub mod cancel;
pub mod core;
pub mod cycle;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
