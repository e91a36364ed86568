//! Structured progress events emitted by the cycle engine.
//!
//! The engine never prints. Anything that wants to observe a run (the CLI
//! report, tracing, tests) implements [`EventSink`].

use std::path::Path;

use tracing::{info, warn};

use crate::core::types::{CommandResult, Outcome, ParseStatus};
use crate::cycle::{CyclePhase, CycleStop};
use crate::io::actions::FileOutcome;

#[derive(Debug)]
pub enum CycleEvent<'a> {
    RunStarted {
        topic: &'a str,
        workspace: &'a Path,
        max_iterations: u32,
        generator: &'a str,
    },
    Phase {
        iteration: u32,
        phase: CyclePhase,
    },
    ResponseParsed {
        iteration: u32,
        status: ParseStatus,
        file_actions: usize,
        shell_actions: usize,
        diagnostics: &'a [String],
    },
    FileApplied {
        iteration: u32,
        path: &'a str,
        outcome: &'a FileOutcome,
    },
    CommandFinished {
        iteration: u32,
        result: &'a CommandResult,
    },
    /// The generator failed without aborting the run.
    GeneratorFailed {
        iteration: u32,
        error: &'a str,
    },
    IterationFinished {
        iteration: u32,
        max_iterations: u32,
        outcome: &'a Outcome,
    },
    RunFinished {
        iterations_completed: u32,
        stop: &'a CycleStop,
        workspace: &'a Path,
    },
}

pub trait EventSink {
    fn emit(&self, event: &CycleEvent<'_>);
}

/// Forwards every event to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &CycleEvent<'_>) {
        match event {
            CycleEvent::RunStarted {
                topic,
                workspace,
                max_iterations,
                generator,
            } => info!(
                topic = %topic,
                workspace = %workspace.display(),
                max_iterations,
                generator = %generator,
                "run started"
            ),
            CycleEvent::Phase { iteration, phase } => {
                tracing::debug!(iteration, phase = phase.as_str(), "phase");
            }
            CycleEvent::ResponseParsed {
                iteration,
                status,
                file_actions,
                shell_actions,
                diagnostics,
            } => {
                if status.is_parsed() {
                    info!(iteration, file_actions, shell_actions, dropped = diagnostics.len(), "response parsed");
                } else {
                    warn!(iteration, status = ?status, "response carried no usable payload");
                }
                for diagnostic in *diagnostics {
                    warn!(iteration, diagnostic = %diagnostic, "payload entry dropped");
                }
            }
            CycleEvent::FileApplied {
                iteration,
                path,
                outcome,
            } => match outcome {
                FileOutcome::Rejected(reason) | FileOutcome::Failed(reason) => {
                    warn!(iteration, path = %path, reason = %reason, "file action not applied");
                }
                _ => tracing::debug!(iteration, path = %path, outcome = ?outcome, "file action"),
            },
            CycleEvent::CommandFinished { iteration, result } => info!(
                iteration,
                command = %result.command,
                exit_code = ?result.exit_code,
                error = ?result.error,
                duration_ms = result.duration.as_millis() as u64,
                "command finished"
            ),
            CycleEvent::GeneratorFailed { iteration, error } => {
                warn!(iteration, error = %error, "generator failed, iteration is a no-op");
            }
            CycleEvent::IterationFinished {
                iteration,
                max_iterations,
                outcome,
            } => info!(
                iteration = iteration + 1,
                max_iterations,
                success = outcome.success,
                terminate = outcome.terminate,
                reason = %outcome.reason,
                "iteration finished"
            ),
            CycleEvent::RunFinished {
                iterations_completed,
                stop,
                workspace,
            } => info!(
                iterations_completed,
                stop = ?stop,
                workspace = %workspace.display(),
                "run finished"
            ),
        }
    }
}

/// Sends each event to several sinks in order.
pub struct FanOut<'a> {
    sinks: Vec<&'a dyn EventSink>,
}

impl<'a> FanOut<'a> {
    pub fn new(sinks: Vec<&'a dyn EventSink>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanOut<'_> {
    fn emit(&self, event: &CycleEvent<'_>) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
