//! The iterate-generate-act-classify loop.
//!
//! One iteration runs to completion before the next begins:
//!
//! 1. Generating: render the prompt and block on the generator.
//! 2. Parsing: extract an `ActionSet` (possibly empty).
//! 3. Executing: apply file actions, run shell actions, build the transcript.
//! 4. Classifying: derive an `Outcome` and append an `IterationRecord`.
//!
//! The run stops when an outcome asks to terminate, when the iteration budget
//! is spent, or when the cancel token trips. A cancelled iteration is never
//! classified or recorded.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::classifier::classify;
use crate::core::parser::{ParsedResponse, parse_response};
use crate::core::policy::{AllowAll, CommandPolicy};
use crate::core::types::{IterationRecord, Outcome};
use crate::events::{CycleEvent, EventSink};
use crate::io::actions::{ActionReport, ApplyOptions, apply_actions};
use crate::io::config::PromptConfig;
use crate::io::generator::{GenerateRequest, Generator, GeneratorError};
use crate::io::iteration_log::{
    IterationMeta, IterationWriteRequest, new_run_id, now_ms, write_iteration,
};
use crate::io::process::CommandRunner;
use crate::io::prompt::PromptBuilder;
use crate::io::workspace::ProjectWorkspace;

static ALLOW_ALL: AllowAll = AllowAll;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Generating,
    Parsing,
    Executing,
    Classifying,
    Continuing,
    Terminated,
    ExhaustedIterations,
    Cancelled,
}

impl CyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Generating => "generating",
            Self::Parsing => "parsing",
            Self::Executing => "executing",
            Self::Classifying => "classifying",
            Self::Continuing => "continuing",
            Self::Terminated => "terminated",
            Self::ExhaustedIterations => "exhausted_iterations",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Explicit run parameters. The engine never reads configuration files.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub max_iterations: u32,
    /// Applied to every shell action.
    pub command_timeout: Duration,
    /// Reported only; the transition rule does not consult it.
    pub stop_on_error: bool,
    /// Working-directory probe run before each iteration's commands.
    pub cwd_check: Option<String>,
    pub project_name: String,
    pub prompt: PromptConfig,
    pub log_iterations: bool,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            command_timeout: Duration::from_secs(300),
            stop_on_error: false,
            cwd_check: Some("pwd".to_string()),
            project_name: "project".to_string(),
            prompt: PromptConfig::default(),
            log_iterations: true,
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleStop {
    Terminated { reason: String, success: bool },
    ExhaustedIterations,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    /// The workspace persists after the run for inspection.
    pub workspace: PathBuf,
    pub iterations_completed: u32,
    pub stop: CycleStop,
    pub history: Vec<IterationRecord>,
}

pub struct CycleEngine<'a, G, R> {
    config: CycleConfig,
    workspace: ProjectWorkspace,
    generator: G,
    runner: R,
    policy: &'a dyn CommandPolicy,
    sink: &'a dyn EventSink,
    cancel: CancelToken,
    prompts: PromptBuilder,
    phase: CyclePhase,
    run_id: String,
}

impl<'a, G: Generator, R: CommandRunner> CycleEngine<'a, G, R> {
    pub fn new(
        config: CycleConfig,
        workspace: ProjectWorkspace,
        generator: G,
        runner: R,
        sink: &'a dyn EventSink,
        cancel: CancelToken,
    ) -> Self {
        Self {
            prompts: PromptBuilder::new(config.prompt.clone()),
            config,
            workspace,
            generator,
            runner,
            policy: &ALLOW_ALL,
            sink,
            cancel,
            phase: CyclePhase::Idle,
            run_id: new_run_id(),
        }
    }

    /// Consult `policy` before every generator-issued command.
    pub fn with_policy(mut self, policy: &'a dyn CommandPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Run the loop for `topic`.
    ///
    /// Returns `Err` only for environment-level failures: the prompt cannot be
    /// rendered, or the generator is unavailable with nothing to fall back to.
    #[instrument(skip_all, fields(run_id = %self.run_id, max_iterations = self.config.max_iterations))]
    pub fn run(&mut self, topic: &str) -> Result<CycleReport> {
        let generator_label = self.generator.describe();
        self.sink.emit(&CycleEvent::RunStarted {
            topic,
            workspace: self.workspace.root(),
            max_iterations: self.config.max_iterations,
            generator: &generator_label,
        });
        info!(
            stop_on_error = self.config.stop_on_error,
            "stop_on_error is reported only and does not end the loop"
        );

        let mut history = Vec::new();
        let mut previous = String::new();

        for index in 0..self.config.max_iterations {
            if self.cancel.is_cancelled() {
                return Ok(self.finish(CycleStop::Cancelled, history));
            }
            let started = Instant::now();

            self.set_phase(index, CyclePhase::Generating);
            let Some(response) = self.generate(topic, index, &previous)? else {
                return Ok(self.finish(CycleStop::Cancelled, history));
            };
            if self.cancel.is_cancelled() {
                return Ok(self.finish(CycleStop::Cancelled, history));
            }

            self.set_phase(index, CyclePhase::Parsing);
            let parsed = parse_response(&response);
            self.sink.emit(&CycleEvent::ResponseParsed {
                iteration: index,
                status: parsed.status,
                file_actions: parsed.actions.file_actions.len(),
                shell_actions: parsed.actions.shell_actions.len(),
                diagnostics: &parsed.diagnostics,
            });

            self.set_phase(index, CyclePhase::Executing);
            let report = self.execute(index, &parsed);
            if report.cancelled {
                return Ok(self.finish(CycleStop::Cancelled, history));
            }

            self.set_phase(index, CyclePhase::Classifying);
            let outcome = classify(&report.transcript);
            self.log_iteration(index, started, &parsed, &report, &response, &generator_label, &outcome);
            self.sink.emit(&CycleEvent::IterationFinished {
                iteration: index,
                max_iterations: self.config.max_iterations,
                outcome: &outcome,
            });

            let terminate = outcome.terminate.then(|| CycleStop::Terminated {
                reason: outcome.reason.clone(),
                success: outcome.success,
            });
            previous.clone_from(&report.transcript);
            history.push(IterationRecord::new(
                index,
                parsed.actions,
                parsed.status,
                report.command_results,
                report.transcript,
                outcome,
                now_ms(),
            ));

            if let Some(stop) = terminate {
                return Ok(self.finish(stop, history));
            }
            if index + 1 < self.config.max_iterations {
                self.set_phase(index, CyclePhase::Continuing);
            }
        }

        Ok(self.finish(CycleStop::ExhaustedIterations, history))
    }

    /// `Ok(None)` means the call was cancelled. Timeouts and failures become
    /// an empty response so the iteration is a no-op.
    fn generate(&self, topic: &str, index: u32, previous: &str) -> Result<Option<String>> {
        let inputs = self.prompts.gather(
            &self.workspace,
            &self.config.project_name,
            topic,
            index,
            self.config.max_iterations,
            previous,
        );
        let pack = self.prompts.build(&inputs).context("render prompt")?;
        let request = GenerateRequest {
            prompt: &pack.user,
            system_prompt: &pack.system,
        };

        match self.generator.generate(&request, &self.cancel) {
            Ok(text) => Ok(Some(text)),
            Err(GeneratorError::Cancelled) => Ok(None),
            Err(GeneratorError::Unavailable(reason)) => Err(anyhow!(
                "generator {} unavailable and no fallback configured: {reason}",
                self.generator.describe()
            )),
            Err(err @ (GeneratorError::Timeout(_) | GeneratorError::Failed(_))) => {
                let error = err.to_string();
                self.sink.emit(&CycleEvent::GeneratorFailed {
                    iteration: index,
                    error: &error,
                });
                Ok(Some(String::new()))
            }
        }
    }

    fn execute(&self, index: u32, parsed: &ParsedResponse) -> ActionReport {
        let options = ApplyOptions {
            timeout: self.config.command_timeout,
            policy: self.policy,
            cwd_check: self.config.cwd_check.as_deref(),
        };
        let report = apply_actions(
            &parsed.actions,
            &self.workspace,
            &self.runner,
            &options,
            &self.cancel,
        );
        for (path, outcome) in &report.file_outcomes {
            self.sink.emit(&CycleEvent::FileApplied {
                iteration: index,
                path,
                outcome,
            });
        }
        for result in &report.command_results {
            self.sink.emit(&CycleEvent::CommandFinished {
                iteration: index,
                result,
            });
        }
        report
    }

    #[allow(clippy::too_many_arguments)]
    fn log_iteration(
        &self,
        index: u32,
        started: Instant,
        parsed: &ParsedResponse,
        report: &ActionReport,
        response: &str,
        generator: &str,
        outcome: &Outcome,
    ) {
        if !self.config.log_iterations {
            return;
        }
        let meta = IterationMeta {
            run_id: self.run_id.clone(),
            iter: index + 1,
            timestamp_ms: now_ms(),
            duration_ms: started.elapsed().as_millis() as u64,
            generator: generator.to_string(),
            parse_status: parsed.status,
            outcome: outcome.clone(),
        };
        let written = write_iteration(&IterationWriteRequest {
            root: self.workspace.root(),
            run_id: &self.run_id,
            meta: &meta,
            actions: &parsed.actions,
            diagnostics: &parsed.diagnostics,
            transcript: &report.transcript,
            response,
        });
        if let Err(err) = written {
            warn!(iteration = index, err = %format!("{err:#}"), "failed to write iteration log");
        }
    }

    fn set_phase(&mut self, iteration: u32, phase: CyclePhase) {
        self.phase = phase;
        self.sink.emit(&CycleEvent::Phase { iteration, phase });
    }

    fn finish(&mut self, stop: CycleStop, history: Vec<IterationRecord>) -> CycleReport {
        let iterations_completed = history.len() as u32;
        let phase = match stop {
            CycleStop::Terminated { .. } => CyclePhase::Terminated,
            CycleStop::ExhaustedIterations => CyclePhase::ExhaustedIterations,
            CycleStop::Cancelled => CyclePhase::Cancelled,
        };
        self.set_phase(iterations_completed, phase);
        self.sink.emit(&CycleEvent::RunFinished {
            iterations_completed,
            stop: &stop,
            workspace: self.workspace.root(),
        });
        CycleReport {
            workspace: self.workspace.root().to_path_buf(),
            iterations_completed,
            stop,
            history,
        }
    }
}
