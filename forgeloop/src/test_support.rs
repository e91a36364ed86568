//! Scripted collaborators for engine and executor tests.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::core::types::{CommandErrorKind, CommandResult};
use crate::events::{CycleEvent, EventSink};
use crate::io::generator::{GenerateRequest, Generator, GeneratorError};
use crate::io::process::{CommandRequest, CommandRunner};
use crate::io::workspace::ProjectWorkspace;

/// A fresh workspace under a temp dir. Keep the `TempDir` alive.
pub fn test_workspace() -> (tempfile::TempDir, ProjectWorkspace) {
    let temp = tempfile::tempdir().expect("tempdir");
    let ws = ProjectWorkspace::create(temp.path().join("project")).expect("workspace");
    (temp, ws)
}

/// A well-formed payload creating `(path, content)` files and running
/// `shell_actions`.
pub fn payload(files: &[(&str, &str)], shell_actions: &[&str]) -> String {
    let file_actions: Vec<serde_json::Value> = files
        .iter()
        .map(|(path, content)| {
            serde_json::json!({ "action": "create", "path": path, "content": content })
        })
        .collect();
    serde_json::json!({
        "explanation": "scripted",
        "file_actions": file_actions,
        "shell_actions": shell_actions,
    })
    .to_string()
}

/// Replies from a queue, recording every prompt. Once the queue is empty it
/// keeps answering with an empty payload.
pub struct ScriptedGenerator {
    replies: RefCell<VecDeque<Result<String, GeneratorError>>>,
    prompts: RefCell<Vec<String>>,
    on_call: Option<Box<dyn Fn(usize)>>,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<Result<String, GeneratorError>>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            prompts: RefCell::new(Vec::new()),
            on_call: None,
        }
    }

    /// Run `hook` with the zero-based call number before replying.
    pub fn on_call(mut self, hook: impl Fn(usize) + 'static) -> Self {
        self.on_call = Some(Box::new(hook));
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl Generator for ScriptedGenerator {
    fn generate(
        &self,
        request: &GenerateRequest<'_>,
        _cancel: &CancelToken,
    ) -> Result<String, GeneratorError> {
        let call = self.prompts.borrow().len();
        self.prompts.borrow_mut().push(request.prompt.to_string());
        if let Some(hook) = &self.on_call {
            hook(call);
        }
        self.replies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Ok(payload(&[], &[])))
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

struct ScriptedOutcome {
    stdout: String,
    stderr: String,
    exit_code: i32,
}

/// Answers commands from a table without spawning anything. Unknown commands
/// succeed with empty output.
#[derive(Default)]
pub struct ScriptedCommandRunner {
    outcomes: HashMap<String, ScriptedOutcome>,
    executed: Mutex<Vec<String>>,
    cancel_on: Option<String>,
}

impl ScriptedCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, command: &str, stdout: &str) -> Self {
        self.outcomes.insert(
            command.to_string(),
            ScriptedOutcome {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: 0,
            },
        );
        self
    }

    pub fn with_failure(mut self, command: &str, exit_code: i32, stderr: &str) -> Self {
        self.outcomes.insert(
            command.to_string(),
            ScriptedOutcome {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_code,
            },
        );
        self
    }

    /// Trip the cancel token while `command` runs, as Ctrl-C would.
    pub fn cancel_during(mut self, command: &str) -> Self {
        self.cancel_on = Some(command.to_string());
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().expect("executed lock").clone()
    }
}

impl CommandRunner for ScriptedCommandRunner {
    fn execute(&self, request: &CommandRequest, cancel: &CancelToken) -> CommandResult {
        self.executed
            .lock()
            .expect("executed lock")
            .push(request.command.clone());

        let mut result = CommandResult {
            command: request.command.clone(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
            duration: Duration::from_millis(1),
            timeout: request.timeout,
            timed_out: false,
            error: None,
            detail: None,
        };
        if self.cancel_on.as_deref() == Some(request.command.as_str()) {
            cancel.cancel();
            result.exit_code = None;
            result.error = Some(CommandErrorKind::Cancelled);
            return result;
        }
        if let Some(outcome) = self.outcomes.get(&request.command) {
            result.stdout.clone_from(&outcome.stdout);
            result.stderr.clone_from(&outcome.stderr);
            result.exit_code = Some(outcome.exit_code);
            if outcome.exit_code != 0 {
                result.error = Some(CommandErrorKind::NonZeroExit);
            }
        }
        result
    }
}

/// Records a one-line rendering of every event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("events lock").clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &CycleEvent<'_>) {
        let line = match event {
            CycleEvent::RunStarted { topic, .. } => format!("run_started {topic}"),
            CycleEvent::Phase { iteration, phase } => {
                format!("phase {iteration} {}", phase.as_str())
            }
            CycleEvent::ResponseParsed {
                iteration, status, ..
            } => format!("parsed {iteration} {status:?}"),
            CycleEvent::FileApplied {
                iteration,
                path,
                outcome,
            } => format!("file {iteration} {path} {outcome:?}"),
            CycleEvent::CommandFinished { iteration, result } => {
                format!("command {iteration} {}", result.command)
            }
            CycleEvent::GeneratorFailed { iteration, error } => {
                format!("generator_failed {iteration}: {error}")
            }
            CycleEvent::IterationFinished {
                iteration, outcome, ..
            } => format!("iteration {iteration} {}", outcome.reason),
            CycleEvent::RunFinished {
                iterations_completed,
                stop,
                ..
            } => format!("run_finished {iterations_completed} {stop:?}"),
        };
        self.events.lock().expect("events lock").push(line);
    }
}
