//! Shared deterministic types for the build-fix loop.
//!
//! These types are the contracts between the parser, the action executor, the
//! classifier and the cycle engine. They carry no I/O handles.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Kind of filesystem mutation requested by the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileActionKind {
    Create,
    Modify,
    Delete,
}

impl FileActionKind {
    /// Parse the `action` field of a payload entry. Case and surrounding
    /// whitespace are ignored; anything else is unknown.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "create" => Some(Self::Create),
            "modify" => Some(Self::Modify),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }
}

/// One file mutation, with a path relative to the workspace root.
///
/// `content` is always `Some` for `Create`/`Modify` once the parser has
/// accepted the action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAction {
    pub action: FileActionKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl FileAction {
    pub fn write(kind: FileActionKind, path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            action: kind,
            path: path.into(),
            content: Some(content.into()),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            action: FileActionKind::Delete,
            path: path.into(),
            content: None,
        }
    }
}

/// One iteration's parsed payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSet {
    pub explanation: String,
    pub file_actions: Vec<FileAction>,
    pub shell_actions: Vec<String>,
}

impl ActionSet {
    pub fn is_empty(&self) -> bool {
        self.file_actions.is_empty() && self.shell_actions.is_empty()
    }
}

/// How the parser fared with a generator response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    /// A payload was found and decoded.
    Parsed,
    /// No `{ ... }` span was present in the response.
    NoPayload,
    /// A span was found but did not decode as a payload object.
    Malformed,
}

impl ParseStatus {
    pub fn is_parsed(self) -> bool {
        self == Self::Parsed
    }
}

/// Why a command did not complete cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandErrorKind {
    SpawnFailure,
    Timeout,
    NonZeroExit,
    Cancelled,
    /// Refused by the command policy; never spawned.
    Rejected,
}

/// Structured result of a single shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    /// Limit the command ran under.
    pub timeout: Duration,
    pub timed_out: bool,
    pub error: Option<CommandErrorKind>,
    /// Human-readable detail for spawn failures and policy rejections.
    pub detail: Option<String>,
}

impl CommandResult {
    /// Result for a command that was never spawned because the policy refused it.
    pub fn rejected(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration: Duration::ZERO,
            timeout: Duration::ZERO,
            timed_out: false,
            error: Some(CommandErrorKind::Rejected),
            detail: Some(reason.into()),
        }
    }

    /// Result for a command that could not be started.
    pub fn spawn_failure(
        command: impl Into<String>,
        detail: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration,
            timeout: Duration::ZERO,
            timed_out: false,
            error: Some(CommandErrorKind::SpawnFailure),
            detail: Some(detail.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Stdout followed by stderr.
    pub fn combined_output(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len());
        out.push_str(&self.stdout);
        out.push_str(&self.stderr);
        out
    }
}

/// Tags for the independent success checks run by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessTag {
    SuccessKeyword,
    TestSuccess,
    BuildSuccess,
    ServerStarted,
}

/// Classifier verdict for one transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub success: bool,
    pub terminate: bool,
    pub reason: String,
    pub error_detected: bool,
    pub success_patterns: BTreeSet<SuccessTag>,
    /// Cosmetic excerpt of the transcript; never consulted for control flow.
    pub summary: String,
}

/// Immutable record of one completed iteration.
#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    index: u32,
    actions: ActionSet,
    parse_status: ParseStatus,
    command_results: Vec<CommandResult>,
    transcript: String,
    outcome: Outcome,
    timestamp_ms: u64,
}

impl IterationRecord {
    pub fn new(
        index: u32,
        actions: ActionSet,
        parse_status: ParseStatus,
        command_results: Vec<CommandResult>,
        transcript: String,
        outcome: Outcome,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            index,
            actions,
            parse_status,
            command_results,
            transcript,
            outcome,
            timestamp_ms,
        }
    }

    /// Zero-based iteration index.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn actions(&self) -> &ActionSet {
        &self.actions
    }

    pub fn parse_status(&self) -> ParseStatus {
        self.parse_status
    }

    pub fn command_results(&self) -> &[CommandResult] {
        &self.command_results
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// Milliseconds since the Unix epoch at which classification finished.
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }
}
