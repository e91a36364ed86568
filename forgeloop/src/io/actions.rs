//! Applies one iteration's `ActionSet` to the workspace.
//!
//! File actions run first, strictly in order; then shell actions run in order
//! through the [`CommandRunner`]. Nothing here aborts the iteration: rejected
//! paths, failed writes and failed commands are recorded and the next action
//! proceeds.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::policy::{CommandPolicy, PolicyDecision};
use crate::core::transcript::render_transcript;
use crate::core::types::{ActionSet, CommandResult, FileAction, FileActionKind};
use crate::io::process::{CommandRequest, CommandRunner};
use crate::io::workspace::{DeleteOutcome, ProjectWorkspace};

/// Result of one file action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Written,
    Deleted,
    AlreadyAbsent,
    /// The path failed the sandbox check; nothing was touched.
    Rejected(String),
    /// The filesystem refused the operation.
    Failed(String),
}

/// Outcome of the diagnostic working-directory probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CwdCheck {
    pub reported: String,
    pub matches: bool,
}

/// Everything `apply_actions` did, in order.
#[derive(Debug, Clone, Default)]
pub struct ActionReport {
    pub file_outcomes: Vec<(String, FileOutcome)>,
    pub command_results: Vec<CommandResult>,
    pub transcript: String,
    pub cwd_check: Option<CwdCheck>,
    /// Cancellation was observed; later commands were not started.
    pub cancelled: bool,
}

/// Knobs for shell execution within one iteration.
pub struct ApplyOptions<'a> {
    /// Applied to every command in the set.
    pub timeout: Duration,
    pub policy: &'a dyn CommandPolicy,
    /// Command that prints the current directory, run once before the shell
    /// actions. `None` skips the check.
    pub cwd_check: Option<&'a str>,
}

/// Apply file actions then shell actions, returning the transcript.
#[instrument(skip_all, fields(
    file_actions = actions.file_actions.len(),
    shell_actions = actions.shell_actions.len(),
))]
pub fn apply_actions<R: CommandRunner + ?Sized>(
    actions: &ActionSet,
    workspace: &ProjectWorkspace,
    runner: &R,
    options: &ApplyOptions<'_>,
    cancel: &CancelToken,
) -> ActionReport {
    let mut report = ActionReport {
        file_outcomes: actions
            .file_actions
            .iter()
            .map(|action| (action.path.clone(), apply_file_action(action, workspace)))
            .collect(),
        ..ActionReport::default()
    };

    if actions.shell_actions.is_empty() {
        report.cancelled = cancel.is_cancelled();
        return report;
    }

    if let Some(probe) = options.cwd_check {
        report.cwd_check = check_working_directory(probe, workspace, runner, options, cancel);
    }

    for command in &actions.shell_actions {
        if cancel.is_cancelled() {
            warn!("cancellation observed, skipping remaining commands");
            report.cancelled = true;
            break;
        }
        let result = run_one(command, workspace, runner, options, cancel);
        if result.error.is_some() {
            warn!(command = %command, error = ?result.error, exit_code = ?result.exit_code, "command failed");
        } else {
            info!(command = %command, duration_ms = result.duration.as_millis() as u64, "command succeeded");
        }
        report.command_results.push(result);
    }
    if cancel.is_cancelled() {
        report.cancelled = true;
    }

    report.transcript = render_transcript(&report.command_results);
    report
}

fn apply_file_action(action: &FileAction, workspace: &ProjectWorkspace) -> FileOutcome {
    let path = match workspace.resolve(&action.path) {
        Ok(path) => path,
        Err(rejected) => {
            warn!(path = %action.path, reason = %rejected, "file action rejected");
            return FileOutcome::Rejected(rejected.to_string());
        }
    };

    let result = match action.action {
        FileActionKind::Create | FileActionKind::Modify => {
            let content = action.content.as_deref().unwrap_or_default();
            workspace
                .write_file(&path, content)
                .map(|()| FileOutcome::Written)
        }
        FileActionKind::Delete => workspace.delete(&path).map(|outcome| match outcome {
            DeleteOutcome::Deleted => FileOutcome::Deleted,
            DeleteOutcome::AlreadyAbsent => FileOutcome::AlreadyAbsent,
        }),
    };

    match result {
        Ok(outcome) => {
            info!(action = action.action.as_str(), path = %path.relative(), "file action applied");
            outcome
        }
        Err(err) => {
            warn!(action = action.action.as_str(), path = %path.relative(), err = %format!("{err:#}"), "file action failed");
            FileOutcome::Failed(format!("{err:#}"))
        }
    }
}

fn run_one<R: CommandRunner + ?Sized>(
    command: &str,
    workspace: &ProjectWorkspace,
    runner: &R,
    options: &ApplyOptions<'_>,
    cancel: &CancelToken,
) -> CommandResult {
    if let PolicyDecision::Deny(reason) = options.policy.check(command) {
        warn!(command = %command, reason = %reason, "command rejected by policy");
        return CommandResult::rejected(command, reason);
    }
    runner.execute(
        &CommandRequest {
            command: command.to_string(),
            workdir: workspace.root().to_path_buf(),
            timeout: options.timeout,
        },
        cancel,
    )
}

/// Detect, but do not enforce, a working-directory mismatch.
fn check_working_directory<R: CommandRunner + ?Sized>(
    probe: &str,
    workspace: &ProjectWorkspace,
    runner: &R,
    options: &ApplyOptions<'_>,
    cancel: &CancelToken,
) -> Option<CwdCheck> {
    let result = runner.execute(
        &CommandRequest {
            command: probe.to_string(),
            workdir: workspace.root().to_path_buf(),
            timeout: options.timeout,
        },
        cancel,
    );
    if !result.succeeded() {
        warn!(error = ?result.error, "failed to determine current directory, execution may fail");
        return None;
    }

    let reported = result.stdout.trim().to_string();
    let matches = PathBuf::from(&reported)
        .canonicalize()
        .map(|real| real == workspace.root())
        .unwrap_or(false);
    if matches {
        info!(cwd = %reported, "working directory check passed");
    } else {
        warn!(
            expected = %workspace.root().display(),
            reported = %reported,
            "working directory mismatch"
        );
    }
    Some(CwdCheck { reported, matches })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::{AllowAll, PatternPolicy};
    use crate::core::types::CommandErrorKind;
    use crate::test_support::{ScriptedCommandRunner, test_workspace};

    fn options(policy: &dyn CommandPolicy) -> ApplyOptions<'_> {
        ApplyOptions {
            timeout: Duration::from_secs(5),
            policy,
            cwd_check: None,
        }
    }

    #[test]
    fn traversal_is_rejected_and_nothing_written_outside() {
        let (temp, ws) = test_workspace();
        let actions = ActionSet {
            explanation: String::new(),
            file_actions: vec![
                FileAction::write(FileActionKind::Create, "../escape.txt", "pwned"),
                FileAction::write(FileActionKind::Create, "inside.txt", "ok"),
            ],
            shell_actions: Vec::new(),
        };

        let report = apply_actions(
            &actions,
            &ws,
            &ScriptedCommandRunner::new(),
            &options(&AllowAll),
            &CancelToken::new(),
        );

        assert!(matches!(report.file_outcomes[0].1, FileOutcome::Rejected(_)));
        assert_eq!(report.file_outcomes[1].1, FileOutcome::Written);
        assert!(!temp.path().join("escape.txt").exists());
        assert!(ws.root().join("inside.txt").is_file());
    }

    #[test]
    fn file_actions_apply_in_order() {
        let (_temp, ws) = test_workspace();
        let actions = ActionSet {
            explanation: String::new(),
            file_actions: vec![
                FileAction::write(FileActionKind::Create, "a.txt", "first"),
                FileAction::write(FileActionKind::Modify, "a.txt", "second"),
                FileAction::delete("b.txt"),
                FileAction::write(FileActionKind::Create, "b.txt", "b"),
                FileAction::delete("a.txt"),
            ],
            shell_actions: Vec::new(),
        };

        let report = apply_actions(
            &actions,
            &ws,
            &ScriptedCommandRunner::new(),
            &options(&AllowAll),
            &CancelToken::new(),
        );

        let outcomes: Vec<&FileOutcome> = report.file_outcomes.iter().map(|(_, o)| o).collect();
        assert_eq!(
            outcomes,
            vec![
                &FileOutcome::Written,
                &FileOutcome::Written,
                &FileOutcome::AlreadyAbsent,
                &FileOutcome::Written,
                &FileOutcome::Deleted,
            ]
        );
        assert!(!ws.root().join("a.txt").exists());
        assert_eq!(
            std::fs::read_to_string(ws.root().join("b.txt")).expect("read"),
            "b"
        );
    }

    #[test]
    fn repeated_identical_create_is_idempotent() {
        let (_temp, ws) = test_workspace();
        let content = "def add(a, b):\n    return a + b\n";
        let actions = ActionSet {
            explanation: String::new(),
            file_actions: vec![
                FileAction::write(FileActionKind::Create, "a.py", content),
                FileAction::write(FileActionKind::Create, "a.py", content),
            ],
            shell_actions: Vec::new(),
        };

        let first = apply_actions(
            &actions,
            &ws,
            &ScriptedCommandRunner::new(),
            &options(&AllowAll),
            &CancelToken::new(),
        );
        let second = apply_actions(
            &actions,
            &ws,
            &ScriptedCommandRunner::new(),
            &options(&AllowAll),
            &CancelToken::new(),
        );

        for report in [&first, &second] {
            assert!(
                report
                    .file_outcomes
                    .iter()
                    .all(|(_, outcome)| *outcome == FileOutcome::Written)
            );
        }
        assert_eq!(
            std::fs::read_to_string(ws.root().join("a.py")).expect("read"),
            content
        );
    }

    #[test]
    fn cancellation_is_reported_for_file_only_iterations() {
        let (_temp, ws) = test_workspace();
        let cancel = CancelToken::new();
        cancel.cancel();
        let actions = ActionSet {
            explanation: String::new(),
            file_actions: vec![FileAction::write(FileActionKind::Create, "a.txt", "a")],
            shell_actions: Vec::new(),
        };

        let report = apply_actions(
            &actions,
            &ws,
            &ScriptedCommandRunner::new(),
            &options(&AllowAll),
            &cancel,
        );

        assert!(report.cancelled);
        assert!(report.transcript.is_empty());
    }

    #[test]
    fn failing_command_does_not_stop_the_rest() {
        let (_temp, ws) = test_workspace();
        let runner = ScriptedCommandRunner::new()
            .with_failure("python broken.py", 1, "Traceback (most recent call last)\n")
            .with_output("echo done", "done\n");
        let actions = ActionSet {
            explanation: String::new(),
            file_actions: Vec::new(),
            shell_actions: vec!["python broken.py".to_string(), "echo done".to_string()],
        };

        let report = apply_actions(
            &actions,
            &ws,
            &runner,
            &options(&AllowAll),
            &CancelToken::new(),
        );

        assert_eq!(report.command_results.len(), 2);
        assert_eq!(
            report.command_results[0].error,
            Some(CommandErrorKind::NonZeroExit)
        );
        assert!(report.command_results[1].succeeded());
        assert_eq!(runner.executed(), vec!["python broken.py", "echo done"]);
        assert!(report.transcript.starts_with(
            "Command: python broken.py\nResult:\nERROR: Command failed with exit code 1"
        ));
        assert!(report.transcript.ends_with("Command: echo done\nResult:\ndone\n\n"));
    }

    #[test]
    fn denied_command_is_never_run() {
        let (_temp, ws) = test_workspace();
        let runner = ScriptedCommandRunner::new();
        let policy = PatternPolicy::new(&[], &["^rm ".to_string()]).expect("policy");
        let actions = ActionSet {
            explanation: String::new(),
            file_actions: Vec::new(),
            shell_actions: vec!["rm -rf data".to_string(), "ls".to_string()],
        };

        let report = apply_actions(&actions, &ws, &runner, &options(&policy), &CancelToken::new());

        assert_eq!(
            report.command_results[0].error,
            Some(CommandErrorKind::Rejected)
        );
        assert_eq!(runner.executed(), vec!["ls"]);
        assert!(report.transcript.contains("ERROR: Command rejected by policy"));
    }

    #[test]
    fn cwd_probe_runs_once_and_stays_out_of_transcript() {
        let (_temp, ws) = test_workspace();
        let root = ws.root().display().to_string();
        let runner = ScriptedCommandRunner::new().with_output("pwd", &format!("{root}\n"));
        let actions = ActionSet {
            explanation: String::new(),
            file_actions: Vec::new(),
            shell_actions: vec!["echo hi".to_string()],
        };
        let opts = ApplyOptions {
            timeout: Duration::from_secs(5),
            policy: &AllowAll,
            cwd_check: Some("pwd"),
        };

        let report = apply_actions(&actions, &ws, &runner, &opts, &CancelToken::new());

        assert_eq!(runner.executed(), vec!["pwd", "echo hi"]);
        assert_eq!(
            report.cwd_check,
            Some(CwdCheck {
                reported: root,
                matches: true
            })
        );
        assert!(!report.transcript.contains("Command: pwd"));
    }

    #[test]
    fn cancelled_before_commands_skips_them() {
        let (_temp, ws) = test_workspace();
        let runner = ScriptedCommandRunner::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let actions = ActionSet {
            explanation: String::new(),
            file_actions: Vec::new(),
            shell_actions: vec!["echo hi".to_string()],
        };

        let report = apply_actions(&actions, &ws, &runner, &options(&AllowAll), &cancel);

        assert!(report.cancelled);
        assert!(runner.executed().is_empty());
        assert!(report.command_results.is_empty());
    }

    #[test]
    fn no_shell_actions_yields_empty_transcript() {
        let (_temp, ws) = test_workspace();
        let runner = ScriptedCommandRunner::new();
        let report = apply_actions(
            &ActionSet::default(),
            &ws,
            &runner,
            &options(&AllowAll),
            &CancelToken::new(),
        );

        assert_eq!(report.transcript, "");
        assert!(runner.executed().is_empty());
    }
}
