//! Rendering of command results into the text the classifier reads.

use crate::core::types::{CommandErrorKind, CommandResult};

/// Text recorded for one command: its output on success, or an `ERROR:`
/// prefixed description followed by whatever output was captured.
pub fn result_text(result: &CommandResult) -> String {
    let Some(kind) = result.error else {
        return result.combined_output();
    };
    let detail = result.detail.as_deref().unwrap_or("unknown error");
    match kind {
        CommandErrorKind::SpawnFailure => format!("ERROR: Error executing command: {detail}"),
        CommandErrorKind::Rejected => format!("ERROR: Command rejected by policy: {detail}"),
        CommandErrorKind::Cancelled => "ERROR: Command cancelled".to_string(),
        CommandErrorKind::Timeout => {
            let mut text = format!(
                "ERROR: Command timed out after {} seconds",
                result.timeout.as_secs()
            );
            let partial = result.combined_output();
            if !partial.is_empty() {
                text.push('\n');
                text.push_str(&partial);
            }
            text
        }
        CommandErrorKind::NonZeroExit => {
            let code = result
                .exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_string());
            format!(
                "ERROR: Command failed with exit code {code}: {}\n{}",
                result.stderr, result.stdout
            )
        }
    }
}

/// One transcript entry per shell action.
pub fn transcript_entry(result: &CommandResult) -> String {
    format!(
        "Command: {}\nResult:\n{}\n",
        result.command,
        result_text(result)
    )
}

/// Ordered concatenation of every command's entry.
pub fn render_transcript(results: &[CommandResult]) -> String {
    results
        .iter()
        .map(transcript_entry)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn ok(command: &str, stdout: &str) -> CommandResult {
        CommandResult {
            command: command.to_string(),
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
            duration: Duration::from_millis(5),
            timeout: Duration::from_secs(30),
            timed_out: false,
            error: None,
            detail: None,
        }
    }

    #[test]
    fn entries_are_ordered_and_joined() {
        let transcript = render_transcript(&[ok("echo a", "a\n"), ok("echo b", "b\n")]);
        assert_eq!(
            transcript,
            "Command: echo a\nResult:\na\n\n\nCommand: echo b\nResult:\nb\n\n"
        );
    }

    #[test]
    fn non_zero_exit_is_error_prefixed_with_code_and_streams() {
        let mut result = ok("python app.py", "partial\n");
        result.stderr = "boom\n".to_string();
        result.exit_code = Some(2);
        result.error = Some(CommandErrorKind::NonZeroExit);

        let text = result_text(&result);
        assert!(text.starts_with("ERROR: Command failed with exit code 2: boom\n"));
        assert!(text.ends_with("partial\n"));
    }

    #[test]
    fn timeout_reports_configured_limit() {
        let mut result = ok("sleep 5", "");
        result.timeout = Duration::from_secs(3);
        result.duration = Duration::from_millis(4_100);
        result.timed_out = true;
        result.error = Some(CommandErrorKind::Timeout);

        assert_eq!(result_text(&result), "ERROR: Command timed out after 3 seconds");
    }

    #[test]
    fn rejection_carries_reason() {
        let result = CommandResult::rejected("sudo ls", "matches deny pattern `^sudo`");
        assert_eq!(
            result_text(&result),
            "ERROR: Command rejected by policy: matches deny pattern `^sudo`"
        );
    }

    #[test]
    fn empty_result_list_renders_empty_transcript() {
        assert_eq!(render_transcript(&[]), "");
    }
}
