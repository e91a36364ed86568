//! Heuristic classification of an iteration transcript.
//!
//! Classification is a pure function of the transcript text. Exit codes are
//! visible in the transcript only through the `ERROR:` prefix the action
//! executor writes for failed commands.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{Outcome, SuccessTag};

/// Substrings that mark a transcript as failed. Checked in order; the first
/// hit is enough.
const ERROR_MARKERS: &[&str] = &[
    "ERROR:",
    "Error:",
    "Exception:",
    "failed with exit code",
    "Command failed",
    "Traceback (most recent call last)",
    "ModuleNotFoundError:",
    "ImportError:",
    "SyntaxError:",
    "NameError:",
    "TypeError:",
    "ValueError:",
];

const CRITICAL_MARKER: &str = "CRITICAL ERROR";

const SUMMARY_HEAD_LINES: usize = 5;
const SUMMARY_MAX_LINES: usize = 10;
const SUMMARY_ERROR_WORDS: &[&str] = &["error", "exception", "failed", "traceback"];

static TEST_SUCCESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)All tests passed|Tests passed|Test successful").expect("valid regex")
});
static BUILD_SUCCESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Build successful|Built successfully").expect("valid regex"));
static SERVER_STARTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Server started|Running on|Listening on").expect("valid regex")
});
static GOAL_COMPLETE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Optimization complete|Goal achieved|Success criteria met")
        .expect("valid regex")
});

/// Ordered table of specific failure reasons. The first matching row wins.
static FAILURE_REASONS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"ModuleNotFoundError: No module named '([^']+)'", "Missing module"),
        (r"ImportError: ([^\n]+)", "Import error"),
        (r"SyntaxError: ([^\n]+)", "Syntax error"),
        (r"TypeError: ([^\n]+)", "Type error"),
        (r"ValueError: ([^\n]+)", "Value error"),
    ]
    .into_iter()
    .map(|(pattern, label)| (Regex::new(pattern).expect("valid regex"), label))
    .collect()
});

/// Classify a transcript into an [`Outcome`].
pub fn classify(transcript: &str) -> Outcome {
    if transcript.is_empty() {
        return Outcome {
            success: false,
            terminate: false,
            reason: "Empty result".to_string(),
            error_detected: false,
            success_patterns: BTreeSet::new(),
            summary: String::new(),
        };
    }

    let error_detected = has_error_marker(transcript);
    let success_patterns = success_patterns(transcript);
    let success = !error_detected && !success_patterns.is_empty();
    let critical = transcript.contains(CRITICAL_MARKER);
    let terminate = critical || GOAL_COMPLETE_RE.is_match(transcript);

    Outcome {
        success,
        terminate,
        reason: reason(transcript, success, terminate, critical),
        error_detected,
        success_patterns,
        summary: summarize(transcript),
    }
}

fn has_error_marker(transcript: &str) -> bool {
    ERROR_MARKERS
        .iter()
        .any(|marker| transcript.contains(marker))
}

fn success_patterns(transcript: &str) -> BTreeSet<SuccessTag> {
    let mut tags = BTreeSet::new();
    if transcript.to_lowercase().contains("successfully") {
        tags.insert(SuccessTag::SuccessKeyword);
    }
    if TEST_SUCCESS_RE.is_match(transcript) {
        tags.insert(SuccessTag::TestSuccess);
    }
    if BUILD_SUCCESS_RE.is_match(transcript) {
        tags.insert(SuccessTag::BuildSuccess);
    }
    if SERVER_STARTED_RE.is_match(transcript) {
        tags.insert(SuccessTag::ServerStarted);
    }
    tags
}

fn reason(transcript: &str, success: bool, terminate: bool, critical: bool) -> String {
    if critical {
        return "Critical error occurred".to_string();
    }
    if terminate {
        return if success {
            "Success criteria met".to_string()
        } else {
            "Termination condition detected".to_string()
        };
    }
    if success {
        return "Execution completed successfully".to_string();
    }
    FAILURE_REASONS
        .iter()
        .find_map(|(re, label)| {
            re.captures(transcript)
                .and_then(|caps| caps.get(1))
                .map(|detail| format!("{label}: {}", detail.as_str().trim_end()))
        })
        .unwrap_or_else(|| "Execution failed with errors".to_string())
}

/// First lines of the transcript plus later lines that look like errors,
/// capped with a trailing `...` marker.
pub fn summarize(transcript: &str) -> String {
    let lines: Vec<&str> = transcript.trim().split('\n').collect();
    let mut relevant: Vec<&str> = lines.iter().take(SUMMARY_HEAD_LINES).copied().collect();
    relevant.extend(
        lines
            .iter()
            .skip(SUMMARY_HEAD_LINES)
            .filter(|line| SUMMARY_ERROR_WORDS.iter().any(|word| line.contains(word)))
            .copied(),
    );
    if relevant.len() > SUMMARY_MAX_LINES {
        relevant.truncate(SUMMARY_MAX_LINES);
        relevant.push("...");
    }
    relevant.join("\n")
}
