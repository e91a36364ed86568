//! Lenient extraction of the action payload from generator text.
//!
//! The generator is asked for a JSON object but routinely wraps it in prose or
//! code fences. The parser takes the span from the first `{` to the last `}`
//! and decodes it field by field, so one bad entry only costs that entry.
//! Braces inside string content that are left unbalanced by surrounding prose
//! can make the span wrong; in that case the response decodes as malformed.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::types::{ActionSet, FileAction, FileActionKind, ParseStatus};

/// Parser output: always an `ActionSet`, possibly empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedResponse {
    pub actions: ActionSet,
    pub status: ParseStatus,
    /// Entries that were dropped and why, in payload order.
    pub diagnostics: Vec<String>,
}

impl ParsedResponse {
    fn empty(status: ParseStatus, diagnostic: String) -> Self {
        Self {
            actions: ActionSet::default(),
            status,
            diagnostics: vec![diagnostic],
        }
    }
}

/// Parse a raw generator response. Never fails.
pub fn parse_response(raw: &str) -> ParsedResponse {
    let Some(span) = payload_span(raw) else {
        warn!("no JSON object found in generator response");
        return ParsedResponse::empty(
            ParseStatus::NoPayload,
            "no JSON object found in response".to_string(),
        );
    };

    let value: Value = match serde_json::from_str(span) {
        Ok(value) => value,
        Err(err) => {
            warn!(err = %err, "failed to decode generator payload");
            return ParsedResponse::empty(
                ParseStatus::Malformed,
                format!("payload is not valid JSON: {err}"),
            );
        }
    };
    let Value::Object(map) = value else {
        return ParsedResponse::empty(
            ParseStatus::Malformed,
            "payload is not a JSON object".to_string(),
        );
    };

    let mut diagnostics = Vec::new();
    let explanation = match map.get("explanation") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => {
            diagnostics.push(format!("explanation is not a string: {other}"));
            String::new()
        }
    };
    let file_actions = decode_file_actions(&map, &mut diagnostics);
    let shell_actions = decode_shell_actions(&map, &mut diagnostics);

    for diagnostic in &diagnostics {
        warn!(diagnostic = %diagnostic, "dropped payload entry");
    }
    debug!(
        file_actions = file_actions.len(),
        shell_actions = shell_actions.len(),
        dropped = diagnostics.len(),
        "parsed generator payload"
    );

    ParsedResponse {
        actions: ActionSet {
            explanation,
            file_actions,
            shell_actions,
        },
        status: ParseStatus::Parsed,
        diagnostics,
    }
}

/// Slice from the first `{` to the last `}` inclusive.
fn payload_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

fn entries<'a>(
    map: &'a Map<String, Value>,
    key: &str,
    diagnostics: &mut Vec<String>,
) -> &'a [Value] {
    match map.get(key) {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => &[],
        Some(_) => {
            diagnostics.push(format!("{key} is not an array"));
            &[]
        }
    }
}

fn decode_file_actions(map: &Map<String, Value>, diagnostics: &mut Vec<String>) -> Vec<FileAction> {
    entries(map, "file_actions", diagnostics)
        .iter()
        .enumerate()
        .filter_map(|(idx, entry)| match decode_file_action(entry) {
            Ok(action) => Some(action),
            Err(reason) => {
                diagnostics.push(format!("file_actions[{idx}]: {reason}"));
                None
            }
        })
        .collect()
}

fn decode_file_action(entry: &Value) -> Result<FileAction, String> {
    let Value::Object(fields) = entry else {
        return Err("entry is not an object".to_string());
    };

    let path = fields
        .get("path")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| "missing path".to_string())?;

    let raw_kind = fields
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing action for {path}"))?;
    let kind = FileActionKind::parse(raw_kind)
        .ok_or_else(|| format!("unknown action '{raw_kind}' for {path}"))?;

    match kind {
        FileActionKind::Delete => Ok(FileAction::delete(path)),
        FileActionKind::Create | FileActionKind::Modify => {
            let content = fields
                .get("content")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("{} without content for {path}", kind.as_str()))?;
            Ok(FileAction::write(kind, path, content))
        }
    }
}

fn decode_shell_actions(map: &Map<String, Value>, diagnostics: &mut Vec<String>) -> Vec<String> {
    entries(map, "shell_actions", diagnostics)
        .iter()
        .enumerate()
        .filter_map(|(idx, entry)| match entry.as_str() {
            Some(command) if !command.trim().is_empty() => Some(command.to_string()),
            Some(_) => {
                diagnostics.push(format!("shell_actions[{idx}]: empty command"));
                None
            }
            None => {
                diagnostics.push(format!("shell_actions[{idx}]: not a string"));
                None
            }
        })
        .collect()
}
