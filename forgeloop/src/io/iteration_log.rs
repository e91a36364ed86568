//! Per-iteration artifacts under `<workspace>/.forgeloop/iterations/`.
//!
//! These are for inspection after a run. Nothing reads them back.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::{ActionSet, Outcome, ParseStatus};
use crate::io::workspace::ARTIFACT_DIR;

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub run_id: String,
    /// One-based, matching the console report.
    pub iter: u32,
    pub timestamp_ms: u64,
    pub duration_ms: u64,
    pub generator: String,
    pub parse_status: ParseStatus,
    pub outcome: Outcome,
}

#[derive(Debug, Serialize)]
struct ActionsLog<'a> {
    actions: &'a ActionSet,
    diagnostics: &'a [String],
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub actions_path: PathBuf,
    pub transcript_path: PathBuf,
    pub response_path: PathBuf,
}

impl IterationPaths {
    pub fn new(root: &Path, run_id: &str, iter: u32) -> Self {
        let dir = root
            .join(ARTIFACT_DIR)
            .join("iterations")
            .join(run_id)
            .join(iter.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            actions_path: dir.join("actions.json"),
            transcript_path: dir.join("transcript.log"),
            response_path: dir.join("response.txt"),
            dir,
        }
    }
}

pub struct IterationWriteRequest<'a> {
    pub root: &'a Path,
    pub run_id: &'a str,
    pub meta: &'a IterationMeta,
    pub actions: &'a ActionSet,
    pub diagnostics: &'a [String],
    pub transcript: &'a str,
    pub response: &'a str,
}

pub fn write_iteration(request: &IterationWriteRequest<'_>) -> Result<IterationPaths> {
    let paths = IterationPaths::new(request.root, request.run_id, request.meta.iter);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

    write_json(&paths.meta_path, request.meta)?;
    write_json(
        &paths.actions_path,
        &ActionsLog {
            actions: request.actions,
            diagnostics: request.diagnostics,
        },
    )?;
    write_text(&paths.transcript_path, request.transcript)?;
    write_text(&paths.response_path, request.response)?;

    Ok(paths)
}

/// `<unix-millis>-<pid>`: unique per process start, sortable by time.
pub fn new_run_id() -> String {
    format!("{}-{}", now_ms(), std::process::id())
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_text(path, &buf)
}
