//! Loop configuration stored in `forgeloop.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::core::policy::PatternPolicy;
use crate::io::generator::SystemPromptDelivery;

pub const DEFAULT_CONFIG_FILE: &str = "forgeloop.toml";

/// Top-level configuration (TOML).
///
/// Meant to be edited by hand. Every field has a default, so a partial file
/// (or no file at all) is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForgeConfig {
    pub cycle: CycleSettings,
    pub shell: ShellConfig,
    pub workspace: WorkspaceConfig,
    pub generator: GeneratorConfig,
    pub policy: PolicyConfig,
    pub prompt: PromptConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CycleSettings {
    pub max_iterations: u32,
    /// Carried and reported; the loop does not act on it.
    pub stop_on_error: bool,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            stop_on_error: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShellConfig {
    pub program: String,
    pub flag: String,
    /// Per-command timeout.
    pub timeout_secs: u64,
    /// In-memory cap per output stream.
    pub output_limit_bytes: usize,
    /// Command that prints the working directory. Empty disables the check.
    pub cwd_check: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: "sh".to_string(),
            flag: "-c".to_string(),
            timeout_secs: 300,
            output_limit_bytes: 1_000_000,
            cwd_check: "pwd".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub base_path: String,
    /// Put each project in `base_path/<name>` instead of `base_path` itself.
    pub project_subdirs: bool,
    pub log_iterations: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_path: "work".to_string(),
            project_subdirs: true,
            log_iterations: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    Command,
    Mock,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FallbackKind {
    Mock,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    pub kind: GeneratorKind,
    /// External CLI, e.g. `["claude", "-p"]`. The prompt is written to stdin.
    pub command: Vec<String>,
    /// Reply format of `command`: `plain`, `anthropic` or `openai`.
    pub extractor: String,
    pub timeout_secs: u64,
    pub fallback: FallbackKind,
    pub system_prompt: SystemPromptDelivery,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            kind: GeneratorKind::Command,
            command: vec![
                "claude".to_string(),
                "-p".to_string(),
                "--output-format".to_string(),
                "text".to_string(),
            ],
            extractor: "plain".to_string(),
            timeout_secs: 600,
            fallback: FallbackKind::Mock,
            system_prompt: SystemPromptDelivery::Arg {
                name: "--append-system-prompt".to_string(),
            },
        }
    }
}

/// Regex allow/deny lists for generator-issued commands. Both empty means
/// every command runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    pub budget_bytes: usize,
    pub include_key_files: bool,
    pub max_key_files: usize,
    /// Previous-iteration transcript is clipped to this before rendering.
    pub transcript_limit_bytes: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 120_000,
            include_key_files: true,
            max_key_files: 5,
            transcript_limit_bytes: 40_000,
        }
    }
}

impl ForgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.shell.timeout_secs == 0 {
            bail!("shell.timeout_secs must be > 0");
        }
        if self.shell.output_limit_bytes == 0 {
            bail!("shell.output_limit_bytes must be > 0");
        }
        if self.shell.program.trim().is_empty() {
            bail!("shell.program must be non-empty");
        }
        if self.workspace.base_path.trim().is_empty() {
            bail!("workspace.base_path must be non-empty");
        }
        if self.generator.timeout_secs == 0 {
            bail!("generator.timeout_secs must be > 0");
        }
        if self.generator.kind == GeneratorKind::Command
            && self
                .generator
                .command
                .first()
                .is_none_or(|program| program.trim().is_empty())
        {
            return Err(anyhow!(
                "generator.command must be a non-empty array when generator.kind = \"command\""
            ));
        }
        if !matches!(self.generator.extractor.as_str(), "plain" | "anthropic" | "openai") {
            bail!(
                "generator.extractor must be one of plain, anthropic, openai (got {:?})",
                self.generator.extractor
            );
        }
        if self.prompt.budget_bytes == 0 {
            bail!("prompt.budget_bytes must be > 0");
        }
        PatternPolicy::new(&self.policy.allow, &self.policy.deny).context("policy")?;
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ForgeConfig::default()`.
pub fn load_config(path: &Path) -> Result<ForgeConfig> {
    if !path.exists() {
        let cfg = ForgeConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ForgeConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ForgeConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
