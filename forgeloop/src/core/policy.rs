//! Allow/deny hook consulted before any generator-issued command is spawned.
//!
//! The default policy allows everything. `PatternPolicy` narrows execution with
//! regular expressions from the `[policy]` config section.

use anyhow::{Context, Result};
use regex::Regex;

/// Verdict for one command string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
}

pub trait CommandPolicy {
    fn check(&self, command: &str) -> PolicyDecision;
}

/// Permit every command.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl CommandPolicy for AllowAll {
    fn check(&self, _command: &str) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

/// Deny-list first, then allow-list (an empty allow-list permits anything not denied).
#[derive(Debug, Clone)]
pub struct PatternPolicy {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
}

impl PatternPolicy {
    pub fn new(allow: &[String], deny: &[String]) -> Result<Self> {
        Ok(Self {
            allow: compile_all(allow, "allow")?,
            deny: compile_all(deny, "deny")?,
        })
    }
}

fn compile_all(patterns: &[String], label: &str) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).with_context(|| format!("compile {label} pattern `{pattern}`"))
        })
        .collect()
}

impl CommandPolicy for PatternPolicy {
    fn check(&self, command: &str) -> PolicyDecision {
        if let Some(re) = self.deny.iter().find(|re| re.is_match(command)) {
            return PolicyDecision::Deny(format!("matches deny pattern `{}`", re.as_str()));
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|re| re.is_match(command)) {
            return PolicyDecision::Deny("matches no allow pattern".to_string());
        }
        PolicyDecision::Allow
    }
}
