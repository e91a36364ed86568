//! Generator adapters: the external source of action payloads.
//!
//! The cycle engine only sees [`Generator`]. Vendor reply shapes are
//! normalised to plain text by a [`TextExtractor`] before they reach it.

use std::cell::Cell;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::io::process::{DEFAULT_OUTPUT_LIMIT_BYTES, run_command_with_timeout};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeneratorError {
    /// The generator cannot be reached at all (missing binary, no network).
    #[error("generator unavailable: {0}")]
    Unavailable(String),
    #[error("generator timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),
    #[error("generator call cancelled")]
    Cancelled,
    #[error("generator failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct GenerateRequest<'a> {
    pub prompt: &'a str,
    pub system_prompt: &'a str,
}

pub trait Generator {
    fn generate(
        &self,
        request: &GenerateRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<String, GeneratorError>;

    /// Short label for logs.
    fn describe(&self) -> String;
}

impl<G: Generator + ?Sized> Generator for &G {
    fn generate(
        &self,
        request: &GenerateRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<String, GeneratorError> {
        (**self).generate(request, cancel)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

impl<G: Generator + ?Sized> Generator for Box<G> {
    fn generate(
        &self,
        request: &GenerateRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<String, GeneratorError> {
        (**self).generate(request, cancel)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Turns a raw vendor reply into the text the parser reads.
pub trait TextExtractor {
    fn extract(&self, raw: &str) -> Result<String, GeneratorError>;
}

/// The reply is already plain text.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainText;

impl TextExtractor for PlainText {
    fn extract(&self, raw: &str) -> Result<String, GeneratorError> {
        Ok(raw.to_string())
    }
}

/// Messages-API reply: every `content[]` block with `type == "text"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicMessages;

impl TextExtractor for AnthropicMessages {
    fn extract(&self, raw: &str) -> Result<String, GeneratorError> {
        let value = decode_reply(raw)?;
        let blocks = value
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| GeneratorError::Failed("reply has no content array".to_string()))?;
        let text: Vec<&str> = blocks
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect();
        if text.is_empty() {
            return Err(GeneratorError::Failed("reply has no text blocks".to_string()));
        }
        Ok(text.concat())
    }
}

/// Chat-completions reply: `choices[0].message.content`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiChat;

impl TextExtractor for OpenAiChat {
    fn extract(&self, raw: &str) -> Result<String, GeneratorError> {
        let value = decode_reply(raw)?;
        value
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GeneratorError::Failed("reply has no choices[0].message.content".to_string()))
    }
}

fn decode_reply(raw: &str) -> Result<Value, GeneratorError> {
    serde_json::from_str(raw.trim())
        .map_err(|err| GeneratorError::Failed(format!("reply is not JSON: {err}")))
}

/// Look up an extractor by its config name.
pub fn extractor_for(name: &str) -> Result<Box<dyn TextExtractor>> {
    Ok(match name {
        "plain" => Box::new(PlainText),
        "anthropic" => Box::new(AnthropicMessages),
        "openai" => Box::new(OpenAiChat),
        other => bail!("unknown extractor {other:?}"),
    })
}

/// How the system prompt reaches an external generator command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SystemPromptDelivery {
    /// Written to stdin ahead of the user prompt.
    Stdin,
    /// Appended as `<name> <system prompt>`.
    Arg { name: String },
    /// Exported as environment variable `name`.
    Env { name: String },
}

/// Runs an external CLI per request: prompt on stdin, reply on stdout.
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    system_prompt: SystemPromptDelivery,
    extractor: Box<dyn TextExtractor>,
    timeout: Duration,
}

impl CommandGenerator {
    pub fn new(
        command: &[String],
        system_prompt: SystemPromptDelivery,
        extractor: Box<dyn TextExtractor>,
        timeout: Duration,
    ) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            bail!("generator command is empty");
        };
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            system_prompt,
            extractor,
            timeout,
        })
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(program = %self.program, prompt_bytes = request.prompt.len()))]
    fn generate(
        &self,
        request: &GenerateRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<String, GeneratorError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        let stdin = match &self.system_prompt {
            SystemPromptDelivery::Stdin => format!("{}\n\n{}", request.system_prompt, request.prompt),
            SystemPromptDelivery::Arg { name } => {
                cmd.arg(name).arg(request.system_prompt);
                request.prompt.to_string()
            }
            SystemPromptDelivery::Env { name } => {
                cmd.env(name, request.system_prompt);
                request.prompt.to_string()
            }
        };

        let output = run_command_with_timeout(
            cmd,
            Some(stdin.as_bytes()),
            self.timeout,
            DEFAULT_OUTPUT_LIMIT_BYTES,
            cancel,
        )
        .map_err(|err| GeneratorError::Unavailable(format!("{err:#}")))?;

        if output.cancelled {
            return Err(GeneratorError::Cancelled);
        }
        if output.timed_out {
            return Err(GeneratorError::Timeout(self.timeout));
        }
        if !output.success() {
            let code = output
                .status
                .and_then(|s| s.code())
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(GeneratorError::Failed(format!(
                "exit code {code}: {}",
                output.stderr_lossy().trim()
            )));
        }

        let text = self.extractor.extract(&output.stdout_lossy())?;
        info!(
            reply_bytes = text.len(),
            elapsed_ms = output.elapsed.as_millis() as u64,
            "generator replied"
        );
        Ok(text)
    }

    fn describe(&self) -> String {
        format!("command:{}", self.program)
    }
}

/// Offline responder. Replies with a well-formed payload that carries no
/// actions, echoing the start of the prompt in the explanation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockGenerator;

impl Generator for MockGenerator {
    fn generate(
        &self,
        request: &GenerateRequest<'_>,
        _cancel: &CancelToken,
    ) -> Result<String, GeneratorError> {
        let mut explanation = if request.prompt.to_lowercase().contains("hello") {
            "Hello! I'm a mock response.".to_string()
        } else {
            let head: String = request.prompt.chars().take(50).collect();
            format!("I received your prompt: {head}...")
        };
        if !request.system_prompt.is_empty() {
            let head: String = request.system_prompt.chars().take(20).collect();
            explanation.push_str(&format!(" (Following system instructions: {head}...)"));
        }
        let payload = serde_json::json!({
            "explanation": explanation,
            "file_actions": [],
            "shell_actions": [],
        });
        serde_json::to_string_pretty(&payload).map_err(|err| GeneratorError::Failed(err.to_string()))
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

/// Uses `fallback` once `primary` reports [`GeneratorError::Unavailable`],
/// and keeps using it for the rest of the run.
pub struct FallbackGenerator<P, F> {
    primary: P,
    fallback: F,
    degraded: Cell<bool>,
}

impl<P: Generator, F: Generator> FallbackGenerator<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self {
            primary,
            fallback,
            degraded: Cell::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.get()
    }
}

impl<P: Generator, F: Generator> Generator for FallbackGenerator<P, F> {
    fn generate(
        &self,
        request: &GenerateRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<String, GeneratorError> {
        if !self.degraded.get() {
            match self.primary.generate(request, cancel) {
                Err(GeneratorError::Unavailable(reason)) => {
                    warn!(
                        primary = %self.primary.describe(),
                        fallback = %self.fallback.describe(),
                        reason = %reason,
                        "primary generator unavailable, switching to fallback"
                    );
                    self.degraded.set(true);
                }
                other => return other,
            }
        }
        self.fallback.generate(request, cancel)
    }

    fn describe(&self) -> String {
        if self.degraded.get() {
            self.fallback.describe()
        } else {
            format!(
                "{} (fallback: {})",
                self.primary.describe(),
                self.fallback.describe()
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::parse_response;
    use crate::test_support::ScriptedGenerator;

    fn request<'a>(prompt: &'a str, system_prompt: &'a str) -> GenerateRequest<'a> {
        GenerateRequest {
            prompt,
            system_prompt,
        }
    }

    #[test]
    fn mock_reply_is_an_empty_payload() {
        let reply = MockGenerator
            .generate(&request("build a calculator please", ""), &CancelToken::new())
            .expect("mock reply");

        let parsed = parse_response(&reply);
        assert!(parsed.status.is_parsed());
        assert!(parsed.actions.is_empty());
        assert_eq!(
            parsed.actions.explanation,
            "I received your prompt: build a calculator please..."
        );
    }

    #[test]
    fn mock_echoes_at_most_fifty_chars() {
        let prompt = "p".repeat(80);
        let reply = MockGenerator
            .generate(&request(&prompt, "be terse and careful always"), &CancelToken::new())
            .expect("mock reply");

        let explanation = parse_response(&reply).actions.explanation;
        assert!(explanation.contains(&format!("{}...", "p".repeat(50))));
        assert!(!explanation.contains(&"p".repeat(51)));
        assert!(explanation.ends_with("(Following system instructions: be terse and careful...)"));
    }

    #[test]
    fn anthropic_extractor_joins_text_blocks() {
        let raw = r#"{"content":[{"type":"text","text":"{\"a\":"},{"type":"tool_use","id":"x"},{"type":"text","text":"1}"}]}"#;
        assert_eq!(AnthropicMessages.extract(raw).expect("extract"), r#"{"a":1}"#);
        assert!(matches!(
            AnthropicMessages.extract(r#"{"content":[]}"#),
            Err(GeneratorError::Failed(_))
        ));
    }

    #[test]
    fn openai_extractor_reads_first_choice() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}]}"#;
        assert_eq!(OpenAiChat.extract(raw).expect("extract"), "hi");
        assert!(OpenAiChat.extract("not json").is_err());
    }

    #[test]
    fn unknown_extractor_is_rejected() {
        assert!(extractor_for("plain").is_ok());
        assert!(extractor_for("xml").is_err());
    }

    #[test]
    fn fallback_takes_over_and_stays() {
        let primary = ScriptedGenerator::new(vec![
            Err(GeneratorError::Unavailable("no binary".to_string())),
            Ok("primary".to_string()),
        ]);
        let fallback = ScriptedGenerator::new(vec![Ok("one".to_string()), Ok("two".to_string())]);
        let generator = FallbackGenerator::new(primary, fallback);
        let cancel = CancelToken::new();

        assert_eq!(generator.generate(&request("a", ""), &cancel), Ok("one".to_string()));
        assert_eq!(generator.generate(&request("b", ""), &cancel), Ok("two".to_string()));
        assert!(generator.is_degraded());
        assert_eq!(generator.primary.prompts(), vec!["a"]);
    }

    #[test]
    fn fallback_ignores_other_primary_errors() {
        let primary = ScriptedGenerator::new(vec![Err(GeneratorError::Failed("bad".to_string()))]);
        let generator = FallbackGenerator::new(primary, MockGenerator);

        assert_eq!(
            generator.generate(&request("a", ""), &CancelToken::new()),
            Err(GeneratorError::Failed("bad".to_string()))
        );
        assert!(!generator.is_degraded());
    }

    #[cfg(unix)]
    mod command {
        use super::*;

        fn sh(script: &str, delivery: SystemPromptDelivery, timeout: Duration) -> CommandGenerator {
            let command = vec![
                "sh".to_string(),
                "-c".to_string(),
                script.to_string(),
                "gen".to_string(),
            ];
            CommandGenerator::new(&command, delivery, Box::new(PlainText), timeout)
                .expect("generator")
        }

        #[test]
        fn prompt_goes_to_stdin() {
            let generator = sh("cat", SystemPromptDelivery::Stdin, Duration::from_secs(5));
            let reply = generator
                .generate(&request("user", "system"), &CancelToken::new())
                .expect("reply");
            assert_eq!(reply, "system\n\nuser");
        }

        #[test]
        fn system_prompt_as_argument() {
            let generator = sh(
                r#"printf '%s|' "$2"; cat"#,
                SystemPromptDelivery::Arg {
                    name: "--system".to_string(),
                },
                Duration::from_secs(5),
            );
            let reply = generator
                .generate(&request("user", "rules"), &CancelToken::new())
                .expect("reply");
            assert_eq!(reply, "rules|user");
        }

        #[test]
        fn system_prompt_as_env() {
            let generator = sh(
                r#"printf '%s|' "$FORGE_SYSTEM"; cat"#,
                SystemPromptDelivery::Env {
                    name: "FORGE_SYSTEM".to_string(),
                },
                Duration::from_secs(5),
            );
            let reply = generator
                .generate(&request("user", "rules"), &CancelToken::new())
                .expect("reply");
            assert_eq!(reply, "rules|user");
        }

        #[test]
        fn missing_binary_is_unavailable() {
            let generator = CommandGenerator::new(
                &["forgeloop-no-such-generator".to_string()],
                SystemPromptDelivery::Stdin,
                Box::new(PlainText),
                Duration::from_secs(5),
            )
            .expect("generator");
            assert!(matches!(
                generator.generate(&request("x", ""), &CancelToken::new()),
                Err(GeneratorError::Unavailable(_))
            ));
        }

        #[test]
        fn non_zero_exit_is_failed() {
            let generator = sh("echo nope >&2; exit 3", SystemPromptDelivery::Stdin, Duration::from_secs(5));
            assert_eq!(
                generator.generate(&request("x", ""), &CancelToken::new()),
                Err(GeneratorError::Failed("exit code 3: nope".to_string()))
            );
        }

        #[test]
        fn slow_generator_times_out() {
            let generator = sh("sleep 5", SystemPromptDelivery::Stdin, Duration::from_secs(1));
            assert_eq!(
                generator.generate(&request("x", ""), &CancelToken::new()),
                Err(GeneratorError::Timeout(Duration::from_secs(1)))
            );
        }
    }
}
