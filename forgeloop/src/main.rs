//! `forgeloop`: run the build-fix loop from the command line.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use forgeloop::cancel::CancelToken;
use forgeloop::core::classifier::classify;
use forgeloop::core::parser::parse_response;
use forgeloop::core::policy::PatternPolicy;
use forgeloop::cycle::{CycleConfig, CycleEngine, CycleStop};
use forgeloop::events::{CycleEvent, EventSink, FanOut, TracingSink};
use forgeloop::exit_codes;
use forgeloop::io::config::{
    DEFAULT_CONFIG_FILE, FallbackKind, ForgeConfig, GeneratorConfig, GeneratorKind, load_config,
    write_config,
};
use forgeloop::io::generator::{
    CommandGenerator, FallbackGenerator, Generator, MockGenerator, extractor_for,
};
use forgeloop::io::process::{ShellCommandRunner, probe_shell};
use forgeloop::io::workspace::{ProjectWorkspace, sanitize_project_name};
use forgeloop::logging;

#[derive(Parser)]
#[command(
    name = "forgeloop",
    version,
    about = "Automated build-fix loop driven by an external code generator"
)]
struct Cli {
    /// Configuration file. Missing means defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Iterate on TOPIC until it succeeds, fails terminally, or runs out of iterations.
    Run {
        topic: String,
        /// Project name (defaults to the topic).
        #[arg(short, long)]
        project: Option<String>,
        /// Iteration budget.
        #[arg(short = 'n', long)]
        iterations: Option<u32>,
        /// Per-command timeout in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(long, value_enum)]
        generator: Option<GeneratorChoice>,
    },
    /// Classify a transcript from FILE (or stdin) and print the outcome as JSON.
    Classify { file: Option<PathBuf> },
    /// Parse a generator response from FILE (or stdin) and print the actions as JSON.
    Parse { file: Option<PathBuf> },
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum GeneratorChoice {
    Command,
    Mock,
}

impl From<GeneratorChoice> for GeneratorKind {
    fn from(choice: GeneratorChoice) -> Self {
        match choice {
            GeneratorChoice::Command => GeneratorKind::Command,
            GeneratorChoice::Mock => GeneratorKind::Mock,
        }
    }
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            topic,
            project,
            iterations,
            timeout_secs,
            generator,
        } => {
            let mut cfg = load_config(&cli.config)?;
            apply_overrides(&mut cfg, iterations, timeout_secs, generator);
            cfg.validate().context("invalid command-line override")?;
            cmd_run(&cfg, &topic, project.as_deref())
        }
        Command::Classify { file } => {
            let transcript = read_input(file.as_deref())?;
            print_json(&classify(&transcript))?;
            Ok(exit_codes::OK)
        }
        Command::Parse { file } => {
            let raw = read_input(file.as_deref())?;
            print_json(&parse_response(&raw))?;
            Ok(exit_codes::OK)
        }
        Command::Init { force } => {
            cmd_init(&cli.config, force)?;
            Ok(exit_codes::OK)
        }
    }
}

fn apply_overrides(
    cfg: &mut ForgeConfig,
    iterations: Option<u32>,
    timeout_secs: Option<u64>,
    generator: Option<GeneratorChoice>,
) {
    if let Some(n) = iterations {
        cfg.cycle.max_iterations = n;
    }
    if let Some(secs) = timeout_secs {
        cfg.shell.timeout_secs = secs;
    }
    if let Some(choice) = generator {
        cfg.generator.kind = choice.into();
    }
}

fn cmd_run(cfg: &ForgeConfig, topic: &str, project: Option<&str>) -> Result<i32> {
    let project_name = sanitize_project_name(project.unwrap_or(topic));
    let base = PathBuf::from(&cfg.workspace.base_path);
    let root = if cfg.workspace.project_subdirs {
        base.join(&project_name)
    } else {
        base
    };
    let workspace = ProjectWorkspace::create(&root)?;

    let runner = ShellCommandRunner::new(
        &cfg.shell.program,
        &cfg.shell.flag,
        cfg.shell.output_limit_bytes,
    );
    probe_shell(&runner, workspace.root().to_path_buf())?;

    let policy = PatternPolicy::new(&cfg.policy.allow, &cfg.policy.deny)?;
    let generator = build_generator(&cfg.generator)?;

    let cancel = CancelToken::new();
    let handle = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received, cancelling run");
        handle.cancel();
    })
    .context("install Ctrl-C handler")?;

    let console = ConsoleSink;
    let tracing_sink = TracingSink;
    let sink = FanOut::new(vec![&console as &dyn EventSink, &tracing_sink]);

    let config = CycleConfig {
        max_iterations: cfg.cycle.max_iterations,
        command_timeout: Duration::from_secs(cfg.shell.timeout_secs),
        stop_on_error: cfg.cycle.stop_on_error,
        cwd_check: Some(cfg.shell.cwd_check.trim())
            .filter(|cmd| !cmd.is_empty())
            .map(str::to_string),
        project_name,
        prompt: cfg.prompt.clone(),
        log_iterations: cfg.workspace.log_iterations,
    };

    info!(topic, root = %workspace.root().display(), "starting run");
    let report = CycleEngine::new(config, workspace, generator, runner, &sink, cancel)
        .with_policy(&policy)
        .run(topic)?;
    Ok(exit_code_for(&report.stop))
}

fn build_generator(cfg: &GeneratorConfig) -> Result<Box<dyn Generator>> {
    if cfg.kind == GeneratorKind::Mock {
        return Ok(Box::new(MockGenerator));
    }
    let primary = CommandGenerator::new(
        &cfg.command,
        cfg.system_prompt.clone(),
        extractor_for(&cfg.extractor)?,
        Duration::from_secs(cfg.timeout_secs),
    )?;
    let generator: Box<dyn Generator> = match cfg.fallback {
        FallbackKind::Mock => Box::new(FallbackGenerator::new(primary, MockGenerator)),
        FallbackKind::None => Box::new(primary),
    };
    Ok(generator)
}

fn exit_code_for(stop: &CycleStop) -> i32 {
    match stop {
        CycleStop::Terminated { success: true, .. } => exit_codes::OK,
        CycleStop::Terminated { success: false, .. } => exit_codes::TERMINATED_FAILURE,
        CycleStop::ExhaustedIterations => exit_codes::EXHAUSTED,
        CycleStop::Cancelled => exit_codes::CANCELLED,
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &ForgeConfig::default())?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => fs::read_to_string(path).with_context(|| format!("read {}", path.display())),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read stdin")?;
            Ok(buf)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize json")?
    );
    Ok(())
}

/// User-facing progress report on stdout.
struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn emit(&self, event: &CycleEvent<'_>) {
        match event {
            CycleEvent::RunStarted {
                topic,
                workspace,
                max_iterations,
                ..
            } => println!(
                "Running {max_iterations} iteration(s) on {topic:?} in {}",
                workspace.display()
            ),
            CycleEvent::IterationFinished {
                iteration,
                max_iterations,
                outcome,
            } => println!(
                "{}",
                iteration_line(*iteration, *max_iterations, outcome.success, &outcome.reason)
            ),
            CycleEvent::RunFinished {
                iterations_completed,
                stop,
                workspace,
            } => {
                if **stop == CycleStop::Cancelled {
                    println!("Run cancelled");
                }
                println!("Completed {iterations_completed} iteration(s)");
                println!("Project is available at: {}", workspace.display());
            }
            _ => {}
        }
    }
}

fn iteration_line(iteration: u32, max_iterations: u32, success: bool, reason: &str) -> String {
    let status = if success { "Success" } else { "Failed" };
    format!(
        "Iteration {}/{max_iterations}: {status} - {reason}",
        iteration + 1
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "forgeloop",
            "run",
            "todo api",
            "--iterations",
            "3",
            "--timeout-secs",
            "10",
            "--generator",
            "mock",
        ]);
        let Command::Run {
            topic,
            iterations,
            timeout_secs,
            generator,
            project,
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(topic, "todo api");
        assert_eq!(iterations, Some(3));
        assert_eq!(timeout_secs, Some(10));
        assert_eq!(generator, Some(GeneratorChoice::Mock));
        assert_eq!(project, None);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["forgeloop", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn overrides_replace_config_values() {
        let mut cfg = ForgeConfig::default();
        apply_overrides(&mut cfg, Some(1), Some(7), Some(GeneratorChoice::Mock));
        assert_eq!(cfg.cycle.max_iterations, 1);
        assert_eq!(cfg.shell.timeout_secs, 7);
        assert_eq!(cfg.generator.kind, GeneratorKind::Mock);
    }

    #[test]
    fn exit_codes_follow_stop_reason() {
        let ok = CycleStop::Terminated {
            reason: "Success criteria met".to_string(),
            success: true,
        };
        let critical = CycleStop::Terminated {
            reason: "Critical error occurred".to_string(),
            success: false,
        };
        assert_eq!(exit_code_for(&ok), exit_codes::OK);
        assert_eq!(exit_code_for(&critical), exit_codes::TERMINATED_FAILURE);
        assert_eq!(
            exit_code_for(&CycleStop::ExhaustedIterations),
            exit_codes::EXHAUSTED
        );
        assert_eq!(exit_code_for(&CycleStop::Cancelled), exit_codes::CANCELLED);
    }

    #[test]
    fn iteration_line_is_one_based() {
        assert_eq!(
            iteration_line(0, 5, false, "Missing module: flask"),
            "Iteration 1/5: Failed - Missing module: flask"
        );
        assert_eq!(
            iteration_line(4, 5, true, "Execution completed successfully"),
            "Iteration 5/5: Success - Execution completed successfully"
        );
    }

    #[test]
    fn mock_kind_skips_command_setup() {
        let cfg = GeneratorConfig {
            kind: GeneratorKind::Mock,
            command: Vec::new(),
            ..GeneratorConfig::default()
        };
        let generator = build_generator(&cfg).expect("generator");
        assert_eq!(generator.describe(), "mock");
    }
}
