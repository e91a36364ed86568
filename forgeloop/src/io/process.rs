//! Child process execution with timeouts, cancellation and bounded output.
//!
//! Every command runs in its own process group (on Unix) so that a timeout or
//! cancellation can kill the shell together with anything it started.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;
use crate::core::types::{CommandErrorKind, CommandResult};

/// How often a waiting process checks the cancel token.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    /// `None` only when the child could not be reaped after a kill.
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            text.push_str(&format!(
                "\n[stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        text
    }

    pub fn stderr_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.stderr_truncated > 0 {
            text.push_str(&format!(
                "\n[stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        text
    }

    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.status.is_some_and(|s| s.success())
    }
}

/// Run a prepared command with a timeout, draining stdout/stderr concurrently.
///
/// Returns `Err` only when the process cannot be spawned or waited on. A
/// timeout or cancellation kills the process group and is reported through the
/// flags on [`CommandOutput`]. Readers that are still blocked when the deadline
/// passes (a background process holding the pipes) are unblocked the same way.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    debug!("spawning child process");
    let started = Instant::now();
    let deadline = started + timeout;
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            // Written from a thread so a child that never reads cannot stall the
            // timeout loop. A closed pipe is the child's choice, not our failure.
            Some(thread::spawn(move || {
                if let Err(e) = child_stdin.write_all(&input) {
                    warn!(err = %e, "failed to write child stdin");
                }
            }))
        }
        None => None,
    };

    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        if cancel.is_cancelled() {
            warn!("command cancelled, killing process group");
            cancelled = true;
            kill_process_group(&mut child);
            break reap(&mut child);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            kill_process_group(&mut child);
            break reap(&mut child);
        }
        if let Some(status) = child
            .wait_timeout(remaining.min(POLL_INTERVAL))
            .context("wait for command")?
        {
            break Some(status);
        }
    };

    // The shell may have exited while a background descendant still holds the
    // pipes open. Give the readers until the deadline, then kill the group.
    while !(stdout_handle.is_finished() && stderr_handle.is_finished()) {
        if cancel.is_cancelled() || Instant::now() >= deadline {
            warn!("output pipes still open after exit, killing process group");
            kill_process_group(&mut child);
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
    if let Some(handle) = stdin_handle
        && handle.join().is_err()
    {
        warn!("stdin writer thread panicked");
    }

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let elapsed = started.elapsed();
    debug!(exit_code = ?status.and_then(|s| s.code()), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
        elapsed,
    })
}

fn reap(child: &mut Child) -> Option<ExitStatus> {
    match child.wait() {
        Ok(status) => Some(status),
        Err(e) => {
            error!(err = %e, "failed to reap killed child");
            None
        }
    }
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

/// Kill the child's whole process group, falling back to the child alone.
#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_process_group(child: &mut Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SAFETY: killpg only sends a signal. The child was spawned as the leader
    // of its own group, so `pgid` names that group and nothing of ours.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, "killpg failed, killing child directly");
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(err = %e, "kill child");
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

/// Parameters for one shell command.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    /// The process is started here; the command text is never rewritten to `cd`.
    pub workdir: PathBuf,
    pub timeout: Duration,
}

/// Runs one shell command and reports a structured result. Implementations
/// never retry.
pub trait CommandRunner {
    fn execute(&self, request: &CommandRequest, cancel: &CancelToken) -> CommandResult;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn execute(&self, request: &CommandRequest, cancel: &CancelToken) -> CommandResult {
        (**self).execute(request, cancel)
    }
}

/// Runs commands through a shell, e.g. `sh -c <command>`.
#[derive(Debug, Clone)]
pub struct ShellCommandRunner {
    program: String,
    flag: String,
    output_limit_bytes: usize,
}

impl Default for ShellCommandRunner {
    fn default() -> Self {
        Self {
            program: "sh".to_string(),
            flag: "-c".to_string(),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl ShellCommandRunner {
    pub fn new(
        program: impl Into<String>,
        flag: impl Into<String>,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            program: program.into(),
            flag: flag.into(),
            output_limit_bytes,
        }
    }
}

impl CommandRunner for ShellCommandRunner {
    #[instrument(skip_all, fields(command = %request.command))]
    fn execute(&self, request: &CommandRequest, cancel: &CancelToken) -> CommandResult {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.flag)
            .arg(&request.command)
            .current_dir(&request.workdir);

        let started = Instant::now();
        let output = match run_command_with_timeout(
            cmd,
            None,
            request.timeout,
            self.output_limit_bytes,
            cancel,
        ) {
            Ok(output) => output,
            Err(err) => {
                return CommandResult::spawn_failure(
                    &request.command,
                    format!("{err:#}"),
                    started.elapsed(),
                );
            }
        };

        let error = if output.cancelled {
            Some(CommandErrorKind::Cancelled)
        } else if output.timed_out {
            Some(CommandErrorKind::Timeout)
        } else if output.success() {
            None
        } else {
            Some(CommandErrorKind::NonZeroExit)
        };

        CommandResult {
            command: request.command.clone(),
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            exit_code: output.status.and_then(|s| s.code()),
            duration: output.elapsed,
            timeout: request.timeout,
            timed_out: output.timed_out,
            error,
            detail: None,
        }
    }
}

/// Check that the shell can be spawned at all. Failure here is an
/// environment problem, not an iteration problem.
pub fn probe_shell<R: CommandRunner + ?Sized>(runner: &R, workdir: PathBuf) -> Result<()> {
    let request = CommandRequest {
        command: "true".to_string(),
        workdir,
        timeout: Duration::from_secs(10),
    };
    let result = runner.execute(&request, &CancelToken::new());
    if result.error == Some(CommandErrorKind::SpawnFailure) {
        return Err(anyhow!(
            "cannot spawn shell: {}",
            result.detail.as_deref().unwrap_or("unknown error")
        ));
    }
    Ok(())
}
