//! Process launching and per-process lifecycle.
//!
//! A [`ManagedProcess`] is only ever constructed from a child the OS has
//! already created, so a failed launch never leaves a half-built handle
//! behind. Terminal states are sticky: once a process has exited, been
//! killed or failed, `terminate` and `kill` return the recorded state.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout};
use tracing::{debug, info, warn};

use super::stderr::StderrCapture;
use crate::config::ToolCommand;
use crate::error::LaunchFailure;
use crate::{Error, Result};

/// How long to wait for stderr to drain after a process has exited.
const STDERR_DRAIN_WAIT: Duration = Duration::from_millis(500);

/// Lifecycle of a spawned process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Exited(i32),
    Killed,
    Failed(String),
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Killed | Self::Failed(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Terminal states other than a clean exit or a teardown kill.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Exited(code) if *code != 0) || matches!(self, Self::Failed(_))
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Exited(code) => write!(f, "exited({})", code),
            Self::Killed => write!(f, "killed"),
            Self::Failed(reason) => write!(f, "failed({})", reason),
        }
    }
}

/// Where a process reads its stdin from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinSource {
    None,
    PreviousProcessStdout,
}

/// Where a process's stdout goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdoutSink {
    /// Relayed into the next process's stdin.
    PipeToNext,
    /// Relayed to the consumer (HTTP body).
    PipeToConsumer,
    /// Read completely by the caller (metadata, resolved URLs).
    Captured,
    /// Redirected straight into a file by the OS.
    File(PathBuf),
}

impl StdoutSink {
    fn is_piped(&self) -> bool {
        !matches!(self, Self::File(_))
    }
}

/// Everything needed to start one external process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub stage: String,
    pub command: ToolCommand,
    pub args: Vec<String>,
    pub stdin: StdinSource,
    pub stdout: StdoutSink,
}

impl ProcessSpec {
    pub fn new(stage: impl Into<String>, command: ToolCommand, args: Vec<String>) -> Self {
        Self {
            stage: stage.into(),
            command,
            args,
            stdin: StdinSource::None,
            stdout: StdoutSink::PipeToConsumer,
        }
    }

    pub fn stdin(mut self, stdin: StdinSource) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn stdout(mut self, stdout: StdoutSink) -> Self {
        self.stdout = stdout;
        self
    }
}

/// Starts external processes with the I/O wiring a pipeline needs.
#[derive(Debug, Clone)]
pub struct Launcher {
    stderr_tail_bytes: usize,
}

impl Launcher {
    pub fn new(stderr_tail_bytes: usize) -> Self {
        Self { stderr_tail_bytes }
    }

    /// Spawn `spec`. Arguments go straight to the OS, never through a shell.
    pub fn spawn(&self, pipeline_id: &str, spec: ProcessSpec) -> Result<ManagedProcess> {
        let ProcessSpec {
            stage,
            command,
            args,
            stdin,
            stdout,
        } = spec;
        let program_name = process_utils::display_name(&command.program).to_string();

        let mut cmd = process_utils::tokio_command(&command.program);
        cmd.args(&command.leading_args)
            .args(&args)
            .env("LC_ALL", "C")
            .stderr(Stdio::piped());

        if stdin == StdinSource::PreviousProcessStdout {
            cmd.stdin(Stdio::piped());
        }
        match &stdout {
            StdoutSink::File(path) => {
                let file = std::fs::File::create(path)?;
                cmd.stdout(Stdio::from(file));
            }
            _ => {
                cmd.stdout(Stdio::piped());
            }
        }

        let mut state = ProcessState::Starting;
        let mut child = cmd.spawn().map_err(|e| {
            let reason = LaunchFailure::from(process_utils::SpawnFailure::classify(&e));
            warn!(pipeline_id, stage = %stage, program = %program_name, error = %e, "Failed to spawn process");
            Error::launch(program_name.clone(), reason)
        })?;
        advance(&mut state, ProcessState::Running);

        let pid = child.id();
        let child_stdin = child.stdin.take();
        let child_stdout = if stdout.is_piped() {
            child.stdout.take()
        } else {
            None
        };
        let id = format!("{}/{}", pipeline_id, stage);
        let stderr = match child.stderr.take() {
            Some(reader) => StderrCapture::spawn(reader, self.stderr_tail_bytes, id.clone()),
            None => StderrCapture::empty(self.stderr_tail_bytes),
        };

        info!(pipeline_id, stage = %stage, program = %program_name, pid, "Spawned process");
        debug!(pipeline_id, stage = %stage, ?args, "Process arguments");

        Ok(ManagedProcess {
            id,
            stage,
            program: program_name,
            stdin_source: stdin,
            stdout_sink: stdout,
            child,
            stdin: child_stdin,
            stdout: child_stdout,
            stderr,
            state,
            teardown_requested: false,
        })
    }
}

/// Move `state` to `next` unless it is already terminal.
fn advance(state: &mut ProcessState, next: ProcessState) -> bool {
    if state.is_terminal() {
        return false;
    }
    *state = next;
    true
}

/// One spawned external process, owned by exactly one pipeline.
#[derive(Debug)]
pub struct ManagedProcess {
    id: String,
    stage: String,
    program: String,
    stdin_source: StdinSource,
    stdout_sink: StdoutSink,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: StderrCapture,
    state: ProcessState,
    teardown_requested: bool,
}

impl ManagedProcess {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Bare executable name.
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    pub fn stdin_source(&self) -> StdinSource {
        self.stdin_source
    }

    pub fn stdout_sink(&self) -> &StdoutSink {
        &self.stdout_sink
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    fn record_exit(&mut self, status: ExitStatus) -> ProcessState {
        let next = match status.code() {
            Some(code) => ProcessState::Exited(code),
            None if self.teardown_requested => ProcessState::Killed,
            None => ProcessState::Failed(describe_signal(&status)),
        };
        if advance(&mut self.state, next) {
            debug!(process = %self.id, state = %self.state, "Process reached terminal state");
        }
        self.state.clone()
    }

    /// Non-blocking check for exit.
    pub fn try_reap(&mut self) -> ProcessState {
        if self.state.is_terminal() {
            return self.state.clone();
        }
        match self.child.try_wait() {
            Ok(Some(status)) => self.record_exit(status),
            Ok(None) => self.state.clone(),
            Err(e) => {
                advance(&mut self.state, ProcessState::Failed(e.to_string()));
                self.state.clone()
            }
        }
    }

    /// Wait for the process to exit on its own.
    pub async fn wait(&mut self) -> ProcessState {
        if self.state.is_terminal() {
            return self.state.clone();
        }
        match self.child.wait().await {
            Ok(status) => self.record_exit(status),
            Err(e) => {
                warn!(process = %self.id, error = %e, "Error waiting for process");
                advance(&mut self.state, ProcessState::Failed(e.to_string()));
                self.state.clone()
            }
        }
    }

    /// Close our ends of the pipes and give the process `grace` to exit,
    /// then kill it. No-op once terminal.
    pub async fn terminate(&mut self, grace: Duration) -> ProcessState {
        if self.try_reap().is_terminal() {
            return self.state.clone();
        }
        self.teardown_requested = true;

        // Writers see EOF on stdin; readers get EPIPE on their next write.
        drop(self.stdin.take());
        drop(self.stdout.take());

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => self.record_exit(status),
            Ok(Err(e)) => {
                advance(&mut self.state, ProcessState::Failed(e.to_string()));
                self.state.clone()
            }
            Err(_) => {
                debug!(process = %self.id, ?grace, "Process did not exit within grace period; killing");
                self.kill().await
            }
        }
    }

    /// Kill the process immediately. No-op once terminal.
    pub async fn kill(&mut self) -> ProcessState {
        if self.try_reap().is_terminal() {
            return self.state.clone();
        }
        self.teardown_requested = true;
        drop(self.stdin.take());
        drop(self.stdout.take());

        if let Err(e) = self.child.start_kill() {
            debug!(process = %self.id, error = %e, "start_kill failed; process may have exited");
        }
        match self.child.wait().await {
            Ok(status) => self.record_exit(status),
            Err(e) => {
                advance(&mut self.state, ProcessState::Failed(e.to_string()));
                self.state.clone()
            }
        }
    }

    /// Bounded excerpt of the process's stderr.
    pub async fn stderr_excerpt(&mut self) -> String {
        self.stderr.finish(STDERR_DRAIN_WAIT).await
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            warn!(process = %self.id, "Process dropped while running; killing");
            let _ = self.child.start_kill();
        }
    }
}

#[cfg(unix)]
fn describe_signal(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("terminated by signal {}", signal),
        None => "terminated without exit code".to_string(),
    }
}

#[cfg(not(unix))]
fn describe_signal(_status: &ExitStatus) -> String {
    "terminated without exit code".to_string()
}
