//! # Subprocess Runner
//!
//! Supervises exactly one external engine process (the audio normalizer or the
//! speech recognizer). The runner starts the process, forwards its output to the
//! log, and reports how it ended.
//!
//! ## Guarantees:
//! - `kill` can be called any number of times, including after the process exited
//! - `await_exit` resolves once; later calls return the cached outcome
//! - stdout/stderr are diagnostics only, results travel through files
//! - dropping a runner kills a process that is still alive

use crate::error::{AppResult, OrchestratorError};
use std::ffi::OsString;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Program plus arguments for one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageCommand {
    /// Short name used in logs and error messages ("ffmpeg", "faster-whisper")
    pub label: &'static str,
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl StageCommand {
    pub fn new(label: &'static str, program: impl Into<OsString>) -> Self {
        Self {
            label,
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl fmt::Display for StageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Process exited on its own. `None` when it was terminated by a signal we did not send.
    Exited(Option<i32>),
    /// We killed it on request.
    Killed,
    /// We killed it because it exceeded the stage timeout.
    TimedOut,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Exited(Some(0)))
    }
}

const FORWARDER_GRACE: Duration = Duration::from_secs(2);

pub struct SubprocessRunner {
    label: &'static str,
    child: Child,
    outcome: Option<ExitOutcome>,
    kill_requested: bool,
    timed_out: bool,
    forwarders: Vec<JoinHandle<()>>,
}

impl SubprocessRunner {
    /// Spawn `command` with piped output.
    ///
    /// Spawn failures (missing executable, permissions) are stage errors.
    pub fn start(command: &StageCommand) -> AppResult<Self> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            OrchestratorError::stage(format!("failed to start {}: {}", command.label, e))
        })?;

        info!(stage = command.label, pid = ?child.id(), "Started {}", command);

        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(forward_lines(command.label, "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(forward_lines(command.label, "stderr", stderr));
        }

        Ok(Self {
            label: command.label,
            child,
            outcome: None,
            kill_requested: false,
            timed_out: false,
            forwarders,
        })
    }

    /// Request termination. Returns `true` if a signal was actually sent.
    ///
    /// No-op once the process has exited or a kill is already in flight.
    pub fn kill(&mut self) -> bool {
        if self.outcome.is_some() || self.kill_requested {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(_)) => false,
            Ok(None) => match self.child.start_kill() {
                Ok(()) => {
                    debug!(stage = self.label, "Kill signal sent");
                    self.kill_requested = true;
                    true
                }
                Err(e) => {
                    // Usually means the process was reaped between try_wait and start_kill.
                    debug!(stage = self.label, error = %e, "Kill failed");
                    false
                }
            },
            Err(e) => {
                warn!(stage = self.label, error = %e, "Could not query process state before kill");
                false
            }
        }
    }

    /// Wait for the process to end.
    pub async fn await_exit(&mut self) -> AppResult<ExitOutcome> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }
        let status = self.child.wait().await?;
        Ok(self.finish(status).await)
    }

    /// Wait for the process, killing it when `cancel` fires or `timeout` elapses.
    pub async fn run_to_exit(
        &mut self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> AppResult<ExitOutcome> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }

        let deadline = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let status = tokio::select! {
            status = self.child.wait() => Some(status?),
            () = cancel.cancelled() => {
                self.kill();
                None
            }
            () = &mut deadline => {
                if self.kill() {
                    warn!(stage = self.label, timeout = ?timeout, "Stage timed out");
                    self.timed_out = true;
                }
                None
            }
        };

        match status {
            Some(status) => Ok(self.finish(status).await),
            None => self.await_exit().await,
        }
    }

    async fn finish(&mut self, status: ExitStatus) -> ExitOutcome {
        // Let the forwarders reach EOF so the process's last words make it into the log.
        // A grandchild holding the pipe open must not stall the pipeline.
        for mut forwarder in std::mem::take(&mut self.forwarders) {
            if tokio::time::timeout(FORWARDER_GRACE, &mut forwarder).await.is_err() {
                forwarder.abort();
            }
        }

        let outcome = if self.timed_out {
            ExitOutcome::TimedOut
        } else if self.kill_requested {
            ExitOutcome::Killed
        } else {
            ExitOutcome::Exited(status.code())
        };
        debug!(stage = self.label, ?outcome, "Process exited");
        self.outcome = Some(outcome);
        outcome
    }
}

fn forward_lines<R>(label: &'static str, stream: &'static str, reader: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) if stream == "stderr" => info!(stage = label, "{}", line),
                Ok(Some(line)) => debug!(stage = label, stream, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    debug!(stage = label, stream, error = %e, "Output stream closed");
                    break;
                }
            }
        }
    })
}
