//! Supervised child processes: line streaming, timeouts and kill escalation.
//!
//! A run is split in two so callers can observe the moment the process
//! actually started: [`spawn`] either launches the child or fails with
//! [`ProcessError::Launch`], and [`RunningProcess::supervise`] drives it to an
//! exit while forwarding every stdout/stderr line as it is produced.
//!
//! Termination is cooperative at the process boundary: SIGTERM to the child's
//! process group, a grace period, then SIGKILL.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

use crate::core::types::{OutputStream, ProcessExit};

const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Everything needed to launch one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: workdir.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Human-readable command line for logs and error messages.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.as_str());
        parts.extend(self.args.iter().map(String::as_str));
        parts.join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.workdir)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so termination reaches provider plugins too.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} was not piped")]
    MissingPipe(&'static str),
}

/// Time bounds for one supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub timeout: Duration,
    pub grace: Duration,
}

/// A line read from the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// A child that has been spawned and is being read.
#[derive(Debug)]
pub struct RunningProcess {
    child: Child,
    pid: Option<u32>,
    command: String,
    lines: mpsc::Receiver<OutputLine>,
}

/// Launch `spec` with piped output. Readers start immediately.
#[instrument(skip_all, fields(command = %spec.display(), workdir = %spec.workdir.display()))]
pub fn spawn(spec: &CommandSpec) -> Result<RunningProcess, ProcessError> {
    debug!("spawning child process");
    let mut child = match spec.command().spawn() {
        Ok(c) => c,
        Err(source) => {
            error!(err = %source, "failed to spawn command");
            return Err(ProcessError::Launch {
                command: spec.display(),
                source,
            });
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or(ProcessError::MissingPipe("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(ProcessError::MissingPipe("stderr"))?;

    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    spawn_line_reader(stdout, OutputStream::Stdout, tx.clone());
    spawn_line_reader(stderr, OutputStream::Stderr, tx);

    let pid = child.id();
    debug!(pid = ?pid, "child process started");
    Ok(RunningProcess {
        child,
        pid,
        command: spec.display(),
        lines: rx,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Timeout,
    Cancel,
}

impl RunningProcess {
    /// Drive the child to completion.
    ///
    /// `on_line` sees each line before the process exits. `cancel` flips to
    /// `true` when a caller asks for cancellation. The returned exit favors
    /// what actually happened: a child that exits 0 after a cancel request is
    /// reported as [`ProcessExit::Exited`].
    #[instrument(skip_all, fields(command = %self.command, pid = ?self.pid, timeout_secs = limits.timeout.as_secs()))]
    pub async fn supervise<F>(
        self,
        limits: RunLimits,
        mut cancel: watch::Receiver<bool>,
        mut on_line: F,
    ) -> ProcessExit
    where
        F: FnMut(OutputStream, String),
    {
        let RunningProcess {
            mut child,
            pid,
            mut lines,
            ..
        } = self;

        let deadline = Instant::now() + limits.timeout;
        let mut lines_open = true;
        let mut stop: Option<StopReason> = None;
        let mut kill_at: Option<Instant> = None;
        let mut forced = false;

        let status = loop {
            tokio::select! {
                biased;
                status = child.wait() => break status,
                line = lines.recv(), if lines_open => match line {
                    Some(line) => on_line(line.stream, line.text),
                    None => lines_open = false,
                },
                _ = tokio::time::sleep_until(deadline), if stop.is_none() => {
                    let timeout_secs = limits.timeout.as_secs();
                    warn!(timeout_secs, "command timed out, terminating");
                    stop = Some(StopReason::Timeout);
                    terminate(&mut child, pid);
                    kill_at = Some(Instant::now() + limits.grace);
                }
                _ = cancel_requested(&mut cancel), if stop.is_none() => {
                    debug!("cancellation requested, terminating");
                    stop = Some(StopReason::Cancel);
                    terminate(&mut child, pid);
                    kill_at = Some(Instant::now() + limits.grace);
                }
                _ = sleep_until_opt(kill_at), if kill_at.is_some() && !forced => {
                    warn!(grace_secs = limits.grace.as_secs(), "grace period expired, killing");
                    force_kill(&mut child, pid);
                    forced = true;
                }
            }
        };

        // Output still buffered in the pipes belongs to this run. Bounded
        // because a leaked grandchild may keep a pipe open.
        if lines_open {
            let drain = async {
                while let Some(line) = lines.recv().await {
                    on_line(line.stream, line.text);
                }
            };
            if tokio::time::timeout(limits.grace, drain).await.is_err() {
                warn!("output pipes still open after exit, giving up on remaining output");
            }
        }

        let exit = classify(status, stop, forced);
        debug!(exit = ?exit, "command finished");
        exit
    }
}

fn classify(
    status: std::io::Result<ExitStatus>,
    stop: Option<StopReason>,
    forced: bool,
) -> ProcessExit {
    let status = match status {
        Ok(status) => status,
        Err(e) => {
            error!(err = %e, "waiting on child failed");
            return ProcessExit::Crashed {
                message: format!("lost track of process: {e}"),
            };
        }
    };
    match stop {
        Some(StopReason::Timeout) => ProcessExit::TimedOut {
            forced,
            signal: exit_signal(&status),
        },
        Some(StopReason::Cancel) if forced => ProcessExit::Killed {
            signal: exit_signal(&status),
        },
        Some(StopReason::Cancel) if status.code() == Some(0) => ProcessExit::Exited { code: 0 },
        Some(StopReason::Cancel) => ProcessExit::Canceled {
            code: status.code(),
            signal: exit_signal(&status),
        },
        None => match status.code() {
            Some(code) => ProcessExit::Exited { code },
            None => match exit_signal(&status) {
                Some(signal) => ProcessExit::Signaled { signal },
                None => ProcessExit::Crashed {
                    message: "process ended without exit code or signal".to_string(),
                },
            },
        },
    }
}

async fn cancel_requested(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|requested| *requested).await.is_err() {
        // Sender gone: nobody can cancel any more.
        std::future::pending::<()>().await;
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

fn spawn_line_reader<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if tx.send(OutputLine { stream, text }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(err = %e, stream = ?stream, "read output");
                    break;
                }
            }
        }
    });
}

#[cfg(unix)]
fn terminate(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::Signal;
    if !signal_group(pid, Signal::SIGTERM) {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn force_kill(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::Signal;
    signal_group(pid, Signal::SIGKILL);
    if let Err(e) = child.start_kill() {
        debug!(err = %e, "start_kill after SIGKILL");
    }
}

#[cfg(not(unix))]
fn force_kill(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: nix::sys::signal::Signal) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return false;
    };
    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) => true,
        Err(e) => {
            debug!(pid, signal = ?signal, err = %e, "signal process group");
            false
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Output of a short auxiliary command run to completion.
#[derive(Debug)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Run a command to completion with a timeout, collecting all output.
///
/// Meant for small read-only invocations such as `output -json`; the child
/// is killed if the timeout elapses.
#[instrument(skip_all, fields(command = %spec.display(), timeout_secs = timeout.as_secs()))]
pub async fn capture(spec: &CommandSpec, timeout: Duration) -> Result<CapturedOutput> {
    let child = spec
        .command()
        .spawn()
        .with_context(|| format!("spawn {}", spec.display()))?;
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output.with_context(|| format!("wait for {}", spec.display()))?,
        // Dropping the future drops the child, which kills it.
        Err(_) => return Err(anyhow!("{} timed out after {:?}", spec.display(), timeout)),
    };
    debug!(exit_code = ?output.status.code(), "command finished");
    Ok(CapturedOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
