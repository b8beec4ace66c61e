// ABOUTME: Worker process handle: launch spec, lifecycle state, and the attached relay.
// ABOUTME: Starts the OS process, forwards its output to tracing, and kills/reaps it.

use crate::error::{FactoryError, Result};
use crate::relay::{Frame, Relay};
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// How to launch a worker process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &OsString {
        &self.program
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Created but not started, or started and still waiting for its relay.
    Inactive = 0,
    /// Relay attached, ready to accept work.
    Ready = 1,
    /// Executing a request.
    Working = 2,
    /// Failed a health check and should be replaced.
    Invalid = 3,
    /// Asked to exit gracefully.
    Stopping = 4,
    /// Being killed.
    Killing = 5,
    /// Process exited and was reaped.
    Stopped = 6,
    /// Process exited unexpectedly.
    Errored = 7,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Ready,
            2 => WorkerState::Working,
            3 => WorkerState::Invalid,
            4 => WorkerState::Stopping,
            5 => WorkerState::Killing,
            6 => WorkerState::Stopped,
            7 => WorkerState::Errored,
            _ => WorkerState::Inactive,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Inactive => "inactive",
            WorkerState::Ready => "ready",
            WorkerState::Working => "working",
            WorkerState::Invalid => "invalid",
            WorkerState::Stopping => "stopping",
            WorkerState::Killing => "killing",
            WorkerState::Stopped => "stopped",
            WorkerState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// One worker process under management.
pub struct Worker {
    spec: ProcessSpec,
    child: Option<Child>,
    pid: Option<i64>,
    state: AtomicU8,
    relay: Option<Relay>,
    exit_status: Option<ExitStatus>,
    created: Instant,
}

impl Worker {
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            child: None,
            pid: None,
            state: AtomicU8::new(WorkerState::Inactive as u8),
            relay: None,
            exit_status: None,
            created: Instant::now(),
        }
    }

    /// Start the OS process. Its stdout and stderr are forwarded to tracing.
    pub fn start(&mut self) -> Result<()> {
        let mut child = self
            .spec
            .command()
            .spawn()
            .map_err(|source| FactoryError::Launch {
                program: self.spec.program.to_string_lossy().into_owned(),
                source,
            })?;

        let pid = child.id().map(i64::from);
        let label = pid.unwrap_or_default();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, label, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, label, "stderr"));
        }

        tracing::debug!(pid = label, program = %self.spec.program.to_string_lossy(), "Started worker process");
        self.pid = pid;
        self.child = Some(child);
        Ok(())
    }

    /// Process id, once started.
    pub fn pid(&self) -> Option<i64> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn attach_relay(&mut self, relay: Relay) {
        self.relay = Some(relay);
    }

    pub fn relay(&self) -> Option<&Relay> {
        self.relay.as_ref()
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Exit status, once the process has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Whether the process is still running. Records the exit status if it has exited.
    pub fn is_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.exit_status.get_or_insert(status);
                false
            }
            Err(_) => false,
        }
    }

    /// Send SIGKILL to the process. Killing an already exited process is not an error.
    pub async fn kill(&mut self) -> Result<()> {
        let pid = self.pid.unwrap_or_default();
        if self.child.is_none() {
            return Err(FactoryError::NotStarted);
        }
        if self.exit_status.is_some() {
            return Ok(());
        }

        self.set_state(WorkerState::Killing);
        let child = self.child.as_mut().ok_or(FactoryError::NotStarted)?;
        match child.start_kill() {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(source) => Err(FactoryError::Kill { pid, source }),
        }
    }

    /// Wait for the process to exit and reap it.
    ///
    /// Exiting because of `kill` or `stop` counts as success; the status is kept in
    /// [`Worker::exit_status`].
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let pid = self.pid.unwrap_or_default();
        let child = self.child.as_mut().ok_or(FactoryError::NotStarted)?;
        let status = child
            .wait()
            .await
            .map_err(|source| FactoryError::Wait { pid, source })?;

        let expected = matches!(self.state(), WorkerState::Killing | WorkerState::Stopping);
        if status.success() || expected {
            self.set_state(WorkerState::Stopped);
        } else {
            tracing::warn!(pid, %status, "Worker exited unexpectedly");
            self.set_state(WorkerState::Errored);
        }
        self.exit_status = Some(status);
        self.relay = None;
        Ok(status)
    }

    /// Ask the worker to exit over its relay, waiting up to `grace` before killing it.
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        if self.child.is_none() {
            return Err(FactoryError::NotStarted);
        }
        if self.exit_status.is_some() {
            return Ok(());
        }

        self.set_state(WorkerState::Stopping);
        if let Some(relay) = &self.relay {
            if let Err(e) = relay.send(&Frame::Stop).await {
                tracing::debug!(pid = ?self.pid, error = %e, "Failed to send stop frame");
            }
        }

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => {
                tracing::warn!(pid = ?self.pid, ?grace, "Worker did not stop in time, killing");
                self.kill().await?;
                self.wait().await.map(|_| ())
            }
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("relay", &self.relay.is_some())
            .field("program", &self.spec.program)
            .finish()
    }
}

async fn forward_output<R>(stream: R, pid: i64, source: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!(target: "relayd::worker_output", pid, source, "{}", line);
    }
}
