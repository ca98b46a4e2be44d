//! External process handle
//!
//! A launched process is observed through a single event receiver. The
//! stream always opens with `Started` and always ends with exactly one
//! `Exited`; nothing follows it. Termination is requested through a
//! [`KillSwitch`] and is reconciled asynchronously: the caller never waits
//! for the exit, it only sees `Exited(Killed)` arrive later.

use bytes::Bytes;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::ProcessError;
use super::ffmpeg::parse_progress_line;
use crate::models::ProgressMetrics;

const EVENT_BUFFER: usize = 256;
const STDERR_TAIL_LINES: usize = 8;
const MAX_LINE_BYTES: usize = 16 * 1024;
const STDOUT_CHUNK_BYTES: usize = 64 * 1024;
/// How long to wait for pipes to drain after a natural exit
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);
/// Time between SIGTERM and SIGKILL; lets the encoder finalize its output
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Forward stdout as `Output` chunks
    pub capture_stdout: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
            capture_stdout: false,
        }
    }

    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Started { command_line: String },
    Progress(ProgressMetrics),
    Output(Bytes),
    Exited(ProcessExit),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// Terminated through the kill switch
    Killed,
    /// Exited on its own with a success status
    Completed,
    /// Any other exit, with failure text
    Failed(String),
}

/// One-shot termination request shared by every holder of the handle
///
/// Dropping every clone without firing also terminates the process.
#[derive(Clone)]
pub struct KillSwitch {
    inner: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl KillSwitch {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let switch = Self {
            inner: Arc::new(Mutex::new(Some(tx))),
        };
        (switch, rx)
    }

    /// Fire the switch. Returns `true` only for the call that delivered it.
    pub fn kill(&self) -> bool {
        let sender = match self.inner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(tx) => {
                // The receiver is gone only when the process was already reaped
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn is_fired(&self) -> bool {
        match self.inner.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl std::fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KillSwitch")
            .field("fired", &self.is_fired())
            .finish()
    }
}

pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub command_line: String,
    pub kill_switch: KillSwitch,
    pub events: mpsc::Receiver<ProcessEvent>,
}

impl ProcessHandle {
    pub fn new(
        pid: Option<u32>,
        command_line: String,
        kill_switch: KillSwitch,
        events: mpsc::Receiver<ProcessEvent>,
    ) -> Self {
        Self {
            pid,
            command_line,
            kill_switch,
            events,
        }
    }
}

/// Seam between the streaming core and the operating system
///
/// `launch` is synchronous so callers can spawn while holding a map entry.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &CommandSpec) -> Result<ProcessHandle, ProcessError>;
}

/// Launches real processes through `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct SystemLauncher;

impl SystemLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessLauncher for SystemLauncher {
    fn launch(&self, spec: &CommandSpec) -> Result<ProcessHandle, ProcessError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .stdout(if spec.capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();
        let command_line = spec.command_line();
        debug!(?pid, command = %command_line, "Spawned process");

        let (kill_switch, kill_rx) = KillSwitch::new();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(monitor(
            child,
            spec.program.clone(),
            command_line.clone(),
            kill_rx,
            tx,
        ));

        Ok(ProcessHandle::new(pid, command_line, kill_switch, rx))
    }
}

async fn monitor(
    mut child: Child,
    program: String,
    command_line: String,
    mut kill_rx: oneshot::Receiver<()>,
    tx: mpsc::Sender<ProcessEvent>,
) {
    let _ = tx.send(ProcessEvent::Started { command_line }).await;

    let mut stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(read_stderr(stderr, tx.clone())));
    let mut stdout_task = child
        .stdout
        .take()
        .map(|stdout| tokio::spawn(read_stdout(stdout, tx.clone())));

    let exit = tokio::select! {
        status = child.wait() => Some(status),
        _ = &mut kill_rx => None,
    };

    let exit = match exit {
        None => {
            terminate(&mut child, &program, TERMINATE_GRACE).await;
            abort(stderr_task.take());
            abort(stdout_task.take());
            ProcessExit::Killed
        }
        Some(Ok(status)) => {
            drain(stdout_task.take()).await;
            let tail = drain(stderr_task.take()).await.unwrap_or_default();
            if status.success() {
                ProcessExit::Completed
            } else if tail.is_empty() {
                ProcessExit::Failed(format!("{program} terminated ({status})"))
            } else {
                ProcessExit::Failed(format!("{program} terminated ({status}): {tail}"))
            }
        }
        Some(Err(e)) => {
            abort(stderr_task.take());
            abort(stdout_task.take());
            ProcessExit::Failed(format!("failed to wait for {program}: {e}"))
        }
    };

    let _ = tx.send(ProcessEvent::Exited(exit)).await;
}

/// SIGTERM first, SIGKILL once the grace period runs out
async fn terminate(child: &mut Child, program: &str, grace: Duration) {
    if request_exit(child) {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => return,
            Err(_) => warn!(program = %program, "Process ignored SIGTERM, killing"),
        }
    }
    if let Err(e) = child.start_kill() {
        warn!(error = %e, program = %program, "Failed to signal process");
    }
    let _ = child.wait().await;
}

#[cfg(unix)]
fn request_exit(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: `pid` is our own child and has not been reaped yet
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn request_exit(_child: &Child) -> bool {
    false
}

fn abort<T>(task: Option<JoinHandle<T>>) {
    if let Some(task) = task {
        task.abort();
    }
}

async fn drain<T>(task: Option<JoinHandle<T>>) -> Option<T> {
    let mut task = task?;
    match tokio::time::timeout(PIPE_DRAIN_GRACE, &mut task).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(_)) => None,
        Err(_) => {
            task.abort();
            None
        }
    }
}

/// Splits stderr on `\r` or `\n`, forwards progress lines and returns the
/// tail of everything else.
async fn read_stderr<R>(mut stderr: R, tx: mpsc::Sender<ProcessEvent>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);

        while let Some(pos) = pending.iter().position(|b| *b == b'\r' || *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            handle_stderr_line(&line[..pos], &mut tail, &tx).await;
        }
        if pending.len() > MAX_LINE_BYTES {
            let line = std::mem::take(&mut pending);
            handle_stderr_line(&line, &mut tail, &tx).await;
        }
    }
    if !pending.is_empty() {
        handle_stderr_line(&pending, &mut tail, &tx).await;
    }

    tail.into_iter().collect::<Vec<_>>().join("\n")
}

async fn handle_stderr_line(
    raw: &[u8],
    tail: &mut VecDeque<String>,
    tx: &mpsc::Sender<ProcessEvent>,
) {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    if let Some(metrics) = parse_progress_line(line) {
        let _ = tx.send(ProcessEvent::Progress(metrics)).await;
        return;
    }

    if tail.len() == STDERR_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line.to_string());
}

async fn read_stdout<R>(mut stdout: R, tx: mpsc::Sender<ProcessEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; STDOUT_CHUNK_BYTES];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if tx.send(ProcessEvent::Output(chunk)).await.is_err() {
                    break;
                }
            }
        }
    }
}
