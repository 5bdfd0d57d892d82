use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelHandle;

/// How long output pipes may stay open after the process itself has exited.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// A fully resolved process invocation for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub step_index: usize,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Variables added on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The process ran to completion. `exit_code` is `None` when a signal ended it.
    Exited {
        exit_code: Option<i32>,
        pid: Option<u32>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    /// The process could not be started.
    SpawnFailed { reason: String },
    /// The process started but its exit status could not be collected.
    WaitFailed { pid: Option<u32>, reason: String },
    /// The timeout elapsed; the process was killed and reaped.
    TimedOut { pid: Option<u32> },
    /// Cancellation was signalled; the process was killed and reaped.
    Cancelled { pid: Option<u32> },
}

/// Runs one step's process to completion.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Get the name of the launcher backend
    fn name(&self) -> &'static str;

    /// Run `invocation`, honouring its timeout and `cancel`
    async fn launch(&self, invocation: &Invocation, cancel: &CancelHandle) -> ProcessOutcome;
}

/// Launches real child processes through `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl SystemLauncher {
    pub fn new() -> Self {
        Self
    }

    async fn terminate(child: &mut Child, pid: Option<u32>) {
        if let Err(e) = child.start_kill() {
            debug!(pid = ?pid, error = %e, "Kill failed, process already gone");
        }
        match child.wait().await {
            Ok(status) => debug!(pid = ?pid, status = %status, "Process terminated"),
            Err(e) => warn!(pid = ?pid, error = %e, "Failed to reap terminated process"),
        }
    }
}

enum Race {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl ProcessLauncher for SystemLauncher {
    fn name(&self) -> &'static str {
        "system"
    }

    async fn launch(&self, invocation: &Invocation, cancel: &CancelHandle) -> ProcessOutcome {
        debug!(
            step_index = invocation.step_index,
            program = %invocation.program,
            args = ?invocation.args,
            cwd = %invocation.cwd.display(),
            "Spawning step process"
        );

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ProcessOutcome::SpawnFailed {
                    reason: describe_spawn_error(&e),
                }
            }
        };

        let pid = child.id();
        // Pipes are drained on their own tasks: a background process the step leaves behind
        // inherits them and may keep them open long after the step itself has exited.
        let stdout = PipeCapture::start(child.stdout.take());
        let stderr = PipeCapture::start(child.stderr.take());

        let race = {
            let deadline = async {
                match invocation.timeout {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                status = child.wait() => Race::Exited(status),
                _ = deadline => Race::TimedOut,
                _ = cancel.cancelled() => Race::Cancelled,
            }
        };

        match race {
            Race::Exited(Ok(status)) => {
                let grace = Instant::now() + PIPE_DRAIN_GRACE;
                let stdout = stdout.finish(grace, invocation.step_index).await;
                let stderr = stderr.finish(grace, invocation.step_index).await;
                ProcessOutcome::Exited {
                    exit_code: status.code(),
                    pid,
                    stdout,
                    stderr,
                }
            }
            Race::Exited(Err(e)) => {
                stdout.abort();
                stderr.abort();
                Self::terminate(&mut child, pid).await;
                ProcessOutcome::WaitFailed {
                    pid,
                    reason: e.to_string(),
                }
            }
            Race::TimedOut => {
                warn!(
                    step_index = invocation.step_index,
                    pid = ?pid,
                    timeout_ms = invocation.timeout.map(|t| t.as_millis() as u64),
                    "Step timed out, killing process"
                );
                stdout.abort();
                stderr.abort();
                Self::terminate(&mut child, pid).await;
                ProcessOutcome::TimedOut { pid }
            }
            Race::Cancelled => {
                warn!(
                    step_index = invocation.step_index,
                    pid = ?pid,
                    "Run cancelled, killing process"
                );
                stdout.abort();
                stderr.abort();
                Self::terminate(&mut child, pid).await;
                ProcessOutcome::Cancelled { pid }
            }
        }
    }
}

/// Output of one pipe, collected on a background task into a shared buffer so that
/// whatever was read survives the task being aborted.
struct PipeCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl PipeCapture {
    fn start<R>(stream: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let task = tokio::spawn(async move {
            let Some(mut stream) = stream else {
                return;
            };
            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => sink.lock().await.extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        debug!(error = %e, "Stopped reading process output");
                        break;
                    }
                }
            }
        });
        Self { buffer, task }
    }

    /// Wait for end-of-file until `deadline`, then keep whatever arrived.
    async fn finish(mut self, deadline: Instant, step_index: usize) -> Vec<u8> {
        if tokio::time::timeout_at(deadline, &mut self.task).await.is_err() {
            debug!(
                step_index,
                "Output pipe still open after exit, a background process may hold it"
            );
            self.task.abort();
        }
        let mut buffer = self.buffer.lock().await;
        std::mem::take(&mut *buffer)
    }

    fn abort(&self) {
        self.task.abort();
    }
}

fn describe_spawn_error(error: &io::Error) -> String {
    match error.kind() {
        io::ErrorKind::NotFound => "command not found (is it installed and on PATH?)".to_string(),
        io::ErrorKind::PermissionDenied => "permission denied (is it executable?)".to_string(),
        _ => error.to_string(),
    }
}
