//! Shell process execution shared by adapters and collaborators.
//!
//! Every shell runs in its own process group. On timeout or cancellation the
//! whole group gets SIGTERM, then SIGKILL after a short grace, so tools the
//! shell started do not outlive the call. The group is also killed when the
//! future is dropped mid-flight (an aborted adapter task, for instance).

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Timeout for capturing stdout/stderr after the process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a signalled process group gets to exit before SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(500);

/// Maximum bytes captured per stream.
const MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

/// Exit codes `sh` uses for "not executable" and "not found".
const SHELL_NOT_EXECUTABLE: i32 = 126;
const SHELL_NOT_FOUND: i32 = 127;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn process: {0}")]
    Spawn(std::io::Error),
    #[error("io error while waiting for process: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// How the process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Exited on its own; `-1` when killed by a signal.
    Completed(i32),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub outcome: ProcessOutcome,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
}

impl ProcessOutput {
    /// Whether `sh` reported that the command itself could not be run.
    pub fn command_missing(&self) -> bool {
        matches!(
            self.outcome,
            ProcessOutcome::Completed(SHELL_NOT_EXECUTABLE | SHELL_NOT_FOUND)
        )
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Last `lines` lines of stderr, or of stdout when stderr is empty.
    pub fn tail(&self, lines: usize) -> String {
        let source = if self.stderr.iter().all(u8::is_ascii_whitespace) {
            self.stdout_lossy()
        } else {
            self.stderr_lossy()
        };
        let all: Vec<&str> = source.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// Read from an async reader with a maximum byte limit.
///
/// Input past the limit is drained and discarded so the child never blocks
/// on a full pipe.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "output exceeded limit, truncating");
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }

        let to_take = n.min(remaining);
        buf.extend_from_slice(&chunk[..to_take]);
    }

    Ok(buf)
}

async fn collect(
    task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
    stream: &'static str,
) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(err))) => {
            warn!(stream, error = %err, "output capture failed");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(stream, error = %err, "output capture task panicked");
            Vec::new()
        }
        Err(_) => {
            warn!(stream, "output capture timed out");
            Vec::new()
        }
    }
}

/// Process group led by a spawned shell. Dropping it SIGKILLs the group.
#[derive(Debug)]
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|id| i32::try_from(id).ok()),
        }
    }

    #[cfg(unix)]
    fn signal(&self, signal: nix::sys::signal::Signal) {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(pgid) = self.pgid else {
            return;
        };
        match killpg(Pid::from_raw(pgid), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!(pgid, signal = %signal, error = %err, "failed to signal process group"),
        }
    }

    fn terminate(&self) {
        #[cfg(unix)]
        self.signal(nix::sys::signal::Signal::SIGTERM);
    }

    /// SIGKILL the group once; later calls do nothing since the id may be reused.
    fn kill(&mut self) {
        #[cfg(unix)]
        self.signal(nix::sys::signal::Signal::SIGKILL);
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// SIGTERM the group, give it [`TERM_GRACE`], then SIGKILL and reap.
async fn stop(child: &mut Child, group: &mut ProcessGroup, cmd: &str) {
    group.terminate();
    if timeout(TERM_GRACE, child.wait()).await.is_ok() {
        group.kill();
        return;
    }
    group.kill();
    if let Err(err) = child.kill().await {
        warn!(cmd = %cmd, error = %err, "failed to kill process");
    }
    let _ = child.wait().await;
}

/// Run `cmd` through `sh -c` in `dir`.
///
/// `stdin` is written to the child and then closed. Returns `Err` only when
/// the shell itself cannot be spawned or waited on; timeouts and
/// cancellation are reported through [`ProcessOutcome`].
pub async fn run_shell(
    cmd: &str,
    dir: &Path,
    stdin: Option<Vec<u8>>,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<ProcessOutput> {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(cmd)
        .current_dir(dir)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    debug!(cmd = %cmd, dir = %dir.display(), timeout_ms = limit.as_millis() as u64, "spawning process");

    let started = Instant::now();
    let mut child = command.spawn().map_err(ProcessError::Spawn)?;
    let mut group = ProcessGroup::of(&child);

    if let (Some(input), Some(mut handle)) = (stdin, child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(err) = handle.write_all(&input).await {
                debug!(error = %err, "child closed stdin early");
            }
        });
    }

    let stdout_task = child
        .stdout
        .take()
        .map(|stdout| tokio::spawn(read_bounded(stdout, MAX_OUTPUT_BYTES)));
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES)));

    let outcome = tokio::select! {
        result = child.wait() => ProcessOutcome::Completed(result?.code().unwrap_or(-1)),
        () = cancel.cancelled() => {
            debug!(cmd = %cmd, "cancellation requested; stopping process group");
            stop(&mut child, &mut group, cmd).await;
            ProcessOutcome::Cancelled
        }
        () = tokio::time::sleep(limit) => {
            warn!(cmd = %cmd, timeout_ms = limit.as_millis() as u64, "process timed out; stopping process group");
            stop(&mut child, &mut group, cmd).await;
            ProcessOutcome::TimedOut
        }
    };

    // Leftover background jobs would hold the pipes open.
    group.kill();
    let (stdout, stderr) = tokio::join!(
        collect(stdout_task, "stdout"),
        collect(stderr_task, "stderr")
    );

    Ok(ProcessOutput {
        outcome,
        stdout,
        stderr,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}
