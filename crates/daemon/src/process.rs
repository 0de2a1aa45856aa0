//! External tool processes
//!
//! Every child the daemon starts goes through [`tool_command`]: no stdin, its
//! own process group on unix so a terminal Ctrl-C reaches only the daemon, and
//! `kill_on_drop` so an abandoned worker task cannot leak a process.

use crate::lifecycle::ShutdownSignal;
use shipper_config::ToolCommand;
use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lines of stderr kept for error messages
const STDERR_TAIL_LINES: usize = 20;

/// Error type for running an external tool
#[derive(Debug, Error)]
pub enum ToolError {
    /// The program could not be started
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// IO error while the program was running
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The program was terminated by a forced shutdown
    #[error("Interrupted by shutdown")]
    Interrupted,
}

/// Captured result of a finished tool run
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    /// Last lines of stderr
    pub stderr: String,
}

/// Build a command for `tool` followed by `args`.
pub fn tool_command<I, S>(tool: &ToolCommand, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut cmd = Command::new(&tool.program);
    cmd.args(&tool.args);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// Start `cmd` with stdout and stderr piped.
pub fn spawn_piped(mut cmd: Command, program: &str) -> Result<Child, ToolError> {
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.spawn().map_err(|source| ToolError::Spawn {
        program: program.to_string(),
        source,
    })
}

/// Collect the last lines of a stream in the background.
pub fn collect_tail<R>(stream: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Vec::from(tail).join("\n")
    })
}

/// Collect a whole stream in the background.
fn collect_all<R>(stream: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        let mut out = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            out.push_str(&line);
            out.push('\n');
        }
        out
    })
}

/// Run `cmd` to completion, capturing its output.
///
/// A forced shutdown terminates the child (see [`terminate`]) and returns
/// [`ToolError::Interrupted`].
pub async fn run_captured(
    cmd: Command,
    program: &str,
    shutdown: &mut ShutdownSignal,
    grace: Duration,
) -> Result<ToolOutput, ToolError> {
    let mut child = spawn_piped(cmd, program)?;

    let stdout = child.stdout.take().map(collect_all);
    let stderr = child.stderr.take().map(collect_tail);

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = shutdown.forced() => {
            terminate(&mut child, grace).await;
            if let Some(handle) = stdout {
                handle.abort();
            }
            if let Some(handle) = stderr {
                handle.abort();
            }
            return Err(ToolError::Interrupted);
        }
    };

    Ok(ToolOutput {
        status,
        stdout: join_text(stdout).await,
        stderr: join_text(stderr).await,
    })
}

/// Await a background reader, yielding empty text if it is missing or failed.
pub async fn join_text(handle: Option<JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// Stop a child: SIGTERM, up to `grace` to exit, then SIGKILL.
///
/// On unix the signals go to the child's process group, so grandchildren
/// started by argv wrappers such as `nice` are stopped too.
pub async fn terminate(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };

    if send_terminate(pid) {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid, %status, "Child exited after SIGTERM");
                #[cfg(unix)]
                signal_group(pid, libc::SIGKILL);
                return;
            }
            Ok(Err(e)) => warn!(pid, "Failed waiting for child: {}", e),
            Err(_) => warn!(pid, grace_secs = grace.as_secs(), "Child ignored SIGTERM, killing"),
        }
    }

    #[cfg(unix)]
    signal_group(pid, libc::SIGKILL);
    if let Err(e) = child.kill().await {
        warn!(pid, "Failed to kill child: {}", e);
    }
}

/// Send SIGTERM to `pid` (and its group on unix). Returns false if nothing
/// could be signalled.
fn send_terminate(pid: u32) -> bool {
    #[cfg(unix)]
    {
        if signal_group(pid, libc::SIGTERM) {
            return true;
        }
    }

    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), ProcessRefreshKind::new());
    sys.process(pid)
        .and_then(|process| process.kill_with(Signal::Term))
        .unwrap_or(false)
}

/// Signal every process in group `pgid`. Children from [`tool_command`]
/// lead their own group, so their pid is the group id.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return false;
    };
    // SAFETY: killpg takes plain integers and touches no memory.
    unsafe { libc::killpg(pgid, signal) == 0 }
}

/// Human-readable exit description: the code, or the signal on unix.
pub fn describe_status(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {}", signal);
        }
    }
    "unknown exit status".to_string()
}
