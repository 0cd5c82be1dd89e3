//! Process spawning shared by both executors
//!
//! Capture-and-wait and line-streaming spawn helpers plus the
//! [`ProcessSet`] bookkeeping that makes `terminate_all` possible. Every
//! spawned child is registered by pid while it runs and deregistered when
//! reaped; termination signals the whole set.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use mirrorsync_core::domain::errors::ExecError;
use mirrorsync_core::ports::executor::{CommandEvent, CommandOutput, CommandStream};

/// Exit code reported when a process was terminated by a signal
const SIGNALED_EXIT_CODE: i32 = -1;

/// Buffered lines per streaming command before backpressure applies
const STREAM_BUFFER: usize = 256;

/// Tracks the pids of processes an executor has started and not reaped.
#[derive(Debug, Clone, Default)]
pub struct ProcessSet {
    pids: Arc<Mutex<HashSet<u32>>>,
}

impl ProcessSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, pid: u32) {
        if let Ok(mut pids) = self.pids.lock() {
            pids.insert(pid);
        }
    }

    fn deregister(&self, pid: u32) {
        if let Ok(mut pids) = self.pids.lock() {
            pids.remove(&pid);
        }
    }

    /// Number of live processes
    #[must_use]
    pub fn len(&self) -> usize {
        self.pids.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// True when no process is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send SIGTERM to every tracked process.
    ///
    /// Idempotent; a pid that already exited is ignored by the kernel
    /// (ESRCH) and dropped from the set either way.
    pub fn terminate_all(&self) {
        let pids: Vec<u32> = self
            .pids
            .lock()
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default();
        for pid in pids {
            debug!(pid, "Terminating process");
            // SAFETY: plain kill(2) with a pid we spawned ourselves.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            self.deregister(pid);
        }
    }
}

fn build_command(argv: &[String]) -> Result<Command, ExecError> {
    let (program, args) = argv.split_first().ok_or_else(|| {
        ExecError::Spawn(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty argv",
        ))
    })?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Ok(cmd)
}

/// Run `argv` to completion with a timeout, capturing output.
///
/// A timeout kills the process and returns [`ExecError::Timeout`]; a
/// non-zero exit is reported through [`CommandOutput`], not as an error.
pub async fn run_captured(
    set: &ProcessSet,
    argv: &[String],
    timeout: Duration,
) -> Result<CommandOutput, ExecError> {
    let mut cmd = build_command(argv)?;
    let child = cmd.spawn().map_err(ExecError::Spawn)?;
    let pid = child.id().unwrap_or(0);
    set.register(pid);

    let result = tokio::time::timeout(timeout, child.wait_with_output()).await;
    set.deregister(pid);

    match result {
        Ok(Ok(output)) => Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(SIGNALED_EXIT_CODE),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(e)) => Err(ExecError::Output(e)),
        Err(_elapsed) => {
            // kill_on_drop already reaped the child via the dropped future;
            // make sure anyway, the pid may still be live.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
            Err(ExecError::Timeout(timeout))
        }
    }
}

/// Start `argv` and stream its output line-by-line.
///
/// The returned [`CommandStream`] yields stdout/stderr lines as the
/// process flushes them and a final [`CommandEvent::Exited`]. The driver
/// task owns the child; the process stays in `set` until it exits.
///
/// `guard` lives as long as the process does — the remote executor
/// passes its session permit here so a streaming command keeps occupying
/// one multiplexing slot until it exits.
pub async fn spawn_streaming(
    set: &ProcessSet,
    argv: &[String],
    guard: impl Send + 'static,
) -> Result<CommandStream, ExecError> {
    let mut cmd = build_command(argv)?;
    let mut child = cmd.spawn().map_err(ExecError::Spawn)?;
    let pid = child.id().unwrap_or(0);
    set.register(pid);

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);

    let set = set.clone();
    tokio::spawn(async move {
        let _guard = guard;
        let out_tx = tx.clone();
        let pump_out = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if out_tx.send(CommandEvent::Stdout(line)).await.is_err() {
                        break;
                    }
                }
            }
        };
        let err_tx = tx.clone();
        let pump_err = async {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if err_tx.send(CommandEvent::Stderr(line)).await.is_err() {
                        break;
                    }
                }
            }
        };
        tokio::join!(pump_out, pump_err);

        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(SIGNALED_EXIT_CODE),
            Err(e) => {
                warn!(pid, error = %e, "Failed to reap streamed process");
                SIGNALED_EXIT_CODE
            }
        };
        set.deregister(pid);
        let _ = tx.send(CommandEvent::Exited(code)).await;
    });

    Ok(CommandStream { events: rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_run_captured_success() {
        let set = ProcessSet::new();
        let out = run_captured(&set, &argv(&["echo", "hello"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_trimmed(), "hello");
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_run_captured_nonzero_exit_is_not_err() {
        let set = ProcessSet::new();
        let out = run_captured(&set, &argv(&["false"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_run_captured_timeout() {
        let set = ProcessSet::new();
        let err = run_captured(&set, &argv(&["sleep", "30"]), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_run_captured_empty_argv() {
        let set = ProcessSet::new();
        let err = run_captured(&set, &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_streaming_yields_lines_then_exit() {
        let set = ProcessSet::new();
        let mut stream = spawn_streaming(&set, &argv(&["sh", "-c", "echo one; echo two"]), ())
            .await
            .unwrap();

        let mut lines = Vec::new();
        let mut exit = None;
        while let Some(event) = stream.next().await {
            match event {
                CommandEvent::Stdout(line) => lines.push(line),
                CommandEvent::Stderr(_) => {}
                CommandEvent::Exited(code) => exit = Some(code),
            }
        }
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(exit, Some(0));
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_streaming_separates_stderr() {
        let set = ProcessSet::new();
        let mut stream = spawn_streaming(&set, &argv(&["sh", "-c", "echo out; echo err >&2"]), ())
            .await
            .unwrap();

        let mut out = Vec::new();
        let mut err = Vec::new();
        while let Some(event) = stream.next().await {
            match event {
                CommandEvent::Stdout(line) => out.push(line),
                CommandEvent::Stderr(line) => err.push(line),
                CommandEvent::Exited(_) => {}
            }
        }
        assert_eq!(out, vec!["out"]);
        assert_eq!(err, vec!["err"]);
    }

    #[tokio::test]
    async fn test_terminate_all_kills_streamed_process() {
        let set = ProcessSet::new();
        let mut stream = spawn_streaming(&set, &argv(&["sleep", "30"]), ()).await.unwrap();
        assert_eq!(set.len(), 1);

        set.terminate_all();

        let mut exit = None;
        while let Some(event) = stream.next().await {
            if let CommandEvent::Exited(code) = event {
                exit = Some(code);
            }
        }
        // Terminated by SIGTERM, so no normal exit code.
        assert_eq!(exit, Some(-1));
    }
}
