//! Command execution ports
//!
//! Both machines are driven through the same contract: blocking
//! [`run`](ICommandExecutor::run) for short commands, streaming
//! [`start`](ICommandExecutor::start) for long-running ones whose output
//! must be consumed line-by-line (buffering a whole transfer's output
//! would defeat real-time progress reporting), and
//! [`terminate_all`](ICommandExecutor::terminate_all) for cancellation.
//!
//! The remote side additionally moves files and resolves its hostname.
//!
//! ## Design Notes
//!
//! - Commands are argv vectors, not shell strings; the remote adapter is
//!   responsible for quoting when it crosses the SSH boundary.
//! - `run` applies a per-invocation timeout. A timeout is a command
//!   failure ([`ExecError::Timeout`]), not a connection failure; the
//!   connection layer decides separately whether the channel is lost.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::errors::ExecError;
use crate::domain::event::HostRole;

/// Result of a completed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit code (-1 when terminated by signal)
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl CommandOutput {
    /// True when the command exited 0
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout with surrounding whitespace trimmed
    #[must_use]
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// One item from a streaming command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    /// A line of stdout (without the trailing newline)
    Stdout(String),
    /// A line of stderr (without the trailing newline)
    Stderr(String),
    /// The process exited; always the final item
    Exited(i32),
}

/// Handle to a command started with [`ICommandExecutor::start`].
///
/// Lines arrive as the process flushes them; the channel closes after
/// [`CommandEvent::Exited`] is delivered.
#[derive(Debug)]
pub struct CommandStream {
    /// Ordered stream of output lines and the final exit notification
    pub events: mpsc::Receiver<CommandEvent>,
}

impl CommandStream {
    /// Receive the next event, or `None` once the stream is exhausted
    pub async fn next(&mut self) -> Option<CommandEvent> {
        self.events.recv().await
    }
}

/// Identical command-execution contract for both machines
#[async_trait]
pub trait ICommandExecutor: Send + Sync {
    /// Run a command to completion, capturing its output.
    ///
    /// Blocks (asynchronously) until the process exits or `timeout`
    /// elapses. A non-zero exit is *not* an `Err`; callers inspect
    /// [`CommandOutput::success`].
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, ExecError>;

    /// Start a long-running command whose output is consumed incrementally
    async fn start(&self, argv: &[String]) -> Result<CommandStream, ExecError>;

    /// Terminate every process this executor started and has not reaped.
    ///
    /// Used by session cancellation and by operation `abort` hooks.
    async fn terminate_all(&self) -> Result<(), ExecError>;

    /// Which machine this executor drives (for event attribution)
    fn host_role(&self) -> HostRole;
}

/// Remote-only extensions: file transfer and identity
#[async_trait]
pub trait IRemoteExecutor: ICommandExecutor {
    /// Copy a local file to the target
    async fn send_file(&self, local: &Path, remote: &Path) -> Result<(), ExecError>;

    /// Copy a file from the target to the local machine
    async fn get_file(&self, remote: &Path, local: &Path) -> Result<(), ExecError>;

    /// The target's self-reported hostname (resolved once per connection)
    async fn hostname(&self) -> Result<String, ExecError>;
}
