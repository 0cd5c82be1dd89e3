//! Remote executor adapter
//!
//! Implements [`ICommandExecutor`] plus the remote-only extensions
//! ([`IRemoteExecutor`]: file transfer, hostname) by running commands as
//! sessions over the shared control-master connection. Each command takes
//! one permit from the connection's session limiter, which is how the
//! multiplexing bound is enforced; streaming commands hold their permit
//! until the remote process exits.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;

use mirrorsync_core::domain::errors::{ConnectionError, ExecError};
use mirrorsync_core::domain::event::HostRole;
use mirrorsync_core::ports::executor::{
    CommandOutput, CommandStream, ICommandExecutor, IRemoteExecutor,
};

use crate::connection::{shell_join, Connection};
use crate::process::{run_captured, spawn_streaming, ProcessSet};

/// Upper bound for a single file transfer
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(3600);

/// Timeout for the one-off hostname resolution
const HOSTNAME_TIMEOUT: Duration = Duration::from_secs(10);

/// Executes commands on the target machine over the session's connection
pub struct RemoteExecutor {
    conn: Arc<Connection>,
    processes: ProcessSet,
    hostname: OnceCell<String>,
}

impl RemoteExecutor {
    /// Create a RemoteExecutor over an established connection
    #[must_use]
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            processes: ProcessSet::new(),
            hostname: OnceCell::new(),
        }
    }

    /// The underlying connection (lock manager needs it for the target
    /// lock's lifetime binding)
    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    fn remote_argv(&self, argv: &[String]) -> Vec<String> {
        let mut full = self.conn.exec_prefix();
        full.push(shell_join(argv));
        full
    }

    async fn acquire_session(
        &self,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, ExecError> {
        self.conn
            .session_limiter()
            .acquire_owned()
            .await
            .map_err(|_| ExecError::Connection(ConnectionError::Closed))
    }
}

#[async_trait]
impl ICommandExecutor for RemoteExecutor {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, ExecError> {
        self.conn.ensure_alive().await?;
        let _permit = self.acquire_session().await?;
        run_captured(&self.processes, &self.remote_argv(argv), timeout).await
    }

    async fn start(&self, argv: &[String]) -> Result<CommandStream, ExecError> {
        self.conn.ensure_alive().await?;
        let permit = self.acquire_session().await?;
        spawn_streaming(&self.processes, &self.remote_argv(argv), permit).await
    }

    async fn terminate_all(&self) -> Result<(), ExecError> {
        // Killing the local ssh session processes tears down their remote
        // counterparts through the channel.
        self.processes.terminate_all();
        Ok(())
    }

    fn host_role(&self) -> HostRole {
        HostRole::Target
    }
}

#[async_trait]
impl IRemoteExecutor for RemoteExecutor {
    async fn send_file(&self, local: &Path, remote: &Path) -> Result<(), ExecError> {
        self.conn.ensure_alive().await?;
        let _permit = self.acquire_session().await?;
        let argv = self.conn.scp_args(
            local.display().to_string(),
            format!("{}:{}", self.conn.destination(), remote.display()),
        );
        let out = run_captured(&self.processes, &argv, TRANSFER_TIMEOUT).await?;
        if out.success() {
            Ok(())
        } else {
            Err(ExecError::Output(std::io::Error::other(format!(
                "scp to target failed: {}",
                out.stderr.trim()
            ))))
        }
    }

    async fn get_file(&self, remote: &Path, local: &Path) -> Result<(), ExecError> {
        self.conn.ensure_alive().await?;
        let _permit = self.acquire_session().await?;
        let argv = self.conn.scp_args(
            format!("{}:{}", self.conn.destination(), remote.display()),
            local.display().to_string(),
        );
        let out = run_captured(&self.processes, &argv, TRANSFER_TIMEOUT).await?;
        if out.success() {
            Ok(())
        } else {
            Err(ExecError::Output(std::io::Error::other(format!(
                "scp from target failed: {}",
                out.stderr.trim()
            ))))
        }
    }

    async fn hostname(&self) -> Result<String, ExecError> {
        self.hostname
            .get_or_try_init(|| async {
                let out = self
                    .run(&["hostname".to_string()], HOSTNAME_TIMEOUT)
                    .await?;
                if out.success() {
                    Ok(out.stdout_trimmed().to_string())
                } else {
                    Err(ExecError::Output(std::io::Error::other(format!(
                        "hostname failed: {}",
                        out.stderr.trim()
                    ))))
                }
            })
            .await
            .cloned()
    }
}
