//! Local executor adapter
//!
//! Implements [`ICommandExecutor`] by spawning processes on the source
//! machine directly. The contract is identical to the remote side, so an
//! operation can run `btrfs filesystem usage` here and on the target
//! through the same code path.

use std::time::Duration;

use async_trait::async_trait;

use mirrorsync_core::domain::errors::ExecError;
use mirrorsync_core::domain::event::HostRole;
use mirrorsync_core::ports::executor::{CommandOutput, CommandStream, ICommandExecutor};

use crate::process::{run_captured, spawn_streaming, ProcessSet};

/// Executes commands on the source machine
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor {
    processes: ProcessSet,
}

impl LocalExecutor {
    /// Create a LocalExecutor
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ICommandExecutor for LocalExecutor {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, ExecError> {
        run_captured(&self.processes, argv, timeout).await
    }

    async fn start(&self, argv: &[String]) -> Result<CommandStream, ExecError> {
        spawn_streaming(&self.processes, argv, ()).await
    }

    async fn terminate_all(&self) -> Result<(), ExecError> {
        self.processes.terminate_all();
        Ok(())
    }

    fn host_role(&self) -> HostRole {
        HostRole::Source
    }
}
