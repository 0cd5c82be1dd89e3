//! Built-in operations
//!
//! The two operations every session carries: the snapshot operation
//! (safety net, ordered first) and the target install/upgrade operation
//! (version parity, ordered second). Future sync operations implement the
//! same [`Operation`](mirrorsync_core::Operation) contract and register
//! alongside them.

pub mod install;
pub mod snapshots;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use mirrorsync_core::domain::errors::ExecError;
use mirrorsync_core::domain::event::HostRole;
use mirrorsync_core::ports::executor::{
    CommandOutput, CommandStream, ICommandExecutor, IRemoteExecutor,
};

/// Lets an `Arc<dyn IRemoteExecutor>` travel where an
/// `Arc<dyn ICommandExecutor>` is expected (no trait upcasting on our
/// MSRV).
pub struct RemoteAsExec(pub Arc<dyn IRemoteExecutor>);

#[async_trait]
impl ICommandExecutor for RemoteAsExec {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, ExecError> {
        self.0.run(argv, timeout).await
    }

    async fn start(&self, argv: &[String]) -> Result<CommandStream, ExecError> {
        self.0.start(argv).await
    }

    async fn terminate_all(&self) -> Result<(), ExecError> {
        self.0.terminate_all().await
    }

    fn host_role(&self) -> HostRole {
        self.0.host_role()
    }
}
