//! CLI subcommands

pub mod cleanup;
pub mod rollback;
pub mod sync;

use std::sync::Arc;

use anyhow::Context;

use mirrorsync_core::config::Config;
use mirrorsync_core::ports::event_bus::NullPublisher;
use mirrorsync_engine::operations::snapshots::{self, SnapshotBlock};
use mirrorsync_engine::operations::RemoteAsExec;
use mirrorsync_remote::{Connection, RemoteExecutor};
use mirrorsync_snapshots::SnapshotManager;

/// The snapshot operation's configuration block from the operation table
pub(crate) fn snapshot_block(config: &Config) -> anyhow::Result<SnapshotBlock> {
    let entry = config
        .operation_entry(snapshots::NAME)
        .context("No 'snapshots' operation configured")?;
    serde_json::from_value(entry.config.clone())
        .context("Invalid 'snapshots' operation configuration")
}

/// Connect to the target and build a snapshot manager for maintenance
/// commands (rollback, cleanup).
pub(crate) async fn connect_snapshot_manager(
    config: &Config,
) -> anyhow::Result<(Arc<Connection>, SnapshotManager)> {
    anyhow::ensure!(
        !config.target.host.is_empty(),
        "No target host configured; set target.host in the configuration file"
    );
    let block = snapshot_block(config)?;
    let connection = Connection::establish(
        config.target.clone(),
        config.connection.clone(),
        Arc::new(NullPublisher),
    )
    .await
    .context("Cannot establish the connection to the target")?;

    let remote = Arc::new(RemoteExecutor::new(Arc::clone(&connection)));
    let manager = block.manager(Arc::new(RemoteAsExec(remote)));
    Ok((connection, manager))
}
