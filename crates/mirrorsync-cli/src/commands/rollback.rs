//! `mirrorsync rollback` - restore subvolumes from pre-sync snapshots

use clap::Args;

use mirrorsync_core::config::Config;
use mirrorsync_core::domain::newtypes::SessionId;

use crate::commands::{connect_snapshot_manager, snapshot_block};
use crate::output::{emit, OutputFormat};

/// Restore the target's subvolumes from a session's pre-sync snapshots.
///
/// Destructive: the live subvolumes are deleted and recreated from the
/// read-only snapshots. Never runs automatically; requires `--yes`.
#[derive(Debug, Args)]
pub struct RollbackCommand {
    /// Id of the failed session to roll back to (printed when a session
    /// fails)
    pub session_id: String,

    /// Confirm the destructive restore
    #[arg(long)]
    pub yes: bool,
}

impl RollbackCommand {
    /// Execute the command, returning the process exit code
    pub async fn execute(self, config: Config, format: OutputFormat) -> i32 {
        let session_id: SessionId = match self.session_id.parse() {
            Ok(id) => id,
            Err(e) => {
                emit(
                    format,
                    &format!("Error: {e}"),
                    &serde_json::json!({ "error": e.to_string() }),
                );
                return 1;
            }
        };

        if !self.yes {
            emit(
                format,
                &format!(
                    "Rollback deletes the live subvolumes and restores them from \
                     session {session_id}'s pre-sync snapshots.\n\
                     Re-run with --yes to proceed."
                ),
                &serde_json::json!({ "error": "confirmation required (--yes)" }),
            );
            return 1;
        }

        let result = async {
            let block = snapshot_block(&config)?;
            let (connection, manager) = connect_snapshot_manager(&config).await?;
            let outcome = manager
                .rollback_to_presync(&session_id, &block.subvolume_names())
                .await;
            connection.close().await;
            outcome.map_err(anyhow::Error::from)
        }
        .await;

        match result {
            Ok(()) => {
                emit(
                    format,
                    &format!("Rolled back to session {session_id}'s pre-sync snapshots"),
                    &serde_json::json!({ "session_id": session_id.to_string(), "rolled_back": true }),
                );
                0
            }
            Err(e) => {
                emit(
                    format,
                    &format!("Error: {e:#}"),
                    &serde_json::json!({ "error": format!("{e:#}") }),
                );
                1
            }
        }
    }
}
