//! `mirrorsync cleanup` - apply snapshot retention

use clap::Args;

use mirrorsync_core::config::Config;
use mirrorsync_snapshots::RetentionPolicy;

use crate::commands::{connect_snapshot_manager, snapshot_block};
use crate::output::{emit, OutputFormat};

/// Delete old snapshot sets according to the retention policy.
///
/// The N most recent sessions are always kept regardless of age.
#[derive(Debug, Args)]
pub struct CleanupCommand {
    /// Override the configured number of sessions to always keep
    #[arg(long)]
    pub keep_recent: Option<usize>,

    /// Override the configured maximum age in days
    #[arg(long)]
    pub max_age_days: Option<i64>,
}

impl CleanupCommand {
    /// Execute the command, returning the process exit code
    pub async fn execute(self, config: Config, format: OutputFormat) -> i32 {
        let result = async {
            let block = snapshot_block(&config)?;
            let policy = RetentionPolicy {
                keep_recent: self.keep_recent.unwrap_or(block.keep_recent),
                max_age: chrono_days(self.max_age_days.unwrap_or(block.max_age_days)),
            };
            let (connection, manager) = connect_snapshot_manager(&config).await?;
            let outcome = manager.cleanup_old_snapshots(policy).await;
            connection.close().await;
            outcome.map_err(anyhow::Error::from)
        }
        .await;

        match result {
            Ok(deleted) => {
                let human = if deleted.is_empty() {
                    "Nothing to delete".to_string()
                } else {
                    format!(
                        "Deleted snapshot sets of {} session(s): {}",
                        deleted.len(),
                        deleted
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", ")
                    )
                };
                let json = serde_json::json!({
                    "deleted": deleted.iter().map(ToString::to_string).collect::<Vec<_>>(),
                });
                emit(format, &human, &json);
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

fn chrono_days(days: i64) -> chrono::Duration {
    chrono::Duration::days(days)
}
