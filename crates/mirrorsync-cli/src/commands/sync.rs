//! `mirrorsync sync` - run one replication session

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::error;

use mirrorsync_core::config::Config;
use mirrorsync_engine::{run_session, spawn_interrupt_handler};

use crate::output::{emit, OutputFormat};

/// Run one replication session against the configured target
#[derive(Debug, Args)]
pub struct SyncCommand {}

impl SyncCommand {
    /// Execute the command, returning the process exit code
    pub async fn execute(self, config: Config, format: OutputFormat) -> i32 {
        let cancel = CancellationToken::new();
        let interrupts = spawn_interrupt_handler(cancel.clone());

        let result = run_session(config, cancel).await;
        interrupts.abort();

        match result {
            Ok(report) => {
                let outcomes: Vec<String> = report
                    .outcomes
                    .iter()
                    .map(|(name, outcome)| format!("  {name}: {outcome:?}"))
                    .collect();
                let human = format!(
                    "Session {} ended: {}\n{}",
                    report.session_id,
                    report.state,
                    outcomes.join("\n")
                );
                let json = serde_json::json!({
                    "session_id": report.session_id.to_string(),
                    "state": report.state.to_string(),
                    "has_errors": report.has_errors,
                    "operations": report
                        .outcomes
                        .iter()
                        .map(|(name, outcome)| {
                            serde_json::json!({ "name": name, "outcome": outcome })
                        })
                        .collect::<Vec<_>>(),
                });
                emit(format, &human, &json);
                report.exit_code()
            }
            Err(e) => {
                error!(error = format!("{e:#}"), "Session could not run");
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
