//! Two-stage interrupt handling
//!
//! The first SIGINT/SIGTERM requests cooperative cancellation: the
//! orchestrator stops starting operations, aborts the current one within
//! the configured timeout, and the session ends as `Aborted` (exit 130).
//! A second signal before cleanup finishes terminates the process
//! immediately, skipping cleanup.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit code for the interrupt path (128 + SIGINT)
pub const INTERRUPT_EXIT_CODE: i32 = 130;

async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Spawn the interrupt handler.
///
/// Cancels `cancel` on the first signal; exits the process on the second.
pub fn spawn_interrupt_handler(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Interrupt received; finishing the current operation and cleaning up");
        cancel.cancel();

        wait_for_signal().await;
        warn!("Second interrupt; terminating immediately");
        std::process::exit(INTERRUPT_EXIT_CODE);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_exit_code() {
        assert_eq!(INTERRUPT_EXIT_CODE, 130);
    }

    #[tokio::test]
    async fn test_handler_spawns_and_aborts_cleanly() {
        let cancel = CancellationToken::new();
        let handle = spawn_interrupt_handler(cancel.clone());
        // No signal arrives in tests; the task just has to be alive.
        assert!(!cancel.is_cancelled());
        handle.abort();
    }
}
