//! Session runtime wiring
//!
//! Builds the concrete stack — event bus, record consumers, connection,
//! executors — around the orchestrator and tears it down afterwards. The
//! orchestrator itself only sees ports; this module is where the real
//! adapters are chosen.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use mirrorsync_core::config::Config;
use mirrorsync_core::domain::newtypes::SessionId;
use mirrorsync_core::domain::session::ErrorFlag;
use mirrorsync_core::ports::event_bus::IEventPublisher;
use mirrorsync_events::{spawn_error_tracker, DisplaySink, EventBus, FileRecorder};
use mirrorsync_remote::{Connection, LocalExecutor, RemoteExecutor};

use crate::orchestrator::{EngineHandles, Orchestrator, SessionReport};
use crate::registry::builtin_registry;

/// Run one full replication session with the real adapter stack.
///
/// `cancel` is the cooperative interrupt token (see
/// [`spawn_interrupt_handler`](crate::interrupt::spawn_interrupt_handler)).
pub async fn run_session(
    config: Config,
    cancel: CancellationToken,
) -> anyhow::Result<SessionReport> {
    anyhow::ensure!(
        !config.target.host.is_empty(),
        "No target host configured; set target.host in the configuration file"
    );

    let session_id = SessionId::new();
    let bus = EventBus::new();
    let error_flag = ErrorFlag::new();
    let consumers_cancel = CancellationToken::new();

    // Independent consumers over the same stream, each with its own
    // threshold: the persisted trail and the live display.
    let recorder = FileRecorder::create(
        &config.logging.directory,
        session_id.clone(),
        config.logging.file_level,
    )
    .context("Cannot open session record file")?;
    let recorder_task = tokio::spawn(recorder.run(bus.subscribe(), consumers_cancel.clone()));

    let display = DisplaySink::stderr(config.logging.display_level);
    let display_task = tokio::spawn(display.run(bus.subscribe(), consumers_cancel.clone()));

    let tracker_task =
        spawn_error_tracker(bus.subscribe(), error_flag.clone(), consumers_cancel.clone());

    // The persistent authenticated channel, supervised by keepalive.
    let events: Arc<dyn IEventPublisher> = Arc::new(bus.clone());
    let connection = Connection::establish(
        config.target.clone(),
        config.connection.clone(),
        Arc::clone(&events),
    )
    .await
    .context("Cannot establish the connection to the target")?;
    let keepalive_cancel = CancellationToken::new();
    let keepalive_task = connection.spawn_keepalive(keepalive_cancel.clone());

    let handles = EngineHandles {
        local: Arc::new(LocalExecutor::new()),
        remote: Arc::new(RemoteExecutor::new(Arc::clone(&connection))),
        // Separate executor instance: its process set holds only the
        // target lock holder, out of reach of operation aborts.
        lock_remote: Arc::new(RemoteExecutor::new(Arc::clone(&connection))),
        events: Arc::clone(&events),
    };

    let orchestrator = Orchestrator::new(
        config,
        builtin_registry()?,
        handles,
        error_flag,
        cancel,
    );
    let report = orchestrator.run(session_id).await;

    // Closing the connection kills the target lock holder, releasing the
    // remote lock no matter how the session ended.
    keepalive_cancel.cancel();
    if let Err(e) = keepalive_task.await {
        warn!(error = %e, "Keepalive task ended abnormally");
    }
    connection.close().await;

    // Let the consumers drain what is already on the bus, then stop them.
    drop(bus);
    drop(events);
    consumers_cancel.cancel();
    let _ = recorder_task.await;
    let _ = display_task.await;
    let _ = tracker_task.await;

    Ok(report)
}
