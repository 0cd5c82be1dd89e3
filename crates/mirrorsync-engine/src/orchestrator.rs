//! Session orchestrator
//!
//! The top-level state machine: `Initializing → Validating → Executing →
//! Cleanup → {Completed | Aborted | Failed}`. The orchestrator owns the
//! session object, drives every operation's lifecycle strictly one at a
//! time, and maps every failure class deterministically onto a terminal
//! state. It never second-guesses an operation's own recoverable/critical
//! classification — it only reacts to what propagates.
//!
//! Ordering guarantees upheld here:
//! - all `validate()` calls finish (with zero errors) before any
//!   `pre_sync` runs;
//! - the snapshot operation runs first and the target install second,
//!   regardless of configured order of the rest;
//! - post-sync snapshots are created only after every operation
//!   succeeded.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mirrorsync_core::config::Config;
use mirrorsync_core::domain::errors::OperationError;
use mirrorsync_core::domain::event::{HostRole, LogLevel};
use mirrorsync_core::domain::newtypes::{Hostname, SessionId};
use mirrorsync_core::domain::session::{ErrorFlag, OperationOutcome, Session, SessionState};
use mirrorsync_core::operation::{ExecutionContext, Operation, OperationRegistry};
use mirrorsync_core::ports::event_bus::IEventPublisher;
use mirrorsync_core::ports::executor::{ICommandExecutor, IRemoteExecutor};

use crate::locks::{SourceLock, TargetLock};
use crate::monitor::{CapacityCheck, DfProbe, DiskMonitor};
use crate::operations::snapshots::{SnapshotBlock, SnapshotOperation, SnapshotService};
use crate::operations::{install, snapshots, RemoteAsExec};

/// Operation name used for session-level log events
const SESSION: &str = "session";

/// Ports and shared handles the orchestrator works through
pub struct EngineHandles {
    /// Command execution on the source machine
    pub local: Arc<dyn ICommandExecutor>,
    /// Command execution and transfer on the target machine
    pub remote: Arc<dyn IRemoteExecutor>,
    /// Separate remote executor whose process set holds only the target
    /// lock holder (operation aborts must not kill the lock)
    pub lock_remote: Arc<dyn IRemoteExecutor>,
    /// Event publication
    pub events: Arc<dyn IEventPublisher>,
}

/// Final outcome of one session, consumed by the CLI
#[derive(Debug)]
pub struct SessionReport {
    /// The session's id (needed to invoke rollback after a failure)
    pub session_id: SessionId,
    /// Terminal state
    pub state: SessionState,
    /// Per-operation outcomes in execution order
    pub outcomes: Vec<(String, OperationOutcome)>,
    /// Whether any ERROR/CRITICAL event was seen
    pub has_errors: bool,
}

impl SessionReport {
    /// Process exit code contract: 0 success, 130 interrupted, 1 anything
    /// else
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.state {
            SessionState::Completed => 0,
            SessionState::Aborted => 130,
            _ => 1,
        }
    }
}

/// How the sequential execution loop ended
enum ExecOutcome {
    AllSucceeded,
    Errored,
    Interrupted,
}

/// Drives one replication session from start to terminal state
pub struct Orchestrator {
    config: Config,
    registry: OperationRegistry,
    handles: EngineHandles,
    error_flag: ErrorFlag,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator.
    ///
    /// `cancel` is the cooperative interrupt signal: the first SIGINT
    /// cancels it, which stops new operations from starting and aborts
    /// the current one.
    pub fn new(
        config: Config,
        registry: OperationRegistry,
        handles: EngineHandles,
        error_flag: ErrorFlag,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            registry,
            handles,
            error_flag,
            cancel,
        }
    }

    fn log(&self, level: LogLevel, host: HostRole, message: &str) {
        self.handles.events.log(level, SESSION, host, message);
    }

    /// Run the whole session.
    ///
    /// The caller allocates the id so observers (the record file is named
    /// after it) exist before the session starts.
    pub async fn run(self, session_id: SessionId) -> SessionReport {
        info!(session = %session_id, "Session starting");

        // ------------------------------------------------------------------
        // Initializing
        // ------------------------------------------------------------------
        let init = self.initialize(&session_id).await;
        let (mut session, mut operations, snapshot_service) = match init {
            Ok(parts) => parts,
            Err(message) => {
                self.log(LogLevel::Critical, HostRole::Source, &message);
                error!(session = %session_id, reason = %message, "Initialization failed");
                return self.failed_before_validation(session_id);
            }
        };
        self.log(
            LogLevel::Info,
            HostRole::Source,
            &format!(
                "Session {} replicating {} -> {}",
                session.id(),
                session.source_host(),
                session.target_host()
            ),
        );

        // ------------------------------------------------------------------
        // Validating: every check runs, all errors surface together
        // ------------------------------------------------------------------
        if session.advance(SessionState::Validating).is_err() {
            return self.report(session);
        }
        let problems = self.validate_all(&operations).await;
        if !problems.is_empty() {
            for problem in &problems {
                self.log(LogLevel::Error, HostRole::Source, problem);
            }
            self.log(
                LogLevel::Critical,
                HostRole::Source,
                &format!("Validation failed with {} problem(s)", problems.len()),
            );
            let _ = session.advance(SessionState::Failed);
            return self.report(session);
        }
        self.log(LogLevel::Info, HostRole::Source, "Validation passed");

        // ------------------------------------------------------------------
        // Executing
        // ------------------------------------------------------------------
        if session.advance(SessionState::Executing).is_err() {
            return self.report(session);
        }

        let lock_wait = Duration::from_secs(self.config.locks.acquire_wait);
        let source_lock = match SourceLock::acquire(
            &self.config.source_lock_path(),
            session.id(),
            lock_wait,
        )
        .await
        {
            Ok(lock) => lock,
            Err(e) => return self.fail_in_executing(session, &format!("Source lock: {e}")),
        };
        session.set_lock_path(source_lock.path().to_path_buf());

        let _target_lock = match TargetLock::acquire(
            self.handles.lock_remote.as_ref(),
            &self.config.locks.target_path,
            lock_wait,
        )
        .await
        {
            Ok(lock) => lock,
            Err(e) => return self.fail_in_executing(session, &format!("Target lock: {e}")),
        };
        self.log(LogLevel::Info, HostRole::Source, "Both session locks held");

        // Disk preflight runs before anything modifies the target.
        let capacity = CapacityCheck {
            preflight_min_free: self.config.disk.preflight_min_free_bytes,
            runtime_min_free: self.config.disk.runtime_min_free_bytes,
        };
        let probe = DfProbe::new(
            Arc::new(RemoteAsExec(Arc::clone(&self.handles.remote))),
            self.config.disk.watch_path.clone(),
        );
        match probe.free_bytes().await {
            Ok(free) if capacity.preflight_ok(free) => {}
            Ok(free) => {
                return self.fail_in_executing(
                    session,
                    &format!(
                        "Preflight disk check failed: {free} bytes free, \
                         {} required",
                        capacity.preflight_min_free
                    ),
                );
            }
            Err(e) => {
                return self.fail_in_executing(session, &format!("Preflight disk probe: {e}"));
            }
        }

        // Runtime monitor runs alongside the sequential operation flow.
        let monitor_cancel = CancellationToken::new();
        let disk_trigger = CancellationToken::new();
        let monitor = DiskMonitor::new(
            DfProbe::new(
                Arc::new(RemoteAsExec(Arc::clone(&self.handles.remote))),
                self.config.disk.watch_path.clone(),
            ),
            capacity,
            Duration::from_secs(self.config.disk.check_interval),
            Arc::clone(&self.handles.events),
        );
        let monitor_handle = monitor.spawn(monitor_cancel.clone(), disk_trigger.clone());

        let outcome = self
            .execute_operations(&mut session, &mut operations, &disk_trigger)
            .await;

        monitor_cancel.cancel();
        let _ = monitor_handle.await;

        match outcome {
            ExecOutcome::AllSucceeded => {
                // Post-sync snapshots exist iff every operation succeeded.
                if let Err(e) = snapshot_service.create_post().await {
                    return self.fail_in_executing(
                        session,
                        &format!("Post-sync snapshots: {e}"),
                    );
                }
                let _ = session.advance(SessionState::Completed);
                self.log(
                    LogLevel::Info,
                    HostRole::Source,
                    &format!("Session {} completed", session.id()),
                );
            }
            ExecOutcome::Errored => {
                let _ = session.advance(SessionState::Failed);
                self.log(
                    LogLevel::Error,
                    HostRole::Source,
                    &format!(
                        "Session {} failed; pre-sync snapshots remain. \
                         Run 'mirrorsync rollback {}' to restore the target.",
                        session.id(),
                        session.id()
                    ),
                );
            }
            ExecOutcome::Interrupted => {
                let _ = session.advance(SessionState::Aborted);
                self.log(
                    LogLevel::Warn,
                    HostRole::Source,
                    &format!("Session {} aborted by user", session.id()),
                );
            }
        }

        drop(source_lock);
        self.report(session)
    }

    /// Initializing: resolve hosts, verify btrfs on both machines, plan
    /// the order, instantiate operations.
    async fn initialize(
        &self,
        session_id: &SessionId,
    ) -> Result<(Session, Vec<Box<dyn Operation>>, Arc<SnapshotService>), String> {
        let order = plan_order(&self.config.enabled_operation_names())?;

        let source_host = self.resolve_source_host().await;
        let target_host = self
            .handles
            .remote
            .hostname()
            .await
            .ok()
            .and_then(|h| Hostname::new(h).ok())
            .or_else(|| Hostname::new(self.config.target.host.clone()).ok())
            .ok_or_else(|| "Cannot resolve target hostname".to_string())?;

        // Both machines must offer the snapshot-capable filesystem.
        let snapshot_block: SnapshotBlock = self
            .config
            .operation_entry(snapshots::NAME)
            .map(|e| serde_json::from_value(e.config.clone()).unwrap_or_default())
            .unwrap_or_default();
        self.verify_btrfs(self.handles.local.as_ref(), &snapshot_block, HostRole::Source)
            .await?;
        let remote_as_exec: Arc<dyn ICommandExecutor> =
            Arc::new(RemoteAsExec(Arc::clone(&self.handles.remote)));
        self.verify_btrfs(remote_as_exec.as_ref(), &snapshot_block, HostRole::Target)
            .await?;

        let session = Session::with_id(
            session_id.clone(),
            source_host.clone(),
            target_host.clone(),
            order.clone(),
            self.error_flag.clone(),
        );

        let base_ctx = ExecutionContext {
            session_id: session_id.clone(),
            source_host,
            target_host,
            config: serde_json::Value::Null,
            local: Arc::clone(&self.handles.local),
            remote: Arc::clone(&self.handles.remote),
            events: Arc::clone(&self.handles.events),
            cancel: self.cancel.clone(),
        };

        // The snapshot operation is shared with the orchestrator: the
        // service half also creates the post-sync set at session end.
        let snapshot_service = Arc::new(SnapshotService::new(
            remote_as_exec,
            &snapshot_block,
            session_id.clone(),
            session.created_at(),
            Arc::clone(&self.handles.events),
        ));

        let mut operations: Vec<Box<dyn Operation>> = Vec::with_capacity(order.len());
        for name in &order {
            let entry = self
                .config
                .operation_entry(name)
                .ok_or_else(|| format!("Operation '{name}' missing from configuration"))?;
            if name == snapshots::NAME {
                operations.push(Box::new(SnapshotOperation::new(Arc::clone(
                    &snapshot_service,
                ))));
                continue;
            }
            let descriptor = self
                .registry
                .get(name)
                .ok_or_else(|| format!("Unknown operation '{name}' in configuration"))?;
            let ctx = Arc::new(base_ctx.for_operation(entry.config.clone()));
            operations.push((descriptor.construct)(ctx));
        }

        Ok((session, operations, snapshot_service))
    }

    async fn resolve_source_host(&self) -> Hostname {
        if let Ok(out) = self
            .handles
            .local
            .run(&["hostname".to_string()], Duration::from_secs(5))
            .await
        {
            if out.success() {
                if let Ok(host) = Hostname::new(out.stdout_trimmed()) {
                    return host;
                }
            }
        }
        Hostname::new("source").expect("literal hostname is valid")
    }

    async fn verify_btrfs(
        &self,
        exec: &dyn ICommandExecutor,
        block: &SnapshotBlock,
        host: HostRole,
    ) -> Result<(), String> {
        let argv = vec![
            "stat".to_string(),
            "-f".to_string(),
            "-c".to_string(),
            "%T".to_string(),
            block.volume_root.display().to_string(),
        ];
        let out = exec
            .run(&argv, Duration::from_secs(15))
            .await
            .map_err(|e| format!("Cannot probe {host} filesystem: {e}"))?;
        if out.success() && out.stdout_trimmed() == "btrfs" {
            Ok(())
        } else {
            Err(format!(
                "{host} filesystem at {} is not btrfs (found '{}')",
                block.volume_root.display(),
                out.stdout_trimmed()
            ))
        }
    }

    /// Validating: schema checks then instance checks, across every
    /// operation, with no early exit.
    async fn validate_all(&self, operations: &[Box<dyn Operation>]) -> Vec<String> {
        let mut problems = Vec::new();

        for entry in &self.config.operations {
            if !entry.enabled {
                continue;
            }
            if let Some(descriptor) = self.registry.get(&entry.name) {
                for error in (descriptor.validate_config)(&entry.config) {
                    problems.push(error.to_string());
                }
            }
        }

        for operation in operations {
            for error in operation.validate().await {
                problems.push(error.to_string());
            }
        }
        problems
    }

    /// Run every operation's lifecycle strictly in order.
    ///
    /// Exactly one operation is current at any time; an interrupt or a
    /// critical error aborts the current one (bounded by the configured
    /// abort timeout) and skips the rest.
    async fn execute_operations(
        &self,
        session: &mut Session,
        operations: &mut [Box<dyn Operation>],
        disk_trigger: &CancellationToken,
    ) -> ExecOutcome {
        enum Step {
            Done(Result<(), OperationError>),
            Interrupted,
            DiskBreach,
        }

        let total = operations.len();
        for index in 0..total {
            if self.cancel.is_cancelled() {
                // Interrupt arrived between operations: nothing to abort.
                let _ = session.advance(SessionState::Cleanup);
                self.skip_remaining(session, operations, index);
                session.request_abort();
                return ExecOutcome::Interrupted;
            }

            let name = operations[index].name().to_string();
            self.log(
                LogLevel::Info,
                HostRole::Source,
                &format!("Starting operation '{name}' ({}/{total})", index + 1),
            );

            let step = {
                let operation = &mut operations[index];
                let lifecycle = async {
                    operation.pre_sync().await?;
                    operation.sync().await?;
                    operation.post_sync().await
                };
                tokio::pin!(lifecycle);
                tokio::select! {
                    result = &mut lifecycle => Step::Done(result),
                    () = self.cancel.cancelled() => Step::Interrupted,
                    () = disk_trigger.cancelled() => Step::DiskBreach,
                }
            };

            match step {
                Step::Done(Ok(())) => {
                    session.record_outcome(&name, OperationOutcome::Success);
                    self.log(
                        LogLevel::Info,
                        HostRole::Source,
                        &format!("Operation '{name}' completed"),
                    );
                }
                Step::Done(Err(e)) => {
                    self.log(
                        LogLevel::Critical,
                        HostRole::Source,
                        &format!("Operation '{name}' failed: {e}"),
                    );
                    session.record_outcome(&name, OperationOutcome::Failed);
                    self.enter_cleanup(session, &mut operations[index]).await;
                    self.skip_remaining(session, operations, index + 1);
                    return ExecOutcome::Errored;
                }
                Step::Interrupted => {
                    self.log(
                        LogLevel::Warn,
                        HostRole::Source,
                        &format!("Interrupt received during '{name}'"),
                    );
                    session.request_abort();
                    session.record_outcome(&name, OperationOutcome::Failed);
                    self.enter_cleanup(session, &mut operations[index]).await;
                    self.skip_remaining(session, operations, index + 1);
                    return ExecOutcome::Interrupted;
                }
                Step::DiskBreach => {
                    self.log(
                        LogLevel::Critical,
                        HostRole::Source,
                        &format!("Disk-space floor breached during '{name}'"),
                    );
                    session.record_outcome(&name, OperationOutcome::Failed);
                    self.enter_cleanup(session, &mut operations[index]).await;
                    self.skip_remaining(session, operations, index + 1);
                    return ExecOutcome::Errored;
                }
            }
        }
        ExecOutcome::AllSucceeded
    }

    /// Cleanup: abort the current operation only, bounded by the
    /// configured timeout. Completed operations are left alone.
    async fn enter_cleanup(&self, session: &mut Session, current: &mut Box<dyn Operation>) {
        let _ = session.advance(SessionState::Cleanup);
        let timeout = Duration::from_secs(self.config.session.abort_timeout);
        let name = current.name().to_string();

        match tokio::time::timeout(timeout, current.abort(timeout)).await {
            Ok(Ok(())) => info!(operation = %name, "Operation abort completed"),
            Ok(Err(e)) => {
                warn!(operation = %name, error = %e, "Operation abort reported failure");
            }
            Err(_elapsed) => {
                warn!(
                    operation = %name,
                    timeout_secs = timeout.as_secs(),
                    "Operation abort timed out; abandoning"
                );
            }
        }
    }

    fn skip_remaining(
        &self,
        session: &mut Session,
        operations: &[Box<dyn Operation>],
        from: usize,
    ) {
        for operation in &operations[from..] {
            session.record_outcome(operation.name(), OperationOutcome::Skipped);
        }
    }

    /// A failure during Executing routes through Cleanup (no running
    /// operation to abort) and lands in Failed.
    fn fail_in_executing(&self, mut session: Session, message: &str) -> SessionReport {
        self.log(LogLevel::Critical, HostRole::Source, message);
        let _ = session.advance(SessionState::Cleanup);
        let _ = session.advance(SessionState::Failed);
        self.report(session)
    }

    fn failed_before_validation(&self, session_id: SessionId) -> SessionReport {
        SessionReport {
            session_id,
            state: SessionState::Failed,
            outcomes: Vec::new(),
            has_errors: true,
        }
    }

    fn report(&self, session: Session) -> SessionReport {
        SessionReport {
            session_id: session.id().clone(),
            state: session.state(),
            outcomes: session.outcomes().to_vec(),
            has_errors: session.has_errors(),
        }
    }
}

/// Execution order: the snapshot operation first, the target install
/// second, everything else in configured order.
///
/// Both required operations must be present and enabled; anything else is
/// a configuration contract violation.
pub fn plan_order(enabled: &[String]) -> Result<Vec<String>, String> {
    if !enabled.iter().any(|n| n == snapshots::NAME) {
        return Err(format!(
            "The '{}' operation must be present and enabled",
            snapshots::NAME
        ));
    }
    if !enabled.iter().any(|n| n == install::NAME) {
        return Err(format!(
            "The '{}' operation must be present and enabled",
            install::NAME
        ));
    }
    let mut order = vec![snapshots::NAME.to_string(), install::NAME.to_string()];
    order.extend(
        enabled
            .iter()
            .filter(|n| *n != snapshots::NAME && *n != install::NAME)
            .cloned(),
    );
    Ok(order)
}
