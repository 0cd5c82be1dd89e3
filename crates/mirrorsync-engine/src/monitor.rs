//! Disk-space monitor
//!
//! Guards the target against running out of space mid-replication. The
//! pure threshold comparison ([`CapacityCheck`]) is separated from the
//! `df`-based probe ([`DfProbe`]) so the policy is unit-testable without
//! any host command involved.
//!
//! Two checks: a one-shot **preflight** before snapshots (failure aborts
//! before any modification) and a recurring **runtime** check during
//! execution (a breach below the lower threshold trips the monitor's
//! trigger token, aborting the in-progress operation).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mirrorsync_core::domain::errors::ExecError;
use mirrorsync_core::domain::event::{HostRole, LogLevel};
use mirrorsync_core::ports::event_bus::IEventPublisher;
use mirrorsync_core::ports::executor::ICommandExecutor;

/// Name the monitor logs under
const MONITOR_NAME: &str = "disk-monitor";

/// Timeout for one df invocation
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Pure free-space policy
#[derive(Debug, Clone, Copy)]
pub struct CapacityCheck {
    /// Free bytes required before any modification starts
    pub preflight_min_free: u64,
    /// Free bytes below which a running session must abort
    pub runtime_min_free: u64,
}

impl CapacityCheck {
    /// True when there is enough space to start a session
    #[must_use]
    pub fn preflight_ok(&self, free_bytes: u64) -> bool {
        free_bytes >= self.preflight_min_free
    }

    /// True when a running session may continue
    #[must_use]
    pub fn runtime_ok(&self, free_bytes: u64) -> bool {
        free_bytes >= self.runtime_min_free
    }
}

/// Parse the output of `df -B1 --output=avail <path>`
#[must_use]
pub fn parse_df_avail(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .last()
        .and_then(|line| line.trim().parse::<u64>().ok())
}

/// Thin collaborator that asks the target how much space is free
pub struct DfProbe {
    exec: Arc<dyn ICommandExecutor>,
    path: PathBuf,
}

impl DfProbe {
    /// Probe `path` on whatever machine `exec` drives
    pub fn new(exec: Arc<dyn ICommandExecutor>, path: PathBuf) -> Self {
        Self { exec, path }
    }

    /// Free bytes on the watched filesystem
    pub async fn free_bytes(&self) -> Result<u64, ExecError> {
        let argv = vec![
            "df".to_string(),
            "-B1".to_string(),
            "--output=avail".to_string(),
            self.path.display().to_string(),
        ];
        let out = self.exec.run(&argv, PROBE_TIMEOUT).await?;
        if !out.success() {
            return Err(ExecError::Output(std::io::Error::other(format!(
                "df failed: {}",
                out.stderr.trim()
            ))));
        }
        parse_df_avail(&out.stdout).ok_or_else(|| {
            ExecError::Output(std::io::Error::other(format!(
                "unparseable df output: {:?}",
                out.stdout
            )))
        })
    }
}

/// Recurring runtime check, run as a background task.
///
/// On a breach the monitor logs at CRITICAL and cancels `trigger`; the
/// orchestrator treats a tripped trigger as a critical failure of the
/// current operation. A failed probe is logged at WARN and skipped — a
/// flaky `df` must not kill a healthy session.
pub struct DiskMonitor {
    probe: DfProbe,
    check: CapacityCheck,
    interval: Duration,
    events: Arc<dyn IEventPublisher>,
}

impl DiskMonitor {
    /// Create a runtime monitor
    pub fn new(
        probe: DfProbe,
        check: CapacityCheck,
        interval: Duration,
        events: Arc<dyn IEventPublisher>,
    ) -> Self {
        Self {
            probe,
            check,
            interval,
            events,
        }
    }

    /// Run the monitor until `cancel` fires or a breach trips `trigger`
    pub fn spawn(self, cancel: CancellationToken, trigger: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.interval.max(Duration::from_millis(10));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick would duplicate the preflight check.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = cancel.cancelled() => break,
                }
                match self.probe.free_bytes().await {
                    Ok(free) => {
                        debug!(free_bytes = free, "Runtime disk check");
                        if !self.check.runtime_ok(free) {
                            self.events.log(
                                LogLevel::Critical,
                                MONITOR_NAME,
                                HostRole::Target,
                                &format!(
                                    "Free space {free} bytes fell below runtime minimum {}",
                                    self.check.runtime_min_free
                                ),
                            );
                            trigger.cancel();
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Disk probe failed, skipping check");
                        self.events.log(
                            LogLevel::Warn,
                            MONITOR_NAME,
                            HostRole::Target,
                            &format!("Disk probe failed: {e}"),
                        );
                    }
                }
            }
        })
    }
}
