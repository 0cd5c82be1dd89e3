//! Persistent SSH connection
//!
//! One authenticated OpenSSH control-master per session, multiplexed into
//! bounded concurrent command sessions. Health is watched by a periodic
//! keepalive probe; loss is surfaced as a [`ConnectionEvent`] and repaired
//! by bounded reconnect attempts before the next remote command runs.
//! Reconnect exhaustion is fatal to the session.
//!
//! No daemon runs on the target: the authenticated command channel is the
//! entire protocol.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mirrorsync_core::config::{ConnectionConfig, TargetConfig};
use mirrorsync_core::domain::errors::ConnectionError;
use mirrorsync_core::domain::event::{ConnectionEvent, ConnectionStatus, Event};
use mirrorsync_core::ports::event_bus::IEventPublisher;

use crate::process::{run_captured, ProcessSet};

/// How often the master socket is polled while establishing
const ESTABLISH_POLL: Duration = Duration::from_millis(250);

/// Build the argv that starts the control master
fn master_args(control_path: &std::path::Path, target: &TargetConfig) -> Vec<String> {
    let mut args = vec![
        "ssh".to_string(),
        "-M".to_string(),
        "-N".to_string(),
        "-S".to_string(),
        control_path.display().to_string(),
        "-p".to_string(),
        target.port.to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
    ];
    for opt in &target.ssh_options {
        args.push("-o".to_string());
        args.push(opt.clone());
    }
    args.push(format!("{}@{}", target.user, target.host));
    args
}

/// Build the argv prefix for one command session over the master
fn exec_args_prefix(control_path: &std::path::Path, target: &TargetConfig) -> Vec<String> {
    let mut args = vec![
        "ssh".to_string(),
        "-S".to_string(),
        control_path.display().to_string(),
        "-p".to_string(),
        target.port.to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
    ];
    for opt in &target.ssh_options {
        args.push("-o".to_string());
        args.push(opt.clone());
    }
    args.push(format!("{}@{}", target.user, target.host));
    args
}

/// Quote one word for the remote shell
fn shell_quote(word: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "-_./=@:,+".contains(c);
    if !word.is_empty() && word.chars().all(safe) {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Join an argv into a single remote shell command line
pub(crate) fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|w| shell_quote(w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// The session's persistent channel to the target machine
pub struct Connection {
    target: TargetConfig,
    settings: ConnectionConfig,
    control_path: PathBuf,
    master: Mutex<Option<tokio::process::Child>>,
    alive: AtomicBool,
    closed: AtomicBool,
    sessions: Arc<Semaphore>,
    events: Arc<dyn IEventPublisher>,
    probes: ProcessSet,
    reconnect_guard: Mutex<()>,
}

impl Connection {
    /// Establish the control master and confirm the channel works.
    ///
    /// Fails within `settings.connect_timeout` if the target is
    /// unreachable or authentication is refused.
    pub async fn establish(
        target: TargetConfig,
        settings: ConnectionConfig,
        events: Arc<dyn IEventPublisher>,
    ) -> Result<Arc<Self>, ConnectionError> {
        let control_dir = dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("mirrorsync");
        std::fs::create_dir_all(&control_dir).map_err(|e| ConnectionError::ConnectFailed {
            host: target.host.clone(),
            reason: e.to_string(),
        })?;
        let control_path = control_dir.join(format!(
            "cm-{}.sock",
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        ));

        let conn = Arc::new(Self {
            sessions: Arc::new(Semaphore::new(settings.max_sessions)),
            target,
            settings,
            control_path,
            master: Mutex::new(None),
            alive: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
            probes: ProcessSet::new(),
            reconnect_guard: Mutex::new(()),
        });
        conn.start_master().await?;
        info!(host = %conn.target.host, "Connection established");
        Ok(conn)
    }

    /// `user@host` form used in messages
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.target.user, self.target.host)
    }

    /// Default per-command timeout from the configuration
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.command_timeout)
    }

    /// Permit pool bounding concurrent command sessions
    #[must_use]
    pub fn session_limiter(&self) -> Arc<Semaphore> {
        Arc::clone(&self.sessions)
    }

    /// Argv prefix for one remote command session
    #[must_use]
    pub(crate) fn exec_prefix(&self) -> Vec<String> {
        exec_args_prefix(&self.control_path, &self.target)
    }

    /// Argv for a file transfer (`scp` sharing the master socket)
    #[must_use]
    pub(crate) fn scp_args(&self, from: String, to: String) -> Vec<String> {
        let mut args = vec![
            "scp".to_string(),
            "-q".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-P".to_string(),
            self.target.port.to_string(),
        ];
        for opt in &self.target.ssh_options {
            args.push("-o".to_string());
            args.push(opt.clone());
        }
        args.push(from);
        args.push(to);
        args
    }

    /// Spawn the master process and wait until the socket answers
    async fn start_master(&self) -> Result<(), ConnectionError> {
        let argv = master_args(&self.control_path, &self.target);
        debug!(control = %self.control_path.display(), "Starting control master");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let child = cmd.spawn().map_err(|e| ConnectionError::ConnectFailed {
            host: self.target.host.clone(),
            reason: e.to_string(),
        })?;
        {
            let mut master = self.master.lock().await;
            if let Some(mut old) = master.replace(child) {
                let _ = old.start_kill();
            }
        }

        let deadline = Instant::now() + Duration::from_secs(self.settings.connect_timeout);
        loop {
            if self.probe().await.is_some() {
                self.alive.store(true, Ordering::Release);
                return Ok(());
            }
            // A dead master never comes back; report its stderr early.
            {
                let mut master = self.master.lock().await;
                if let Some(child) = master.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        master.take();
                        return Err(ConnectionError::ConnectFailed {
                            host: self.target.host.clone(),
                            reason: format!("ssh master exited with {status}"),
                        });
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(ConnectionError::ConnectFailed {
                    host: self.target.host.clone(),
                    reason: format!(
                        "no response within {}s",
                        self.settings.connect_timeout
                    ),
                });
            }
            tokio::time::sleep(ESTABLISH_POLL).await;
        }
    }

    /// One keepalive round-trip through the channel; latency on success
    async fn probe(&self) -> Option<u64> {
        let mut argv = self.exec_prefix();
        argv.push("true".to_string());
        let started = Instant::now();
        let timeout = Duration::from_secs(self.settings.keepalive_interval.max(1));
        match run_captured(&self.probes, &argv, timeout).await {
            Ok(out) if out.success() => Some(started.elapsed().as_millis() as u64),
            _ => None,
        }
    }

    /// True while the channel is believed healthy
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    /// Run the keepalive monitor until cancelled.
    ///
    /// Publishes `Connected{latency}` on every successful probe and
    /// `Lost` after the configured number of consecutive misses.
    pub fn spawn_keepalive(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(conn.settings.keepalive_interval.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut missed: u32 = 0;

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    () = cancel.cancelled() => break,
                }
                if conn.closed.load(Ordering::Acquire) {
                    break;
                }
                match conn.probe().await {
                    Some(latency_ms) => {
                        missed = 0;
                        conn.alive.store(true, Ordering::Release);
                        conn.events.publish(Event::Connection(ConnectionEvent::new(
                            ConnectionStatus::Connected { latency_ms },
                        )));
                    }
                    None => {
                        missed += 1;
                        warn!(missed, "Keepalive probe failed");
                        if missed >= conn.settings.keepalive_max_missed {
                            conn.alive.store(false, Ordering::Release);
                            conn.events.publish(Event::Connection(ConnectionEvent::new(
                                ConnectionStatus::Lost,
                            )));
                        }
                    }
                }
            }
        })
    }

    /// Make sure the channel is usable, reconnecting if it was lost.
    ///
    /// Called before every remote command. Bounded by
    /// `settings.reconnect_attempts`; exhaustion is fatal.
    pub async fn ensure_alive(&self) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }
        if self.alive.load(Ordering::Acquire) {
            return Ok(());
        }

        // One reconnect at a time; latecomers see the outcome.
        let _guard = self.reconnect_guard.lock().await;
        if self.alive.load(Ordering::Acquire) {
            return Ok(());
        }

        for attempt in 1..=self.settings.reconnect_attempts {
            self.events.publish(Event::Connection(ConnectionEvent::new(
                ConnectionStatus::Reconnecting { attempt },
            )));
            info!(attempt, "Reconnecting to target");
            match self.start_master().await {
                Ok(()) => {
                    self.events.publish(Event::Connection(ConnectionEvent::new(
                        ConnectionStatus::Connected { latency_ms: 0 },
                    )));
                    return Ok(());
                }
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }
        Err(ConnectionError::ReconnectExhausted {
            attempts: self.settings.reconnect_attempts,
        })
    }

    /// Tear the channel down. Remote processes tied to it (including the
    /// target lock holder) die with it.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.alive.store(false, Ordering::Release);
        self.probes.terminate_all();

        let mut exit_argv = self.exec_prefix();
        // -O exit tells the master to tear down all sessions and quit.
        exit_argv.insert(1, "-O".to_string());
        exit_argv.insert(2, "exit".to_string());
        let _ = run_captured(&ProcessSet::new(), &exit_argv, Duration::from_secs(5)).await;

        let mut master = self.master.lock().await;
        if let Some(mut child) = master.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        let _ = std::fs::remove_file(&self.control_path);
        info!("Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn target() -> TargetConfig {
        TargetConfig {
            host: "backup.lan".to_string(),
            user: "root".to_string(),
            port: 2222,
            ssh_options: vec!["StrictHostKeyChecking=accept-new".to_string()],
        }
    }

    #[test]
    fn test_master_args_shape() {
        let args = master_args(Path::new("/run/ms/cm.sock"), &target());
        assert_eq!(args[0], "ssh");
        assert!(args.contains(&"-M".to_string()));
        assert!(args.contains(&"-N".to_string()));
        assert!(args.contains(&"/run/ms/cm.sock".to_string()));
        assert!(args.contains(&"2222".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=accept-new".to_string()));
        assert_eq!(args.last().unwrap(), "root@backup.lan");
    }

    #[test]
    fn test_exec_prefix_has_no_master_flags() {
        let args = exec_args_prefix(Path::new("/run/ms/cm.sock"), &target());
        assert!(!args.contains(&"-M".to_string()));
        assert!(!args.contains(&"-N".to_string()));
        assert_eq!(args.last().unwrap(), "root@backup.lan");
    }

    #[test]
    fn test_shell_quote_passes_safe_words() {
        assert_eq!(shell_quote("btrfs"), "btrfs");
        assert_eq!(shell_quote("/path/to-file_1.img"), "/path/to-file_1.img");
    }

    #[test]
    fn test_shell_quote_wraps_unsafe_words() {
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_shell_join() {
        let argv = vec![
            "btrfs".to_string(),
            "subvolume".to_string(),
            "list".to_string(),
            "/mnt/my data".to_string(),
        ];
        assert_eq!(shell_join(&argv), "btrfs subvolume list '/mnt/my data'");
    }
}
