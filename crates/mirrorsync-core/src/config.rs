//! Configuration module for MirrorSync.
//!
//! Typed configuration structs that map to the YAML configuration file,
//! with loading, defaults, and the ordered operation table. The structs
//! here are the *already-parsed* form the engine consumes; schema-level
//! validation of per-operation blocks belongs to each operation's
//! descriptor.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::event::LogLevel;

/// Top-level configuration for MirrorSync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub target: TargetConfig,
    pub connection: ConnectionConfig,
    pub locks: LockConfig,
    pub disk: DiskConfig,
    pub session: SessionConfig,
    /// Ordered operation table; order here is execution order.
    pub operations: Vec<OperationEntry>,
}

/// Logging settings: two independent thresholds over the same event
/// stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Threshold for the persisted JSONL record file.
    pub file_level: LogLevel,
    /// Threshold for live display output.
    pub display_level: LogLevel,
    /// Where session record files are written.
    pub directory: PathBuf,
}

/// Remote machine and SSH settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Hostname or address of the machine being replicated onto.
    pub host: String,
    /// SSH user (replication requires root on the target).
    pub user: String,
    /// SSH port.
    pub port: u16,
    /// Extra `-o` options passed to every ssh invocation.
    pub ssh_options: Vec<String>,
}

/// Connection supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Maximum concurrent command sessions multiplexed over the channel.
    pub max_sessions: usize,
    /// Seconds between keepalive probes.
    pub keepalive_interval: u64,
    /// Missed probes before the connection is declared lost.
    pub keepalive_max_missed: u32,
    /// Seconds allowed for initial connection establishment.
    pub connect_timeout: u64,
    /// Bounded reconnect attempts before giving up.
    pub reconnect_attempts: u32,
    /// Default per-command timeout in seconds.
    pub command_timeout: u64,
}

/// Lock locations and acquisition bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Source lock file. `None` means the per-user runtime directory.
    pub source_path: Option<PathBuf>,
    /// Well-known lock file path on the target.
    pub target_path: PathBuf,
    /// Bounded wait for either lock before failing, in seconds.
    pub acquire_wait: u64,
}

/// Disk-space monitor thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Path on the target whose filesystem is monitored.
    pub watch_path: PathBuf,
    /// Free bytes required before any modification starts.
    pub preflight_min_free_bytes: u64,
    /// Free bytes below which an in-progress session must abort.
    pub runtime_min_free_bytes: u64,
    /// Seconds between runtime checks.
    pub check_interval: u64,
}

/// Session-wide behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds granted to the current operation's `abort` hook.
    pub abort_timeout: u64,
}

/// One row of the ordered operation table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationEntry {
    /// Registered operation name.
    pub name: String,
    /// Disabled operations are skipped entirely (required ones cannot be).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Operation-specific configuration block, validated by the
    /// operation's own descriptor.
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file_level: LogLevel::Debug,
            display_level: LogLevel::Info,
            directory: dirs::state_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib"))
                .join("mirrorsync")
                .join("logs"),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: "root".to_string(),
            port: 22,
            ssh_options: Vec::new(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            keepalive_interval: 15,
            keepalive_max_missed: 3,
            connect_timeout: 30,
            reconnect_attempts: 3,
            command_timeout: 120,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            source_path: None,
            target_path: PathBuf::from("/run/mirrorsync.lock"),
            acquire_wait: 10,
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            watch_path: PathBuf::from("/"),
            preflight_min_free_bytes: 5 * 1024 * 1024 * 1024,
            runtime_min_free_bytes: 1024 * 1024 * 1024,
            check_interval: 30,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            abort_timeout: 30,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/mirrorsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("mirrorsync")
            .join("config.yaml")
    }

    /// Resolved source lock file path.
    pub fn source_lock_path(&self) -> PathBuf {
        self.locks.source_path.clone().unwrap_or_else(|| {
            dirs::runtime_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("mirrorsync")
                .join("mirrorsync.lock")
        })
    }

    /// The entry for a named operation, if present in the table.
    pub fn operation_entry(&self, name: &str) -> Option<&OperationEntry> {
        self.operations.iter().find(|e| e.name == name)
    }

    /// Names of enabled operations, in configured order.
    pub fn enabled_operation_names(&self) -> Vec<String> {
        self.operations
            .iter()
            .filter(|e| e.enabled)
            .map(|e| e.name.clone())
            .collect()
    }
}
