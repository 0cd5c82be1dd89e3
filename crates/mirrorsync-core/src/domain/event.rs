//! Observable events
//!
//! Immutable value objects published on the event bus by the orchestrator
//! and by operation instances. Consumers (log recorder, terminal display)
//! subscribe independently; nothing here knows who is listening.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::SessionId;

/// Severity of a [`LogEvent`].
///
/// Ordered so consumers can apply a threshold with a plain comparison.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    /// True for levels that flip the session's `has_errors` flag
    #[must_use]
    pub fn is_error(self) -> bool {
        self >= LogLevel::Error
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            other => Err(format!("Unknown log level '{other}'")),
        }
    }
}

/// Which side of the replication a log event concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostRole {
    /// The machine the session runs on
    Source,
    /// The machine being replicated onto
    Target,
}

impl std::fmt::Display for HostRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostRole::Source => write!(f, "source"),
            HostRole::Target => write!(f, "target"),
        }
    }
}

/// A structured log message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// When the event was produced
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub level: LogLevel,
    /// Name of the operation that produced it (or "session")
    pub operation: String,
    /// Which machine the message concerns
    pub host: HostRole,
    /// Human-readable message
    pub message: String,
    /// Free-form key/value context
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl LogEvent {
    /// Create a LogEvent timestamped now, with empty context
    pub fn new(
        level: LogLevel,
        operation: impl Into<String>,
        host: HostRole,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            operation: operation.into(),
            host,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    /// Attach a context key/value pair
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// A progress update from a running operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// When the event was produced
    pub timestamp: DateTime<Utc>,
    /// Name of the operation reporting progress
    pub operation: String,
    /// Fractional completion, clamped to 0.0..=1.0
    pub fraction: f64,
    /// What is being worked on right now
    pub current_item: String,
    /// Estimated seconds remaining, when the operation can tell
    pub eta_seconds: Option<u64>,
}

impl ProgressEvent {
    /// Create a ProgressEvent timestamped now.
    ///
    /// `fraction` is clamped into `0.0..=1.0`; operations never have to
    /// worry about off-by-rounding values upsetting consumers.
    pub fn new(operation: impl Into<String>, fraction: f64, current_item: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation: operation.into(),
            fraction: fraction.clamp(0.0, 1.0),
            current_item: current_item.into(),
            eta_seconds: None,
        }
    }

    /// Attach an ETA estimate
    #[must_use]
    pub fn with_eta(mut self, seconds: u64) -> Self {
        self.eta_seconds = Some(seconds);
        self
    }
}

/// Connection health as observed by the keepalive monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ConnectionStatus {
    /// The channel is up; latency of the last keepalive round-trip
    Connected {
        /// Round-trip latency in milliseconds
        latency_ms: u64,
    },
    /// The keepalive threshold was exceeded
    Lost,
    /// A reconnect attempt is in flight
    Reconnecting {
        /// 1-based attempt counter
        attempt: u32,
    },
}

/// A change in connection health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    /// When the event was produced
    pub timestamp: DateTime<Utc>,
    /// New connection status
    pub status: ConnectionStatus,
}

impl ConnectionEvent {
    /// Create a ConnectionEvent timestamped now
    #[must_use]
    pub fn new(status: ConnectionStatus) -> Self {
        Self {
            timestamp: Utc::now(),
            status,
        }
    }
}

/// Any event that can travel over the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Event {
    /// A structured log message
    Log(LogEvent),
    /// A progress update
    Progress(ProgressEvent),
    /// A connection health change
    Connection(ConnectionEvent),
}

impl Event {
    /// The session-wide record form: a self-describing JSON object.
    ///
    /// Used by the persisting consumer; one record per line.
    pub fn to_record(&self, session_id: &SessionId) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(map) = value.as_object_mut() {
            map.insert(
                "session_id".to_string(),
                serde_json::Value::String(session_id.to_string()),
            );
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Critical);
    }

    #[test]
    fn test_level_is_error() {
        assert!(!LogLevel::Warn.is_error());
        assert!(LogLevel::Error.is_error());
        assert!(LogLevel::Critical.is_error());
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_progress_fraction_clamped() {
        let p = ProgressEvent::new("packages", 1.3, "deduplicating");
        assert!((p.fraction - 1.0).abs() < f64::EPSILON);
        let p = ProgressEvent::new("packages", -0.1, "starting");
        assert!((p.fraction - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_log_event_context() {
        let e = LogEvent::new(LogLevel::Info, "snapshots", HostRole::Target, "created")
            .with_context("subvolume", "@home");
        assert_eq!(e.context.get("subvolume").unwrap(), "@home");
    }

    #[test]
    fn test_record_carries_session_id() {
        let id: SessionId = "0011aabb".parse().unwrap();
        let event = Event::Log(LogEvent::new(
            LogLevel::Info,
            "session",
            HostRole::Source,
            "starting",
        ));
        let record = event.to_record(&id);
        assert_eq!(record["session_id"], "0011aabb");
        assert_eq!(record["kind"], "log");
        assert_eq!(record["level"], "info");
    }

    #[test]
    fn test_connection_event_serializes_status() {
        let event = ConnectionEvent::new(ConnectionStatus::Connected { latency_ms: 12 });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"]["status"], "connected");
        assert_eq!(json["status"]["latency_ms"], 12);
    }
}
