//! Error taxonomy
//!
//! Every failure class the orchestrator reacts to has its own type here.
//! The split follows the two-tier signaling convention: recoverable
//! conditions are logged by the operation that hit them and never surface
//! as a Rust error; everything in this module is fatal to some scope
//! (a config check, the session, the connection) and is handled
//! deterministically by the orchestrator.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while validating domain values at construction time
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid identifier format
    #[error("Invalid id: {0}")]
    InvalidId(String),

    /// Invalid hostname (empty or contains whitespace)
    #[error("Invalid hostname: '{0}'")]
    InvalidHostname(String),

    /// Invalid subvolume name (empty component or traversal)
    #[error("Invalid subvolume name: '{0}'")]
    InvalidSubvolume(String),

    /// Version string is not a dotted numeric triple
    #[error("Invalid version string: '{0}'")]
    InvalidVersion(String),

    /// Invalid session state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// Malformed snapshot directory or entry name
    #[error("Unparseable snapshot name: '{0}'")]
    InvalidSnapshotName(String),
}

/// A schema-level problem in one operation's configuration block.
///
/// Detected by [`OperationDescriptor::validate_config`]
/// (crate::operation::OperationDescriptor) before any I/O happens;
/// always fatal to session start.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{operation}: {message}")]
pub struct ConfigError {
    /// Name of the operation whose config block is invalid
    pub operation: String,
    /// What is wrong with it
    pub message: String,
}

impl ConfigError {
    /// Create a ConfigError for the named operation
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// A problem detected during the read-only validation phase.
///
/// Collected across all operations before the session decides anything,
/// so a user sees every problem in one pass.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{operation}: {message}")]
pub struct ValidationError {
    /// Name of the operation that reported the problem
    pub operation: String,
    /// What is wrong
    pub message: String,
}

impl ValidationError {
    /// Create a ValidationError for the named operation
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Failure of the persistent connection to the target
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Initial connection establishment failed
    #[error("Failed to connect to {host}: {reason}")]
    ConnectFailed {
        /// Target hostname
        host: String,
        /// Underlying reason
        reason: String,
    },

    /// The keepalive monitor declared the connection lost
    #[error("Connection to target lost")]
    Lost,

    /// Reconnect attempts were exhausted
    #[error("Reconnect failed after {attempts} attempts")]
    ReconnectExhausted {
        /// How many attempts were made
        attempts: u32,
    },

    /// The connection is shut down and accepts no further commands
    #[error("Connection closed")]
    Closed,
}

/// Failure to acquire or hold one of the two session locks
#[derive(Debug, Error)]
pub enum LockError {
    /// Another session already holds the source lock
    #[error("Source lock at {path} is held by another session")]
    SourceBusy {
        /// Lock file path
        path: String,
    },

    /// Another session already holds the target lock
    #[error("Target lock at {path} is held by another session")]
    TargetBusy {
        /// Remote lock file path
        path: String,
    },

    /// The remote lock holder did not confirm acquisition in time
    #[error("Target lock handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Filesystem-level failure manipulating the lock file
    #[error("Lock I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure executing a command through an executor
#[derive(Debug, Error)]
pub enum ExecError {
    /// The command did not finish within its per-invocation timeout
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// The process could not be spawned
    #[error("Failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    /// Reading the process's output failed
    #[error("Failed to read command output: {0}")]
    Output(#[source] std::io::Error),

    /// The underlying connection is unusable
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// A critical failure inside an operation's lifecycle.
///
/// Operations classify their own failures: recoverable conditions are
/// logged through the event bus and the method returns `Ok`; only
/// conditions that must abort the whole session become an
/// `OperationError`. The orchestrator never reclassifies.
#[derive(Debug, Error)]
pub enum OperationError {
    /// The operation cannot continue and the session must abort
    #[error("{0}")]
    Critical(String),

    /// A command the operation depends on failed
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// The operation observed session cancellation and stopped
    #[error("Operation stopped by session cancellation")]
    Cancelled,
}

impl OperationError {
    /// Shorthand for a critical failure with a formatted message
    pub fn critical(message: impl Into<String>) -> Self {
        Self::Critical(message.into())
    }
}
