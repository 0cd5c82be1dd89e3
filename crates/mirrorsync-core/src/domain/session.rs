//! Replication session entity
//!
//! A [`Session`] is the unit of one sync run: its identity, its position
//! in the state machine, and the per-operation outcomes. The orchestrator
//! is the only writer, with one deliberate exception: the event bus's
//! error-tracking consumer flips the shared [`ErrorFlag`] when an
//! ERROR/CRITICAL-level event passes through, independent of operation
//! outcomes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{Hostname, SessionId};

/// States of the session state machine.
///
/// `Completed`, `Aborted`, and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connection and operations are being brought up
    Initializing,
    /// Read-only validation across all operations
    Validating,
    /// Locks held, snapshots taken, operations running
    Executing,
    /// Best-effort abort of the current operation after error or interrupt
    Cleanup,
    /// Every operation succeeded
    Completed,
    /// User-initiated interrupt ended the session
    Aborted,
    /// An error ended the session; rollback is available
    Failed,
}

impl SessionState {
    /// Returns true for terminal states
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Aborted | SessionState::Failed
        )
    }

    /// Returns true if the transition `self → to` is allowed
    #[must_use]
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Initializing, Validating)
                | (Initializing, Failed)
                | (Validating, Executing)
                | (Validating, Failed)
                | (Executing, Cleanup)
                | (Executing, Completed)
                | (Cleanup, Failed)
                | (Cleanup, Aborted)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Initializing => "initializing",
            SessionState::Validating => "validating",
            SessionState::Executing => "executing",
            SessionState::Cleanup => "cleanup",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
            SessionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Outcome of a single operation within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    /// The full lifecycle ran without a critical error
    Success,
    /// The operation was never started (earlier failure or interrupt)
    Skipped,
    /// The operation returned a critical error
    Failed,
}

/// Shared boolean set by the event bus's error tracker.
///
/// Cloneable handle; the session and the tracking consumer see the same
/// underlying flag.
#[derive(Debug, Clone, Default)]
pub struct ErrorFlag(Arc<AtomicBool>);

impl ErrorFlag {
    /// Create an unset flag
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag (sticky; never cleared for the session's lifetime)
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Read the flag
    #[must_use]
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One end-to-end replication run
#[derive(Debug)]
pub struct Session {
    /// Short random token identifying this run
    id: SessionId,
    /// When the session was created
    created_at: DateTime<Utc>,
    /// Machine the session runs on
    source_host: Hostname,
    /// Machine being replicated onto
    target_host: Hostname,
    /// Current state-machine position
    state: SessionState,
    /// Enabled operations in execution order
    operation_order: Vec<String>,
    /// Per-operation outcome, filled in as operations finish
    outcomes: Vec<(String, OperationOutcome)>,
    /// Set by the error-tracking event consumer
    error_flag: ErrorFlag,
    /// Set by the orchestrator when an interrupt was received
    abort_requested: bool,
    /// Where the source lock file lives (once acquired)
    lock_path: Option<PathBuf>,
}

impl Session {
    /// Create a new session in `Initializing`
    pub fn new(
        source_host: Hostname,
        target_host: Hostname,
        operation_order: Vec<String>,
        error_flag: ErrorFlag,
    ) -> Self {
        Self::with_id(
            SessionId::new(),
            source_host,
            target_host,
            operation_order,
            error_flag,
        )
    }

    /// Create a session under a pre-allocated id (the orchestrator hands
    /// the id to execution contexts before the session object exists)
    pub fn with_id(
        id: SessionId,
        source_host: Hostname,
        target_host: Hostname,
        operation_order: Vec<String>,
        error_flag: ErrorFlag,
    ) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            source_host,
            target_host,
            state: SessionState::Initializing,
            operation_order,
            outcomes: Vec::new(),
            error_flag,
            abort_requested: false,
            lock_path: None,
        }
    }

    // --- Getters ---

    /// The session's unique id
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// When the session was created
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Source hostname
    pub fn source_host(&self) -> &Hostname {
        &self.source_host
    }

    /// Target hostname
    pub fn target_host(&self) -> &Hostname {
        &self.target_host
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Enabled operations in execution order
    pub fn operation_order(&self) -> &[String] {
        &self.operation_order
    }

    /// Recorded per-operation outcomes
    pub fn outcomes(&self) -> &[(String, OperationOutcome)] {
        &self.outcomes
    }

    /// True once any ERROR/CRITICAL event was seen on the bus
    pub fn has_errors(&self) -> bool {
        self.error_flag.get()
    }

    /// True once an interrupt was received
    pub fn abort_requested(&self) -> bool {
        self.abort_requested
    }

    /// Source lock file path, once the lock is held
    pub fn lock_path(&self) -> Option<&PathBuf> {
        self.lock_path.as_ref()
    }

    // --- Orchestrator-driven mutation ---

    /// Advance the state machine, rejecting transitions the machine does
    /// not define
    pub fn advance(&mut self, to: SessionState) -> Result<(), DomainError> {
        if !self.state.can_transition_to(to) {
            return Err(DomainError::InvalidState {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Record the outcome of one operation
    pub fn record_outcome(&mut self, operation: impl Into<String>, outcome: OperationOutcome) {
        self.outcomes.push((operation.into(), outcome));
    }

    /// Mark that the user requested an abort
    pub fn request_abort(&mut self) {
        self.abort_requested = true;
    }

    /// Remember where the source lock lives
    pub fn set_lock_path(&mut self, path: PathBuf) {
        self.lock_path = Some(path);
    }

    /// True when every recorded outcome is `Success` and all enabled
    /// operations have one
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.len() == self.operation_order.len()
            && self
                .outcomes
                .iter()
                .all(|(_, o)| *o == OperationOutcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> Session {
        Session::new(
            Hostname::new("src.lan").unwrap(),
            Hostname::new("dst.lan").unwrap(),
            vec!["snapshots".to_string(), "target-install".to_string()],
            ErrorFlag::new(),
        )
    }

    mod state_machine_tests {
        use super::*;

        #[test]
        fn test_happy_path() {
            let mut s = test_session();
            s.advance(SessionState::Validating).unwrap();
            s.advance(SessionState::Executing).unwrap();
            s.advance(SessionState::Completed).unwrap();
            assert!(s.state().is_terminal());
        }

        #[test]
        fn test_error_path() {
            let mut s = test_session();
            s.advance(SessionState::Validating).unwrap();
            s.advance(SessionState::Executing).unwrap();
            s.advance(SessionState::Cleanup).unwrap();
            s.advance(SessionState::Failed).unwrap();
            assert_eq!(s.state(), SessionState::Failed);
        }

        #[test]
        fn test_interrupt_path() {
            let mut s = test_session();
            s.advance(SessionState::Validating).unwrap();
            s.advance(SessionState::Executing).unwrap();
            s.advance(SessionState::Cleanup).unwrap();
            s.advance(SessionState::Aborted).unwrap();
            assert_eq!(s.state(), SessionState::Aborted);
        }

        #[test]
        fn test_rejects_skipping_validation() {
            let mut s = test_session();
            let err = s.advance(SessionState::Executing).unwrap_err();
            assert!(matches!(err, DomainError::InvalidState { .. }));
        }

        #[test]
        fn test_rejects_leaving_terminal_state() {
            let mut s = test_session();
            s.advance(SessionState::Failed).unwrap();
            assert!(s.advance(SessionState::Validating).is_err());
        }

        #[test]
        fn test_terminal_states() {
            assert!(SessionState::Completed.is_terminal());
            assert!(SessionState::Aborted.is_terminal());
            assert!(SessionState::Failed.is_terminal());
            assert!(!SessionState::Executing.is_terminal());
            assert!(!SessionState::Cleanup.is_terminal());
        }
    }

    mod outcome_tests {
        use super::*;

        #[test]
        fn test_all_succeeded_requires_every_operation() {
            let mut s = test_session();
            s.record_outcome("snapshots", OperationOutcome::Success);
            assert!(!s.all_succeeded());
            s.record_outcome("target-install", OperationOutcome::Success);
            assert!(s.all_succeeded());
        }

        #[test]
        fn test_all_succeeded_false_on_failure() {
            let mut s = test_session();
            s.record_outcome("snapshots", OperationOutcome::Success);
            s.record_outcome("target-install", OperationOutcome::Failed);
            assert!(!s.all_succeeded());
        }

        #[test]
        fn test_skipped_is_not_success() {
            let mut s = test_session();
            s.record_outcome("snapshots", OperationOutcome::Success);
            s.record_outcome("target-install", OperationOutcome::Skipped);
            assert!(!s.all_succeeded());
        }
    }

    mod error_flag_tests {
        use super::*;

        #[test]
        fn test_flag_shared_between_clones() {
            let flag = ErrorFlag::new();
            let session = Session::new(
                Hostname::new("a").unwrap(),
                Hostname::new("b").unwrap(),
                vec![],
                flag.clone(),
            );
            assert!(!session.has_errors());
            flag.set();
            assert!(session.has_errors());
        }
    }

    #[test]
    fn test_abort_request() {
        let mut s = test_session();
        assert!(!s.abort_requested());
        s.request_abort();
        assert!(s.abort_requested());
    }
}
