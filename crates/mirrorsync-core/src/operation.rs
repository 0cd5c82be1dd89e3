//! The operation contract
//!
//! Every pluggable sync operation implements [`Operation`]; the
//! orchestrator drives the lifecycle `validate → pre_sync → sync →
//! post_sync`, strictly one operation at a time, and calls
//! [`abort`](Operation::abort) on the currently-running operation when the
//! session is torn down.
//!
//! Operation types are registered in an explicit [`OperationRegistry`]
//! built at startup from a closed list; there is no runtime discovery.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::errors::{ConfigError, OperationError, ValidationError};
use crate::domain::newtypes::{Hostname, SessionId};
use crate::ports::event_bus::IEventPublisher;
use crate::ports::executor::{ICommandExecutor, IRemoteExecutor};

/// Everything an operation instance receives at construction.
///
/// Shared read-only by all operation instances within a session; owned by
/// the orchestrator.
pub struct ExecutionContext {
    /// Id of the owning session
    pub session_id: SessionId,
    /// Machine the session runs on
    pub source_host: Hostname,
    /// Machine being replicated onto
    pub target_host: Hostname,
    /// This operation's validated configuration block
    pub config: serde_json::Value,
    /// Command execution on the source machine
    pub local: Arc<dyn ICommandExecutor>,
    /// Command execution and file transfer on the target machine
    pub remote: Arc<dyn IRemoteExecutor>,
    /// Event publication handle
    pub events: Arc<dyn IEventPublisher>,
    /// Cooperative cancellation signal; long-running work checks this
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    /// Derive a context for another operation, swapping in its config block
    #[must_use]
    pub fn for_operation(&self, config: serde_json::Value) -> Self {
        Self {
            session_id: self.session_id.clone(),
            source_host: self.source_host.clone(),
            target_host: self.target_host.clone(),
            config,
            local: Arc::clone(&self.local),
            remote: Arc::clone(&self.remote),
            events: Arc::clone(&self.events),
            cancel: self.cancel.clone(),
        }
    }
}

/// Lifecycle contract for one pluggable sync operation.
///
/// Failure classification is the operation's job: recoverable conditions
/// are logged (ERROR level) through the context's event handle and the
/// method returns `Ok`; only conditions that must abort the whole session
/// return an [`OperationError`].
#[async_trait]
pub trait Operation: Send {
    /// The operation's registered name
    fn name(&self) -> &str;

    /// Read-only checks against either machine. Runs once per session,
    /// before any operation executes; must not mutate state.
    async fn validate(&self) -> Vec<ValidationError>;

    /// Preparation work before the main sync step
    async fn pre_sync(&mut self) -> Result<(), OperationError> {
        Ok(())
    }

    /// The operation's actual work
    async fn sync(&mut self) -> Result<(), OperationError>;

    /// Follow-up work after the main sync step
    async fn post_sync(&mut self) -> Result<(), OperationError> {
        Ok(())
    }

    /// Best-effort cancellation. Called only on the currently-executing
    /// operation when the session aborts; must terminate any remote
    /// processes it started and return within `timeout` (the orchestrator
    /// abandons it otherwise).
    async fn abort(&mut self, timeout: Duration) -> Result<(), OperationError> {
        let _ = timeout;
        Ok(())
    }
}

/// Pure, schema-level check of an operation's configuration block
pub type ConfigValidator = fn(&serde_json::Value) -> Vec<ConfigError>;

/// Constructor producing an operation instance from its context
pub type OperationConstructor =
    Box<dyn Fn(Arc<ExecutionContext>) -> Box<dyn Operation> + Send + Sync>;

/// Static description of one operation type
pub struct OperationDescriptor {
    /// Unique key used in configuration
    pub name: &'static str,
    /// Required operations cannot be disabled
    pub required: bool,
    /// Schema-level config check (pure, no I/O)
    pub validate_config: ConfigValidator,
    /// Instance constructor
    pub construct: OperationConstructor,
}

/// Explicit startup-time registry mapping operation name → descriptor
#[derive(Default)]
pub struct OperationRegistry {
    descriptors: BTreeMap<&'static str, OperationDescriptor>,
}

impl OperationRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation type. Duplicate names are a wiring mistake
    /// and are rejected.
    pub fn register(&mut self, descriptor: OperationDescriptor) -> Result<(), ConfigError> {
        let name = descriptor.name;
        if self.descriptors.contains_key(name) {
            return Err(ConfigError::new(
                name,
                "operation registered twice".to_string(),
            ));
        }
        self.descriptors.insert(name, descriptor);
        Ok(())
    }

    /// Look up a descriptor by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OperationDescriptor> {
        self.descriptors.get(name)
    }

    /// All registered names (sorted)
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.descriptors.keys().copied().collect()
    }

    /// Names of required operations (sorted)
    #[must_use]
    pub fn required_names(&self) -> Vec<&'static str> {
        self.descriptors
            .values()
            .filter(|d| d.required)
            .map(|d| d.name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::HostRole;
    use crate::domain::errors::ExecError;
    use crate::ports::event_bus::NullPublisher;
    use crate::ports::executor::{CommandOutput, CommandStream};
    use std::path::Path;

    struct NoopExecutor;

    #[async_trait]
    impl ICommandExecutor for NoopExecutor {
        async fn run(
            &self,
            _argv: &[String],
            _timeout: Duration,
        ) -> Result<CommandOutput, ExecError> {
            Ok(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        async fn start(&self, _argv: &[String]) -> Result<CommandStream, ExecError> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(CommandStream { events: rx })
        }

        async fn terminate_all(&self) -> Result<(), ExecError> {
            Ok(())
        }

        fn host_role(&self) -> HostRole {
            HostRole::Source
        }
    }

    #[async_trait]
    impl IRemoteExecutor for NoopExecutor {
        async fn send_file(&self, _local: &Path, _remote: &Path) -> Result<(), ExecError> {
            Ok(())
        }

        async fn get_file(&self, _remote: &Path, _local: &Path) -> Result<(), ExecError> {
            Ok(())
        }

        async fn hostname(&self) -> Result<String, ExecError> {
            Ok("target".to_string())
        }
    }

    struct NoopOperation;

    #[async_trait]
    impl Operation for NoopOperation {
        fn name(&self) -> &str {
            "noop"
        }

        async fn validate(&self) -> Vec<ValidationError> {
            Vec::new()
        }

        async fn sync(&mut self) -> Result<(), OperationError> {
            Ok(())
        }
    }

    fn test_context() -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext {
            session_id: SessionId::new(),
            source_host: Hostname::new("src").unwrap(),
            target_host: Hostname::new("dst").unwrap(),
            config: serde_json::Value::Null,
            local: Arc::new(NoopExecutor),
            remote: Arc::new(NoopExecutor),
            events: Arc::new(NullPublisher),
            cancel: CancellationToken::new(),
        })
    }

    fn noop_descriptor() -> OperationDescriptor {
        OperationDescriptor {
            name: "noop",
            required: false,
            validate_config: |_| Vec::new(),
            construct: Box::new(|_ctx| Box::new(NoopOperation)),
        }
    }

    #[test]
    fn test_registry_register_and_get() {
        let mut registry = OperationRegistry::new();
        registry.register(noop_descriptor()).unwrap();
        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["noop"]);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = OperationRegistry::new();
        registry.register(noop_descriptor()).unwrap();
        let err = registry.register(noop_descriptor()).unwrap_err();
        assert_eq!(err.operation, "noop");
    }

    #[tokio::test]
    async fn test_constructed_operation_runs_lifecycle() {
        let mut registry = OperationRegistry::new();
        registry.register(noop_descriptor()).unwrap();

        let descriptor = registry.get("noop").unwrap();
        let mut op = (descriptor.construct)(test_context());
        assert_eq!(op.name(), "noop");
        assert!(op.validate().await.is_empty());
        op.pre_sync().await.unwrap();
        op.sync().await.unwrap();
        op.post_sync().await.unwrap();
    }

    #[test]
    fn test_context_for_operation_swaps_config() {
        let ctx = test_context();
        let derived = ctx.for_operation(serde_json::json!({"enabled": true}));
        assert_eq!(derived.session_id, ctx.session_id);
        assert_eq!(derived.config["enabled"], true);
    }
}
