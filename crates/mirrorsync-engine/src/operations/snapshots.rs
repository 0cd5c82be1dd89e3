//! Snapshot operation
//!
//! The required, first-ordered operation. Creates one read-only snapshot
//! per configured subvolume before anything modifies the target
//! (`pre_sync`), and again after the whole session succeeds (driven by
//! the orchestrator through [`SnapshotService::create_post`]). Also the
//! home of the explicit maintenance entry points: rollback and retention
//! cleanup, both invoked by separate user commands, never automatically.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use mirrorsync_core::domain::errors::{ConfigError, OperationError, ValidationError};
use mirrorsync_core::domain::event::{HostRole, LogLevel};
use mirrorsync_core::domain::newtypes::{SessionId, SubvolumeName};
use mirrorsync_core::domain::snapshot::SnapshotPhase;
use mirrorsync_core::operation::{ExecutionContext, Operation};
use mirrorsync_core::ports::event_bus::IEventPublisher;
use mirrorsync_core::ports::executor::ICommandExecutor;
use mirrorsync_snapshots::{RetentionPolicy, SnapshotError, SnapshotManager};

use super::RemoteAsExec;

/// Registered name of this operation
pub const NAME: &str = "snapshots";

/// Timeout for individual btrfs commands
const BTRFS_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration block of the snapshot operation
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotBlock {
    /// Subvolumes to protect (e.g. `["@", "@home"]`)
    pub subvolumes: Vec<String>,
    /// Where the live subvolumes are mounted on the target
    pub volume_root: PathBuf,
    /// Root directory for per-session snapshot directories
    pub snapshot_root: PathBuf,
    /// Retention: sessions always kept regardless of age
    pub keep_recent: usize,
    /// Retention: snapshot sets older than this become deletable
    pub max_age_days: i64,
}

impl Default for SnapshotBlock {
    fn default() -> Self {
        Self {
            subvolumes: Vec::new(),
            volume_root: PathBuf::from("/"),
            snapshot_root: PathBuf::from("/.snapshots/mirrorsync"),
            keep_recent: 3,
            max_age_days: 30,
        }
    }
}

impl SnapshotBlock {
    /// The configured retention policy
    #[must_use]
    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age: chrono::Duration::days(self.max_age_days),
            keep_recent: self.keep_recent,
        }
    }

    /// The configured subvolumes, dropping names that fail validation
    /// (schema validation reports those separately)
    #[must_use]
    pub fn subvolume_names(&self) -> Vec<SubvolumeName> {
        self.subvolumes
            .iter()
            .filter_map(|n| SubvolumeName::new(n.clone()).ok())
            .collect()
    }

    /// Build a snapshot manager for this block (maintenance commands use
    /// this without a session)
    #[must_use]
    pub fn manager(&self, exec: Arc<dyn ICommandExecutor>) -> SnapshotManager {
        SnapshotManager::new(
            exec,
            self.snapshot_root.clone(),
            self.volume_root.clone(),
            BTRFS_TIMEOUT,
        )
    }
}

/// Schema-level check of the snapshot block (pure, no I/O)
pub fn validate_config(value: &serde_json::Value) -> Vec<ConfigError> {
    let mut errors = Vec::new();
    // An absent block means defaults (which still require subvolumes).
    let parsed = if value.is_null() {
        Ok(SnapshotBlock::default())
    } else {
        serde_json::from_value(value.clone())
    };
    let block: SnapshotBlock = match parsed {
        Ok(block) => block,
        Err(e) => {
            errors.push(ConfigError::new(NAME, e.to_string()));
            return errors;
        }
    };
    if block.subvolumes.is_empty() {
        errors.push(ConfigError::new(NAME, "at least one subvolume is required"));
    }
    for name in &block.subvolumes {
        if let Err(e) = SubvolumeName::new(name.clone()) {
            errors.push(ConfigError::new(NAME, e.to_string()));
        }
    }
    if block.max_age_days < 0 {
        errors.push(ConfigError::new(NAME, "max_age_days must not be negative"));
    }
    errors
}

/// Snapshot work shared between the session operation and the
/// maintenance commands (rollback, cleanup).
pub struct SnapshotService {
    manager: SnapshotManager,
    subvolumes: Vec<SubvolumeName>,
    volume_root: PathBuf,
    session_id: SessionId,
    created_at: DateTime<Utc>,
    events: Arc<dyn IEventPublisher>,
}

impl SnapshotService {
    /// Create a service for one session
    pub fn new(
        exec: Arc<dyn ICommandExecutor>,
        block: &SnapshotBlock,
        session_id: SessionId,
        created_at: DateTime<Utc>,
        events: Arc<dyn IEventPublisher>,
    ) -> Self {
        Self {
            manager: block.manager(exec),
            subvolumes: block.subvolume_names(),
            volume_root: block.volume_root.clone(),
            session_id,
            created_at,
            events,
        }
    }

    /// The manager, for maintenance commands that need raw access
    #[must_use]
    pub fn manager(&self) -> &SnapshotManager {
        &self.manager
    }

    /// Read-only checks: btrfs filesystem, live subvolumes present
    pub async fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        match self.manager.is_btrfs(&self.volume_root).await {
            Ok(true) => {}
            Ok(false) => errors.push(ValidationError::new(
                NAME,
                format!(
                    "{} is not on a btrfs filesystem",
                    self.volume_root.display()
                ),
            )),
            Err(e) => errors.push(ValidationError::new(
                NAME,
                format!("could not probe filesystem type: {e}"),
            )),
        }

        for subvolume in &self.subvolumes {
            let live = self.volume_root.join(subvolume.as_str());
            let argv = vec![
                "test".to_string(),
                "-d".to_string(),
                live.display().to_string(),
            ];
            match self.manager_exec_run(&argv).await {
                Ok(true) => {}
                Ok(false) => errors.push(ValidationError::new(
                    NAME,
                    format!("subvolume path {} does not exist", live.display()),
                )),
                Err(e) => errors.push(ValidationError::new(
                    NAME,
                    format!("could not check subvolume {subvolume}: {e}"),
                )),
            }
        }
        errors
    }

    async fn manager_exec_run(&self, argv: &[String]) -> Result<bool, OperationError> {
        let out = self
            .manager
            .executor()
            .run(argv, BTRFS_TIMEOUT)
            .await
            .map_err(OperationError::Exec)?;
        Ok(out.success())
    }

    async fn create_phase(&self, phase: SnapshotPhase) -> Result<(), OperationError> {
        let total = self.subvolumes.len();
        for (i, subvolume) in self.subvolumes.iter().enumerate() {
            self.events.progress(
                NAME,
                i as f64 / total.max(1) as f64,
                &format!("{phase} snapshot of {subvolume}"),
            );
            self.manager
                .create_phase_snapshots(
                    &self.session_id,
                    self.created_at,
                    phase,
                    std::slice::from_ref(subvolume),
                )
                .await
                .map_err(|e| OperationError::critical(e.to_string()))?;
            self.events.log(
                LogLevel::Info,
                NAME,
                HostRole::Target,
                &format!("Created {phase} snapshot of {subvolume}"),
            );
        }
        self.events
            .progress(NAME, 1.0, &format!("{phase} snapshots complete"));
        Ok(())
    }

    /// Create the pre-sync snapshot set
    pub async fn create_pre(&self) -> Result<(), OperationError> {
        info!(session = %self.session_id, "Creating pre-sync snapshots");
        self.create_phase(SnapshotPhase::Pre).await
    }

    /// Create the post-sync snapshot set (only called once every
    /// operation succeeded)
    pub async fn create_post(&self) -> Result<(), OperationError> {
        info!(session = %self.session_id, "Creating post-sync snapshots");
        self.create_phase(SnapshotPhase::Post).await
    }

    /// Restore all configured subvolumes from `session_id`'s pre-sync
    /// snapshots. Destructive and explicit; see the rollback command.
    pub async fn rollback_to_presync(&self, session_id: &SessionId) -> Result<(), SnapshotError> {
        self.manager
            .rollback_to_presync(session_id, &self.subvolumes)
            .await
    }

    /// Apply age/count retention; returns the deleted sessions
    pub async fn cleanup_old_snapshots(
        &self,
        policy: RetentionPolicy,
    ) -> Result<Vec<SessionId>, SnapshotError> {
        self.manager.cleanup_old_snapshots(policy).await
    }
}

/// The session-ordered face of the snapshot work
pub struct SnapshotOperation {
    service: Arc<SnapshotService>,
}

impl SnapshotOperation {
    /// Wrap a shared service (the orchestrator keeps the other handle for
    /// the post-sync phase)
    #[must_use]
    pub fn new(service: Arc<SnapshotService>) -> Self {
        Self { service }
    }

    /// Construct from an execution context (registry path)
    #[must_use]
    pub fn from_context(ctx: &Arc<ExecutionContext>) -> Self {
        let block: SnapshotBlock =
            serde_json::from_value(ctx.config.clone()).unwrap_or_default();
        let service = SnapshotService::new(
            Arc::new(RemoteAsExec(Arc::clone(&ctx.remote))),
            &block,
            ctx.session_id.clone(),
            Utc::now(),
            Arc::clone(&ctx.events),
        );
        Self {
            service: Arc::new(service),
        }
    }

    /// The shared service handle
    #[must_use]
    pub fn service(&self) -> Arc<SnapshotService> {
        Arc::clone(&self.service)
    }
}

#[async_trait]
impl Operation for SnapshotOperation {
    fn name(&self) -> &str {
        NAME
    }

    async fn validate(&self) -> Vec<ValidationError> {
        self.service.validate().await
    }

    async fn pre_sync(&mut self) -> Result<(), OperationError> {
        self.service.create_pre().await
    }

    async fn sync(&mut self) -> Result<(), OperationError> {
        // All real work happens in the phase hooks; the sync step of the
        // safety operation is deliberately empty.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod config_tests {
        use super::*;

        #[test]
        fn test_valid_block() {
            let value = serde_json::json!({
                "subvolumes": ["@", "@home"],
                "volume_root": "/mnt/volumes",
            });
            assert!(validate_config(&value).is_empty());
        }

        #[test]
        fn test_missing_subvolumes() {
            let errors = validate_config(&serde_json::json!({}));
            assert_eq!(errors.len(), 1);
            assert!(errors[0].message.contains("subvolume"));
        }

        #[test]
        fn test_bad_subvolume_name() {
            let value = serde_json::json!({ "subvolumes": ["@", "../etc"] });
            let errors = validate_config(&value);
            assert_eq!(errors.len(), 1);
        }

        #[test]
        fn test_unknown_field_rejected() {
            let value = serde_json::json!({
                "subvolumes": ["@"],
                "subvolume": ["typo"],
            });
            assert!(!validate_config(&value).is_empty());
        }

        #[test]
        fn test_negative_age_rejected() {
            let value = serde_json::json!({
                "subvolumes": ["@"],
                "max_age_days": -1,
            });
            assert!(!validate_config(&value).is_empty());
        }

        #[test]
        fn test_retention_mapping() {
            let block = SnapshotBlock {
                keep_recent: 5,
                max_age_days: 14,
                ..Default::default()
            };
            let policy = block.retention();
            assert_eq!(policy.keep_recent, 5);
            assert_eq!(policy.max_age, chrono::Duration::days(14));
        }
    }
}
