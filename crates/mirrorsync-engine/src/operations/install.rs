//! Target install/upgrade operation
//!
//! The required, second-ordered operation: before any sync operation
//! touches the target, make sure the target runs the same tool version as
//! the source. A *newer* target fails validation outright — the tool
//! never silently downgrades a machine. Installation and upgrade happen
//! right after the pre-sync snapshots, so a botched upgrade is covered by
//! rollback like everything else.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use mirrorsync_core::domain::errors::{ConfigError, OperationError, ValidationError};
use mirrorsync_core::domain::event::{HostRole, LogLevel};
use mirrorsync_core::domain::newtypes::ToolVersion;
use mirrorsync_core::operation::{ExecutionContext, Operation};
use mirrorsync_core::ports::event_bus::IEventPublisher;
use mirrorsync_core::ports::executor::IRemoteExecutor;

/// Registered name of this operation
pub const NAME: &str = "target-install";

/// Timeout for the version query and the small install commands
const INSTALL_CMD_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration block of the install operation
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstallBlock {
    /// Where the tool lives on the target
    pub install_path: PathBuf,
    /// Binary to ship; defaults to the currently running executable
    pub source_binary: Option<PathBuf>,
}

impl Default for InstallBlock {
    fn default() -> Self {
        Self {
            install_path: PathBuf::from("/usr/local/bin/mirrorsync"),
            source_binary: None,
        }
    }
}

/// Schema-level check of the install block (pure, no I/O)
pub fn validate_config(value: &serde_json::Value) -> Vec<ConfigError> {
    let mut errors = Vec::new();
    // An absent block means defaults.
    let parsed = if value.is_null() {
        Ok(InstallBlock::default())
    } else {
        serde_json::from_value(value.clone())
    };
    let block: InstallBlock = match parsed {
        Ok(block) => block,
        Err(e) => {
            errors.push(ConfigError::new(NAME, e.to_string()));
            return errors;
        }
    };
    if !block.install_path.is_absolute() {
        errors.push(ConfigError::new(NAME, "install_path must be absolute"));
    }
    if let Some(binary) = &block.source_binary {
        if !binary.is_absolute() {
            errors.push(ConfigError::new(NAME, "source_binary must be absolute"));
        }
    }
    errors
}

/// The target's installed version: `Ok(None)` means not installed.
///
/// The version query runs `<install_path> --version` and takes the last
/// whitespace-separated token (matching the tool's own `version` output).
async fn query_target_version(
    remote: &dyn IRemoteExecutor,
    install_path: &std::path::Path,
) -> Result<Option<ToolVersion>, OperationError> {
    let argv = vec![
        install_path.display().to_string(),
        "--version".to_string(),
    ];
    let out = remote
        .run(&argv, INSTALL_CMD_TIMEOUT)
        .await
        .map_err(OperationError::Exec)?;
    if !out.success() {
        // Missing binary (127) or unrunnable: treated as not installed.
        return Ok(None);
    }
    let version = out
        .stdout_trimmed()
        .split_whitespace()
        .last()
        .unwrap_or_default()
        .parse::<ToolVersion>()
        .map_err(|e| OperationError::critical(format!("unreadable target version: {e}")))?;
    Ok(Some(version))
}

/// Installs or upgrades the tool on the target
pub struct InstallOperation {
    ctx: Arc<ExecutionContext>,
    block: InstallBlock,
    source_version: ToolVersion,
}

impl InstallOperation {
    /// Construct from an execution context
    #[must_use]
    pub fn from_context(ctx: Arc<ExecutionContext>) -> Self {
        let block: InstallBlock = serde_json::from_value(ctx.config.clone()).unwrap_or_default();
        Self {
            ctx,
            block,
            source_version: ToolVersion::current(),
        }
    }

    fn source_binary(&self) -> Result<PathBuf, OperationError> {
        match &self.block.source_binary {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe()
                .map_err(|e| OperationError::critical(format!("cannot locate own binary: {e}"))),
        }
    }

    async fn run_remote_ok(&self, argv: &[String]) -> Result<(), OperationError> {
        let out = self
            .ctx
            .remote
            .run(argv, INSTALL_CMD_TIMEOUT)
            .await
            .map_err(OperationError::Exec)?;
        if out.success() {
            Ok(())
        } else {
            Err(OperationError::critical(format!(
                "'{}' failed: {}",
                argv.join(" "),
                out.stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl Operation for InstallOperation {
    fn name(&self) -> &str {
        NAME
    }

    async fn validate(&self) -> Vec<ValidationError> {
        match query_target_version(self.ctx.remote.as_ref(), &self.block.install_path).await {
            Ok(Some(target)) if target > self.source_version => {
                vec![ValidationError::new(
                    NAME,
                    format!(
                        "target version {target} is newer than source version {}; \
                         refusing to downgrade",
                        self.source_version
                    ),
                )]
            }
            Ok(_) => Vec::new(),
            Err(e) => vec![ValidationError::new(
                NAME,
                format!("could not determine target version: {e}"),
            )],
        }
    }

    async fn sync(&mut self) -> Result<(), OperationError> {
        let target = query_target_version(self.ctx.remote.as_ref(), &self.block.install_path)
            .await?;

        if target == Some(self.source_version) {
            self.ctx.events.log(
                LogLevel::Info,
                NAME,
                HostRole::Target,
                &format!("Target already runs {}", self.source_version),
            );
            return Ok(());
        }

        let action = match target {
            None => "install",
            Some(_) => "upgrade",
        };
        info!(
            action,
            version = %self.source_version,
            path = %self.block.install_path.display(),
            "Shipping tool to target"
        );
        self.ctx
            .events
            .progress(NAME, 0.1, &format!("{action} {}", self.source_version));

        // Stage next to the final path, then atomically move into place.
        let staged = PathBuf::from(format!("{}.new", self.block.install_path.display()));
        let binary = self.source_binary()?;
        self.ctx
            .remote
            .send_file(&binary, &staged)
            .await
            .map_err(OperationError::Exec)?;
        self.ctx.events.progress(NAME, 0.6, "binary transferred");

        self.run_remote_ok(&[
            "chmod".to_string(),
            "755".to_string(),
            staged.display().to_string(),
        ])
        .await?;
        self.run_remote_ok(&[
            "mv".to_string(),
            "-f".to_string(),
            staged.display().to_string(),
            self.block.install_path.display().to_string(),
        ])
        .await?;

        // Confirm the upgrade actually took.
        let installed = query_target_version(self.ctx.remote.as_ref(), &self.block.install_path)
            .await?;
        if installed != Some(self.source_version) {
            return Err(OperationError::critical(format!(
                "target reports {} after install, expected {}",
                installed.map_or_else(|| "nothing".to_string(), |v| v.to_string()),
                self.source_version
            )));
        }

        self.ctx.events.progress(NAME, 1.0, "target up to date");
        self.ctx.events.log(
            LogLevel::Info,
            NAME,
            HostRole::Target,
            &format!("Target now runs {} ({action})", self.source_version),
        );
        Ok(())
    }

    async fn abort(&mut self, _timeout: Duration) -> Result<(), OperationError> {
        self.ctx
            .remote
            .terminate_all()
            .await
            .map_err(OperationError::Exec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorsync_core::domain::errors::ExecError;
    use mirrorsync_core::domain::event::HostRole;
    use mirrorsync_core::domain::newtypes::{Hostname, SessionId};
    use mirrorsync_core::ports::event_bus::NullPublisher;
    use mirrorsync_core::ports::executor::{
        CommandOutput, CommandStream, ICommandExecutor,
    };
    use std::path::Path;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Remote fake: `--version` responses queued, everything else
    /// succeeds; transfers and commands are recorded.
    struct FakeRemote {
        version_outputs: Mutex<Vec<CommandOutput>>,
        commands: Mutex<Vec<String>>,
        transfers: Mutex<Vec<(PathBuf, PathBuf)>>,
    }

    impl FakeRemote {
        fn new(version_outputs: Vec<CommandOutput>) -> Arc<Self> {
            Arc::new(Self {
                version_outputs: Mutex::new(version_outputs),
                commands: Mutex::new(Vec::new()),
                transfers: Mutex::new(Vec::new()),
            })
        }

        fn version(v: &str) -> CommandOutput {
            CommandOutput {
                exit_code: 0,
                stdout: format!("mirrorsync {v}\n"),
                stderr: String::new(),
            }
        }

        fn missing() -> CommandOutput {
            CommandOutput {
                exit_code: 127,
                stdout: String::new(),
                stderr: "sh: command not found".to_string(),
            }
        }
    }

    #[async_trait]
    impl ICommandExecutor for FakeRemote {
        async fn run(
            &self,
            argv: &[String],
            _timeout: Duration,
        ) -> Result<CommandOutput, ExecError> {
            self.commands.lock().unwrap().push(argv.join(" "));
            if argv.last().map(String::as_str) == Some("--version") {
                let mut outputs = self.version_outputs.lock().unwrap();
                if !outputs.is_empty() {
                    return Ok(outputs.remove(0));
                }
            }
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
            HostRole::Target
        }
    }

    #[async_trait]
    impl IRemoteExecutor for FakeRemote {
        async fn send_file(&self, local: &Path, remote: &Path) -> Result<(), ExecError> {
            self.transfers
                .lock()
                .unwrap()
                .push((local.to_path_buf(), remote.to_path_buf()));
            Ok(())
        }

        async fn get_file(&self, _remote: &Path, _local: &Path) -> Result<(), ExecError> {
            Ok(())
        }

        async fn hostname(&self) -> Result<String, ExecError> {
            Ok("target".to_string())
        }
    }

    fn ctx_with(remote: Arc<FakeRemote>, binary: &Path) -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext {
            session_id: SessionId::new(),
            source_host: Hostname::new("src").unwrap(),
            target_host: Hostname::new("dst").unwrap(),
            config: serde_json::json!({
                "source_binary": binary.display().to_string(),
            }),
            local: Arc::clone(&remote) as Arc<dyn ICommandExecutor>,
            remote,
            events: Arc::new(NullPublisher),
            cancel: CancellationToken::new(),
        })
    }

    fn current() -> String {
        ToolVersion::current().to_string()
    }

    #[tokio::test]
    async fn test_validate_rejects_newer_target() {
        let remote = FakeRemote::new(vec![FakeRemote::version("99.0.0")]);
        let binary = tempfile::NamedTempFile::new().unwrap();
        let op = InstallOperation::from_context(ctx_with(Arc::clone(&remote), binary.path()));

        let errors = op.validate().await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("refusing to downgrade"));
        // No installation step ran.
        assert!(remote.transfers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_validate_accepts_missing_and_older_target() {
        let remote = FakeRemote::new(vec![FakeRemote::missing()]);
        let binary = tempfile::NamedTempFile::new().unwrap();
        let op = InstallOperation::from_context(ctx_with(remote, binary.path()));
        assert!(op.validate().await.is_empty());

        let remote = FakeRemote::new(vec![FakeRemote::version("0.0.1")]);
        let binary = tempfile::NamedTempFile::new().unwrap();
        let op = InstallOperation::from_context(ctx_with(remote, binary.path()));
        assert!(op.validate().await.is_empty());
    }

    #[tokio::test]
    async fn test_sync_skips_when_versions_match() {
        let remote = FakeRemote::new(vec![FakeRemote::version(&current())]);
        let binary = tempfile::NamedTempFile::new().unwrap();
        let mut op = InstallOperation::from_context(ctx_with(Arc::clone(&remote), binary.path()));

        op.sync().await.unwrap();
        assert!(remote.transfers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_installs_and_reverifies() {
        // First query: missing; second (after install): current version.
        let remote = FakeRemote::new(vec![
            FakeRemote::missing(),
            FakeRemote::version(&current()),
        ]);
        let binary = tempfile::NamedTempFile::new().unwrap();
        let mut op = InstallOperation::from_context(ctx_with(Arc::clone(&remote), binary.path()));

        op.sync().await.unwrap();

        let transfers = remote.transfers.lock().unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].0, binary.path());
        assert_eq!(
            transfers[0].1,
            PathBuf::from("/usr/local/bin/mirrorsync.new")
        );

        let commands = remote.commands.lock().unwrap();
        assert!(commands
            .iter()
            .any(|c| c == "chmod 755 /usr/local/bin/mirrorsync.new"));
        assert!(commands
            .iter()
            .any(|c| c == "mv -f /usr/local/bin/mirrorsync.new /usr/local/bin/mirrorsync"));
    }

    #[tokio::test]
    async fn test_sync_fails_when_recheck_mismatches() {
        let remote = FakeRemote::new(vec![
            FakeRemote::missing(),
            FakeRemote::version("0.0.1"),
        ]);
        let binary = tempfile::NamedTempFile::new().unwrap();
        let mut op = InstallOperation::from_context(ctx_with(remote, binary.path()));

        let err = op.sync().await.unwrap_err();
        assert!(matches!(err, OperationError::Critical(_)));
        assert!(err.to_string().contains("after install"));
    }

    #[test]
    fn test_validate_config_requires_absolute_paths() {
        let errors = validate_config(&serde_json::json!({
            "install_path": "relative/mirrorsync",
        }));
        assert_eq!(errors.len(), 1);

        assert!(validate_config(&serde_json::json!({})).is_empty());
    }
}
