//! Snapshot manager
//!
//! Wraps the btrfs primitives behind an [`ICommandExecutor`] so snapshots
//! are taken on whichever machine the executor drives (in practice the
//! target, over the session's connection).
//!
//! Layout on disk:
//!
//! ```text
//! <root>/
//!   20260314-092653-ab12cd34/          one directory per session
//!     pre-@-20260314-092653            read-only snapshot per subvolume
//!     pre-@home-20260314-092653
//!     post-@-20260314-093401
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use mirrorsync_core::domain::errors::ExecError;
use mirrorsync_core::domain::newtypes::{SessionId, SubvolumeName};
use mirrorsync_core::domain::snapshot::{
    parse_session_dir_name, session_dir_name, snapshot_entry_name, Snapshot, SnapshotPhase,
};
use mirrorsync_core::ports::executor::ICommandExecutor;

use crate::retention::{select_expired, RetentionPolicy};

/// Failures while manipulating snapshots
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The executor could not run the command at all
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// A btrfs (or filesystem) command exited non-zero
    #[error("'{command}' failed: {stderr}")]
    CommandFailed {
        /// The command that failed
        command: String,
        /// Its stderr, trimmed
        stderr: String,
    },

    /// No snapshot directory exists for the session
    #[error("No snapshots found for session {0}")]
    NoSessionDir(SessionId),

    /// The session directory exists but lacks a pre-sync snapshot for the
    /// subvolume
    #[error("Session {session_id} has no pre-sync snapshot for subvolume '{subvolume}'")]
    MissingPresync {
        /// Session the rollback was requested for
        session_id: SessionId,
        /// Subvolume without a pre-sync snapshot
        subvolume: SubvolumeName,
    },
}

/// One session's snapshot directory
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshots {
    /// Directory name under the snapshot root
    pub dir_name: String,
    /// When the session took its first snapshot
    pub created_at: DateTime<Utc>,
    /// Owning session
    pub session_id: SessionId,
}

/// Manages the snapshot tree on one machine
pub struct SnapshotManager {
    exec: Arc<dyn ICommandExecutor>,
    /// Root directory holding per-session snapshot directories
    root: PathBuf,
    /// Where the live subvolumes are mounted (live path = `volume_root/<name>`)
    volume_root: PathBuf,
    timeout: Duration,
}

impl SnapshotManager {
    /// Create a manager operating through `exec`
    pub fn new(
        exec: Arc<dyn ICommandExecutor>,
        root: PathBuf,
        volume_root: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            exec,
            root,
            volume_root,
            timeout,
        }
    }

    /// The executor this manager drives commands through
    #[must_use]
    pub fn executor(&self) -> &Arc<dyn ICommandExecutor> {
        &self.exec
    }

    /// Run a command and require exit code 0
    async fn run_ok(&self, argv: &[String]) -> Result<String, SnapshotError> {
        let out = self.exec.run(argv, self.timeout).await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(SnapshotError::CommandFailed {
                command: argv.join(" "),
                stderr: out.stderr.trim().to_string(),
            })
        }
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    /// Live path of a subvolume
    fn live_path(&self, subvolume: &SubvolumeName) -> PathBuf {
        self.volume_root.join(subvolume.as_str())
    }

    /// True when `path` sits on a btrfs filesystem
    pub async fn is_btrfs(&self, path: &std::path::Path) -> Result<bool, SnapshotError> {
        let out = self
            .exec
            .run(
                &Self::argv(&["stat", "-f", "-c", "%T", &path.display().to_string()]),
                self.timeout,
            )
            .await?;
        Ok(out.success() && out.stdout_trimmed() == "btrfs")
    }

    /// Create one read-only snapshot per subvolume for the given phase.
    ///
    /// The session directory is created on first use. Snapshots are
    /// read-only from birth (`-r`); nothing ever mutates them.
    pub async fn create_phase_snapshots(
        &self,
        session_id: &SessionId,
        created_at: DateTime<Utc>,
        phase: SnapshotPhase,
        subvolumes: &[SubvolumeName],
    ) -> Result<Vec<Snapshot>, SnapshotError> {
        let dir = self.root.join(session_dir_name(created_at, session_id));
        self.run_ok(&Self::argv(&["mkdir", "-p", &dir.display().to_string()]))
            .await?;

        let mut created = Vec::with_capacity(subvolumes.len());
        for subvolume in subvolumes {
            let entry = snapshot_entry_name(phase, subvolume, Utc::now());
            let dest = dir.join(&entry);
            let live = self.live_path(subvolume);
            info!(
                subvolume = %subvolume,
                phase = %phase,
                dest = %dest.display(),
                "Creating read-only snapshot"
            );
            self.run_ok(&Self::argv(&[
                "btrfs",
                "subvolume",
                "snapshot",
                "-r",
                &live.display().to_string(),
                &dest.display().to_string(),
            ]))
            .await?;
            created.push(Snapshot {
                subvolume: subvolume.clone(),
                phase,
                created_at: Utc::now(),
                session_id: session_id.clone(),
                path: dest,
                read_only: true,
            });
        }
        Ok(created)
    }

    /// List per-session snapshot directories, oldest first.
    ///
    /// Entries that do not parse as session directories are ignored (the
    /// root may hold unrelated files).
    pub async fn list_sessions(&self) -> Result<Vec<SessionSnapshots>, SnapshotError> {
        let out = self
            .exec
            .run(
                &Self::argv(&["ls", "-1", &self.root.display().to_string()]),
                self.timeout,
            )
            .await?;
        if !out.success() {
            // A missing root simply means no snapshots yet.
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for line in out.stdout.lines() {
            let name = line.trim();
            if name.is_empty() {
                continue;
            }
            match parse_session_dir_name(name) {
                Ok((created_at, session_id)) => sessions.push(SessionSnapshots {
                    dir_name: name.to_string(),
                    created_at,
                    session_id,
                }),
                Err(_) => debug!(name, "Ignoring non-session entry in snapshot root"),
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    /// The snapshot directory for one session id, if present
    pub async fn find_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionSnapshots>, SnapshotError> {
        Ok(self
            .list_sessions()
            .await?
            .into_iter()
            .find(|s| &s.session_id == session_id))
    }

    /// Snapshot entry names within one session directory
    async fn list_entries(&self, dir_name: &str) -> Result<Vec<String>, SnapshotError> {
        let dir = self.root.join(dir_name);
        let out = self
            .run_ok(&Self::argv(&["ls", "-1", &dir.display().to_string()]))
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Delete one session's snapshots and its directory
    pub async fn delete_session(&self, session: &SessionSnapshots) -> Result<(), SnapshotError> {
        for entry in self.list_entries(&session.dir_name).await? {
            let path = self.root.join(&session.dir_name).join(&entry);
            info!(snapshot = %path.display(), "Deleting snapshot");
            self.run_ok(&Self::argv(&[
                "btrfs",
                "subvolume",
                "delete",
                &path.display().to_string(),
            ]))
            .await?;
        }
        self.run_ok(&Self::argv(&[
            "rmdir",
            &self.root.join(&session.dir_name).display().to_string(),
        ]))
        .await?;
        Ok(())
    }

    /// Apply age/count retention across all sessions.
    ///
    /// Returns the ids whose snapshots were deleted. The `keep_recent`
    /// most recent sessions are never touched regardless of age.
    pub async fn cleanup_old_snapshots(
        &self,
        policy: RetentionPolicy,
    ) -> Result<Vec<SessionId>, SnapshotError> {
        let sessions = self.list_sessions().await?;
        let by_id: Vec<(DateTime<Utc>, SessionId)> = sessions
            .iter()
            .map(|s| (s.created_at, s.session_id.clone()))
            .collect();
        let expired = select_expired(&by_id, policy, Utc::now());

        for id in &expired {
            if let Some(session) = sessions.iter().find(|s| &s.session_id == id) {
                self.delete_session(session).await?;
            }
        }
        if expired.is_empty() {
            debug!("Cleanup found nothing to delete");
        }
        Ok(expired)
    }

    /// Restore every given subvolume from the session's pre-sync snapshot.
    ///
    /// Destructive: the live subvolume is deleted and recreated (writable)
    /// from the read-only pre-sync snapshot. Fails loudly when the session
    /// or any of its pre-sync snapshots is missing; partial rollback is
    /// reported as the error of the first failing subvolume.
    pub async fn rollback_to_presync(
        &self,
        session_id: &SessionId,
        subvolumes: &[SubvolumeName],
    ) -> Result<(), SnapshotError> {
        let session = self
            .find_session(session_id)
            .await?
            .ok_or_else(|| SnapshotError::NoSessionDir(session_id.clone()))?;
        let entries = self.list_entries(&session.dir_name).await?;

        // Resolve every pre-sync snapshot up front; a missing one must
        // fail the rollback before anything is deleted.
        let mut sources = Vec::with_capacity(subvolumes.len());
        for subvolume in subvolumes {
            let prefix = format!("{}-{}-", SnapshotPhase::Pre, subvolume.slug());
            let entry = entries
                .iter()
                .find(|e| e.starts_with(&prefix))
                .ok_or_else(|| SnapshotError::MissingPresync {
                    session_id: session_id.clone(),
                    subvolume: subvolume.clone(),
                })?;
            sources.push((subvolume.clone(), self.root.join(&session.dir_name).join(entry)));
        }

        for (subvolume, source) in sources {
            let live = self.live_path(&subvolume);
            warn!(
                subvolume = %subvolume,
                from = %source.display(),
                "Rolling back subvolume to pre-sync snapshot"
            );
            self.run_ok(&Self::argv(&[
                "btrfs",
                "subvolume",
                "delete",
                &live.display().to_string(),
            ]))
            .await?;
            self.run_ok(&Self::argv(&[
                "btrfs",
                "subvolume",
                "snapshot",
                &source.display().to_string(),
                &live.display().to_string(),
            ]))
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mirrorsync_core::domain::event::HostRole;
    use mirrorsync_core::ports::executor::{CommandOutput, CommandStream};
    use std::sync::Mutex;

    /// Scripted executor: canned responses by command prefix, every
    /// invocation recorded.
    struct FakeExec {
        log: Mutex<Vec<String>>,
        responses: Vec<(String, CommandOutput)>,
    }

    impl FakeExec {
        fn new(responses: Vec<(&str, CommandOutput)>) -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                responses: responses
                    .into_iter()
                    .map(|(p, o)| (p.to_string(), o))
                    .collect(),
            }
        }

        fn ok(stdout: &str) -> CommandOutput {
            CommandOutput {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }
        }

        fn fail(stderr: &str) -> CommandOutput {
            CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: stderr.to_string(),
            }
        }

        fn commands(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ICommandExecutor for FakeExec {
        async fn run(
            &self,
            argv: &[String],
            _timeout: Duration,
        ) -> Result<CommandOutput, ExecError> {
            let joined = argv.join(" ");
            self.log.lock().unwrap().push(joined.clone());
            for (prefix, output) in &self.responses {
                if joined.starts_with(prefix.as_str()) {
                    return Ok(output.clone());
                }
            }
            Ok(Self::ok(""))
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

    fn manager(exec: Arc<FakeExec>) -> SnapshotManager {
        SnapshotManager::new(
            exec,
            PathBuf::from("/.snapshots/mirrorsync"),
            PathBuf::from("/mnt/volumes"),
            Duration::from_secs(30),
        )
    }

    fn subvols(names: &[&str]) -> Vec<SubvolumeName> {
        names.iter().map(|n| SubvolumeName::new(*n).unwrap()).collect()
    }

    fn sid(s: &str) -> SessionId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_create_phase_snapshots_issues_readonly_snapshots() {
        let exec = Arc::new(FakeExec::new(vec![]));
        let mgr = manager(Arc::clone(&exec));

        let snaps = mgr
            .create_phase_snapshots(
                &sid("ab12cd34"),
                Utc::now(),
                SnapshotPhase::Pre,
                &subvols(&["@", "@home"]),
            )
            .await
            .unwrap();

        assert_eq!(snaps.len(), 2);
        assert!(snaps.iter().all(|s| s.read_only));

        let commands = exec.commands();
        assert!(commands[0].starts_with("mkdir -p /.snapshots/mirrorsync/"));
        assert!(commands[1].starts_with("btrfs subvolume snapshot -r /mnt/volumes/@ "));
        assert!(commands[2].starts_with("btrfs subvolume snapshot -r /mnt/volumes/@home "));
        assert!(commands[1].contains("/pre-@-"));
        assert!(commands[2].contains("/pre-@home-"));
    }

    #[tokio::test]
    async fn test_create_fails_when_btrfs_fails() {
        let exec = Arc::new(FakeExec::new(vec![(
            "btrfs subvolume snapshot",
            FakeExec::fail("ERROR: not a btrfs filesystem"),
        )]));
        let mgr = manager(exec);

        let err = mgr
            .create_phase_snapshots(
                &sid("ab12cd34"),
                Utc::now(),
                SnapshotPhase::Pre,
                &subvols(&["@"]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_list_sessions_parses_and_sorts() {
        let exec = Arc::new(FakeExec::new(vec![(
            "ls -1 /.snapshots/mirrorsync",
            FakeExec::ok("20260302-110000-bbbbbbbb\nlost+found\n20260301-100000-aaaaaaaa\n"),
        )]));
        let mgr = manager(exec);

        let sessions = mgr.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, sid("aaaaaaaa"));
        assert_eq!(sessions[1].session_id, sid("bbbbbbbb"));
    }

    #[tokio::test]
    async fn test_list_sessions_empty_when_root_missing() {
        let exec = Arc::new(FakeExec::new(vec![(
            "ls -1",
            FakeExec::fail("No such file or directory"),
        )]));
        let mgr = manager(exec);
        assert!(mgr.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_deletes_live_and_restores_writable() {
        let exec = Arc::new(FakeExec::new(vec![
            (
                "ls -1 /.snapshots/mirrorsync/20260301-100000-aaaaaaaa",
                FakeExec::ok("pre-@-20260301-100000\npost-@-20260301-101500\n"),
            ),
            (
                "ls -1 /.snapshots/mirrorsync",
                FakeExec::ok("20260301-100000-aaaaaaaa\n"),
            ),
        ]));
        let mgr = manager(Arc::clone(&exec));

        mgr.rollback_to_presync(&sid("aaaaaaaa"), &subvols(&["@"]))
            .await
            .unwrap();

        let commands = exec.commands();
        let delete = commands
            .iter()
            .position(|c| c == "btrfs subvolume delete /mnt/volumes/@")
            .expect("live subvolume deleted");
        let restore = commands
            .iter()
            .position(|c| {
                c == "btrfs subvolume snapshot \
                      /.snapshots/mirrorsync/20260301-100000-aaaaaaaa/pre-@-20260301-100000 \
                      /mnt/volumes/@"
                    || c.starts_with("btrfs subvolume snapshot /.snapshots")
            })
            .expect("subvolume restored");
        assert!(delete < restore);
        // The restore is writable: no -r flag.
        assert!(!commands[restore].contains(" -r "));
    }

    #[tokio::test]
    async fn test_rollback_fails_loudly_without_session() {
        let exec = Arc::new(FakeExec::new(vec![(
            "ls -1 /.snapshots/mirrorsync",
            FakeExec::ok(""),
        )]));
        let mgr = manager(exec);

        let err = mgr
            .rollback_to_presync(&sid("aaaaaaaa"), &subvols(&["@"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::NoSessionDir(_)));
    }

    #[tokio::test]
    async fn test_rollback_fails_before_deleting_when_presync_missing() {
        let exec = Arc::new(FakeExec::new(vec![
            (
                "ls -1 /.snapshots/mirrorsync/20260301-100000-aaaaaaaa",
                // Only @home has a pre snapshot; @ is missing.
                FakeExec::ok("pre-@home-20260301-100000\n"),
            ),
            (
                "ls -1 /.snapshots/mirrorsync",
                FakeExec::ok("20260301-100000-aaaaaaaa\n"),
            ),
        ]));
        let mgr = manager(Arc::clone(&exec));

        let err = mgr
            .rollback_to_presync(&sid("aaaaaaaa"), &subvols(&["@home", "@"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::MissingPresync { .. }));

        // Nothing was deleted: resolution happens before destruction.
        assert!(!exec
            .commands()
            .iter()
            .any(|c| c.starts_with("btrfs subvolume delete")));
    }

    #[tokio::test]
    async fn test_delete_session_removes_entries_then_dir() {
        let exec = Arc::new(FakeExec::new(vec![(
            "ls -1 /.snapshots/mirrorsync/20260301-100000-aaaaaaaa",
            FakeExec::ok("pre-@-20260301-100000\n"),
        )]));
        let mgr = manager(Arc::clone(&exec));

        let session = SessionSnapshots {
            dir_name: "20260301-100000-aaaaaaaa".to_string(),
            created_at: Utc::now(),
            session_id: sid("aaaaaaaa"),
        };
        mgr.delete_session(&session).await.unwrap();

        let commands = exec.commands();
        assert!(commands.iter().any(|c| c.starts_with(
            "btrfs subvolume delete /.snapshots/mirrorsync/20260301-100000-aaaaaaaa/pre-@-"
        )));
        assert_eq!(
            commands.last().unwrap(),
            "rmdir /.snapshots/mirrorsync/20260301-100000-aaaaaaaa"
        );
    }
}
