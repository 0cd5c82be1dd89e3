//! Session locks
//!
//! Two cooperating exclusive locks, both required before any
//! state-modifying phase: the **source lock** (an `flock(2)` on a file
//! under the per-user runtime directory, preventing two sessions from the
//! same source) and the **target lock** (an `flock` holder process on the
//! remote machine, started over the session's connection — if the
//! connection drops, the holder dies and the lock releases itself, so an
//! orphaned session can never leave a stale target lock behind).
//!
//! Acquisition failure at either end is fatal after one bounded wait;
//! locks are never retried indefinitely.

use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use mirrorsync_core::domain::errors::LockError;
use mirrorsync_core::domain::newtypes::SessionId;
use mirrorsync_core::ports::executor::{CommandEvent, CommandStream, IRemoteExecutor};

/// Delay between lock retry attempts within the bounded wait
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Handshake line the target lock holder prints once it owns the lock
pub const TARGET_LOCK_TOKEN: &str = "mirrorsync-target-lock-held";

fn try_flock(fd: i32) -> bool {
    // LOCK_EX | LOCK_NB: exclusive, fail instead of blocking.
    unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) == 0 }
}

/// Exclusive lock on the source machine, held for the whole session.
///
/// The kernel releases the flock on process exit by any path, so a
/// crashed session never wedges the source.
#[derive(Debug)]
pub struct SourceLock {
    file: std::fs::File,
    path: PathBuf,
}

impl SourceLock {
    /// Acquire the source lock, waiting at most `wait`.
    pub async fn acquire(
        path: &Path,
        session_id: &SessionId,
        wait: Duration,
    ) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        let deadline = Instant::now() + wait;
        loop {
            if try_flock(file.as_raw_fd()) {
                break;
            }
            if Instant::now() >= deadline {
                return Err(LockError::SourceBusy {
                    path: path.display().to_string(),
                });
            }
            debug!(path = %path.display(), "Source lock busy, retrying");
            tokio::time::sleep(RETRY_DELAY).await;
        }

        // Record who holds the lock; purely informational for humans
        // inspecting a stuck machine.
        let metadata = serde_json::json!({
            "pid": std::process::id(),
            "session_id": session_id.to_string(),
            "acquired_at": chrono::Utc::now().to_rfc3339(),
        });
        use std::io::{Seek, Write};
        let mut f = &file;
        let _ = f.set_len(0);
        let _ = f.seek(std::io::SeekFrom::Start(0));
        let _ = writeln!(f, "{metadata}");

        info!(path = %path.display(), "Source lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Where the lock file lives
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SourceLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        debug!(path = %self.path.display(), "Source lock released");
    }
}

/// Exclusive lock on the target machine, lifetime-bound to the connection.
///
/// Holding this struct keeps a remote `flock` holder process alive
/// through one multiplexed session. The holder dies — releasing the
/// lock — when the connection closes, whether or not this process exits
/// cleanly.
#[derive(Debug)]
pub struct TargetLock {
    path: PathBuf,
    // Keeping the stream keeps the local ssh session process's output
    // channel; the holder itself lives until the connection does.
    _holder: CommandStream,
}

impl TargetLock {
    /// Acquire the target lock over `remote`, waiting at most `wait` for
    /// the holder's handshake.
    pub async fn acquire(
        remote: &dyn IRemoteExecutor,
        path: &Path,
        wait: Duration,
    ) -> Result<Self, LockError> {
        let script = format!(
            "flock -n {} -c 'echo {} && exec sleep infinity'",
            path.display(),
            TARGET_LOCK_TOKEN
        );
        let argv = vec!["sh".to_string(), "-c".to_string(), script];
        let mut stream = remote
            .start(&argv)
            .await
            .map_err(|e| LockError::Io(std::io::Error::other(e.to_string())))?;

        // The holder prints the token once it owns the flock; flock -n
        // exits non-zero immediately when someone else holds it.
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LockError::HandshakeTimeout(wait));
            }
            match tokio::time::timeout(remaining, stream.next()).await {
                Ok(Some(CommandEvent::Stdout(line))) if line.trim() == TARGET_LOCK_TOKEN => {
                    info!(path = %path.display(), "Target lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        _holder: stream,
                    });
                }
                Ok(Some(CommandEvent::Stdout(_) | CommandEvent::Stderr(_))) => continue,
                Ok(Some(CommandEvent::Exited(_)) | None) => {
                    return Err(LockError::TargetBusy {
                        path: path.display().to_string(),
                    });
                }
                Err(_elapsed) => return Err(LockError::HandshakeTimeout(wait)),
            }
        }
    }

    /// Remote lock file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        SessionId::new()
    }

    mod source_lock_tests {
        use super::*;

        #[tokio::test]
        async fn test_acquire_writes_metadata() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("mirrorsync.lock");
            let session_id = sid();

            let lock = SourceLock::acquire(&path, &session_id, Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(lock.path(), path);

            let content = std::fs::read_to_string(&path).unwrap();
            let meta: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
            assert_eq!(meta["session_id"], session_id.to_string());
            assert_eq!(meta["pid"], std::process::id());
        }

        #[tokio::test]
        async fn test_second_acquire_fails_fast() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("mirrorsync.lock");

            let _held = SourceLock::acquire(&path, &sid(), Duration::from_secs(1))
                .await
                .unwrap();

            // flock is per-open-file; a second open in the same process
            // models a second session attempt.
            let err = SourceLock::acquire(&path, &sid(), Duration::from_millis(50))
                .await
                .unwrap_err();
            assert!(matches!(err, LockError::SourceBusy { .. }));
        }

        #[tokio::test]
        async fn test_released_on_drop() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("mirrorsync.lock");

            {
                let _lock = SourceLock::acquire(&path, &sid(), Duration::from_secs(1))
                    .await
                    .unwrap();
            }
            // Reacquirable immediately after drop.
            let _lock = SourceLock::acquire(&path, &sid(), Duration::from_millis(50))
                .await
                .unwrap();
        }

        #[tokio::test]
        async fn test_creates_parent_directory() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("nested").join("mirrorsync.lock");
            let _lock = SourceLock::acquire(&path, &sid(), Duration::from_secs(1))
                .await
                .unwrap();
            assert!(path.exists());
        }
    }

    mod target_lock_tests {
        use super::*;
        use async_trait::async_trait;
        use mirrorsync_core::domain::errors::ExecError;
        use mirrorsync_core::domain::event::HostRole;
        use mirrorsync_core::ports::executor::{CommandOutput, ICommandExecutor};
        use std::sync::Arc;

        /// Remote fake whose `start` plays back a scripted handshake.
        struct ScriptedRemote {
            events: std::sync::Mutex<Vec<CommandEvent>>,
        }

        impl ScriptedRemote {
            fn new(events: Vec<CommandEvent>) -> Arc<Self> {
                Arc::new(Self {
                    events: std::sync::Mutex::new(events),
                })
            }
        }

        #[async_trait]
        impl ICommandExecutor for ScriptedRemote {
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
                let (tx, rx) = tokio::sync::mpsc::channel(8);
                for event in self.events.lock().unwrap().drain(..) {
                    tx.try_send(event).unwrap();
                }
                // The sender stays alive so the stream models a holder
                // that is still running (no `None` after the script).
                std::mem::forget(tx);
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
        impl IRemoteExecutor for ScriptedRemote {
            async fn send_file(
                &self,
                _local: &Path,
                _remote: &Path,
            ) -> Result<(), ExecError> {
                Ok(())
            }

            async fn get_file(&self, _remote: &Path, _local: &Path) -> Result<(), ExecError> {
                Ok(())
            }

            async fn hostname(&self) -> Result<String, ExecError> {
                Ok("target".to_string())
            }
        }

        #[tokio::test]
        async fn test_acquire_succeeds_on_handshake() {
            let remote = ScriptedRemote::new(vec![CommandEvent::Stdout(
                TARGET_LOCK_TOKEN.to_string(),
            )]);
            let lock = TargetLock::acquire(
                remote.as_ref(),
                Path::new("/run/mirrorsync.lock"),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
            assert_eq!(lock.path(), Path::new("/run/mirrorsync.lock"));
        }

        #[tokio::test]
        async fn test_acquire_fails_when_holder_exits() {
            // flock -n exits 1 straight away when the lock is taken.
            let remote = ScriptedRemote::new(vec![CommandEvent::Exited(1)]);
            let err = TargetLock::acquire(
                remote.as_ref(),
                Path::new("/run/mirrorsync.lock"),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, LockError::TargetBusy { .. }));
        }

        #[tokio::test]
        async fn test_acquire_times_out_without_handshake() {
            let remote = ScriptedRemote::new(vec![]);
            let err = TargetLock::acquire(
                remote.as_ref(),
                Path::new("/run/mirrorsync.lock"),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, LockError::HandshakeTimeout(_)));
        }

        #[tokio::test]
        async fn test_noise_before_handshake_is_ignored() {
            let remote = ScriptedRemote::new(vec![
                CommandEvent::Stderr("Warning: Permanently added host".to_string()),
                CommandEvent::Stdout(TARGET_LOCK_TOKEN.to_string()),
            ]);
            assert!(TargetLock::acquire(
                remote.as_ref(),
                Path::new("/run/mirrorsync.lock"),
                Duration::from_secs(1),
            )
            .await
            .is_ok());
        }
    }
}
