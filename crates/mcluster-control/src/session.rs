//! Session-wide state and the cross-process session lock.
//!
//! A [`ClusterSession`] owns the lifecycle manager for one test run. Test harnesses start
//! it once, hand it to the fixture factories, and call [`ClusterSession::finish`] when the
//! run ends so no cluster outlives the session.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mcluster_config::ClusterConfigBuilder;
use mcluster_core::SessionId;
use mcluster_runner::Backends;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, info};

use crate::error::{ControlError, Result};
use crate::manager::ClusterLifecycleManager;
use crate::types::SessionSettings;

/// Advisory exclusive lock on a file, shared by every worker process of a test run.
///
/// The manager holds it while launching and tearing down clusters, so workers never bring
/// up clusters on the same ports at the same time.
#[derive(Debug, Clone)]
pub struct SessionLock {
    path: PathBuf,
}

/// Holds the session lock until dropped.
pub struct SessionLockGuard {
    _flock: Flock<File>,
}

impl std::fmt::Debug for SessionLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLockGuard").finish_non_exhaustive()
    }
}

impl SessionLock {
    /// Create a lock on `path`; the file is created on first use.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the lock.
    ///
    /// `flock` blocks, so the wait runs on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Lock` if the lock file cannot be opened or locked.
    pub async fn acquire(&self) -> Result<SessionLockGuard> {
        let path = self.path.clone();

        let flock = tokio::task::spawn_blocking(move || lock_file(&path))
            .await
            .map_err(|e| ControlError::Lock(io::Error::other(e)))?
            .map_err(ControlError::Lock)?;

        debug!(path = %self.path.display(), "Session lock acquired");
        Ok(SessionLockGuard { _flock: flock })
    }
}

fn lock_file(path: &Path) -> io::Result<Flock<File>> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;

    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| io::Error::from(errno))
}

/// Explicit state for one test session.
pub struct ClusterSession {
    id: SessionId,
    started_at: DateTime<Utc>,
    manager: Arc<ClusterLifecycleManager>,
    finished: AtomicBool,
}

impl ClusterSession {
    /// Start a session with the given settings and backends.
    #[must_use]
    pub fn start(settings: SessionSettings, backends: Backends) -> Self {
        let mut manager = ClusterLifecycleManager::new(
            backends,
            ClusterConfigBuilder::new(settings.defaults),
            settings.manager,
        );
        if let Some(path) = settings.lock_path {
            manager = manager.with_session_lock(SessionLock::new(path));
        }

        let id = SessionId::generate();
        info!(session_id = %id, "Cluster session started");

        Self {
            id,
            started_at: Utc::now(),
            manager: Arc::new(manager),
            finished: AtomicBool::new(false),
        }
    }

    /// Start a session configured entirely from the environment.
    pub async fn from_env() -> Self {
        Self::start(SessionSettings::from_env(), Backends::from_env().await)
    }

    /// The session's identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// When the session started.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The session's lifecycle manager.
    #[must_use]
    pub const fn manager(&self) -> &Arc<ClusterLifecycleManager> {
        &self.manager
    }

    /// Whether [`finish`](Self::finish) has run.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Tear down every cluster still registered and return how many were stopped.
    ///
    /// Only the first call does any work.
    pub async fn finish(&self) -> usize {
        if self.finished.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let stopped = self.manager.shutdown_all().await;
        info!(
            session_id = %self.id,
            clusters_stopped = stopped,
            elapsed_secs = (Utc::now() - self.started_at).num_seconds(),
            "Cluster session finished"
        );
        stopped
    }
}

impl std::fmt::Debug for ClusterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSession")
            .field("id", &self.id)
            .field("started_at", &self.started_at)
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use mcluster_core::{ScopeKey, Variant};
    use mcluster_runner::{BackendBinding, MockBackend};

    #[tokio::test]
    async fn lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let lock = SessionLock::new(dir.path().join("mcluster.lock"));

        let guard = lock.acquire().await.unwrap();
        assert!(lock.path().exists());

        // A second open file description must wait for the first guard.
        let contender = lock.clone();
        let waiting = tokio::spawn(async move { contender.acquire().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished());

        drop(guard);
        let second = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn lock_reports_unopenable_path() {
        let dir = tempfile::tempdir().unwrap();
        let lock = SessionLock::new(dir.path().join("missing").join("mcluster.lock"));

        let err = lock.acquire().await.unwrap_err();
        assert!(matches!(err, ControlError::Lock(_)));
    }

    #[tokio::test]
    async fn finish_tears_down_once() {
        let backend = Arc::new(MockBackend::new());
        let session = ClusterSession::start(
            SessionSettings::default(),
            Backends::uniform(BackendBinding::shared(backend.clone())),
        );

        session
            .manager()
            .acquire(&ScopeKey::session(Variant::Default))
            .await
            .unwrap();
        assert_eq!(backend.live_clusters(), 1);

        assert_eq!(session.finish().await, 1);
        assert!(session.is_finished());
        assert_eq!(backend.live_clusters(), 0);
        assert!(session.manager().active_keys().is_empty());

        assert_eq!(session.finish().await, 0);
        assert_eq!(backend.terminate_count(), 1);
    }
}
