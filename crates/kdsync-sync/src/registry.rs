//! Session registry
//!
//! Keeps the runtime handle of every session next to its persisted row:
//! the cancellation token of the running cycle and the cycle lock that
//! serializes cycles of one session.
//!
//! ## Design Notes
//!
//! - Roots are canonicalized before the nesting check, so a symlinked
//!   alias of an existing root is rejected too.
//! - Adds are serialized: the nesting check and the insert of one add
//!   never interleave with another add.
//! - Pause and removal go through `Draining`: the token is cancelled and
//!   the call waits for the running cycle to hand back the cycle lock.
//!   Actions that did not finish stay `SyncPending`.
//! - Removal only deletes store rows. Files on disk are left alone.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use kdsync_core::domain::{RemotePath, SessionId, SessionStatus, SyncEvent, SyncPath, SyncSession};
use kdsync_core::ports::{IEventSink, IStateRepository};

use crate::error::SyncError;

/// Runtime state of one session
#[derive(Debug, Default)]
pub struct SessionHandle {
    token: Mutex<CancellationToken>,
    cycle: Arc<AsyncMutex<()>>,
    deleting: AtomicBool,
}

impl SessionHandle {
    /// Token of the current run; cancelled on pause and removal
    pub fn token(&self) -> CancellationToken {
        self.token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn cancel(&self) {
        self.token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .cancel();
    }

    fn renew(&self) {
        *self
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = CancellationToken::new();
    }

    /// Waits for the running cycle, if any, and keeps others out
    pub async fn lock_cycle(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.cycle).lock_owned().await
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::SeqCst)
    }
}

/// Sessions known to the engine
pub struct SessionRegistry {
    repository: Arc<dyn IStateRepository>,
    events: Arc<dyn IEventSink>,
    handles: DashMap<SessionId, Arc<SessionHandle>>,
    add_lock: AsyncMutex<()>,
}

impl SessionRegistry {
    pub fn new(repository: Arc<dyn IStateRepository>, events: Arc<dyn IEventSink>) -> Self {
        Self {
            repository,
            events,
            handles: DashMap::new(),
            add_lock: AsyncMutex::new(()),
        }
    }

    /// Registers the handles of every persisted session
    ///
    /// Handles of sessions whose rows are gone (removed by another process)
    /// are cancelled and dropped.
    pub async fn load(&self) -> Result<Vec<SyncSession>, SyncError> {
        let sessions = self.repository.list_sessions().await?;
        for session in &sessions {
            self.handles.entry(*session.id()).or_default();
        }
        self.handles.retain(|id, handle| {
            let keep = handle.is_deleting() || sessions.iter().any(|s| s.id() == id);
            if !keep {
                handle.cancel();
            }
            keep
        });
        debug!(count = sessions.len(), "Sessions loaded");
        Ok(sessions)
    }

    pub fn handle(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.handles.get(id).map(|h| Arc::clone(h.value()))
    }

    pub async fn get(&self, id: &SessionId) -> Result<SyncSession, SyncError> {
        self.repository
            .get_session(id)
            .await?
            .ok_or(SyncError::SessionNotFound(*id))
    }

    pub async fn list(&self) -> Result<Vec<SyncSession>, SyncError> {
        Ok(self.repository.list_sessions().await?)
    }

    /// Creates a session over `local_root`
    ///
    /// # Errors
    /// - `IoError` if the root cannot be canonicalized
    /// - `NestedSession` if it contains, or is contained by, another root
    #[instrument(skip(self, remote_root), fields(local_root = %local_root.display()))]
    pub async fn add(
        &self,
        name: &str,
        local_root: &Path,
        remote_root: RemotePath,
        lite_sync: bool,
    ) -> Result<SyncSession, SyncError> {
        let _adding = self.add_lock.lock().await;
        let canonical = tokio::fs::canonicalize(local_root).await?;
        let root = SyncPath::new(canonical)?;

        for existing in self.repository.list_sessions().await? {
            let other = match tokio::fs::canonicalize(existing.local_root().as_path()).await {
                Ok(path) => SyncPath::new(path)?,
                Err(_) => existing.local_root().clone(),
            };
            if other.nests_with(&root) {
                return Err(SyncError::NestedSession {
                    path: root.as_path().to_path_buf(),
                    existing: other.as_path().to_path_buf(),
                });
            }
        }

        let session = SyncSession::new(name, root, remote_root).with_lite_sync(lite_sync);
        self.repository.save_session(&session).await?;
        self.handles.insert(*session.id(), Arc::new(SessionHandle::default()));

        info!(session_id = %session.id(), name, "Session added");
        self.events.emit(SyncEvent::SessionAdded {
            session_id: *session.id(),
            local_root: session.local_root().to_string(),
        });
        Ok(session)
    }

    /// Drains then pauses a session
    ///
    /// Pausing a paused session is a no-op.
    #[instrument(skip(self))]
    pub async fn pause(&self, id: &SessionId, reason: &str) -> Result<SyncSession, SyncError> {
        let handle = self.live_handle(id)?;
        let mut session = self.get(id).await?;
        if session.status() == SessionStatus::Paused {
            return Ok(session);
        }

        session.transition_to(SessionStatus::Draining, None)?;
        self.repository.save_session(&session).await?;
        handle.cancel();
        let _cycle = handle.lock_cycle().await;

        // The cycle may have saved the session meanwhile
        let mut session = self.get(id).await?;
        if session.status() != SessionStatus::Draining {
            session.transition_to(SessionStatus::Draining, None)?;
        }
        session.transition_to(SessionStatus::Paused, Some(reason.to_string()))?;
        self.repository.save_session(&session).await?;

        info!(session_id = %id, reason, "Session paused");
        self.events.emit(SyncEvent::SessionPaused {
            session_id: *id,
            reason: reason.to_string(),
        });
        Ok(session)
    }

    /// Reactivates a paused or failed session
    #[instrument(skip(self))]
    pub async fn resume(&self, id: &SessionId) -> Result<SyncSession, SyncError> {
        let handle = self.live_handle(id)?;
        let mut session = self.get(id).await?;
        if session.status() == SessionStatus::Active {
            return Ok(session);
        }
        session.transition_to(SessionStatus::Active, None)?;
        handle.renew();
        self.repository.save_session(&session).await?;

        info!(session_id = %id, "Session resumed");
        self.events.emit(SyncEvent::SessionResumed { session_id: *id });
        Ok(session)
    }

    /// Stops a session and deletes its store rows
    #[instrument(skip(self))]
    pub async fn remove(&self, id: &SessionId) -> Result<(), SyncError> {
        let handle = self.live_handle(id)?;
        handle.deleting.store(true, Ordering::SeqCst);
        let mut session = self.get(id).await?;

        if session.status() != SessionStatus::Draining {
            if let Err(e) = session.transition_to(SessionStatus::Draining, None) {
                debug!(session_id = %id, error = %e, "Removing without draining");
            } else {
                self.repository.save_session(&session).await?;
            }
        }
        handle.cancel();
        let _cycle = handle.lock_cycle().await;

        self.repository.delete_session(id).await?;
        self.handles.remove(id);

        info!(session_id = %id, "Session removed");
        self.events.emit(SyncEvent::SessionRemoved { session_id: *id });
        Ok(())
    }

    /// Handle of a session that is not being deleted
    fn live_handle(&self, id: &SessionId) -> Result<Arc<SessionHandle>, SyncError> {
        let handle = self.handle(id).ok_or(SyncError::SessionNotFound(*id))?;
        if handle.is_deleting() {
            return Err(SyncError::SessionBeingDeleted(*id));
        }
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdsync_cache::{DatabasePool, SqliteStateRepository};
    use kdsync_core::ports::NullEventSink;
    use tempfile::TempDir;

    async fn registry() -> SessionRegistry {
        let pool = DatabasePool::in_memory().await.unwrap();
        SessionRegistry::new(
            Arc::new(SqliteStateRepository::new(pool.pool().clone())),
            Arc::new(NullEventSink),
        )
    }

    mod add {
        use super::*;

        #[tokio::test]
        async fn test_add_persists_session() {
            let registry = registry().await;
            let dir = TempDir::new().unwrap();
            let session = registry
                .add("docs", dir.path(), RemotePath::root(), false)
                .await
                .unwrap();

            let listed = registry.list().await.unwrap();
            assert_eq!(listed.len(), 1);
            assert_eq!(listed[0].id(), session.id());
            assert_eq!(session.status(), SessionStatus::Active);
            assert!(registry.handle(session.id()).is_some());
        }

        #[tokio::test]
        async fn test_rejects_nested_roots_both_ways() {
            let registry = registry().await;
            let dir = TempDir::new().unwrap();
            let inner = dir.path().join("inner");
            std::fs::create_dir(&inner).unwrap();

            registry
                .add("inner", &inner, RemotePath::root(), false)
                .await
                .unwrap();
            let outer = registry
                .add("outer", dir.path(), RemotePath::root(), false)
                .await;
            assert!(matches!(outer, Err(SyncError::NestedSession { .. })));

            let deeper = inner.join("deeper");
            std::fs::create_dir(&deeper).unwrap();
            let nested = registry
                .add("deeper", &deeper, RemotePath::root(), false)
                .await;
            let err = nested.unwrap_err();
            assert_eq!(err.error_code().unwrap().code(), "nested_session");
        }

        #[tokio::test]
        async fn test_siblings_are_accepted() {
            let registry = registry().await;
            let dir = TempDir::new().unwrap();
            let a = dir.path().join("a");
            let ab = dir.path().join("ab");
            std::fs::create_dir(&a).unwrap();
            std::fs::create_dir(&ab).unwrap();

            registry.add("a", &a, RemotePath::root(), false).await.unwrap();
            registry.add("ab", &ab, RemotePath::root(), false).await.unwrap();
            assert_eq!(registry.list().await.unwrap().len(), 2);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_concurrent_nested_adds_admit_one() {
            let registry = Arc::new(registry().await);
            let dir = TempDir::new().unwrap();
            let inner = dir.path().join("inner");
            std::fs::create_dir(&inner).unwrap();

            let outer = {
                let registry = Arc::clone(&registry);
                let root = dir.path().to_path_buf();
                tokio::spawn(async move { registry.add("outer", &root, RemotePath::root(), false).await })
            };
            let nested = {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.add("inner", &inner, RemotePath::root(), false).await })
            };
            let results = [outer.await.unwrap(), nested.await.unwrap()];

            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            assert!(results
                .iter()
                .any(|r| matches!(r, Err(SyncError::NestedSession { .. }))));
            assert_eq!(registry.list().await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_missing_root_is_io_error() {
            let registry = registry().await;
            let dir = TempDir::new().unwrap();
            let result = registry
                .add("gone", &dir.path().join("missing"), RemotePath::root(), false)
                .await;
            assert!(matches!(result, Err(SyncError::IoError(_))));
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_pause_cancels_and_resume_renews_token() {
            let registry = registry().await;
            let dir = TempDir::new().unwrap();
            let session = registry
                .add("docs", dir.path(), RemotePath::root(), false)
                .await
                .unwrap();
            let handle = registry.handle(session.id()).unwrap();
            let token = handle.token();

            let paused = registry.pause(session.id(), "user request").await.unwrap();
            assert_eq!(paused.status(), SessionStatus::Paused);
            assert_eq!(paused.status_detail(), Some("user request"));
            assert!(token.is_cancelled());

            let resumed = registry.resume(session.id()).await.unwrap();
            assert_eq!(resumed.status(), SessionStatus::Active);
            assert!(!handle.token().is_cancelled());
        }

        #[tokio::test]
        async fn test_remove_deletes_rows_and_keeps_files() {
            let registry = registry().await;
            let dir = TempDir::new().unwrap();
            std::fs::write(dir.path().join("keep.txt"), b"data").unwrap();
            let session = registry
                .add("docs", dir.path(), RemotePath::root(), false)
                .await
                .unwrap();

            registry.remove(session.id()).await.unwrap();
            assert!(registry.list().await.unwrap().is_empty());
            assert!(registry.handle(session.id()).is_none());
            assert!(dir.path().join("keep.txt").exists());
            assert!(matches!(
                registry.pause(session.id(), "x").await,
                Err(SyncError::SessionNotFound(_))
            ));
        }

        #[tokio::test]
        async fn test_commands_refused_while_deleting() {
            let registry = registry().await;
            let dir = TempDir::new().unwrap();
            let session = registry
                .add("docs", dir.path(), RemotePath::root(), false)
                .await
                .unwrap();
            let handle = registry.handle(session.id()).unwrap();
            let cycle = handle.lock_cycle().await;

            let id = *session.id();
            let registry = &registry;
            let removing = async move { registry.remove(&id).await };
            let check = async move {
                // let remove mark the session and block on the cycle lock
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                }
                let refused = registry.resume(&id).await;
                assert!(matches!(refused, Err(SyncError::SessionBeingDeleted(_))));
                drop(cycle);
            };
            let (removed, ()) = tokio::join!(removing, check);
            removed.unwrap();
        }
    }
}
