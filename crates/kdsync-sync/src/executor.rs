//! Worker pool executing planned actions
//!
//! Waves run one after the other; inside a wave every item gets its own
//! task and its actions run in plan order. Workers never touch the store:
//! each action yields an [`ActionOutcome`] that the session consumer
//! applies.
//!
//! ## Design Notes
//!
//! - At most one action per item is in flight across all sessions, through
//!   a keyed lock map.
//! - Every action holds a slot of the shared [`ResourceCeiling`]; transfers
//!   also draw their size from its bandwidth bucket.
//! - Downloads land in a temp sibling and are renamed into place; a
//!   cancelled or failed download removes the temp file.
//! - Once the session is cancelled no new action starts. Actions that did
//!   not run are reported as skipped and stay pending.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn, Instrument};

use kdsync_core::domain::{ActionKind, RelativePath, RemoteId, SyncAction, SyncSession, UniqueId};
use kdsync_core::ports::{
    IPlaceholderHydrator, ILocalFileSystem, IRemoteDrive, LocalEntry, RemoteEntry, RemoteError,
};

use crate::error::{ActionFailure, Cancelled};
use crate::plan::Wave;
use crate::throttle::ResourceCeiling;

/// What a successful action left behind
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Effect {
    /// Local entry at the action's target, hash filled in when known
    pub local: Option<LocalEntry>,
    /// Remote entry returned by the drive
    pub remote: Option<RemoteEntry>,
}

impl Effect {
    fn local(entry: LocalEntry) -> Self {
        Self {
            local: Some(entry),
            remote: None,
        }
    }

    fn remote(entry: RemoteEntry) -> Self {
        Self {
            local: None,
            remote: Some(entry),
        }
    }
}

/// How an action ended
#[derive(Debug, Clone, PartialEq)]
pub enum ActionStatus {
    Done(Effect),
    Failed(ActionFailure),
    /// Not run: cancelled session, or an earlier action it depends on failed
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub action: SyncAction,
    pub status: ActionStatus,
}

impl ActionOutcome {
    fn skipped(action: SyncAction) -> Self {
        Self {
            action,
            status: ActionStatus::Skipped,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.status, ActionStatus::Done(_))
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Adapters shared by every worker task
#[derive(Clone)]
struct Worker {
    fs: Arc<dyn ILocalFileSystem>,
    remote: Arc<dyn IRemoteDrive>,
    hydrator: Option<Arc<dyn IPlaceholderHydrator>>,
    ceiling: Arc<ResourceCeiling>,
}

impl Worker {
    async fn run(
        &self,
        session: &SyncSession,
        action: &SyncAction,
        dehydrated: bool,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Effect> {
        let _slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            slot = self.ceiling.acquire() => slot?,
        };
        if dehydrated && matches!(action.kind, ActionKind::Upload { .. } | ActionKind::SetAside { .. }) {
            self.hydrate(session, &action.item_id, action.path(), None, cancel)
                .await?;
        }
        self.perform(session, action, cancel).await
    }

    async fn perform(
        &self,
        session: &SyncSession,
        action: &SyncAction,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Effect> {
        let root = session.local_root();
        let remote_root = session.remote_root();
        match &action.kind {
            ActionKind::Download { remote_id, path }
            | ActionKind::DownloadCopy {
                remote_id, to: path, ..
            } => self.download(session, remote_id, path, cancel).await,
            ActionKind::Upload { path, remote_id } => {
                let entry = self
                    .fs
                    .stat(root, path)
                    .await?
                    .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))?;
                self.ceiling.bandwidth().consume(entry.size).await;
                let source = root.resolve(path);
                let uploaded = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Cancelled.into()),
                    r = self.remote.upload(remote_root, path, &source, remote_id.as_ref()) => r?,
                };
                let local = LocalEntry {
                    hash: uploaded.fingerprint.hash.clone(),
                    ..entry
                };
                Ok(Effect {
                    local: Some(local),
                    remote: Some(uploaded),
                })
            }
            ActionKind::CreateLocalFolder { path } => {
                self.fs.create_dir_all(root, path).await?;
                Ok(Effect {
                    local: self.fs.stat(root, path).await?,
                    remote: None,
                })
            }
            ActionKind::CreateRemoteFolder { path } => {
                let created = self.remote.create_folder(remote_root, path).await?;
                let local = self.fs.stat(root, path).await?;
                Ok(Effect {
                    local,
                    remote: Some(created),
                })
            }
            ActionKind::MoveLocal { from, to } => {
                self.fs.rename(root, from, to).await?;
                Ok(Effect {
                    local: self.fs.stat(root, to).await?,
                    remote: None,
                })
            }
            ActionKind::MoveRemote { remote_id, to, .. } => {
                let moved = self.remote.move_item(remote_root, remote_id, to).await?;
                Ok(Effect::remote(moved))
            }
            ActionKind::DeleteLocal { path } => {
                self.fs.remove(root, path).await?;
                Ok(Effect::default())
            }
            ActionKind::DeleteRemote { remote_id, path } => {
                match self.remote.delete_item(remote_root, remote_id).await {
                    Ok(()) => Ok(Effect::default()),
                    Err(e) if is_not_found(&e) => {
                        debug!(path = %path, "Remote item already gone");
                        Ok(Effect::default())
                    }
                    Err(e) => Err(e),
                }
            }
            ActionKind::SetAside { from, to, .. } => {
                self.fs.rename(root, from, to).await?;
                let mut entry = self
                    .fs
                    .stat(root, to)
                    .await?
                    .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))?;
                if !entry.is_directory {
                    entry.hash = Some(self.fs.hash_file(root, to).await?);
                }
                Ok(Effect::local(entry))
            }
            ActionKind::Hydrate { remote_id, path } => {
                self.hydrate(session, &action.item_id, path, Some(remote_id), cancel)
                    .await
            }
            ActionKind::CreatePlaceholder { .. }
            | ActionKind::UpdatePlaceholder { .. }
            | ActionKind::Link { .. }
            | ActionKind::Forget { .. } => Ok(Effect::default()),
        }
    }

    /// Fetches remote content into `path` through a temp sibling
    async fn download(
        &self,
        session: &SyncSession,
        remote_id: &RemoteId,
        path: &RelativePath,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Effect> {
        let root = session.local_root();
        if let Some(parent) = path.parent() {
            self.fs.create_dir_all(root, &parent).await?;
        }
        let temp = self.fs.temp_path(root, path);
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled.into()),
            r = self.remote.download(session.remote_root(), remote_id, &temp, None) => r,
        };
        let fingerprint = match fetched {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                if let Err(cleanup) = self.fs.discard(&temp).await {
                    warn!(temp = %temp.display(), error = %cleanup, "Failed to remove temp file");
                }
                return Err(e);
            }
        };
        self.ceiling.bandwidth().consume(fingerprint.size).await;
        let entry = self.fs.commit(root, &temp, path).await?;
        Ok(Effect::local(LocalEntry {
            hash: fingerprint.hash.clone().or(entry.hash.clone()),
            ..entry
        }))
    }

    async fn hydrate(
        &self,
        session: &SyncSession,
        item_id: &UniqueId,
        path: &RelativePath,
        remote_id: Option<&RemoteId>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Effect> {
        match (&self.hydrator, remote_id) {
            (Some(hydrator), _) => {
                hydrator.ensure_hydrated(item_id).await?;
                let mut entry = self
                    .fs
                    .stat(session.local_root(), path)
                    .await?
                    .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))?;
                entry.hash = Some(self.fs.hash_file(session.local_root(), path).await?);
                Ok(Effect::local(entry))
            }
            (None, Some(remote_id)) => self.download(session, remote_id, path, cancel).await,
            (None, None) => Err(anyhow::anyhow!("no hydrator available for {path}")),
        }
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|c| c.downcast_ref::<RemoteError>())
        .any(|e| matches!(e, RemoteError::NotFound(_)))
}

// ============================================================================
// ActionExecutor
// ============================================================================

/// Runs waves of actions with per-item serialization
#[derive(Clone)]
pub struct ActionExecutor {
    worker: Worker,
    item_locks: Arc<DashMap<UniqueId, Arc<Mutex<()>>>>,
}

impl ActionExecutor {
    pub fn new(
        fs: Arc<dyn ILocalFileSystem>,
        remote: Arc<dyn IRemoteDrive>,
        ceiling: Arc<ResourceCeiling>,
    ) -> Self {
        Self {
            worker: Worker {
                fs,
                remote,
                hydrator: None,
                ceiling,
            },
            item_locks: Arc::new(DashMap::new()),
        }
    }

    /// Content actions on dehydrated items go through `hydrator` first
    pub fn with_hydrator(mut self, hydrator: Arc<dyn IPlaceholderHydrator>) -> Self {
        self.worker.hydrator = Some(hydrator);
        self
    }

    pub fn ceiling(&self) -> &Arc<ResourceCeiling> {
        &self.worker.ceiling
    }

    /// Number of items with an action in flight or waiting for their lock
    pub fn busy_items(&self) -> usize {
        self.item_locks.len()
    }

    /// Runs every wave, returning one outcome per action
    ///
    /// `dehydrated` lists the items without local content.
    #[instrument(skip_all, fields(session_id = %session.id(), waves = waves.len()))]
    pub async fn run(
        &self,
        session: &SyncSession,
        waves: Vec<Wave>,
        dehydrated: &HashSet<UniqueId>,
        cancel: &CancellationToken,
    ) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::new();
        let mut failed: HashSet<UniqueId> = HashSet::new();

        for wave in waves {
            if cancel.is_cancelled() {
                outcomes.extend(wave.actions.into_iter().map(ActionOutcome::skipped));
                continue;
            }
            debug!(phase = wave.phase.as_str(), depth = wave.depth, actions = wave.actions.len(), "Running wave");

            let mut tasks = JoinSet::new();
            for (item_id, actions) in wave.by_item() {
                let blocked = failed.contains(&item_id)
                    || actions
                        .iter()
                        .any(|a| a.requires.is_some_and(|r| failed.contains(&r)));
                if blocked {
                    outcomes.extend(actions.into_iter().map(ActionOutcome::skipped));
                    continue;
                }
                let executor = self.clone();
                let session = session.clone();
                let cancel = cancel.clone();
                let is_dehydrated = dehydrated.contains(&item_id);
                let span = tracing::debug_span!("item", item_id = %item_id);
                tasks.spawn(
                    async move {
                        executor
                            .run_item(&session, item_id, actions, is_dehydrated, &cancel)
                            .await
                    }
                    .instrument(span),
                );
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(item_outcomes) => {
                        for outcome in item_outcomes {
                            if matches!(outcome.status, ActionStatus::Failed(_)) {
                                failed.insert(outcome.action.item_id);
                            }
                            outcomes.push(outcome);
                        }
                    }
                    Err(e) => warn!(error = %e, "Worker task panicked"),
                }
            }
        }
        outcomes
    }

    /// Runs the actions of one item in order, stopping at the first failure
    async fn run_item(
        &self,
        session: &SyncSession,
        item_id: UniqueId,
        actions: Vec<SyncAction>,
        dehydrated: bool,
        cancel: &CancellationToken,
    ) -> Vec<ActionOutcome> {
        let lock = self
            .item_locks
            .entry(item_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        let mut outcomes = Vec::with_capacity(actions.len());
        let mut stopped = false;
        for action in actions {
            if stopped || cancel.is_cancelled() {
                outcomes.push(ActionOutcome::skipped(action));
                continue;
            }
            let status = match self.worker.run(session, &action, dehydrated, cancel).await {
                Ok(effect) => {
                    debug!(action = %action, "Action done");
                    ActionStatus::Done(effect)
                }
                Err(e) => {
                    let failure = ActionFailure::classify(&e, action.path());
                    warn!(action = %action, error = %format!("{e:#}"), code = failure.error.code(), "Action failed");
                    stopped = true;
                    ActionStatus::Failed(failure)
                }
            };
            outcomes.push(ActionOutcome { action, status });
        }

        drop(guard);
        self.item_locks
            .remove_if(&item_id, |_, l| Arc::strong_count(l) == 2);
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::TempDir;

    use kdsync_core::domain::{Phase, RemotePath, SyncPath};

    use super::*;
    use crate::error::FailureKind;
    use crate::filesystem::LocalFileSystem;
    use crate::plan::into_waves;
    use crate::remote_dir::DirectoryRemoteDrive;

    fn path(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    struct Fixture {
        local: TempDir,
        remote_dir: TempDir,
        drive: Arc<DirectoryRemoteDrive>,
        executor: ActionExecutor,
        session: SyncSession,
    }

    async fn fixture() -> Fixture {
        let local = TempDir::new().unwrap();
        let remote_dir = TempDir::new().unwrap();
        let drive = Arc::new(DirectoryRemoteDrive::open(remote_dir.path()).await.unwrap());
        let executor = ActionExecutor::new(
            Arc::new(LocalFileSystem::new()),
            drive.clone(),
            Arc::new(ResourceCeiling::new(2, 0)),
        );
        let session = SyncSession::new(
            "test",
            SyncPath::new(local.path().to_path_buf()).unwrap(),
            RemotePath::root(),
        );
        Fixture {
            local,
            remote_dir,
            drive,
            executor,
            session,
        }
    }

    fn temp_files(dir: &std::path::Path) -> Vec<PathBuf> {
        walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| {
                kdsync_core::ports::is_temp_file_name(&e.file_name().to_string_lossy())
            })
            .map(|e| e.into_path())
            .collect()
    }

    #[tokio::test]
    async fn test_upload_then_download_into_subfolder() {
        let fx = fixture().await;
        std::fs::write(fx.local.path().join("a.txt"), b"hello").unwrap();
        let item = UniqueId::new();

        let outcomes = fx
            .executor
            .run(
                &fx.session,
                into_waves(vec![SyncAction::new(
                    item,
                    ActionKind::Upload {
                        path: path("a.txt"),
                        remote_id: None,
                    },
                )]),
                &HashSet::new(),
                &CancellationToken::new(),
            )
            .await;
        let ActionStatus::Done(effect) = &outcomes[0].status else {
            panic!("upload failed: {outcomes:?}");
        };
        let uploaded = effect.remote.clone().unwrap();
        assert_eq!(effect.local.as_ref().unwrap().hash, uploaded.fingerprint.hash);
        assert!(fx.remote_dir.path().join("a.txt").exists());

        let outcomes = fx
            .executor
            .run(
                &fx.session,
                into_waves(vec![SyncAction::new(
                    item,
                    ActionKind::Download {
                        remote_id: uploaded.remote_id,
                        path: path("copy/b.txt"),
                    },
                )]),
                &HashSet::new(),
                &CancellationToken::new(),
            )
            .await;
        assert!(outcomes[0].is_done(), "{outcomes:?}");
        assert_eq!(std::fs::read(fx.local.path().join("copy/b.txt")).unwrap(), b"hello");
        assert!(temp_files(fx.local.path()).is_empty());
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_file() {
        let fx = fixture().await;
        let outcomes = fx
            .executor
            .run(
                &fx.session,
                into_waves(vec![SyncAction::new(
                    UniqueId::new(),
                    ActionKind::Download {
                        remote_id: RemoteId::new("item-99999999".to_string()).unwrap(),
                        path: path("ghost.txt"),
                    },
                )]),
                &HashSet::new(),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(outcomes[0].status, ActionStatus::Failed(_)));
        assert!(!fx.local.path().join("ghost.txt").exists());
        assert!(temp_files(fx.local.path()).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_session_skips_everything() {
        let fx = fixture().await;
        std::fs::write(fx.local.path().join("a.txt"), b"x").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcomes = fx
            .executor
            .run(
                &fx.session,
                into_waves(vec![SyncAction::new(
                    UniqueId::new(),
                    ActionKind::Upload {
                        path: path("a.txt"),
                        remote_id: None,
                    },
                )]),
                &HashSet::new(),
                &cancel,
            )
            .await;
        assert_eq!(outcomes[0].status, ActionStatus::Skipped);
        assert!(!fx.remote_dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_failure_skips_dependent_actions() {
        let fx = fixture().await;
        let item = UniqueId::new();
        let copy = UniqueId::new();
        let actions = vec![
            // source does not exist
            SyncAction::new(
                item,
                ActionKind::SetAside {
                    from: path("missing.txt"),
                    to: path("missing (1).txt"),
                    new_item: copy,
                    forget_original: true,
                },
            ),
            SyncAction::new(
                copy,
                ActionKind::Upload {
                    path: path("missing (1).txt"),
                    remote_id: None,
                },
            )
            .requiring(item),
        ];
        let waves = into_waves(actions);
        assert_eq!(waves[0].phase, Phase::Preserve);

        let outcomes = fx
            .executor
            .run(&fx.session, waves, &HashSet::new(), &CancellationToken::new())
            .await;
        assert!(matches!(outcomes[0].status, ActionStatus::Failed(_)));
        assert_eq!(outcomes[1].status, ActionStatus::Skipped);
        assert_eq!(fx.executor.busy_items(), 0);
    }

    #[tokio::test]
    async fn test_delete_of_missing_remote_item_succeeds() {
        let fx = fixture().await;
        let outcomes = fx
            .executor
            .run(
                &fx.session,
                into_waves(vec![SyncAction::new(
                    UniqueId::new(),
                    ActionKind::DeleteRemote {
                        remote_id: RemoteId::new("item-00000042".to_string()).unwrap(),
                        path: path("gone.txt"),
                    },
                )]),
                &HashSet::new(),
                &CancellationToken::new(),
            )
            .await;
        assert!(outcomes[0].is_done(), "{outcomes:?}");
    }

    #[tokio::test]
    async fn test_forbidden_upload_is_classified_for_blacklist() {
        let fx = fixture().await;
        std::fs::write(fx.local.path().join("a.txt"), b"v1").unwrap();
        let uploaded = fx
            .drive
            .upload(
                &RemotePath::root(),
                &path("a.txt"),
                &fx.local.path().join("a.txt"),
                None,
            )
            .await
            .unwrap();
        fx.drive.set_read_only(&path("a.txt"), true).await.unwrap();
        std::fs::write(fx.local.path().join("a.txt"), b"v2").unwrap();

        let outcomes = fx
            .executor
            .run(
                &fx.session,
                into_waves(vec![SyncAction::new(
                    UniqueId::new(),
                    ActionKind::Upload {
                        path: path("a.txt"),
                        remote_id: Some(uploaded.remote_id),
                    },
                )]),
                &HashSet::new(),
                &CancellationToken::new(),
            )
            .await;
        let ActionStatus::Failed(failure) = &outcomes[0].status else {
            panic!("expected failure: {outcomes:?}");
        };
        assert!(matches!(failure.kind, FailureKind::Blacklist(_)));
    }
}
