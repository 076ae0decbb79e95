//! Command API of the sync engine
//!
//! [`SyncService`] is the single entry point used by the daemon and the
//! CLI. It owns the session registry, the session consumer shared by all
//! sessions, the resource ceiling and the placeholder manager.
//!
//! ## Design Notes
//!
//! - Cycles of one session never overlap: `run_cycle` holds the session's
//!   cycle lock, which pause and removal also wait for.
//! - Runtime settings changed through the API (resource ceiling,
//!   large-folder threshold) are persisted in the store and reapplied by
//!   [`SyncService::start`].
//! - A folder the user excludes shares the `Excluded` state with folders
//!   held for large-folder confirmation; confirming re-admits either kind.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use kdsync_conflict::{policy_applies, BlacklistManager, ConflictError, ExclusionMatcher};
use kdsync_core::config::Config;
use kdsync_core::domain::{
    BlacklistEntry, ConflictId, ConflictPolicy, ConflictRecord, CycleSummary, DeltaKind,
    PlaceholderState, RelativePath, RemotePath, SessionId, SyncItem, SyncSession, SyncState,
    UniqueId,
};
use kdsync_core::ports::{ILocalFileSystem, IPlaceholderHydrator, IStateRepository, ItemFilter};
use kdsync_litesync::PlaceholderManager;

use crate::consumer::{EngineDeps, SessionConsumer};
use crate::delta::local_delta;
use crate::error::SyncError;
use crate::registry::{SessionHandle, SessionRegistry};
use crate::throttle::ResourceCeiling;

const SETTING_LARGE_FOLDER_MB: &str = "sync.large_folder_threshold_mb";
const SETTING_MAX_CONCURRENT: &str = "resources.max_concurrent_actions";
const SETTING_BANDWIDTH_KBPS: &str = "resources.bandwidth_limit_kbps";

/// Item counts of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub name: String,
    pub local_root: String,
    pub status: String,
    pub status_detail: Option<String>,
    pub lite_sync: bool,
    pub items: usize,
    pub pending: usize,
    pub conflicted: usize,
    pub blacklisted: usize,
    pub excluded: usize,
    pub dehydrated: usize,
}

/// Snapshot returned by [`SyncService::status`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub sessions: Vec<SessionReport>,
    pub max_concurrent_actions: usize,
    pub bandwidth_limit_kbps: u64,
    pub large_folder_threshold_mb: u64,
    pub busy_items: usize,
}

/// Engine facade
pub struct SyncService {
    repository: Arc<dyn IStateRepository>,
    fs: Arc<dyn ILocalFileSystem>,
    registry: Arc<SessionRegistry>,
    consumer: Arc<SessionConsumer>,
    ceiling: Arc<ResourceCeiling>,
    placeholders: PlaceholderManager,
    exclusions: ExclusionMatcher,
}

impl SyncService {
    /// Wires the engine
    ///
    /// A placeholder manager is built over the same adapters and used as the
    /// hydrator unless `deps` already carries one.
    pub fn new(config: &Config, mut deps: EngineDeps) -> Self {
        let placeholders = PlaceholderManager::new(
            Arc::clone(&deps.repository),
            Arc::clone(&deps.remote),
            Arc::clone(&deps.events),
            &config.litesync,
        );
        if deps.hydrator.is_none() {
            deps.hydrator = Some(Arc::new(placeholders.clone()) as Arc<dyn IPlaceholderHydrator>);
        }
        Self {
            repository: Arc::clone(&deps.repository),
            fs: Arc::clone(&deps.fs),
            registry: Arc::new(SessionRegistry::new(
                Arc::clone(&deps.repository),
                Arc::clone(&deps.events),
            )),
            ceiling: Arc::clone(&deps.ceiling),
            consumer: Arc::new(SessionConsumer::new(config, deps)),
            placeholders,
            exclusions: ExclusionMatcher::new(&config.exclusions),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn placeholders(&self) -> &PlaceholderManager {
        &self.placeholders
    }

    fn blacklist(&self) -> &Arc<BlacklistManager> {
        self.consumer.blacklist()
    }

    /// Loads sessions and persisted settings
    ///
    /// Temporary blacklist entries are released when configured, and
    /// hydration queues left by a previous run are resumed in the
    /// background.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<Vec<SyncSession>, SyncError> {
        let sessions = self.attach().await?;

        let released = self.blacklist().release_temporary_on_startup().await?;
        if !released.is_empty() {
            info!(count = released.len(), "Temporary blacklist entries released");
        }
        for session in &sessions {
            if !self.repository.pending_hydrations(session.id()).await?.is_empty() {
                self.spawn_hydration_queue(session.id());
            }
        }
        info!(sessions = sessions.len(), "Sync service started");
        Ok(sessions)
    }

    /// Loads sessions and persisted settings only
    ///
    /// For short-lived command clients sharing the store with a running
    /// daemon.
    pub async fn attach(&self) -> Result<Vec<SyncSession>, SyncError> {
        let sessions = self.registry.load().await?;
        self.restore_settings().await?;
        Ok(sessions)
    }

    async fn restore_settings(&self) -> Result<(), SyncError> {
        if let Some(mb) = self.numeric_setting(SETTING_LARGE_FOLDER_MB).await? {
            self.consumer.set_large_folder_threshold_mb(mb);
        }
        let concurrency = self.numeric_setting(SETTING_MAX_CONCURRENT).await?;
        let kbps = self.numeric_setting(SETTING_BANDWIDTH_KBPS).await?;
        if concurrency.is_some() || kbps.is_some() {
            let concurrency = concurrency
                .and_then(|c| usize::try_from(c).ok())
                .unwrap_or_else(|| self.ceiling.limit());
            let kbps = kbps.unwrap_or_else(|| self.ceiling.bandwidth().rate_kbps());
            self.ceiling.set_limits(concurrency, kbps);
        }
        Ok(())
    }

    async fn numeric_setting(&self, key: &str) -> Result<Option<u64>, SyncError> {
        let Some(raw) = self.repository.get_setting(key).await? else {
            return Ok(None);
        };
        match raw.parse::<u64>() {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key, value = %raw, error = %e, "Ignoring invalid stored setting");
                Ok(None)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    pub async fn add_session(
        &self,
        name: &str,
        local_root: &Path,
        remote_root: RemotePath,
        lite_sync: bool,
    ) -> Result<SyncSession, SyncError> {
        self.registry.add(name, local_root, remote_root, lite_sync).await
    }

    pub async fn remove_session(&self, id: &SessionId) -> Result<(), SyncError> {
        self.registry.remove(id).await
    }

    pub async fn pause_session(&self, id: &SessionId, reason: &str) -> Result<SyncSession, SyncError> {
        self.registry.pause(id, reason).await
    }

    pub async fn resume_session(&self, id: &SessionId) -> Result<SyncSession, SyncError> {
        self.registry.resume(id).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SyncSession>, SyncError> {
        self.registry.list().await
    }

    /// Runs one cycle, waiting for a running one to finish first
    pub async fn run_cycle(&self, id: &SessionId) -> Result<CycleSummary, SyncError> {
        let handle = self.live_handle(id)?;
        let _cycle = handle.lock_cycle().await;
        let token = handle.token();
        self.consumer.run_cycle(id, &token).await
    }

    fn live_handle(&self, id: &SessionId) -> Result<Arc<SessionHandle>, SyncError> {
        let handle = self
            .registry
            .handle(id)
            .ok_or(SyncError::SessionNotFound(*id))?;
        if handle.is_deleting() {
            return Err(SyncError::SessionBeingDeleted(*id));
        }
        Ok(handle)
    }

    /// Cancellation token of the session's current run
    pub fn session_token(&self, id: &SessionId) -> Option<CancellationToken> {
        self.registry.handle(id).map(|h| h.token())
    }

    // ------------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------------

    /// Records the user's decision for a conflict
    ///
    /// The item goes back to `SyncPending`; the next cycle plans the
    /// resolution with `policy` and closes the record once it succeeded.
    #[instrument(skip(self))]
    pub async fn resolve_conflict(
        &self,
        conflict_id: &ConflictId,
        policy: ConflictPolicy,
    ) -> Result<ConflictRecord, SyncError> {
        let mut record = self
            .repository
            .get_conflict(conflict_id)
            .await?
            .ok_or(SyncError::ConflictNotFound(*conflict_id))?;
        if record.is_resolved() {
            return Err(ConflictError::AlreadyResolved(conflict_id.to_string()).into());
        }
        if !policy_applies(record.kind(), policy) {
            return Err(ConflictError::PolicyNotApplicable {
                kind: record.kind(),
                policy,
            }
            .into());
        }

        record.decide(policy);
        self.repository.save_conflict(&record).await?;

        if let Some(mut item) = self.repository.get_item(record.item_id()).await? {
            if item.state() == SyncState::Conflicted && policy != ConflictPolicy::Manual {
                item.transition_to(SyncState::SyncPending)?;
                self.repository.save_item(&item).await?;
            }
        }
        info!(conflict_id = %conflict_id, policy = %policy, path = %record.path(), "Conflict decision recorded");
        Ok(record)
    }

    pub async fn list_conflicts(
        &self,
        session_id: Option<&SessionId>,
        unresolved_only: bool,
    ) -> Result<Vec<ConflictRecord>, SyncError> {
        Ok(self
            .repository
            .list_conflicts(session_id, unresolved_only)
            .await?)
    }

    // ------------------------------------------------------------------------
    // Blacklist
    // ------------------------------------------------------------------------

    /// Releases a blacklisted item; it is reconciled again next cycle
    pub async fn clear_blacklist(&self, item_id: &UniqueId) -> Result<bool, SyncError> {
        let released = self.blacklist().clear_blacklist(item_id).await?;
        if let Some(mut item) = self.repository.get_item(item_id).await? {
            if item.state().is_blacklisted() {
                item.transition_to(SyncState::Unsynced)?;
                item.set_blacklist(None);
                self.repository.save_item(&item).await?;
            }
        }
        Ok(released)
    }

    pub async fn list_blacklist(
        &self,
        session_id: Option<&SessionId>,
    ) -> Result<Vec<BlacklistEntry>, SyncError> {
        Ok(self.blacklist().list_pending(session_id).await?)
    }

    // ------------------------------------------------------------------------
    // Lite Sync
    // ------------------------------------------------------------------------

    /// Switches Lite Sync; disabling starts hydrating the session's placeholders
    ///
    /// Waits for a running cycle, so the cycle plans with one setting only.
    pub async fn set_lite_sync(&self, id: &SessionId, enabled: bool) -> Result<usize, SyncError> {
        let handle = self.live_handle(id)?;
        let queued = {
            let _cycle = handle.lock_cycle().await;
            self.placeholders.set_lite_sync(id, enabled).await?
        };
        if queued > 0 {
            self.spawn_hydration_queue(id);
        }
        Ok(queued)
    }

    fn spawn_hydration_queue(&self, id: &SessionId) {
        let Some(token) = self.session_token(id) else {
            return;
        };
        let placeholders = self.placeholders.clone();
        let id = *id;
        tokio::spawn(async move {
            if let Err(e) = placeholders.resume_pending(&id, &token).await {
                warn!(session_id = %id, error = %e, "Hydration queue stopped");
            }
        });
    }

    pub async fn dehydrate(&self, item_id: &UniqueId) -> Result<(), SyncError> {
        Ok(self.placeholders.dehydrate(item_id).await?)
    }

    // ------------------------------------------------------------------------
    // Resources and large folders
    // ------------------------------------------------------------------------

    /// Changes the worker pool limits for every session
    pub async fn set_resource_ceiling(
        &self,
        max_concurrent: usize,
        bandwidth_kbps: u64,
    ) -> Result<(), SyncError> {
        self.ceiling.set_limits(max_concurrent, bandwidth_kbps);
        self.repository
            .set_setting(SETTING_MAX_CONCURRENT, &self.ceiling.limit().to_string())
            .await?;
        self.repository
            .set_setting(SETTING_BANDWIDTH_KBPS, &bandwidth_kbps.to_string())
            .await?;
        Ok(())
    }

    /// Size above which new remote folders wait for confirmation (0 = never)
    pub async fn set_large_folder_threshold(&self, mb: u64) -> Result<(), SyncError> {
        self.consumer.set_large_folder_threshold_mb(mb);
        self.repository
            .set_setting(SETTING_LARGE_FOLDER_MB, &mb.to_string())
            .await?;
        info!(threshold_mb = mb, "Large-folder threshold updated");
        Ok(())
    }

    /// Admits a folder held for confirmation, with its subtree
    ///
    /// Also brings back a folder excluded with [`SyncService::exclude_folder`].
    /// Returns how many items were re-admitted.
    #[instrument(skip(self))]
    pub async fn confirm_large_folder(&self, item_id: &UniqueId) -> Result<usize, SyncError> {
        let folder = self
            .repository
            .get_item(item_id)
            .await?
            .ok_or(SyncError::ItemNotFound(*item_id))?;
        if !folder.is_directory()
            || folder.state() != SyncState::Excluded
            || self.exclusions.is_excluded(folder.local_path())
        {
            return Err(SyncError::NotPendingConfirmation(*item_id));
        }

        let held = self
            .repository
            .query_items(
                &ItemFilter::new()
                    .with_session(*folder.session_id())
                    .with_state(SyncState::Excluded),
            )
            .await?;
        let mut admitted = Vec::new();
        for mut item in held {
            let inside = item.id() == folder.id()
                || item.local_path().is_descendant_of(folder.local_path());
            if inside && !self.exclusions.is_excluded(item.local_path()) {
                item.transition_to(SyncState::Unsynced)?;
                admitted.push(item);
            }
        }
        self.repository.save_items(&admitted).await?;
        info!(item_id = %item_id, path = %folder.local_path(), count = admitted.len(), "Large folder confirmed");
        Ok(admitted.len())
    }

    /// Stops syncing a folder: the local copy is removed, the remote one stays
    ///
    /// Downloads running below the folder are cancelled first. Refused while
    /// the folder holds local changes that are not uploaded yet. The folder
    /// is then listed by [`SyncService::held_folders`] and comes back with
    /// [`SyncService::confirm_large_folder`]. Returns how many items were
    /// excluded.
    #[instrument(skip(self))]
    pub async fn exclude_folder(&self, item_id: &UniqueId) -> Result<usize, SyncError> {
        let session_id = *self
            .repository
            .get_item(item_id)
            .await?
            .ok_or(SyncError::ItemNotFound(*item_id))?
            .session_id();
        let handle = self.live_handle(&session_id)?;
        let _cycle = handle.lock_cycle().await;

        let session = self
            .repository
            .get_session(&session_id)
            .await?
            .ok_or(SyncError::SessionNotFound(session_id))?;
        let folder = self
            .repository
            .get_item(item_id)
            .await?
            .ok_or(SyncError::ItemNotFound(*item_id))?;
        let root = folder.local_path().clone();
        let refuse = |path: &RelativePath, reason: &str| SyncError::CannotExclude {
            path: path.clone(),
            reason: reason.to_string(),
        };
        if !folder.is_directory() {
            return Err(refuse(&root, "not a folder"));
        }
        if folder.state() == SyncState::Excluded {
            return Err(refuse(&root, "already excluded"));
        }
        if folder.remote_id().is_none() || folder.remote_deleted() {
            return Err(refuse(&root, "the folder does not exist remotely"));
        }

        let inside = |path: &RelativePath| *path == root || path.is_descendant_of(&root);
        let mut items = self
            .repository
            .query_items(&ItemFilter::new().with_session(session_id))
            .await?;
        let scan = self.consumer.scanner().scan(&session, &mut items).await?;
        if let Some(new) = scan.new_items.iter().find(|i| inside(i.local_path())) {
            return Err(refuse(new.local_path(), "never uploaded"));
        }
        for item in &items {
            let entry = scan.entry(item.id());
            if !inside(item.local_path()) && !entry.is_some_and(|e| inside(&e.path)) {
                continue;
            }
            if item.state() == SyncState::Conflicted {
                return Err(refuse(item.local_path(), "unresolved conflict"));
            }
            let pending = local_delta(item, entry).is_some_and(|d| d.kind != DeltaKind::Deleted);
            if pending {
                return Err(refuse(item.local_path(), "local changes not uploaded yet"));
            }
        }

        let mut subtree: Vec<SyncItem> = items
            .into_iter()
            .filter(|item| inside(item.local_path()))
            .collect();
        for item in &subtree {
            if item.state().is_blacklisted() {
                self.blacklist().clear_blacklist(item.id()).await?;
            }
        }
        for item in &mut subtree {
            item.exclude_from_sync();
        }
        self.repository.save_items(&subtree).await?;
        for item in &subtree {
            self.placeholders.cancel_hydration(item.id()).await;
        }
        // a download that finished meanwhile stored its own row
        self.repository.save_items(&subtree).await?;

        self.fs
            .remove(session.local_root(), &root)
            .await
            .map_err(|e| {
                warn!(path = %root, error = %e, "Could not remove the excluded folder");
                e
            })?;
        info!(item_id = %item_id, path = %root, count = subtree.len(), "Folder excluded from sync");
        Ok(subtree.len())
    }

    /// Folders waiting for [`SyncService::confirm_large_folder`]
    ///
    /// Held large folders and folders excluded by the user alike. Only the
    /// top of each held subtree is listed.
    pub async fn held_folders(
        &self,
        session_id: Option<&SessionId>,
    ) -> Result<Vec<SyncItem>, SyncError> {
        let mut filter = ItemFilter::new().with_state(SyncState::Excluded);
        if let Some(id) = session_id {
            filter = filter.with_session(*id);
        }
        let held: Vec<SyncItem> = self
            .repository
            .query_items(&filter)
            .await?
            .into_iter()
            .filter(|item| item.is_directory() && !self.exclusions.is_excluded(item.local_path()))
            .collect();
        let tops = held
            .iter()
            .filter(|item| {
                !held.iter().any(|other| {
                    other.session_id() == item.session_id()
                        && item.local_path().is_descendant_of(other.local_path())
                })
            })
            .cloned()
            .collect();
        Ok(tops)
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    pub async fn status(&self) -> Result<ServiceStatus, SyncError> {
        let mut sessions = Vec::new();
        for session in self.registry.list().await? {
            let items = self
                .repository
                .query_items(&ItemFilter::new().with_session(*session.id()))
                .await?;
            let count = |pred: fn(&SyncItem) -> bool| items.iter().filter(|i| pred(i)).count();
            sessions.push(SessionReport {
                session_id: *session.id(),
                name: session.name().to_string(),
                local_root: session.local_root().to_string(),
                status: session.status().to_string(),
                status_detail: session.status_detail().map(str::to_string),
                lite_sync: session.lite_sync(),
                items: items.len(),
                pending: count(|i| matches!(i.state(), SyncState::Unsynced | SyncState::SyncPending)),
                conflicted: count(|i| i.state() == SyncState::Conflicted),
                blacklisted: count(|i| i.state().is_blacklisted()),
                excluded: count(|i| i.state() == SyncState::Excluded),
                dehydrated: count(|i| i.placeholder() == PlaceholderState::Dehydrated),
            });
        }
        Ok(ServiceStatus {
            sessions,
            max_concurrent_actions: self.ceiling.limit(),
            bandwidth_limit_kbps: self.ceiling.bandwidth().rate_kbps(),
            large_folder_threshold_mb: self.consumer.large_folder_threshold_mb(),
            busy_items: self.consumer.executor().busy_items(),
        })
    }
}
