//! Per-session reconciliation cycle
//!
//! The [`SessionConsumer`] runs one cycle at a time for a session:
//!
//! ```text
//! release due blacklist entries
//!   → ingest remote feed → scan local root → reconcile
//!   → record decisions → run waves → apply outcomes → CycleCompleted
//! ```
//!
//! ## Design Notes
//!
//! - The consumer is the only writer of item rows during a cycle. Workers
//!   report outcomes; their effects reach the store here.
//! - A missing local root stops the cycle before scanning, otherwise every
//!   item would look locally deleted.
//! - An item becomes `Synced` only when every action planned for it
//!   succeeded; anything skipped or failed leaves it `SyncPending`.
//! - The session row is only touched column by column (cursor, status,
//!   last cycle), so settings changed during the cycle survive it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use kdsync_conflict::{BlacklistManager, FailureOutcome};
use kdsync_core::config::Config;
use kdsync_core::domain::{
    ActionKind, ActivityKind, ConflictId, ConflictRecord, CycleSummary, Fingerprint, ItemKind,
    PlaceholderState, SessionStatus, SyncAction, SyncErrorCode, SyncEvent, SyncItem, SyncSession,
    SyncState, UniqueId,
};
use kdsync_core::ports::{
    Clock, IEventSink, ILocalFileSystem, IPlaceholderHydrator, IRemoteDrive, IStateRepository,
    ItemFilter, LocalEntry, RemoteEntry,
};

use crate::delta::{LocalScan, LocalScanner};
use crate::error::{ActionFailure, FailureKind, SyncError};
use crate::executor::{ActionExecutor, ActionOutcome, ActionStatus, Effect};
use crate::plan::into_waves;
use crate::reconciler::{Plan, ReconcileInput, Reconciler};
use crate::remote_feed::RemoteFeed;
use crate::retry::RetryPolicy;
use crate::throttle::ResourceCeiling;

const MIB: u64 = 1024 * 1024;

/// Adapters shared by every session
#[derive(Clone)]
pub struct EngineDeps {
    pub repository: Arc<dyn IStateRepository>,
    pub fs: Arc<dyn ILocalFileSystem>,
    pub remote: Arc<dyn IRemoteDrive>,
    pub events: Arc<dyn IEventSink>,
    pub clock: Arc<dyn Clock>,
    pub ceiling: Arc<ResourceCeiling>,
    pub hydrator: Option<Arc<dyn IPlaceholderHydrator>>,
}

/// Runs reconciliation cycles
pub struct SessionConsumer {
    repository: Arc<dyn IStateRepository>,
    events: Arc<dyn IEventSink>,
    clock: Arc<dyn Clock>,
    scanner: LocalScanner,
    feed: RemoteFeed,
    reconciler: Reconciler,
    executor: ActionExecutor,
    blacklist: Arc<BlacklistManager>,
    max_item_retries: u32,
    large_folder_mb: AtomicU64,
}

impl SessionConsumer {
    pub fn new(config: &Config, deps: EngineDeps) -> Self {
        let mut executor = ActionExecutor::new(
            Arc::clone(&deps.fs),
            Arc::clone(&deps.remote),
            Arc::clone(&deps.ceiling),
        );
        if let Some(hydrator) = deps.hydrator {
            executor = executor.with_hydrator(hydrator);
        }
        let blacklist = Arc::new(BlacklistManager::new(
            Arc::clone(&deps.repository),
            Arc::clone(&deps.clock),
            Arc::clone(&deps.events),
            config.blacklist.clone(),
        ));
        Self {
            scanner: LocalScanner::new(deps.fs),
            feed: RemoteFeed::new(
                deps.remote,
                Arc::clone(&deps.repository),
                Arc::clone(&deps.events),
                RetryPolicy::from_config(&config.sync),
            ),
            reconciler: Reconciler::new(config),
            executor,
            blacklist,
            repository: deps.repository,
            events: deps.events,
            clock: deps.clock,
            max_item_retries: config.sync.max_item_retries,
            large_folder_mb: AtomicU64::new(config.sync.large_folder_threshold_mb),
        }
    }

    pub fn scanner(&self) -> &LocalScanner {
        &self.scanner
    }

    pub fn blacklist(&self) -> &Arc<BlacklistManager> {
        &self.blacklist
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    pub fn large_folder_threshold_mb(&self) -> u64 {
        self.large_folder_mb.load(Ordering::SeqCst)
    }

    /// 0 disables the confirmation
    pub fn set_large_folder_threshold_mb(&self, mb: u64) {
        self.large_folder_mb.store(mb, Ordering::SeqCst);
    }

    /// Runs one full cycle of `session_id`
    ///
    /// Paused and draining sessions are skipped with an empty summary.
    #[instrument(skip(self, cancel), fields(session_id = %session_id))]
    pub async fn run_cycle(
        &self,
        session_id: &kdsync_core::domain::SessionId,
        cancel: &CancellationToken,
    ) -> Result<CycleSummary, SyncError> {
        let started = Instant::now();
        let mut session = self
            .repository
            .get_session(session_id)
            .await?
            .ok_or(SyncError::SessionNotFound(*session_id))?;
        if !session.status().is_running() {
            debug!(status = %session.status(), "Session not running, cycle skipped");
            return Ok(CycleSummary::default());
        }

        self.blacklist.release_due(session_id).await?;

        self.feed
            .ingest(&mut session, self.large_folder_threshold_mb().saturating_mul(MIB))
            .await?;

        let root = session.local_root().as_path().to_path_buf();
        let root_ok = tokio::fs::metadata(&root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !root_ok {
            let error = SyncErrorCode::SyncRootUnavailable {
                path: root.display().to_string(),
            };
            self.stop_session(&mut session, error).await?;
            return Err(SyncError::RootUnavailable(root));
        }

        let mut items = self
            .repository
            .query_items(&ItemFilter::new().with_session(*session_id))
            .await?;
        let scan = self.scanner.scan(&session, &mut items).await?;
        let mut to_save: Vec<SyncItem> = items
            .iter()
            .filter(|i| scan.observed.contains(i.id()))
            .cloned()
            .collect();
        to_save.extend(scan.new_items.iter().cloned());
        if !to_save.is_empty() {
            self.repository.save_items(&to_save).await?;
        }
        items.extend(scan.new_items.iter().cloned());

        let open_conflicts: HashMap<UniqueId, ConflictRecord> = self
            .repository
            .list_conflicts(Some(session_id), true)
            .await?
            .into_iter()
            .map(|c| (*c.item_id(), c))
            .collect();

        let now = self.clock.now();
        let plan = self.reconciler.reconcile(&ReconcileInput {
            session: &session,
            items: &items,
            scan: &scan,
            open_conflicts: &open_conflicts,
            at: now,
        });

        let mut summary = CycleSummary {
            actions_planned: plan.actions.len(),
            conflicts: plan.conflicts.iter().filter(|c| c.is_new).count(),
            blacklisted: plan.blacklist.len(),
            ..CycleSummary::default()
        };

        let mut cycle = Cycle {
            session: &session,
            items: items.into_iter().map(|i| (*i.id(), i)).collect(),
            scan: &scan,
        };

        let conflict_actions = self.record_decisions(&mut cycle, &plan).await?;

        if !plan.actions.is_empty() {
            let dehydrated: HashSet<UniqueId> = cycle
                .items
                .values()
                .filter(|i| i.placeholder() != PlaceholderState::Hydrated)
                .map(|i| *i.id())
                .collect();
            let outcomes = self
                .executor
                .run(&session, into_waves(plan.actions.clone()), &dehydrated, cancel)
                .await;
            let applied = self
                .apply_outcomes(&mut cycle, &outcomes, &conflict_actions)
                .await?;
            summary.actions_succeeded = applied.succeeded;
            summary.actions_failed = applied.failed;
            summary.actions_skipped = applied.skipped;
            summary.blacklisted += applied.blacklisted;
            if let Some(error) = applied.session_error {
                self.stop_session(&mut session, error).await?;
            }
        }

        let finished = self.clock.now();
        self.repository
            .record_session_cycle(session_id, finished)
            .await?;
        session.record_cycle(finished);

        summary.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if summary.actions_planned > 0 || summary.conflicts > 0 || summary.blacklisted > 0 {
            info!(
                planned = summary.actions_planned,
                succeeded = summary.actions_succeeded,
                failed = summary.actions_failed,
                skipped = summary.actions_skipped,
                conflicts = summary.conflicts,
                blacklisted = summary.blacklisted,
                duration_ms = summary.duration_ms,
                "Cycle completed"
            );
        } else {
            debug!(duration_ms = summary.duration_ms, "Cycle completed, nothing to do");
        }
        self.events.emit(SyncEvent::CycleCompleted {
            session_id: *session_id,
            summary: summary.clone(),
        });
        Ok(summary)
    }

    async fn stop_session(
        &self,
        session: &mut SyncSession,
        error: SyncErrorCode,
    ) -> Result<(), SyncError> {
        error!(session_id = %session.id(), code = error.code(), "Session stopped on error");
        // A pause or removal may have landed while the cycle ran
        let status = self
            .repository
            .get_session(session.id())
            .await?
            .map_or(session.status(), |stored| stored.status());
        if status.can_transition_to(SessionStatus::Error) {
            let detail = error.render();
            self.repository
                .set_session_status(session.id(), SessionStatus::Error, Some(&detail))
                .await?;
            session.transition_to(SessionStatus::Error, Some(detail))?;
        }
        self.events.emit(SyncEvent::SessionError {
            session_id: *session.id(),
            error,
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Decisions
    // ------------------------------------------------------------------------

    /// Stores the non-action decisions of `plan`
    ///
    /// Returns the actions planned per auto-resolved conflict.
    async fn record_decisions(
        &self,
        cycle: &mut Cycle<'_>,
        plan: &Plan,
    ) -> Result<HashMap<ConflictId, usize>, SyncError> {
        let session_id = *cycle.session.id();

        for item_id in &plan.remediated {
            self.blacklist.clear_blacklist(item_id).await?;
            if let Some(item) = cycle.items.get_mut(item_id) {
                item.set_state_unchecked(SyncState::Unsynced);
                item.set_blacklist(None);
                self.repository.save_item(item).await?;
            }
        }

        for (item_id, reason) in &plan.blacklist {
            let Some(item) = cycle.items.get_mut(item_id) else {
                continue;
            };
            match self.blacklist.blacklist(item, *reason, None).await {
                Ok(_) => self.repository.save_item(item).await?,
                Err(e) => {
                    warn!(item_id = %item_id, reason = %reason, error = %e, "Could not blacklist item");
                }
            }
        }

        for (item_id, path) in &plan.excluded {
            let Some(item) = cycle.items.get_mut(item_id) else {
                continue;
            };
            item.transition_to(SyncState::Excluded)?;
            self.repository.save_item(item).await?;
            debug!(item_id = %item_id, path = %path, "Item excluded by template");
            self.events.emit(SyncEvent::ItemExcluded {
                session_id,
                item_id: *item_id,
                error: SyncErrorCode::ExcludedByTemplate { path: path.clone() },
            });
        }

        for conflict_id in &plan.vanished_conflicts {
            if let Some(mut record) = self.repository.get_conflict(conflict_id).await? {
                let policy = record.policy();
                record.resolve(policy, self.clock.now());
                self.repository.save_conflict(&record).await?;
                debug!(conflict_id = %conflict_id, "Conflict no longer applies");
                self.events.emit(SyncEvent::ConflictResolved {
                    session_id,
                    conflict_id: *conflict_id,
                    policy,
                });
            }
        }

        let mut conflict_actions: HashMap<ConflictId, usize> = HashMap::new();
        for action in &plan.actions {
            if let Some(conflict_id) = action.conflict_id {
                *conflict_actions.entry(conflict_id).or_default() += 1;
            }
        }

        for planned in &plan.conflicts {
            let record = &planned.record;
            self.repository.save_conflict(record).await?;
            if planned.manual {
                if let Some(item) = cycle.items.get_mut(record.item_id()) {
                    if item.state() != SyncState::Conflicted {
                        item.transition_to(SyncState::Conflicted)?;
                        self.repository.save_item(item).await?;
                    }
                }
            }
            if planned.is_new {
                warn!(
                    item_id = %record.item_id(),
                    path = %record.path(),
                    kind = %record.kind(),
                    policy = %record.policy(),
                    "Conflict raised"
                );
                self.events.emit(SyncEvent::ConflictRaised {
                    session_id,
                    conflict_id: *record.id(),
                    item_id: *record.item_id(),
                    kind: record.kind(),
                    policy: record.policy(),
                    error: if planned.manual {
                        SyncErrorCode::ConflictAwaitingUser {
                            path: record.path().clone(),
                        }
                    } else {
                        SyncErrorCode::for_conflict(
                            record.kind(),
                            record.path().clone(),
                            record.copy_path().cloned(),
                        )
                    },
                });
            }
        }

        let mut pending = Vec::new();
        for item_id in plan.acting_items() {
            let Some(item) = cycle.items.get_mut(&item_id) else {
                continue;
            };
            if item.state() != SyncState::SyncPending && item.can_transition_to(SyncState::SyncPending) {
                item.transition_to(SyncState::SyncPending)?;
                pending.push(item.clone());
            }
        }
        for item_id in &plan.settled {
            let Some(item) = cycle.items.get_mut(item_id) else {
                continue;
            };
            if item.can_transition_to(SyncState::Synced) {
                item.transition_to(SyncState::Synced)?;
                pending.push(item.clone());
            }
        }
        if !pending.is_empty() {
            self.repository.save_items(&pending).await?;
        }

        Ok(conflict_actions)
    }

    // ------------------------------------------------------------------------
    // Outcomes
    // ------------------------------------------------------------------------

    async fn apply_outcomes(
        &self,
        cycle: &mut Cycle<'_>,
        outcomes: &[ActionOutcome],
        conflict_actions: &HashMap<ConflictId, usize>,
    ) -> Result<Applied, SyncError> {
        let mut applied = Applied::default();
        let mut incomplete: HashSet<UniqueId> = HashSet::new();
        let mut touched: HashSet<UniqueId> = HashSet::new();
        let mut forgotten: Vec<UniqueId> = Vec::new();
        let mut placeholders: Vec<(UniqueId, PlaceholderState)> = Vec::new();
        let mut conflict_done: HashMap<ConflictId, usize> = HashMap::new();

        for outcome in outcomes {
            let action = &outcome.action;
            match &outcome.status {
                ActionStatus::Done(effect) => {
                    applied.succeeded += 1;
                    if let Some(conflict_id) = action.conflict_id {
                        *conflict_done.entry(conflict_id).or_default() += 1;
                    }
                    let change = self.apply_done(cycle, action, effect)?;
                    touched.extend(change.touched);
                    forgotten.extend(change.forgotten);
                    placeholders.extend(change.placeholder);
                }
                ActionStatus::Failed(failure) => {
                    applied.failed += 1;
                    incomplete.insert(action.item_id);
                    touched.insert(action.item_id);
                    if failure.pauses_session() {
                        applied.session_error.get_or_insert_with(|| failure.error.clone());
                        continue;
                    }
                    if self.apply_failure(cycle, action, failure).await? {
                        applied.blacklisted += 1;
                    }
                }
                ActionStatus::Skipped => {
                    applied.skipped += 1;
                    incomplete.insert(action.item_id);
                }
            }
        }

        // Items whose actions all succeeded are synced
        let forgotten_set: HashSet<UniqueId> = forgotten.iter().copied().collect();
        for item_id in &touched {
            if incomplete.contains(item_id) || forgotten_set.contains(item_id) {
                continue;
            }
            if let Some(item) = cycle.items.get_mut(item_id) {
                if item.state() == SyncState::SyncPending {
                    item.transition_to(SyncState::Synced)?;
                }
            }
        }

        let mut dirty: Vec<SyncItem> = touched
            .iter()
            .filter(|id| !forgotten_set.contains(id))
            .filter_map(|id| cycle.items.get(id).cloned())
            .collect();
        dirty.sort_by(|a, b| a.local_path().cmp(b.local_path()));
        if !dirty.is_empty() {
            self.repository.save_items(&dirty).await?;
        }
        for (item_id, state) in placeholders {
            if !forgotten_set.contains(&item_id) {
                self.repository.set_placeholder_state(&item_id, state).await?;
            }
        }

        let session_id = *cycle.session.id();
        for (conflict_id, planned) in conflict_actions {
            if conflict_done.get(conflict_id).copied().unwrap_or(0) < *planned {
                continue;
            }
            if let Some(mut record) = self.repository.get_conflict(conflict_id).await? {
                let policy = record.policy();
                record.resolve(policy, self.clock.now());
                self.repository.save_conflict(&record).await?;
                info!(conflict_id = %conflict_id, policy = %policy, "Conflict resolved");
                self.events.emit(SyncEvent::ConflictResolved {
                    session_id,
                    conflict_id: *conflict_id,
                    policy,
                });
            }
        }

        for item_id in forgotten {
            self.repository.delete_item(&item_id).await?;
        }
        Ok(applied)
    }

    /// Folds one successful action into the working set
    fn apply_done(
        &self,
        cycle: &mut Cycle<'_>,
        action: &SyncAction,
        effect: &Effect,
    ) -> Result<DoneChange, SyncError> {
        let session_id = *cycle.session.id();
        let mut change = DoneChange::default();
        change.touched.push(action.item_id);

        let Some(item) = cycle.items.get_mut(&action.item_id) else {
            warn!(item_id = %action.item_id, action = %action, "Outcome for unknown item");
            return Ok(change);
        };
        let existed = item.was_synced();
        let direction = action.kind.direction();

        match &action.kind {
            ActionKind::Download { path, .. } | ActionKind::Hydrate { path, .. } => {
                let fingerprint = local_fingerprint(effect.local.as_ref(), item);
                item.mark_converged(path.clone(), fingerprint);
                if let Some(entry) = &effect.local {
                    item.set_local_node_id(entry.node_id);
                }
                if item.placeholder() != PlaceholderState::Hydrated {
                    change.placeholder = Some((*item.id(), PlaceholderState::Hydrated));
                    if let Err(e) = item
                        .set_placeholder(PlaceholderState::Hydrating)
                        .and_then(|()| item.set_placeholder(PlaceholderState::Hydrated))
                    {
                        debug!(item_id = %item.id(), error = %e, "Placeholder state not advanced");
                    }
                }
            }
            ActionKind::Upload { path, .. } | ActionKind::CreateRemoteFolder { path } => {
                if let Some(remote) = &effect.remote {
                    item.assign_remote_id(remote.remote_id.clone())?;
                }
                let fingerprint = uploaded_fingerprint(effect, item);
                item.mark_converged(path.clone(), fingerprint);
                if let Some(entry) = &effect.local {
                    item.set_local_node_id(entry.node_id);
                }
            }
            ActionKind::CreateLocalFolder { path } => {
                item.mark_converged(path.clone(), Fingerprint::directory());
                if let Some(entry) = &effect.local {
                    item.set_local_node_id(entry.node_id);
                }
            }
            ActionKind::MoveLocal { from, to } | ActionKind::MoveRemote { from, to, .. } => {
                let baseline = item.local_path().clone();
                item.relocate(to.clone());
                if let Some(entry) = &effect.local {
                    item.set_local_node_id(entry.node_id);
                }
                if item.is_directory() {
                    cycle.rebase_subtree(&action.item_id, &baseline, from, to, &mut change.touched);
                }
            }
            ActionKind::DeleteLocal { .. } | ActionKind::DeleteRemote { .. } | ActionKind::Forget { .. } => {
                change.forgotten.push(action.item_id);
                if item.is_directory() {
                    let folder = item.local_path().clone();
                    change.forgotten.extend(
                        cycle
                            .items
                            .values()
                            .filter(|i| i.local_path().is_descendant_of(&folder))
                            .map(|i| *i.id()),
                    );
                }
            }
            ActionKind::SetAside {
                to,
                new_item,
                forget_original,
                ..
            } => {
                let kind = item.kind();
                if *forget_original {
                    change.forgotten.push(action.item_id);
                }
                if let Some(entry) = &effect.local {
                    let copy = new_local_item(cycle.session, *new_item, kind, to, entry);
                    change.touched.push(*new_item);
                    cycle.items.insert(*new_item, copy);
                }
            }
            ActionKind::DownloadCopy { to, new_item, .. } => {
                if let Some(entry) = &effect.local {
                    let copy = new_local_item(cycle.session, *new_item, ItemKind::File, to, entry);
                    change.touched.push(*new_item);
                    cycle.items.insert(*new_item, copy);
                }
            }
            ActionKind::CreatePlaceholder { path } | ActionKind::UpdatePlaceholder { path } => {
                let fingerprint = item
                    .remote_fingerprint()
                    .cloned()
                    .unwrap_or_else(Fingerprint::directory);
                item.mark_converged(path.clone(), fingerprint);
                item.make_virtual();
                change.placeholder = Some((*item.id(), PlaceholderState::Dehydrated));
            }
            ActionKind::Link { path } => {
                let fingerprint = cycle
                    .scan
                    .entry(&action.item_id)
                    .map(LocalEntry::fingerprint)
                    .or_else(|| item.local_fingerprint().cloned())
                    .or_else(|| item.remote_fingerprint().cloned())
                    .unwrap_or_else(Fingerprint::directory);
                item.mark_converged(path.clone(), fingerprint);
            }
        }

        self.emit_item_event(session_id, action, existed, direction);
        Ok(change)
    }

    fn emit_item_event(
        &self,
        session_id: kdsync_core::domain::SessionId,
        action: &SyncAction,
        existed: bool,
        direction: kdsync_core::domain::Direction,
    ) {
        let item_id = action.item_id;
        let event = match &action.kind {
            ActionKind::Link { .. } | ActionKind::Forget { .. } | ActionKind::Hydrate { .. } => return,
            ActionKind::MoveLocal { from, to }
            | ActionKind::MoveRemote { from, to, .. }
            | ActionKind::SetAside { from, to, .. } => SyncEvent::ItemMoved {
                session_id,
                item_id,
                from: from.clone(),
                to: to.clone(),
                direction,
            },
            kind => {
                let path = kind.path().clone();
                match kind.activity(existed) {
                    ActivityKind::Removed => SyncEvent::ItemRemoved {
                        session_id,
                        item_id,
                        path,
                        direction,
                    },
                    ActivityKind::Updated => SyncEvent::ItemUpdated {
                        session_id,
                        item_id,
                        path,
                        direction,
                    },
                    ActivityKind::Added | ActivityKind::Moved => SyncEvent::ItemAdded {
                        session_id,
                        item_id,
                        path,
                        direction,
                    },
                }
            }
        };
        self.events.emit(event);
    }

    /// Records a failed action; returns whether the item got blacklisted
    async fn apply_failure(
        &self,
        cycle: &mut Cycle<'_>,
        action: &SyncAction,
        failure: &ActionFailure,
    ) -> Result<bool, SyncError> {
        let session_id = *cycle.session.id();
        let Some(item) = cycle.items.get_mut(&action.item_id) else {
            return Ok(false);
        };
        match failure.kind {
            FailureKind::Cancelled => Ok(false),
            FailureKind::PauseSession => Ok(false),
            FailureKind::Transient { counted } => {
                self.events.emit(SyncEvent::ItemFailed {
                    session_id,
                    item_id: action.item_id,
                    error: failure.error.clone(),
                });
                if !counted {
                    return Ok(false);
                }
                let outcome = self
                    .blacklist
                    .record_transient_failure(item, self.max_item_retries)
                    .await?;
                Ok(matches!(outcome, FailureOutcome::Blacklisted(_)))
            }
            FailureKind::Blacklist(reason) => match self.blacklist.blacklist(item, reason, None).await {
                Ok(_) => Ok(true),
                Err(e) => {
                    warn!(item_id = %action.item_id, reason = %reason, error = %e, "Could not blacklist item");
                    Ok(false)
                }
            },
        }
    }
}

// ============================================================================
// Cycle working set
// ============================================================================

struct Cycle<'a> {
    session: &'a SyncSession,
    items: HashMap<UniqueId, SyncItem>,
    scan: &'a LocalScan,
}

impl Cycle<'_> {
    /// Moves the stored paths of a folder's descendants along with it
    fn rebase_subtree(
        &mut self,
        folder_id: &UniqueId,
        baseline: &kdsync_core::domain::RelativePath,
        from: &kdsync_core::domain::RelativePath,
        to: &kdsync_core::domain::RelativePath,
        touched: &mut Vec<UniqueId>,
    ) {
        for (id, child) in self.items.iter_mut() {
            if id == folder_id {
                continue;
            }
            let local = child
                .local_path()
                .rebase(baseline, to)
                .or_else(|| child.local_path().rebase(from, to));
            if let Some(local) = local {
                child.set_local_path(local);
                touched.push(*id);
            }
            let remote = child
                .remote_path()
                .rebase(baseline, to)
                .or_else(|| child.remote_path().rebase(from, to));
            if let Some(remote) = remote {
                if child.remote_fingerprint().is_some() {
                    let fingerprint = child.remote_fingerprint().cloned().unwrap_or_else(Fingerprint::directory);
                    let read_only = child.read_only();
                    let deleted = child.remote_deleted();
                    child.observe_remote(remote, fingerprint, read_only);
                    if deleted {
                        child.observe_remote_deletion();
                    }
                    touched.push(*id);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct DoneChange {
    touched: Vec<UniqueId>,
    forgotten: Vec<UniqueId>,
    placeholder: Option<(UniqueId, PlaceholderState)>,
}

#[derive(Debug, Default)]
struct Applied {
    succeeded: usize,
    failed: usize,
    skipped: usize,
    blacklisted: usize,
    session_error: Option<SyncErrorCode>,
}

fn local_fingerprint(entry: Option<&LocalEntry>, item: &SyncItem) -> Fingerprint {
    match entry {
        Some(entry) => entry.fingerprint(),
        None => item
            .remote_fingerprint()
            .cloned()
            .unwrap_or_else(Fingerprint::directory),
    }
}

/// Local fingerprint after an upload, carrying the remote hash
fn uploaded_fingerprint(effect: &Effect, item: &SyncItem) -> Fingerprint {
    if item.is_directory() {
        return Fingerprint::directory();
    }
    let remote_hash = effect
        .remote
        .as_ref()
        .and_then(|r: &RemoteEntry| r.fingerprint.hash.clone());
    match (&effect.local, remote_hash) {
        (Some(entry), Some(hash)) => entry.fingerprint().with_hash(hash),
        (Some(entry), None) => entry.fingerprint(),
        (None, _) => effect
            .remote
            .as_ref()
            .map(|r| r.fingerprint.clone())
            .or_else(|| item.local_fingerprint().cloned())
            .unwrap_or_else(Fingerprint::directory),
    }
}

fn new_local_item(
    session: &SyncSession,
    id: UniqueId,
    kind: ItemKind,
    path: &kdsync_core::domain::RelativePath,
    entry: &LocalEntry,
) -> SyncItem {
    SyncItem::new_local(*session.id(), kind, path.clone(), entry.fingerprint(), entry.node_id)
        .with_id(id)
}
