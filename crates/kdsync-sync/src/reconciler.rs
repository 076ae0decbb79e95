//! Reconciliation of local and remote deltas into a plan
//!
//! For every item of a session the reconciler compares the local delta
//! (from the scan) and the remote delta (from the persisted remote
//! observation) against the last-synced baseline and decides what to do:
//! propagate a one-sided change, merge two compatible changes, resolve a
//! conflict through its policy, or route the item to the blacklist or the
//! exclusion list.
//!
//! ## Design Notes
//!
//! - Reconciliation is pure. The [`Plan`] it returns is applied by the
//!   session consumer, which persists states and runs the actions.
//! - Items are visited in path order so a folder is decided before its
//!   content. Blacklisted and excluded folders hold back their subtree.
//! - Name checks run only on actions that introduce a name on a side.
//!   A case-insensitive duplicate is detected against names that already
//!   exist before names introduced this cycle, so a rename never steals
//!   the name of a file that did not move.
//! - Moves implied by the move of an ancestor folder are dropped; the
//!   consumer rebases the subtree once the folder move succeeds.
//! - A local file written where a placeholder lives is a create/create
//!   conflict: the file moves to a conflict copy name and is uploaded from
//!   there, the placeholder keeps its path.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use kdsync_conflict::{
    policy_applies, ConflictDetector, ConflictNamer, DetectedConflict, ExclusionKind,
    ExclusionMatcher, OccupiedPaths, PlanRequest, PolicyEngine, ResolutionPlanner, TreeFacts,
};
use kdsync_core::config::Config;
use kdsync_core::domain::{
    ActionKind, BlacklistReason, ConflictId, ConflictKind, ConflictPolicy, ConflictRecord,
    DeltaKind, ItemDelta, PlaceholderState, RelativePath, SyncAction, SyncItem, SyncSession,
    SyncState, UniqueId,
};
use kdsync_core::ports::LocalEntry;

use crate::delta::{local_delta, remote_delta, LocalScan};
use crate::validator::{NameValidator, SiblingIndex};

/// Everything the reconciler looks at for one session
#[derive(Debug, Clone, Copy)]
pub struct ReconcileInput<'a> {
    pub session: &'a SyncSession,
    /// Stored items, including the new items of `scan`
    pub items: &'a [SyncItem],
    pub scan: &'a LocalScan,
    /// Unresolved conflict records, by item
    pub open_conflicts: &'a HashMap<UniqueId, ConflictRecord>,
    /// Timestamp for conflict records and copy names
    pub at: DateTime<Utc>,
}

/// A conflict raised or re-planned this cycle
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedConflict {
    pub record: ConflictRecord,
    /// No actions were planned: the item becomes `Conflicted`
    pub manual: bool,
    /// First detection, the record is not stored yet
    pub is_new: bool,
}

/// Decisions of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub actions: Vec<SyncAction>,
    pub conflicts: Vec<PlannedConflict>,
    /// Items to blacklist, with the reason
    pub blacklist: Vec<(UniqueId, BlacklistReason)>,
    /// Items matched by a silent exclusion template, with the matched path
    pub excluded: Vec<(UniqueId, RelativePath)>,
    /// Blacklisted items the user renamed or deleted
    pub remediated: Vec<UniqueId>,
    /// Items without changes that are not marked `Synced` yet
    pub settled: Vec<UniqueId>,
    /// Open conflicts whose clash is gone
    pub vanished_conflicts: Vec<ConflictId>,
}

impl Plan {
    /// Whether the pass found nothing to do
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
            && self.conflicts.iter().all(|c| !c.is_new)
            && self.blacklist.is_empty()
            && self.excluded.is_empty()
            && self.remediated.is_empty()
            && self.settled.is_empty()
            && self.vanished_conflicts.is_empty()
    }

    /// Items with at least one planned action
    pub fn acting_items(&self) -> HashSet<UniqueId> {
        self.actions.iter().map(|a| a.item_id).collect()
    }
}

// ============================================================================
// Per-item view
// ============================================================================

struct Work<'a> {
    item: &'a SyncItem,
    local: Option<ItemDelta>,
    remote: Option<ItemDelta>,
    /// Where the item is now on the local side (or will appear)
    current: RelativePath,
    /// Name the item claims after this cycle
    target: RelativePath,
}

impl<'a> Work<'a> {
    fn new(item: &'a SyncItem, entry: Option<&LocalEntry>) -> Self {
        let local = local_delta(item, entry);
        let remote = remote_delta(item);
        let current = match (entry, &remote) {
            (Some(entry), _) => entry.path.clone(),
            (None, Some(r)) if r.kind != DeltaKind::Deleted => r.path.clone(),
            _ => item.local_path().clone(),
        };
        let target = match (&local, &remote) {
            (Some(l), _) if introduces(l) => l.path.clone(),
            (_, Some(r)) if introduces(r) => r.path.clone(),
            _ => current.clone(),
        };
        Self {
            item,
            local,
            remote,
            current,
            target,
        }
    }

    fn has_deltas(&self) -> bool {
        self.local.is_some() || self.remote.is_some()
    }

    fn introduces_name(&self) -> bool {
        self.local.as_ref().is_some_and(introduces) || self.remote.as_ref().is_some_and(introduces)
    }

    fn is_going_away(&self) -> bool {
        let deleted = |d: &ItemDelta| d.kind == DeltaKind::Deleted;
        self.local.as_ref().is_some_and(deleted) || self.remote.as_ref().is_some_and(deleted)
    }

    /// Local path the item has now, falling back to the baseline
    fn local_path(&self) -> RelativePath {
        self.local
            .as_ref()
            .filter(|d| d.kind != DeltaKind::Deleted)
            .map(|d| d.path.clone())
            .unwrap_or_else(|| self.item.local_path().clone())
    }
}

fn introduces(delta: &ItemDelta) -> bool {
    matches!(delta.kind, DeltaKind::Created | DeltaKind::Moved)
}

/// Folders whose deletion is being propagated this cycle
#[derive(Debug, Default)]
struct DeletedFolders {
    remote: Vec<RelativePath>,
    local: Vec<RelativePath>,
}

impl DeletedFolders {
    fn collect(works: &[Work<'_>]) -> Self {
        let mut folders = Self::default();
        for work in works.iter().filter(|w| w.item.is_directory()) {
            if work.remote.as_ref().is_some_and(|d| d.kind == DeltaKind::Deleted) {
                folders.remote.push(work.item.local_path().clone());
            }
            if work.local.as_ref().is_some_and(|d| d.kind == DeltaKind::Deleted) {
                folders.local.push(work.item.local_path().clone());
            }
        }
        folders
    }

    fn tree_facts(&self, work: &Work<'_>) -> TreeFacts {
        let lands_under = |delta: &Option<ItemDelta>, folders: &[RelativePath]| {
            delta
                .as_ref()
                .filter(|d| introduces(d))
                .is_some_and(|d| Self::under(folders, &d.path))
        };
        TreeFacts {
            local_target_parent_deleted_remotely: lands_under(&work.local, &self.remote),
            remote_target_parent_deleted_locally: lands_under(&work.remote, &self.local),
        }
    }

    fn parent_alive(&self, path: &RelativePath) -> bool {
        !Self::under(&self.remote, path) && !Self::under(&self.local, path)
    }

    fn under(folders: &[RelativePath], path: &RelativePath) -> bool {
        folders.iter().any(|f| path.is_descendant_of(f))
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Turns per-item deltas into a [`Plan`]
#[derive(Debug, Clone)]
pub struct Reconciler {
    validator: NameValidator,
    exclusions: ExclusionMatcher,
    policies: PolicyEngine,
    planner: ResolutionPlanner,
    namer: ConflictNamer,
    case_insensitive: bool,
    /// 0 disables the check
    max_upload_bytes: u64,
}

impl Reconciler {
    pub fn new(config: &Config) -> Self {
        Self {
            validator: NameValidator::new(&config.platform),
            exclusions: ExclusionMatcher::new(&config.exclusions),
            policies: PolicyEngine::new(&config.conflicts),
            planner: ResolutionPlanner::new(ConflictNamer::new(config.platform.max_name_length)),
            namer: ConflictNamer::new(config.platform.max_name_length),
            case_insensitive: config.platform.effective_case_insensitive(),
            max_upload_bytes: config.sync.max_upload_size_mb.saturating_mul(1024 * 1024),
        }
    }

    /// Plans the cycle for every item of `input`
    #[instrument(skip_all, fields(session_id = %input.session.id(), items = input.items.len()))]
    pub fn reconcile(&self, input: &ReconcileInput<'_>) -> Plan {
        let mut works: Vec<Work<'_>> = input
            .items
            .iter()
            .map(|item| Work::new(item, input.scan.entry(item.id())))
            .collect();
        works.sort_by(|a, b| {
            a.current
                .cmp(&b.current)
                .then_with(|| a.item.id().cmp(b.item.id()))
        });

        let deleted = DeletedFolders::collect(&works);
        let duplicates = self.case_duplicates(&works);
        let mut occupied = self.occupied(&works, input.scan);
        let mut blocked: Vec<RelativePath> = Vec::new();
        let mut plan = Plan::default();

        for work in &works {
            let item = work.item;
            let id = *item.id();

            if Self::is_blocked(&blocked, work) {
                continue;
            }

            if !item.state().is_reconcilable() {
                Self::hold(work, &mut plan);
                if item.is_directory() && item.state() != SyncState::Conflicted {
                    blocked.push(work.current.clone());
                    blocked.push(item.local_path().clone());
                }
                continue;
            }

            if !item.was_synced() {
                if let Some(exclusion) = self.exclusion(&work.target) {
                    debug!(item_id = %id, path = %work.target, template = %exclusion.template, "Item excluded");
                    match exclusion.kind {
                        ExclusionKind::Warn => plan
                            .blacklist
                            .push((id, BlacklistReason::CustomTemplateExclusion)),
                        ExclusionKind::Silent => plan.excluded.push((id, work.target.clone())),
                    }
                    if item.is_directory() {
                        blocked.push(work.target.clone());
                    }
                    continue;
                }
            }

            if let Some(placeholder) = input
                .scan
                .over_placeholders
                .get(&id)
                .and_then(|p| input.items.iter().find(|i| i.id() == p))
                .filter(|p| !p.remote_deleted())
            {
                self.set_aside_from_placeholder(work, placeholder, input, &mut occupied, &mut plan);
                continue;
            }

            let open = input.open_conflicts.get(&id);
            if !work.has_deltas() {
                if let Some(record) = open {
                    plan.vanished_conflicts.push(*record.id());
                }
                if item.was_synced() && item.state() != SyncState::Synced {
                    plan.settled.push(id);
                }
                continue;
            }

            let tree = deleted.tree_facts(work);
            if let Some(detected) =
                ConflictDetector::detect(item, work.local.as_ref(), work.remote.as_ref(), tree)
            {
                self.resolve(work, detected, open, input, &deleted, &mut occupied, &mut plan);
                continue;
            }
            if let Some(record) = open {
                plan.vanished_conflicts.push(*record.id());
            }

            let actions = self.propagate(work, input.session.lite_sync());
            match self.violation(work, &actions, &duplicates) {
                Some(reason) => {
                    debug!(item_id = %id, path = %work.target, reason = %reason, "Item violates naming rules");
                    plan.blacklist.push((id, reason));
                    if item.is_directory() {
                        blocked.push(work.target.clone());
                        blocked.push(work.current.clone());
                    }
                }
                None => plan.actions.extend(actions),
            }
        }

        Self::drop_implied_moves(&mut plan.actions);
        Self::restore_deleted_ancestors(&mut plan.actions);

        debug!(
            actions = plan.actions.len(),
            conflicts = plan.conflicts.len(),
            blacklisted = plan.blacklist.len(),
            excluded = plan.excluded.len(),
            settled = plan.settled.len(),
            "Reconciliation complete"
        );
        plan
    }

    fn is_blocked(blocked: &[RelativePath], work: &Work<'_>) -> bool {
        blocked.iter().any(|b| {
            work.current.is_descendant_of(b)
                || work.target.is_descendant_of(b)
                || work.item.local_path().is_descendant_of(b)
        })
    }

    /// Items outside the reconcilable states; only remediation is noticed
    fn hold(work: &Work<'_>, plan: &mut Plan) {
        if !work.item.state().is_blacklisted() {
            return;
        }
        let remediated = work
            .local
            .as_ref()
            .is_some_and(|d| matches!(d.kind, DeltaKind::Moved | DeltaKind::Deleted));
        if remediated {
            plan.remediated.push(*work.item.id());
        }
    }

    /// Template matching `path` or one of its ancestors
    fn exclusion(&self, path: &RelativePath) -> Option<kdsync_conflict::ExclusionMatch> {
        let mut cursor = Some(path.clone());
        while let Some(p) = cursor {
            if p.is_root() {
                break;
            }
            if let Some(found) = self.exclusions.check(&p) {
                return Some(found);
            }
            cursor = p.parent();
        }
        None
    }

    /// Items whose new name collides case-insensitively with an existing one
    fn case_duplicates(&self, works: &[Work<'_>]) -> HashSet<UniqueId> {
        let mut duplicates = HashSet::new();
        if !self.case_insensitive {
            return duplicates;
        }
        let mut index = SiblingIndex::new();
        let (moving, stable): (Vec<&Work<'_>>, Vec<&Work<'_>>) = works
            .iter()
            .filter(|w| !w.is_going_away())
            .partition(|w| w.introduces_name());
        for work in stable {
            index.claim(&work.current, *work.item.id());
        }
        let mut moving = moving;
        moving.sort_by(|a, b| a.target.cmp(&b.target));
        for work in moving {
            if !index.claim(&work.target, *work.item.id()) {
                duplicates.insert(*work.item.id());
            }
        }
        duplicates
    }

    fn occupied(&self, works: &[Work<'_>], scan: &LocalScan) -> OccupiedPaths {
        let mut occupied = OccupiedPaths::new(self.case_insensitive);
        for work in works {
            occupied.insert(work.item.local_path());
            occupied.insert(work.item.remote_path());
            occupied.insert(&work.current);
            occupied.insert(&work.target);
        }
        for entry in scan.entries.values() {
            occupied.insert(&entry.path);
        }
        occupied
    }

    // ------------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn resolve(
        &self,
        work: &Work<'_>,
        detected: DetectedConflict,
        open: Option<&ConflictRecord>,
        input: &ReconcileInput<'_>,
        deleted: &DeletedFolders,
        occupied: &mut OccupiedPaths,
        plan: &mut Plan,
    ) {
        let item = work.item;
        let reused = open.filter(|r| r.kind() == detected.kind);
        if let (Some(stale), None) = (open, reused) {
            plan.vanished_conflicts.push(*stale.id());
        }

        let policy = match reused {
            Some(record)
                if record.policy() != ConflictPolicy::Manual
                    && policy_applies(detected.kind, record.policy()) =>
            {
                record.policy()
            }
            _ => self.policies.evaluate(detected.kind, &work.current),
        };
        let is_new = reused.is_none();
        let mut record = match reused {
            Some(record) => record.clone(),
            None => ConflictRecord::new(
                *input.session.id(),
                *item.id(),
                work.current.clone(),
                detected.kind,
                policy,
                input.at,
            )
            .with_versions(
                item.local_fingerprint().cloned(),
                item.remote_fingerprint().cloned(),
            ),
        };
        record.decide(policy);

        if policy == ConflictPolicy::Manual {
            plan.conflicts.push(PlannedConflict {
                record,
                manual: true,
                is_new,
            });
            return;
        }

        let request = PlanRequest {
            item,
            conflict_id: *record.id(),
            kind: detected.kind,
            side: detected.side,
            policy,
            local_path: work.local_path(),
            remote_path: item.remote_path().clone(),
            original_path: item.local_path().clone(),
            original_parent_alive: deleted.parent_alive(item.local_path()),
            lite_sync: input.session.lite_sync(),
            at: input.at,
        };
        match self.planner.plan(&request, occupied) {
            Ok(resolution) => {
                let manual = resolution.is_manual();
                if manual {
                    record.decide(ConflictPolicy::Manual);
                }
                if let Some(copy) = resolution.copy_path {
                    record = record.with_copy_path(copy);
                }
                plan.actions.extend(resolution.actions);
                plan.conflicts.push(PlannedConflict {
                    record,
                    manual,
                    is_new,
                });
            }
            Err(e) => {
                warn!(
                    item_id = %item.id(),
                    kind = %detected.kind,
                    policy = %policy,
                    error = %e,
                    "Conflict cannot be resolved automatically"
                );
                record.decide(ConflictPolicy::Manual);
                plan.conflicts.push(PlannedConflict {
                    record,
                    manual: true,
                    is_new,
                });
            }
        }
    }

    /// Plans a new local file found at `placeholder`'s path
    fn set_aside_from_placeholder(
        &self,
        work: &Work<'_>,
        placeholder: &SyncItem,
        input: &ReconcileInput<'_>,
        occupied: &mut OccupiedPaths,
        plan: &mut Plan,
    ) {
        let item = work.item;
        let id = *item.id();
        let kind = ConflictKind::CreateCreate;
        let reused = input.open_conflicts.get(&id).filter(|r| r.kind() == kind);
        let is_new = reused.is_none();
        let mut record = match reused {
            Some(record) => record.clone(),
            None => ConflictRecord::new(
                *input.session.id(),
                id,
                work.current.clone(),
                kind,
                self.policies.evaluate(kind, &work.current),
                input.at,
            )
            .with_versions(
                item.local_fingerprint().cloned(),
                placeholder.remote_fingerprint().cloned(),
            ),
        };
        if record.policy() == ConflictPolicy::Manual {
            plan.conflicts.push(PlannedConflict {
                record,
                manual: true,
                is_new,
            });
            return;
        }

        let copy = match self
            .namer
            .conflict_copy_path(&work.current, input.at, |p| occupied.contains(p))
        {
            Ok(copy) => copy,
            Err(e) => {
                warn!(item_id = %id, path = %work.current, error = %e, "No free name for the local copy");
                record.decide(ConflictPolicy::Manual);
                plan.conflicts.push(PlannedConflict {
                    record,
                    manual: true,
                    is_new,
                });
                return;
            }
        };
        occupied.insert(&copy);
        record.decide(ConflictPolicy::RenameLocalAndDownloadRemote);
        let conflict_id = *record.id();
        debug!(item_id = %id, path = %work.current, copy = %copy, "Local file set aside from placeholder");

        plan.actions.push(
            SyncAction::new(
                id,
                ActionKind::MoveLocal {
                    from: work.current.clone(),
                    to: copy.clone(),
                },
            )
            .resolving(conflict_id),
        );
        plan.actions.push(
            SyncAction::new(
                id,
                ActionKind::Upload {
                    path: copy.clone(),
                    remote_id: None,
                },
            )
            .resolving(conflict_id),
        );
        plan.conflicts.push(PlannedConflict {
            record: record.with_copy_path(copy),
            manual: false,
            is_new,
        });
    }

    // ------------------------------------------------------------------------
    // Propagation
    // ------------------------------------------------------------------------

    fn propagate(&self, work: &Work<'_>, lite_sync: bool) -> Vec<SyncAction> {
        let item = work.item;
        let kinds = match (&work.local, &work.remote) {
            (Some(local), None) => Self::push(item, local),
            (None, Some(remote)) => Self::pull(item, remote, lite_sync),
            (Some(local), Some(remote)) => Self::merge(item, local, remote),
            (None, None) => Vec::new(),
        };
        kinds
            .into_iter()
            .map(|kind| SyncAction::new(*item.id(), kind))
            .collect()
    }

    /// Local change only
    fn push(item: &SyncItem, local: &ItemDelta) -> Vec<ActionKind> {
        let remote_id = item.remote_id().cloned();
        let create = |path: &RelativePath| {
            if local.is_directory {
                ActionKind::CreateRemoteFolder { path: path.clone() }
            } else {
                ActionKind::Upload {
                    path: path.clone(),
                    remote_id: remote_id.clone(),
                }
            }
        };
        match local.kind {
            DeltaKind::Created => vec![create(&local.path)],
            DeltaKind::Edited => vec![ActionKind::Upload {
                path: local.path.clone(),
                remote_id: remote_id.clone(),
            }],
            DeltaKind::Moved => match &remote_id {
                Some(rid) => {
                    let mut kinds = vec![ActionKind::MoveRemote {
                        remote_id: rid.clone(),
                        from: item.remote_path().clone(),
                        to: local.path.clone(),
                    }];
                    if local.content_changed {
                        kinds.push(ActionKind::Upload {
                            path: local.path.clone(),
                            remote_id: Some(rid.clone()),
                        });
                    }
                    kinds
                }
                None => vec![create(&local.path)],
            },
            DeltaKind::Deleted => match &remote_id {
                Some(rid) => vec![ActionKind::DeleteRemote {
                    remote_id: rid.clone(),
                    path: item.remote_path().clone(),
                }],
                None => vec![ActionKind::Forget {
                    path: item.local_path().clone(),
                }],
            },
        }
    }

    /// Remote change only
    fn pull(item: &SyncItem, remote: &ItemDelta, lite_sync: bool) -> Vec<ActionKind> {
        let Some(rid) = remote.remote_id.clone() else {
            return Vec::new();
        };
        let virtual_only = item.placeholder() != PlaceholderState::Hydrated;
        match remote.kind {
            DeltaKind::Created if remote.is_directory => vec![ActionKind::CreateLocalFolder {
                path: remote.path.clone(),
            }],
            DeltaKind::Created if lite_sync => vec![ActionKind::CreatePlaceholder {
                path: remote.path.clone(),
            }],
            DeltaKind::Created => vec![ActionKind::Download {
                remote_id: rid,
                path: remote.path.clone(),
            }],
            DeltaKind::Edited | DeltaKind::Moved if virtual_only => {
                vec![ActionKind::UpdatePlaceholder {
                    path: remote.path.clone(),
                }]
            }
            DeltaKind::Edited => vec![ActionKind::Download {
                remote_id: rid,
                path: remote.path.clone(),
            }],
            DeltaKind::Moved => {
                let mut kinds = vec![ActionKind::MoveLocal {
                    from: item.local_path().clone(),
                    to: remote.path.clone(),
                }];
                if remote.content_changed {
                    kinds.push(ActionKind::Download {
                        remote_id: rid,
                        path: remote.path.clone(),
                    });
                }
                kinds
            }
            DeltaKind::Deleted if virtual_only || !item.present_locally() => {
                vec![ActionKind::Forget {
                    path: item.local_path().clone(),
                }]
            }
            DeltaKind::Deleted => vec![ActionKind::DeleteLocal {
                path: item.local_path().clone(),
            }],
        }
    }

    /// Compatible changes on both sides
    fn merge(item: &SyncItem, local: &ItemDelta, remote: &ItemDelta) -> Vec<ActionKind> {
        let Some(rid) = remote.remote_id.clone() else {
            return Self::push(item, local);
        };
        match (local.kind, remote.kind) {
            (DeltaKind::Deleted, DeltaKind::Deleted) => {
                return vec![ActionKind::Forget {
                    path: item.local_path().clone(),
                }]
            }
            (DeltaKind::Created, DeltaKind::Created) => {
                return vec![ActionKind::Link {
                    path: local.path.clone(),
                }]
            }
            (DeltaKind::Deleted, _) => {
                return vec![ActionKind::DeleteRemote {
                    remote_id: rid,
                    path: remote.path.clone(),
                }]
            }
            (_, DeltaKind::Deleted) => {
                return vec![ActionKind::DeleteLocal {
                    path: local.path.clone(),
                }]
            }
            _ => {}
        }

        let mut kinds = Vec::new();
        let target = if local.changes_path() {
            local.path.clone()
        } else if remote.changes_path() {
            remote.path.clone()
        } else {
            local.path.clone()
        };
        if local.changes_path() && !remote.changes_path() {
            kinds.push(ActionKind::MoveRemote {
                remote_id: rid.clone(),
                from: item.remote_path().clone(),
                to: target.clone(),
            });
        } else if remote.changes_path() && !local.changes_path() {
            kinds.push(ActionKind::MoveLocal {
                from: item.local_path().clone(),
                to: target.clone(),
            });
        }
        match (local.changes_content(), remote.changes_content()) {
            (true, false) => kinds.push(ActionKind::Upload {
                path: target.clone(),
                remote_id: Some(rid),
            }),
            (false, true) => kinds.push(ActionKind::Download {
                remote_id: rid,
                path: target.clone(),
            }),
            _ => {}
        }
        if kinds.is_empty() {
            kinds.push(ActionKind::Link { path: target });
        }
        kinds
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    fn violation(
        &self,
        work: &Work<'_>,
        actions: &[SyncAction],
        duplicates: &HashSet<UniqueId>,
    ) -> Option<BlacklistReason> {
        let item = work.item;
        for action in actions {
            let Some(target) = Self::introduced_name(item, &action.kind) else {
                continue;
            };
            if let Err(reason) = self.validator.check_path(target) {
                return Some(reason);
            }
            if duplicates.contains(item.id()) {
                return Some(BlacklistReason::DuplicateCaseInsensitiveName);
            }
        }

        let uploads = actions
            .iter()
            .any(|a| matches!(a.kind, ActionKind::Upload { .. }));
        if let Some(local) = work.local.as_ref().filter(|_| uploads) {
            if local.link_count > 1 {
                return Some(BlacklistReason::HardLink);
            }
            let size = local.fingerprint.as_ref().map_or(0, |fp| fp.size);
            if self.max_upload_bytes > 0 && size > self.max_upload_bytes {
                return Some(BlacklistReason::TooLarge);
            }
        }
        None
    }

    /// Path at which `kind` introduces a name that did not exist on that side
    fn introduced_name<'k>(item: &SyncItem, kind: &'k ActionKind) -> Option<&'k RelativePath> {
        match kind {
            ActionKind::Upload {
                path,
                remote_id: None,
            }
            | ActionKind::CreateRemoteFolder { path }
            | ActionKind::CreateLocalFolder { path }
            | ActionKind::CreatePlaceholder { path } => Some(path),
            ActionKind::MoveRemote { to, .. } | ActionKind::MoveLocal { to, .. } => Some(to),
            ActionKind::Download { path, .. } if !item.was_synced() => Some(path),
            _ => None,
        }
    }

    // ------------------------------------------------------------------------
    // Post-processing
    // ------------------------------------------------------------------------

    /// Drops moves that the move of an ancestor folder already performs
    fn drop_implied_moves(actions: &mut Vec<SyncAction>) {
        let moves: Vec<(bool, RelativePath, RelativePath)> = actions
            .iter()
            .filter(|a| a.conflict_id.is_none())
            .filter_map(|a| move_of(&a.kind))
            .collect();
        actions.retain(|action| {
            if action.conflict_id.is_some() {
                return true;
            }
            let Some((local, from, to)) = move_of(&action.kind) else {
                return true;
            };
            let implied = moves.iter().any(|(ancestor_local, af, at)| {
                *ancestor_local == local
                    && from.is_descendant_of(af)
                    && from.rebase(af, at).as_ref() == Some(&to)
            });
            if implied {
                debug!(from = %from, to = %to, "Dropping move implied by folder move");
            }
            !implied
        });
    }

    /// A restored child keeps its locally deleted folders alive
    fn restore_deleted_ancestors(actions: &mut [SyncAction]) {
        let restored: Vec<RelativePath> = actions
            .iter()
            .filter(|a| a.conflict_id.is_some())
            .filter(|a| {
                matches!(
                    a.kind,
                    ActionKind::Download { .. }
                        | ActionKind::CreateLocalFolder { .. }
                        | ActionKind::CreatePlaceholder { .. }
                )
            })
            .map(|a| a.path().clone())
            .collect();
        if restored.is_empty() {
            return;
        }
        for action in actions.iter_mut() {
            if let ActionKind::DeleteRemote { path, .. } = &action.kind {
                if restored.iter().any(|p| p.is_descendant_of(path)) {
                    let path = path.clone();
                    debug!(path = %path, "Recreating folder locally instead of deleting it remotely");
                    action.kind = ActionKind::CreateLocalFolder { path };
                }
            }
        }
    }
}

/// (local side, from, to) of a move action
fn move_of(kind: &ActionKind) -> Option<(bool, RelativePath, RelativePath)> {
    match kind {
        ActionKind::MoveLocal { from, to } => Some((true, from.clone(), to.clone())),
        ActionKind::MoveRemote { from, to, .. } => Some((false, from.clone(), to.clone())),
        _ => None,
    }
}
