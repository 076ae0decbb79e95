//! Conflict resolution planning
//!
//! Turns a detected conflict and the policy chosen for it into the sync
//! actions that carry the resolution out. Planning is pure: no file or
//! network operation happens here. The actions run through the regular
//! executor and the conflict record is closed once they succeed.
//!
//! | Policy                         | Actions                                             |
//! |--------------------------------|-----------------------------------------------------|
//! | RenameLocalAndDownloadRemote   | set local aside as a copy, upload copy, download    |
//! | KeepBoth                       | download remote into a copy, upload copy and local  |
//! | CancelLocalOperation           | move local back to the remote path                  |
//! | RestoreToOriginalLocation      | download again, or undo the move                    |
//! | RescueToRoot                   | move the content to the root as a new item          |
//! | Manual                         | nothing; the item stays `Conflicted`                |

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::debug;

use kdsync_core::domain::{
    ActionKind, ConflictId, ConflictKind, ConflictPolicy, RelativePath, Side, SyncAction,
    SyncItem, UniqueId,
};

use crate::{error::ConflictError, namer::ConflictNamer, policy::policy_applies};

// ============================================================================
// OccupiedPaths
// ============================================================================

/// Paths already used on either side, plus paths claimed by earlier plans
///
/// Generated names are checked against it so two resolutions in the same
/// cycle never pick the same copy or rescue name.
#[derive(Debug, Clone, Default)]
pub struct OccupiedPaths {
    paths: HashSet<String>,
    case_insensitive: bool,
}

impl OccupiedPaths {
    pub fn new(case_insensitive: bool) -> Self {
        Self {
            paths: HashSet::new(),
            case_insensitive,
        }
    }

    fn key(&self, path: &RelativePath) -> String {
        if self.case_insensitive {
            path.folded()
        } else {
            path.as_str().to_string()
        }
    }

    pub fn insert(&mut self, path: &RelativePath) {
        let key = self.key(path);
        self.paths.insert(key);
    }

    pub fn contains(&self, path: &RelativePath) -> bool {
        self.paths.contains(&self.key(path))
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

// ============================================================================
// Planning
// ============================================================================

/// Everything needed to plan one resolution
#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    pub item: &'a SyncItem,
    pub conflict_id: ConflictId,
    pub kind: ConflictKind,
    /// Side whose change is at risk
    pub side: Side,
    pub policy: ConflictPolicy,
    /// Current local path of the item
    pub local_path: RelativePath,
    /// Current remote path of the item
    pub remote_path: RelativePath,
    /// Last-known-synced path
    pub original_path: RelativePath,
    /// Whether the parent of `original_path` still exists on both sides
    pub original_parent_alive: bool,
    /// Remote creations arrive as virtual entries
    pub lite_sync: bool,
    /// Timestamp used in conflict copy names
    pub at: DateTime<Utc>,
}

/// Actions implementing a resolution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionPlan {
    pub actions: Vec<SyncAction>,
    /// Where at-risk content ends up under a new name
    pub copy_path: Option<RelativePath>,
}

impl ResolutionPlan {
    /// Whether the plan leaves the conflict to the user
    pub fn is_manual(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Plans the actions of a conflict resolution
#[derive(Debug, Clone, Copy)]
pub struct ResolutionPlanner {
    namer: ConflictNamer,
}

impl ResolutionPlanner {
    pub fn new(namer: ConflictNamer) -> Self {
        Self { namer }
    }

    /// Plans the resolution, claiming generated names in `occupied`
    ///
    /// # Errors
    /// `ConflictError::PolicyNotApplicable` when the policy cannot resolve
    /// this kind of conflict; `ConflictError::Domain` when no free name
    /// can be generated.
    pub fn plan(
        &self,
        request: &PlanRequest<'_>,
        occupied: &mut OccupiedPaths,
    ) -> Result<ResolutionPlan, ConflictError> {
        if !policy_applies(request.kind, request.policy) {
            return Err(ConflictError::PolicyNotApplicable {
                kind: request.kind,
                policy: request.policy,
            });
        }

        let plan = match request.policy {
            ConflictPolicy::Manual => ResolutionPlan::default(),
            ConflictPolicy::RenameLocalAndDownloadRemote => {
                self.rename_local_and_download(request, occupied)?
            }
            ConflictPolicy::KeepBoth => self.keep_both(request, occupied)?,
            ConflictPolicy::CancelLocalOperation => self.cancel_local(request, occupied)?,
            ConflictPolicy::RestoreToOriginalLocation => self.restore(request, occupied)?,
            ConflictPolicy::RescueToRoot => self.rescue(request, occupied)?,
        };

        debug!(
            item_id = %request.item.id(),
            kind = %request.kind,
            policy = %request.policy,
            actions = plan.actions.len(),
            copy = ?plan.copy_path.as_ref().map(|p| p.as_str()),
            "Planned conflict resolution"
        );
        Ok(plan)
    }

    /// Local content becomes a conflict copy; the remote version takes the path
    fn rename_local_and_download(
        &self,
        request: &PlanRequest<'_>,
        occupied: &mut OccupiedPaths,
    ) -> Result<ResolutionPlan, ConflictError> {
        let item = request.item;
        let id = *item.id();
        let copy = self.namer.conflict_copy_path(&request.local_path, request.at, |p| {
            occupied.contains(p)
        })?;
        occupied.insert(&copy);
        let new_item = UniqueId::new();

        let mut actions = vec![
            self.action(
                request,
                id,
                ActionKind::SetAside {
                    from: request.local_path.clone(),
                    to: copy.clone(),
                    new_item,
                    forget_original: false,
                },
            ),
            self.action(request, new_item, Self::push_new(item, &copy)).requiring(id),
        ];
        if let Some(remote_id) = item.remote_id() {
            let fetch = if item.is_directory() {
                ActionKind::CreateLocalFolder {
                    path: request.remote_path.clone(),
                }
            } else {
                ActionKind::Download {
                    remote_id: remote_id.clone(),
                    path: request.remote_path.clone(),
                }
            };
            actions.push(self.action(request, id, fetch).requiring(id));
        }

        Ok(ResolutionPlan {
            actions,
            copy_path: Some(copy),
        })
    }

    /// Remote content becomes a conflict copy; the local version is uploaded
    fn keep_both(
        &self,
        request: &PlanRequest<'_>,
        occupied: &mut OccupiedPaths,
    ) -> Result<ResolutionPlan, ConflictError> {
        let item = request.item;
        let id = *item.id();
        let Some(remote_id) = item.remote_id().cloned() else {
            // Nothing remote to keep: plain upload
            let upload = ActionKind::Upload {
                path: request.local_path.clone(),
                remote_id: None,
            };
            return Ok(ResolutionPlan {
                actions: vec![self.action(request, id, upload)],
                copy_path: None,
            });
        };

        let copy = self.namer.conflict_copy_path(&request.local_path, request.at, |p| {
            occupied.contains(p)
        })?;
        occupied.insert(&copy);
        let new_item = UniqueId::new();

        let actions = vec![
            self.action(
                request,
                id,
                ActionKind::DownloadCopy {
                    remote_id: remote_id.clone(),
                    to: copy.clone(),
                    new_item,
                },
            ),
            self.action(
                request,
                new_item,
                ActionKind::Upload {
                    path: copy.clone(),
                    remote_id: None,
                },
            )
            .requiring(id),
            self.action(
                request,
                id,
                ActionKind::Upload {
                    path: request.local_path.clone(),
                    remote_id: Some(remote_id),
                },
            )
            .requiring(id),
        ];

        Ok(ResolutionPlan {
            actions,
            copy_path: Some(copy),
        })
    }

    /// Undo the local move: the item goes back to where the remote has it
    fn cancel_local(
        &self,
        request: &PlanRequest<'_>,
        occupied: &mut OccupiedPaths,
    ) -> Result<ResolutionPlan, ConflictError> {
        if request.kind == ConflictKind::MoveIntoDeletedParent {
            return self.restore(request, occupied);
        }
        let id = *request.item.id();
        occupied.insert(&request.remote_path);
        Ok(ResolutionPlan {
            actions: vec![self.action(
                request,
                id,
                ActionKind::MoveLocal {
                    from: request.local_path.clone(),
                    to: request.remote_path.clone(),
                },
            )],
            copy_path: None,
        })
    }

    fn restore(
        &self,
        request: &PlanRequest<'_>,
        occupied: &mut OccupiedPaths,
    ) -> Result<ResolutionPlan, ConflictError> {
        let item = request.item;
        let id = *item.id();

        if request.kind == ConflictKind::DeleteEdit {
            let Some(remote_id) = item.remote_id() else {
                return Ok(ResolutionPlan::default());
            };
            occupied.insert(&request.remote_path);
            let fetch = if item.is_directory() {
                ActionKind::CreateLocalFolder {
                    path: request.remote_path.clone(),
                }
            } else {
                ActionKind::Download {
                    remote_id: remote_id.clone(),
                    path: request.remote_path.clone(),
                }
            };
            return Ok(ResolutionPlan {
                actions: vec![self.action(request, id, fetch)],
                copy_path: None,
            });
        }

        // Move into a deleted parent: undo the move on the moving side
        let target = if request.original_parent_alive {
            request.original_path.clone()
        } else {
            let rescued = self
                .namer
                .rescue_path(&request.original_path, |p| occupied.contains(p))?;
            occupied.insert(&rescued);
            rescued
        };

        let mut actions = Vec::new();
        if request.local_path != target {
            actions.push(self.action(
                request,
                id,
                ActionKind::MoveLocal {
                    from: request.local_path.clone(),
                    to: target.clone(),
                },
            ));
        }
        if request.remote_path != target {
            if let Some(remote_id) = item.remote_id() {
                actions.push(self.action(
                    request,
                    id,
                    ActionKind::MoveRemote {
                        remote_id: remote_id.clone(),
                        from: request.remote_path.clone(),
                        to: target.clone(),
                    },
                ));
            }
        }

        Ok(ResolutionPlan {
            copy_path: (target != request.original_path).then_some(target),
            actions,
        })
    }

    /// Move at-risk content to the session root
    fn rescue(
        &self,
        request: &PlanRequest<'_>,
        occupied: &mut OccupiedPaths,
    ) -> Result<ResolutionPlan, ConflictError> {
        let item = request.item;
        let id = *item.id();

        let (actions, rescued) = match request.side {
            Side::Local => {
                let rescued = self
                    .namer
                    .rescue_path(&request.local_path, |p| occupied.contains(p))?;
                occupied.insert(&rescued);
                let new_item = UniqueId::new();
                let actions = vec![
                    self.action(
                        request,
                        id,
                        ActionKind::SetAside {
                            from: request.local_path.clone(),
                            to: rescued.clone(),
                            new_item,
                            forget_original: true,
                        },
                    ),
                    self.action(request, new_item, Self::push_new(item, &rescued))
                        .requiring(id),
                ];
                (actions, rescued)
            }
            Side::Remote => {
                let Some(remote_id) = item.remote_id() else {
                    return Ok(ResolutionPlan::default());
                };
                let rescued = self
                    .namer
                    .rescue_path(&request.remote_path, |p| occupied.contains(p))?;
                occupied.insert(&rescued);
                let fetch = if item.is_directory() {
                    ActionKind::CreateLocalFolder {
                        path: rescued.clone(),
                    }
                } else if request.lite_sync {
                    ActionKind::CreatePlaceholder {
                        path: rescued.clone(),
                    }
                } else {
                    ActionKind::Download {
                        remote_id: remote_id.clone(),
                        path: rescued.clone(),
                    }
                };
                let actions = vec![
                    self.action(
                        request,
                        id,
                        ActionKind::MoveRemote {
                            remote_id: remote_id.clone(),
                            from: request.remote_path.clone(),
                            to: rescued.clone(),
                        },
                    ),
                    self.action(request, id, fetch).requiring(id),
                ];
                (actions, rescued)
            }
        };

        Ok(ResolutionPlan {
            actions,
            copy_path: Some(rescued),
        })
    }

    /// Upload (or folder creation) of content set aside under `path`
    fn push_new(item: &SyncItem, path: &RelativePath) -> ActionKind {
        if item.is_directory() {
            ActionKind::CreateRemoteFolder { path: path.clone() }
        } else {
            ActionKind::Upload {
                path: path.clone(),
                remote_id: None,
            }
        }
    }

    fn action(&self, request: &PlanRequest<'_>, item_id: UniqueId, kind: ActionKind) -> SyncAction {
        SyncAction::new(item_id, kind).resolving(request.conflict_id)
    }
}
