//! Ordering of planned actions into waves
//!
//! Actions run phase by phase (preserve, structure, move, content,
//! delete). Within a phase, actions are split by path depth: parents
//! before children, except in the delete phase where children go first.
//! Every action of a wave is independent of the others in that wave,
//! apart from actions on the same item, which run in plan order.

use std::collections::BTreeMap;

use kdsync_core::domain::{Phase, SyncAction, UniqueId};

/// Actions that may run concurrently
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wave {
    pub phase: Phase,
    pub depth: usize,
    pub actions: Vec<SyncAction>,
}

impl Wave {
    /// Actions grouped by item, each group in plan order
    pub fn by_item(&self) -> Vec<(UniqueId, Vec<SyncAction>)> {
        let mut groups: Vec<(UniqueId, Vec<SyncAction>)> = Vec::new();
        for action in &self.actions {
            match groups.iter_mut().find(|(id, _)| *id == action.item_id) {
                Some((_, group)) => group.push(action.clone()),
                None => groups.push((action.item_id, vec![action.clone()])),
            }
        }
        groups
    }
}

/// Splits `actions` into ordered waves
pub fn into_waves(actions: Vec<SyncAction>) -> Vec<Wave> {
    // Depth is negated for deletes so the map order is the execution order
    let mut buckets: BTreeMap<(Phase, i64), Vec<SyncAction>> = BTreeMap::new();
    for action in actions {
        let phase = action.phase();
        let depth = action.path().depth() as i64;
        let key = if phase == Phase::Delete { -depth } else { depth };
        buckets.entry((phase, key)).or_default().push(action);
    }
    buckets
        .into_iter()
        .map(|((phase, key), actions)| Wave {
            phase,
            depth: key.unsigned_abs() as usize,
            actions,
        })
        .collect()
}
