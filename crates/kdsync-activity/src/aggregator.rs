//! Activity aggregation for user notifications
//!
//! Item events are grouped per session and kind over a flush window and
//! turned into one sentence per group:
//!
//! ```text
//! "a.txt has been added."
//! "a.txt and 4 other file(s) have been added."
//! "a.txt has been moved to b/a.txt."
//! "a.txt has been moved to b/a.txt and 2 other file(s) have been moved."
//! ```
//!
//! Only changes applied to the local tree are summarised; the user made
//! the ones that went up.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use kdsync_core::domain::{ActivityKind, Direction, RelativePath, SessionId, SyncEvent};
use kdsync_core::ports::IEventSink;

/// One rendered notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityMessage {
    pub session_id: SessionId,
    pub kind: ActivityKind,
    /// Files covered by the message
    pub count: usize,
    pub text: String,
}

#[derive(Debug)]
struct Group {
    session_id: SessionId,
    kind: ActivityKind,
    first: RelativePath,
    target: Option<RelativePath>,
    count: usize,
}

#[derive(Debug, Default)]
struct State {
    // first-seen order
    groups: Vec<Group>,
    muted: HashSet<SessionId>,
}

/// Renders the sentence for a group of `count` files led by `first`
pub fn render(kind: ActivityKind, first: &RelativePath, target: Option<&RelativePath>, count: usize) -> String {
    let others = count.saturating_sub(1);
    match kind {
        ActivityKind::Moved => {
            let target = target.map(RelativePath::as_str).unwrap_or_default();
            if others == 0 {
                format!("{first} has been moved to {target}.")
            } else {
                format!("{first} has been moved to {target} and {others} other file(s) have been moved.")
            }
        }
        _ => {
            let verb = kind.as_str();
            if others == 0 {
                format!("{first} has been {verb}.")
            } else {
                format!("{first} and {others} other file(s) have been {verb}.")
            }
        }
    }
}

/// Groups item events into notification messages
#[derive(Debug, Default)]
pub struct ActivityAggregator {
    state: Mutex<State>,
}

impl ActivityAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Adds an event to the pending groups
    ///
    /// A paused session is muted until it resumes; pausing drops what is
    /// pending for it.
    pub fn record(&self, event: &SyncEvent) {
        let mut state = self.lock();

        match event {
            SyncEvent::SessionRemoved { session_id } => {
                state.groups.retain(|g| g.session_id != *session_id);
                state.muted.remove(session_id);
                return;
            }
            SyncEvent::SessionPaused { session_id, .. } => {
                state.muted.insert(*session_id);
                state.groups.retain(|g| g.session_id != *session_id);
                return;
            }
            SyncEvent::SessionResumed { session_id } => {
                state.muted.remove(session_id);
                return;
            }
            _ => {}
        }

        let Some(kind) = event.activity() else {
            return;
        };
        let (first, target, direction) = match event {
            SyncEvent::ItemAdded { path, direction, .. }
            | SyncEvent::ItemRemoved { path, direction, .. }
            | SyncEvent::ItemUpdated { path, direction, .. } => (path, None, *direction),
            SyncEvent::ItemMoved { from, to, direction, .. } => (from, Some(to), *direction),
            _ => return,
        };
        let session_id = *event.session_id();
        if direction != Direction::Down || state.muted.contains(&session_id) {
            return;
        }

        match state
            .groups
            .iter_mut()
            .find(|g| g.session_id == session_id && g.kind == kind)
        {
            Some(group) => group.count += 1,
            None => state.groups.push(Group {
                session_id,
                kind,
                first: first.clone(),
                target: target.cloned(),
                count: 1,
            }),
        }
    }

    /// Number of groups waiting for the next flush
    pub fn pending(&self) -> usize {
        self.lock().groups.len()
    }

    /// Renders and clears every pending group
    pub fn flush(&self) -> Vec<ActivityMessage> {
        let groups = std::mem::take(&mut self.lock().groups);
        groups
            .into_iter()
            .map(|g| ActivityMessage {
                text: render(g.kind, &g.first, g.target.as_ref(), g.count),
                session_id: g.session_id,
                kind: g.kind,
                count: g.count,
            })
            .collect()
    }

    /// Flushes every `window` into `out` until `cancel` fires
    ///
    /// A last flush runs on cancellation. The loop also stops when the
    /// receiver of `out` is dropped.
    pub async fn run(
        self: Arc<Self>,
        window: Duration,
        out: mpsc::Sender<ActivityMessage>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(window);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            let stopping = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = ticker.tick() => false,
            };
            for message in self.flush() {
                debug!(session_id = %message.session_id, count = message.count, "Activity notification");
                if out.send(message).await.is_err() {
                    info!("Notification receiver gone, aggregator stopping");
                    return;
                }
            }
            if stopping {
                break;
            }
        }
    }
}

impl IEventSink for ActivityAggregator {
    fn emit(&self, event: SyncEvent) {
        self.record(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdsync_core::domain::UniqueId;

    fn path(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    fn added(session_id: SessionId, p: &str, direction: Direction) -> SyncEvent {
        SyncEvent::ItemAdded {
            session_id,
            item_id: UniqueId::new(),
            path: path(p),
            direction,
        }
    }

    fn moved(session_id: SessionId, from: &str, to: &str) -> SyncEvent {
        SyncEvent::ItemMoved {
            session_id,
            item_id: UniqueId::new(),
            from: path(from),
            to: path(to),
            direction: Direction::Down,
        }
    }

    mod rendering {
        use super::*;

        #[test]
        fn test_single_and_grouped_sentences() {
            assert_eq!(
                render(ActivityKind::Added, &path("a.txt"), None, 1),
                "a.txt has been added."
            );
            assert_eq!(
                render(ActivityKind::Removed, &path("a.txt"), None, 5),
                "a.txt and 4 other file(s) have been removed."
            );
            assert_eq!(
                render(ActivityKind::Updated, &path("docs/r.md"), None, 2),
                "docs/r.md and 1 other file(s) have been updated."
            );
        }

        #[test]
        fn test_move_sentences() {
            assert_eq!(
                render(ActivityKind::Moved, &path("a.txt"), Some(&path("b/a.txt")), 1),
                "a.txt has been moved to b/a.txt."
            );
            assert_eq!(
                render(ActivityKind::Moved, &path("a.txt"), Some(&path("b/a.txt")), 3),
                "a.txt has been moved to b/a.txt and 2 other file(s) have been moved."
            );
        }
    }

    mod grouping {
        use super::*;

        #[test]
        fn test_groups_per_session_and_kind() {
            let agg = ActivityAggregator::new();
            let s1 = SessionId::new();
            let s2 = SessionId::new();
            agg.record(&added(s1, "a.txt", Direction::Down));
            agg.record(&added(s1, "b.txt", Direction::Down));
            agg.record(&added(s2, "c.txt", Direction::Down));
            agg.record(&moved(s1, "x", "y/x"));
            assert_eq!(agg.pending(), 3);

            let messages = agg.flush();
            assert_eq!(messages.len(), 3);
            assert_eq!(messages[0].session_id, s1);
            assert_eq!(messages[0].count, 2);
            assert_eq!(messages[0].text, "a.txt and 1 other file(s) have been added.");
            assert_eq!(messages[1].text, "c.txt has been added.");
            assert_eq!(messages[2].kind, ActivityKind::Moved);
            assert_eq!(agg.pending(), 0);
        }

        #[test]
        fn test_uploads_and_other_events_are_ignored() {
            let agg = ActivityAggregator::new();
            let sid = SessionId::new();
            agg.record(&added(sid, "mine.txt", Direction::Up));
            agg.record(&SyncEvent::SessionResumed { session_id: sid });
            assert!(agg.flush().is_empty());
        }

        #[test]
        fn test_paused_session_is_silent() {
            let agg = ActivityAggregator::new();
            let sid = SessionId::new();
            agg.record(&added(sid, "a.txt", Direction::Down));
            agg.record(&SyncEvent::SessionPaused {
                session_id: sid,
                reason: "Paused by user".into(),
            });
            assert_eq!(agg.pending(), 0);
            agg.record(&added(sid, "b.txt", Direction::Down));
            assert!(agg.flush().is_empty());

            agg.record(&SyncEvent::SessionResumed { session_id: sid });
            agg.record(&added(sid, "c.txt", Direction::Down));
            assert_eq!(agg.flush()[0].text, "c.txt has been added.");
        }

        #[test]
        fn test_removed_session_drops_pending() {
            let agg = ActivityAggregator::new();
            let sid = SessionId::new();
            agg.record(&added(sid, "a.txt", Direction::Down));
            agg.record(&SyncEvent::SessionRemoved { session_id: sid });
            assert!(agg.flush().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_flushes_each_window_and_on_cancel() {
        let agg = Arc::new(ActivityAggregator::new());
        let sid = SessionId::new();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&agg).run(
            Duration::from_secs(2),
            tx,
            cancel.clone(),
        ));

        agg.record(&added(sid, "a.txt", Direction::Down));
        agg.record(&added(sid, "b.txt", Direction::Down));
        let first = rx.recv().await.unwrap();
        assert_eq!(first.count, 2);

        agg.record(&added(sid, "c.txt", Direction::Down));
        cancel.cancel();
        let last = rx.recv().await.unwrap();
        assert_eq!(last.text, "c.txt has been added.");

        task.await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
