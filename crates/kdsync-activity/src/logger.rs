//! ActivityLogger - persists the event stream to the activity log
//!
//! `IEventSink::emit` must not block, so events are queued on an unbounded
//! channel and written by a background task. Persistence failures are
//! logged via `tracing::warn!` and never reach the engine.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use kdsync_core::domain::{SessionId, SyncEvent};
use kdsync_core::ports::{ActivityRecord, IEventSink, IStateRepository};

/// Event sink that appends events to the store's activity log
#[derive(Clone)]
pub struct ActivityLogger {
    tx: mpsc::UnboundedSender<SyncEvent>,
    repository: Arc<dyn IStateRepository>,
}

impl ActivityLogger {
    /// Creates the logger and spawns its writer task
    ///
    /// The task ends once every clone of the logger has been dropped and
    /// the queue is drained; await the handle to flush on shutdown.
    pub fn spawn(repository: Arc<dyn IStateRepository>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<SyncEvent>();
        let writer = Arc::clone(&repository);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = writer.record_activity(&event).await {
                    warn!(event = event.name(), error = %e, "Failed to record activity");
                }
            }
            debug!("Activity writer stopped");
        });
        (Self { tx, repository }, handle)
    }

    /// Most recent entries, newest first
    pub async fn recent(
        &self,
        session_id: Option<&SessionId>,
        limit: u32,
    ) -> anyhow::Result<Vec<ActivityRecord>> {
        self.repository.recent_activity(session_id, limit).await
    }
}

/// Whether an event is worth keeping in the log
///
/// Hydration starts are always followed by a completion or failure, and
/// idle cycles carry no information.
fn is_recorded(event: &SyncEvent) -> bool {
    match event {
        SyncEvent::HydrationStarted { .. } => false,
        SyncEvent::CycleCompleted { summary, .. } => {
            summary.actions_planned > 0 || summary.conflicts > 0 || summary.blacklisted > 0
        }
        _ => true,
    }
}

impl IEventSink for ActivityLogger {
    fn emit(&self, event: SyncEvent) {
        if !is_recorded(&event) {
            return;
        }
        if self.tx.send(event).is_err() {
            warn!("Activity writer is gone, event dropped");
        }
    }
}
