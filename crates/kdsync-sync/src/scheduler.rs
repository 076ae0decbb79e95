//! Per-session cycle scheduling
//!
//! One [`SessionScheduler`] runs per session and decides when its next cycle
//! starts. Three things trigger a cycle:
//!
//! - local changes, once the [`ChangeDebouncer`] says the root is quiet
//! - the remote poll interval
//! - an explicit request through [`SchedulerHandle::request_sync`]
//!
//! ```text
//! SessionWatcher ──→ ChangeDebouncer ─┐
//! remote poll tick ───────────────────┼──→ SyncService::run_cycle
//! SchedulerHandle::request_sync ──────┘
//! ```
//!
//! Cycles of one session never overlap: the loop awaits each cycle before
//! looking at the next trigger, and `run_cycle` itself holds the session's
//! cycle lock. Triggers arriving meanwhile coalesce into the next cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kdsync_core::config::SyncConfig;
use kdsync_core::domain::SessionId;

use crate::error::SyncError;
use crate::service::SyncService;
use crate::watcher::{ChangeDebouncer, LocalChange};

/// Asks a running scheduler for an immediate cycle
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    trigger: Arc<Notify>,
}

impl SchedulerHandle {
    /// Starts a cycle without waiting for the debounce window or poll tick
    pub fn request_sync(&self) {
        self.trigger.notify_one();
    }
}

/// Drives the cycles of one session until shut down
pub struct SessionScheduler {
    service: Arc<SyncService>,
    session_id: SessionId,
    debounce: Duration,
    poll_interval: Duration,
    trigger: Arc<Notify>,
}

/// Why a cycle was started
#[derive(Debug, Clone, Copy)]
enum Trigger {
    LocalChange,
    RemotePoll,
    Requested,
}

impl SessionScheduler {
    pub fn new(
        service: Arc<SyncService>,
        session_id: SessionId,
        config: &SyncConfig,
    ) -> (Self, SchedulerHandle) {
        let trigger = Arc::new(Notify::new());
        let scheduler = Self {
            service,
            session_id,
            debounce: Duration::from_millis(config.debounce_delay_ms),
            poll_interval: Duration::from_secs(config.remote_poll_interval_secs.max(1)),
            trigger: Arc::clone(&trigger),
        };
        (scheduler, SchedulerHandle { trigger })
    }

    /// Runs until `shutdown` fires or the session goes away
    ///
    /// The first poll tick fires immediately, so a freshly started
    /// scheduler begins with a cycle. A closed change channel only turns off
    /// local triggers; polling and requests keep working.
    pub async fn run(self, mut changes: mpsc::Receiver<LocalChange>, shutdown: CancellationToken) {
        info!(
            session_id = %self.session_id,
            debounce_ms = self.debounce.as_millis() as u64,
            poll_secs = self.poll_interval.as_secs(),
            "Session scheduler starting"
        );

        let mut debouncer = ChangeDebouncer::new(self.debounce);
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut changes_open = true;

        loop {
            let deadline = debouncer.deadline();
            let trigger = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                change = changes.recv(), if changes_open => {
                    match change {
                        Some(change) => debouncer.push(change, Instant::now()),
                        None => {
                            debug!(session_id = %self.session_id, "Change channel closed");
                            changes_open = false;
                        }
                    }
                    continue;
                }
                _ = self.trigger.notified() => Trigger::Requested,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() =>
                {
                    let batch = debouncer.take_settled(Instant::now());
                    if batch.is_empty() {
                        continue;
                    }
                    debug!(session_id = %self.session_id, changes = batch.len(), "Local changes settled");
                    Trigger::LocalChange
                }
                _ = poll.tick() => Trigger::RemotePoll,
            };

            // the cycle rescans the whole root
            debouncer.clear();

            if !self.cycle(trigger).await {
                break;
            }
        }

        info!(session_id = %self.session_id, "Session scheduler stopped");
    }

    /// Runs one cycle; returns false when the session is gone
    async fn cycle(&self, trigger: Trigger) -> bool {
        debug!(session_id = %self.session_id, trigger = ?trigger, "Starting cycle");
        match self.service.run_cycle(&self.session_id).await {
            Ok(summary) => {
                debug!(
                    session_id = %self.session_id,
                    planned = summary.actions_planned,
                    failed = summary.actions_failed,
                    "Scheduled cycle finished"
                );
                true
            }
            Err(SyncError::SessionNotFound(_)) | Err(SyncError::SessionBeingDeleted(_)) => {
                info!(session_id = %self.session_id, "Session removed, stopping scheduler");
                false
            }
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Scheduled cycle failed");
                true
            }
        }
    }
}
