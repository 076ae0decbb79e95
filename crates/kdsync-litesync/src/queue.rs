//! Lite Sync toggling and the persisted bulk hydration queue
//!
//! Turning Lite Sync off queues every dehydrated item of the session in the
//! store, then hydrates the queue one row at a time. A row is removed only
//! after its item is hydrated, so a restart resumes with what is left.

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use kdsync_core::domain::{SessionId, SyncEvent, SyncState, UniqueId};

use crate::error::PlaceholderError;
use crate::manager::PlaceholderManager;

/// Result of one pass over the hydration queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueReport {
    pub hydrated: usize,
    pub failed: usize,
    /// Rows still queued when the pass stopped
    pub remaining: usize,
}

impl PlaceholderManager {
    /// Switches Lite Sync for a session
    ///
    /// Enabling only affects future remote creations. Disabling queues the
    /// session's dehydrated items for hydration and returns how many rows
    /// were added; call [`PlaceholderManager::resume_pending`] to work the
    /// queue.
    #[instrument(skip(self))]
    pub async fn set_lite_sync(
        &self,
        session_id: &SessionId,
        enabled: bool,
    ) -> Result<usize, PlaceholderError> {
        let mut session = self
            .repository()
            .get_session(session_id)
            .await?
            .ok_or(PlaceholderError::SessionNotFound(*session_id))?;
        self.repository()
            .set_session_lite_sync(session_id, enabled)
            .await?;
        session.set_lite_sync(enabled);

        let queued = if enabled {
            0
        } else {
            let ids: Vec<UniqueId> = self
                .virtual_entries(&session)
                .await?
                .iter()
                .filter(|item| !item.is_directory())
                .map(|item| *item.id())
                .collect();
            self.repository().enqueue_hydration(session_id, &ids).await?
        };

        info!(session_id = %session_id, enabled, queued, "Lite Sync toggled");
        self.events().emit(SyncEvent::LiteSyncToggled {
            session_id: *session_id,
            enabled,
        });
        Ok(queued)
    }

    /// Hydrates the queued items of a session one by one
    ///
    /// Stops early when `cancel` fires. Failed items stay queued for the
    /// next pass; rows of items that no longer exist or were excluded from
    /// sync are dropped.
    #[instrument(skip(self, cancel))]
    pub async fn resume_pending(
        &self,
        session_id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<QueueReport, PlaceholderError> {
        let pending = self.repository().pending_hydrations(session_id).await?;
        let mut report = QueueReport {
            remaining: pending.len(),
            ..QueueReport::default()
        };

        for item_id in pending {
            if cancel.is_cancelled() {
                break;
            }
            let gone = self
                .repository()
                .get_item(&item_id)
                .await?
                .map_or(true, |item| item.state() == SyncState::Excluded);
            if gone {
                self.repository().complete_hydration(&item_id).await?;
                report.remaining -= 1;
                continue;
            }
            match self.hydrate(&item_id).await {
                Ok(_) => {
                    // the download task removes the row
                    report.hydrated += 1;
                    report.remaining -= 1;
                }
                Err(e) => {
                    warn!(item_id = %item_id, error = %e, "Queued hydration failed, keeping it queued");
                    report.failed += 1;
                }
            }
        }

        info!(
            session_id = %session_id,
            hydrated = report.hydrated,
            failed = report.failed,
            remaining = report.remaining,
            "Hydration queue pass finished"
        );
        Ok(report)
    }
}
