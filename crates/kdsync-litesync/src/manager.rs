//! Hydration and dehydration of placeholders
//!
//! A dehydrated item has a row in the store and no file on disk. The
//! [`PlaceholderManager`] fetches its content on demand and releases it
//! again when asked to.
//!
//! ```text
//! open() / ensure_hydrated()
//!        │
//!        ▼
//! ┌──────────────────┐  already running   ┌──────────────────┐
//! │  in_flight map   │ ─────────────────► │ watch::Receiver  │
//! │  (by item id)    │                    │ (shared result)  │
//! └──────────────────┘                    └──────────────────┘
//!        │ first caller
//!        ▼
//!   spawned task: permit → download to temp sibling → link into place
//!                 → store row Hydrated → HydrationCompleted
//! ```
//!
//! ## Design Notes
//!
//! - The download runs in its own task, so a caller that gives up does not
//!   strand the others waiting on the same item.
//! - A failed download removes the temp file and falls back to
//!   `Dehydrated`; nothing fetched is ever left at the item's path. This
//!   holds for failures after the content was moved into place too.
//! - A file the user wrote at a placeholder's path is never replaced:
//!   hydration fails and the next cycle keeps both versions.
//! - The local fingerprint recorded after hydration keeps the remote hash,
//!   so the next scan does not mistake the new file for a local edit.
//! - [`PlaceholderManager::cancel_hydration`] stops a download and returns
//!   once the item is back to `Dehydrated`. Excluded items are never
//!   hydrated.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use kdsync_core::config::LiteSyncConfig;
use kdsync_core::domain::{
    Fingerprint, PlaceholderState, RelativePath, RemoteId, SyncErrorCode, SyncEvent, SyncItem, SyncSession, SyncState,
    UniqueId,
};
use kdsync_core::ports::{
    IEventSink, IPlaceholderHydrator, IRemoteDrive, IStateRepository, ItemFilter, TEMP_FILE_PREFIX,
};

use crate::error::PlaceholderError;

/// Shared outcome of one download: bytes fetched, or the failure message
type HydrationResult = Option<Result<u64, String>>;

struct InFlight {
    result: watch::Receiver<HydrationResult>,
    cancel: CancellationToken,
}

struct Inner {
    repository: Arc<dyn IStateRepository>,
    remote: Arc<dyn IRemoteDrive>,
    events: Arc<dyn IEventSink>,
    permits: Semaphore,
    in_flight: DashMap<UniqueId, InFlight>,
}

/// Placeholder (Lite Sync) manager
#[derive(Clone)]
pub struct PlaceholderManager {
    inner: Arc<Inner>,
}

impl PlaceholderManager {
    pub fn new(
        repository: Arc<dyn IStateRepository>,
        remote: Arc<dyn IRemoteDrive>,
        events: Arc<dyn IEventSink>,
        config: &LiteSyncConfig,
    ) -> Self {
        let concurrency = usize::try_from(config.hydration_concurrency)
            .unwrap_or(1)
            .max(1);
        Self {
            inner: Arc::new(Inner {
                repository,
                remote,
                events,
                permits: Semaphore::new(concurrency),
                in_flight: DashMap::new(),
            }),
        }
    }

    pub(crate) fn repository(&self) -> &Arc<dyn IStateRepository> {
        &self.inner.repository
    }

    pub(crate) fn events(&self) -> &Arc<dyn IEventSink> {
        &self.inner.events
    }

    /// Number of downloads in progress
    pub fn active_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn is_hydrating(&self, item_id: &UniqueId) -> bool {
        self.inner.in_flight.contains_key(item_id)
    }

    /// Stops the item's download, if one is running
    ///
    /// Returns once the download task has finished and the item is back to
    /// `Dehydrated`; `false` if nothing was running.
    pub async fn cancel_hydration(&self, item_id: &UniqueId) -> bool {
        let running = self.inner.in_flight.get(item_id).map(|flight| {
            flight.cancel.cancel();
            flight.result.clone()
        });
        let Some(mut result) = running else {
            return false;
        };
        // a closed channel means the task is gone as well
        let _ = result.wait_for(Option::is_some).await;
        debug!(item_id = %item_id, "Hydration cancelled");
        true
    }

    // ------------------------------------------------------------------------
    // Hydration
    // ------------------------------------------------------------------------

    /// Makes the item's content present locally
    ///
    /// Returns the number of bytes fetched (0 if the item was already
    /// hydrated). Concurrent calls for the same item share one download.
    pub async fn hydrate(&self, item_id: &UniqueId) -> Result<u64, PlaceholderError> {
        let mut rx = match self.inner.in_flight.entry(*item_id) {
            Entry::Occupied(running) => {
                debug!(item_id = %item_id, "Hydration already in progress, waiting");
                running.get().result.clone()
            }
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                let cancel = CancellationToken::new();
                slot.insert(InFlight {
                    result: rx.clone(),
                    cancel: cancel.clone(),
                });
                let inner = Arc::clone(&self.inner);
                let id = *item_id;
                tokio::spawn(async move {
                    let result = inner.run_hydration(&id, &cancel).await;
                    inner.in_flight.remove(&id);
                    let shared = match &result {
                        Ok(bytes) => Ok(*bytes),
                        Err(e) => Err(e.to_string()),
                    };
                    let _ = tx.send(Some(shared));
                    result
                });
                rx
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| anyhow::anyhow!("hydration task ended without a result"))?
            .clone();
        match outcome {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(detail)) => {
                let path = self
                    .inner
                    .repository
                    .get_item(item_id)
                    .await?
                    .map(|item| item.local_path().clone())
                    .unwrap_or_else(RelativePath::root);
                Err(PlaceholderError::HydrationFailed { path, detail })
            }
            None => Err(anyhow::anyhow!("hydration result missing").into()),
        }
    }

    /// Hydrates the item if needed and opens it for reading
    ///
    /// Blocks the caller until the content is present.
    #[instrument(skip(self))]
    pub async fn open(&self, item_id: &UniqueId) -> Result<tokio::fs::File, PlaceholderError> {
        self.hydrate(item_id).await?;
        let (session, item) = self.inner.load(item_id).await?;
        let path = session.local_root().resolve(item.local_path());
        Ok(tokio::fs::File::open(&path).await?)
    }

    // ------------------------------------------------------------------------
    // Dehydration
    // ------------------------------------------------------------------------

    /// Releases the local content of a synced file
    ///
    /// # Errors
    /// `DehydrationRefused` if the item is not `Synced`, is not hydrated, or
    /// has local content that differs from the synced version.
    #[instrument(skip(self))]
    pub async fn dehydrate(&self, item_id: &UniqueId) -> Result<(), PlaceholderError> {
        let (session, mut item) = self.inner.load(item_id).await?;
        let path = item.local_path().clone();
        let refuse = |reason: &str| PlaceholderError::DehydrationRefused {
            path: path.clone(),
            reason: reason.to_string(),
        };

        if item.is_directory() {
            return Err(PlaceholderError::IsDirectory(*item_id));
        }
        if item.placeholder() != PlaceholderState::Hydrated {
            return Err(refuse("item is not hydrated"));
        }
        if item.state() != SyncState::Synced {
            return Err(refuse("item is not synced"));
        }
        let unchanged = match (item.local_fingerprint(), item.synced_fingerprint()) {
            (Some(local), Some(synced)) => local.same_content(synced),
            _ => false,
        };
        if !unchanged {
            return Err(refuse("local content differs from the synced version"));
        }

        let absolute = session.local_root().resolve(&path);
        let metadata = tokio::fs::metadata(&absolute).await?;
        if let Some(local) = item.local_fingerprint() {
            if metadata.len() != local.size || modified_at(&metadata) != local.mtime {
                return Err(refuse("file changed since the last scan"));
            }
        }

        item.set_placeholder(PlaceholderState::Dehydrating)
            .map_err(anyhow::Error::from)?;
        self.inner
            .repository
            .set_placeholder_state(item_id, PlaceholderState::Dehydrating)
            .await?;

        if let Err(e) = tokio::fs::remove_file(&absolute).await {
            warn!(path = %path, error = %e, "Could not remove content, keeping it");
            self.inner
                .repository
                .set_placeholder_state(item_id, PlaceholderState::Hydrated)
                .await?;
            return Err(e.into());
        }

        // The content is gone either way, the state follows it
        item.make_virtual();
        let saved = self.inner.repository.save_item(&item).await;
        self.inner
            .repository
            .set_placeholder_state(item_id, PlaceholderState::Dehydrated)
            .await?;
        saved?;

        info!(item_id = %item_id, path = %path, "Item dehydrated");
        self.inner.events.emit(SyncEvent::Dehydrated {
            session_id: *session.id(),
            item_id: *item_id,
            path,
        });
        Ok(())
    }

    /// Items of the session that exist only as placeholders
    pub async fn virtual_entries(
        &self,
        session: &SyncSession,
    ) -> Result<Vec<SyncItem>, PlaceholderError> {
        Ok(self
            .inner
            .repository
            .query_items(
                &ItemFilter::new()
                    .with_session(*session.id())
                    .with_placeholder(PlaceholderState::Dehydrated),
            )
            .await?)
    }
}

#[async_trait::async_trait]
impl IPlaceholderHydrator for PlaceholderManager {
    async fn ensure_hydrated(&self, item_id: &UniqueId) -> anyhow::Result<()> {
        self.hydrate(item_id).await?;
        Ok(())
    }
}

// ============================================================================
// Download task
// ============================================================================

impl Inner {
    async fn load(&self, item_id: &UniqueId) -> Result<(SyncSession, SyncItem), PlaceholderError> {
        let item = self
            .repository
            .get_item(item_id)
            .await?
            .ok_or(PlaceholderError::ItemNotFound(*item_id))?;
        let session = self
            .repository
            .get_session(item.session_id())
            .await?
            .ok_or(PlaceholderError::SessionNotFound(*item.session_id()))?;
        Ok((session, item))
    }

    #[instrument(skip(self, cancel))]
    async fn run_hydration(
        &self,
        item_id: &UniqueId,
        cancel: &CancellationToken,
    ) -> Result<u64, PlaceholderError> {
        let (session, mut item) = self.load(item_id).await?;
        if item.state() == SyncState::Excluded {
            self.repository.complete_hydration(item_id).await?;
            return Err(PlaceholderError::Excluded(item.local_path().clone()));
        }
        if item.placeholder() == PlaceholderState::Hydrated {
            self.repository.complete_hydration(item_id).await?;
            return Ok(0);
        }
        if item.is_directory() {
            return Err(PlaceholderError::IsDirectory(*item_id));
        }
        let remote_id = item
            .remote_id()
            .cloned()
            .ok_or(PlaceholderError::NoRemoteId(*item_id))?;
        let path = item.local_path().clone();

        item.set_placeholder(PlaceholderState::Hydrating)
            .map_err(anyhow::Error::from)?;
        self.repository
            .set_placeholder_state(item_id, PlaceholderState::Hydrating)
            .await?;
        self.events.emit(SyncEvent::HydrationStarted {
            session_id: *session.id(),
            item_id: *item_id,
            path: path.clone(),
        });

        let target = session.local_root().resolve(&path);
        match self
            .download_into_place(&session, &mut item, &remote_id, &target, cancel)
            .await
        {
            Ok(bytes) => {
                self.repository.complete_hydration(item_id).await?;
                info!(item_id = %item_id, path = %path, bytes, "Item hydrated");
                self.events.emit(SyncEvent::HydrationCompleted {
                    session_id: *session.id(),
                    item_id: *item_id,
                    path,
                    bytes,
                });
                Ok(bytes)
            }
            Err(e) => {
                let detail = format!("{e:#}");
                warn!(item_id = %item_id, path = %path, error = %detail, "Hydration failed");
                if let Err(reset) = self
                    .repository
                    .set_placeholder_state(item_id, PlaceholderState::Dehydrated)
                    .await
                {
                    warn!(item_id = %item_id, error = %reset, "Could not reset placeholder state");
                }
                self.events.emit(SyncEvent::HydrationFailed {
                    session_id: *session.id(),
                    item_id: *item_id,
                    error: SyncErrorCode::HydrationFailed {
                        path: path.clone(),
                        detail: detail.clone(),
                    },
                });
                Err(PlaceholderError::HydrationFailed { path, detail })
            }
        }
    }

    /// Fetches the content to `target` and records the item as hydrated
    ///
    /// On error nothing fetched is left at `target`.
    async fn download_into_place(
        &self,
        session: &SyncSession,
        item: &mut SyncItem,
        remote_id: &RemoteId,
        target: &Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<u64> {
        let _permit = tokio::select! {
            () = cancel.cancelled() => anyhow::bail!("hydration cancelled"),
            permit = self.permits.acquire() => {
                permit.map_err(|_| anyhow::anyhow!("hydration pool closed"))?
            }
        };
        let fetched = self.fetch(session, remote_id, target, cancel).await?;

        let recorded = async {
            let metadata = tokio::fs::metadata(target).await?;
            let local = Fingerprint::file(fetched.hash.clone(), metadata.len(), modified_at(&metadata));
            item.observe_local(item.local_path().clone(), local, node_id(&metadata));
            item.set_placeholder(PlaceholderState::Hydrated)?;
            self.repository.save_item(item).await?;
            self.repository
                .set_placeholder_state(item.id(), PlaceholderState::Hydrated)
                .await?;
            Ok::<_, anyhow::Error>(metadata.len())
        }
        .await;
        if recorded.is_err() {
            if let Err(e) = tokio::fs::remove_file(target).await {
                warn!(target = %target.display(), error = %e, "Could not remove fetched content");
            }
        }
        recorded
    }

    /// Downloads into a temp sibling of `target` and moves it into place
    ///
    /// A file already at `target` is never replaced. Only the download
    /// itself is cancellable.
    async fn fetch(
        &self,
        session: &SyncSession,
        remote_id: &RemoteId,
        target: &Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Fingerprint> {
        let temp = temp_sibling(target);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let result = async {
            if tokio::fs::try_exists(target).await? {
                return Err(occupied(target));
            }
            let fingerprint = tokio::select! {
                () = cancel.cancelled() => anyhow::bail!("hydration cancelled"),
                fetched = self.remote.download(session.remote_root(), remote_id, &temp, None) => fetched?,
            };
            publish(&temp, target).await?;
            Ok::<_, anyhow::Error>(fingerprint)
        }
        .await;
        if result.is_err() {
            discard_temp(&temp).await;
        }
        result
    }
}

async fn discard_temp(temp: &Path) {
    if let Err(e) = tokio::fs::remove_file(temp).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(temp = %temp.display(), error = %e, "Failed to remove temp file");
        }
    }
}

/// Moves `temp` to `target` unless something exists there
///
/// A hard link fails on an existing target, which a rename would replace.
async fn publish(temp: &Path, target: &Path) -> anyhow::Result<()> {
    match tokio::fs::hard_link(temp, target).await {
        Ok(()) => {
            if let Err(e) = tokio::fs::remove_file(temp).await {
                warn!(temp = %temp.display(), error = %e, "Failed to remove temp file");
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(occupied(target)),
        Err(e) => {
            debug!(error = %e, "Hard link unsupported, falling back to rename");
            if tokio::fs::try_exists(target).await? {
                return Err(occupied(target));
            }
            tokio::fs::rename(temp, target).await?;
            Ok(())
        }
    }
}

fn occupied(target: &Path) -> anyhow::Error {
    anyhow::anyhow!("a local file already exists at {}", target.display())
}

fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{TEMP_FILE_PREFIX}{name}"))
}

fn modified_at(metadata: &std::fs::Metadata) -> chrono::DateTime<chrono::Utc> {
    metadata
        .modified()
        .map(chrono::DateTime::<chrono::Utc>::from)
        .unwrap_or_default()
}

#[cfg(unix)]
fn node_id(metadata: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn node_id(_metadata: &std::fs::Metadata) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_sibling_keeps_directory() {
        let temp = temp_sibling(Path::new("/data/docs/report.pdf"));
        assert_eq!(temp, PathBuf::from("/data/docs/.kdsync-tmp-report.pdf"));
    }
}
