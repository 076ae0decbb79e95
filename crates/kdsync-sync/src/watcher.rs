//! Local change notification for a session root
//!
//! [`SessionWatcher`] wraps the `notify` crate and turns raw OS events under
//! one sync root into [`LocalChange`] values. The watcher only says *that*
//! something changed: the next cycle rescans the root and works out *what*.
//!
//! [`ChangeDebouncer`] collects those changes and reports a batch once the
//! whole root has been quiet for the debounce delay, so an editor saving a
//! file five times in a second costs one cycle.
//!
//! ```text
//! inotify ──→ SessionWatcher ──→ mpsc ──→ ChangeDebouncer ──→ SessionScheduler
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use kdsync_core::ports::is_temp_file_name;

/// A change observed under a sync root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl LocalChange {
    /// The path the change leaves behind (the destination for renames)
    pub fn path(&self) -> &Path {
        match self {
            LocalChange::Created(p) | LocalChange::Modified(p) | LocalChange::Removed(p) => p,
            LocalChange::Renamed { to, .. } => to,
        }
    }
}

fn is_temp_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(is_temp_file_name)
        .unwrap_or(false)
}

/// Watches one sync root recursively
///
/// Dropping the watcher stops the OS watch and closes the change channel.
pub struct SessionWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl std::fmt::Debug for SessionWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionWatcher")
            .field("root", &self.root)
            .finish()
    }
}

impl SessionWatcher {
    /// Starts watching `root` and returns the receiving end of its changes
    pub fn start(root: &Path) -> Result<(Self, mpsc::Receiver<LocalChange>)> {
        let (tx, rx) = mpsc::channel::<LocalChange>(1024);

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(change) = map_notify_event(&event) {
                        // the receiver is gone once the scheduler stopped
                        let _ = tx.blocking_send(change);
                    }
                }
                Err(e) => warn!(error = %e, "File watcher error"),
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;

        info!(root = %root.display(), "Watching sync root");
        Ok((
            Self {
                _watcher: watcher,
                root: root.to_path_buf(),
            },
            rx,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Converts a `notify::Event` into a [`LocalChange`]
///
/// Access events are ignored, and so is anything that only touches the
/// engine's own temporary files. A rename out of a temporary name is the
/// final step of a download and shows up as a creation.
fn map_notify_event(event: &notify::Event) -> Option<LocalChange> {
    let paths = &event.paths;
    let first = paths.first()?;

    let change = match &event.kind {
        EventKind::Create(_) => LocalChange::Created(first.clone()),
        EventKind::Remove(_) => LocalChange::Removed(first.clone()),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            let (from, to) = (paths[0].clone(), paths[1].clone());
            match (is_temp_path(&from), is_temp_path(&to)) {
                (true, true) => return None,
                (true, false) => LocalChange::Created(to),
                (false, true) => LocalChange::Removed(from),
                (false, false) => LocalChange::Renamed { from, to },
            }
        }
        EventKind::Modify(_) => LocalChange::Modified(first.clone()),
        _ => {
            trace!(kind = ?event.kind, "Ignoring event kind");
            return None;
        }
    };

    if is_temp_path(change.path()) {
        return None;
    }
    Some(change)
}

/// Coalesces changes until the root has been quiet for the debounce delay
///
/// Changes to the same path replace each other. Every push restarts the
/// quiet window for the whole batch.
#[derive(Debug)]
pub struct ChangeDebouncer {
    pending: HashMap<PathBuf, LocalChange>,
    last_change: Option<Instant>,
    delay: Duration,
}

impl ChangeDebouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            last_change: None,
            delay,
        }
    }

    pub fn push(&mut self, change: LocalChange, now: Instant) {
        debug!(path = %change.path().display(), change = ?change, "Local change");
        self.pending.insert(change.path().to_path_buf(), change);
        self.last_change = Some(now);
    }

    /// When the pending batch settles, if anything is pending
    pub fn deadline(&self) -> Option<Instant> {
        self.last_change.map(|at| at + self.delay)
    }

    /// Takes the batch once it has settled at `now`, else returns nothing
    pub fn take_settled(&mut self, now: Instant) -> Vec<LocalChange> {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.last_change = None;
                self.pending.drain().map(|(_, change)| change).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Drops the pending batch
    pub fn clear(&mut self) {
        self.pending.clear();
        self.last_change = None;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
