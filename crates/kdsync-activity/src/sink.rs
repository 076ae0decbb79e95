//! Event sinks
//!
//! The engine publishes through a single [`IEventSink`]. [`FanOutSink`]
//! lets the daemon attach several consumers behind it:
//!
//! ```text
//!                      ┌─→ TracingSink       (log lines)
//! engine ─→ FanOutSink ├─→ BroadcastSink     (live subscribers)
//!                      ├─→ ActivityLogger    (store)
//!                      └─→ ActivityAggregator (notifications)
//! ```

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use kdsync_core::domain::SyncEvent;
use kdsync_core::ports::IEventSink;

/// Forwards every event to each inner sink, in order
#[derive(Default, Clone)]
pub struct FanOutSink {
    sinks: Vec<Arc<dyn IEventSink>>,
}

impl FanOutSink {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, sink: Arc<dyn IEventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl IEventSink for FanOutSink {
    fn emit(&self, event: SyncEvent) {
        let Some((last, rest)) = self.sinks.split_last() else {
            return;
        };
        for sink in rest {
            sink.emit(event.clone());
        }
        last.emit(event);
    }
}

/// Publishes events to any number of live subscribers
///
/// Slow subscribers lose the oldest events (`RecvError::Lagged`); the
/// engine is never held up.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<SyncEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl IEventSink for BroadcastSink {
    fn emit(&self, event: SyncEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory; for tests and diagnostics
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.lock().clone()
    }

    /// Removes and returns everything recorded so far
    pub fn take(&self) -> Vec<SyncEvent> {
        std::mem::take(&mut *self.lock())
    }

    /// Number of recorded events with the given [`SyncEvent::name`]
    pub fn count(&self, name: &str) -> usize {
        self.lock().iter().filter(|e| e.name() == name).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SyncEvent>> {
        self.events.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl IEventSink for RecordingSink {
    fn emit(&self, event: SyncEvent) {
        self.lock().push(event);
    }
}

/// Writes events to the `tracing` subscriber
///
/// Events carrying an error code are logged at `warn`, session lifecycle
/// at `info` and the per-item stream at `debug`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl IEventSink for TracingSink {
    fn emit(&self, event: SyncEvent) {
        let session_id = event.session_id().to_string();
        let name = event.name();

        if let Some(error) = event.error() {
            warn!(
                target: "kdsync::events",
                session_id = %session_id,
                event = name,
                code = error.code(),
                category = ?error.category(),
                "{}",
                error.render()
            );
            return;
        }

        match &event {
            SyncEvent::SessionAdded { .. }
            | SyncEvent::SessionRemoved { .. }
            | SyncEvent::SessionPaused { .. }
            | SyncEvent::SessionResumed { .. }
            | SyncEvent::LiteSyncToggled { .. }
            | SyncEvent::ConflictResolved { .. }
            | SyncEvent::BlacklistCleared { .. } => {
                info!(target: "kdsync::events", session_id = %session_id, event = name, ?event);
            }
            _ => {
                debug!(target: "kdsync::events", session_id = %session_id, event = name, ?event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdsync_core::domain::SessionId;

    fn resumed(session_id: SessionId) -> SyncEvent {
        SyncEvent::SessionResumed { session_id }
    }

    #[test]
    fn test_fan_out_reaches_every_sink() {
        let a = Arc::new(RecordingSink::new());
        let b = Arc::new(RecordingSink::new());
        let fan = FanOutSink::new()
            .with(Arc::clone(&a) as Arc<dyn IEventSink>)
            .with(Arc::clone(&b) as Arc<dyn IEventSink>);
        assert_eq!(fan.len(), 2);

        fan.emit(resumed(SessionId::new()));
        assert_eq!(a.count("session_resumed"), 1);
        assert_eq!(b.count("session_resumed"), 1);
    }

    #[test]
    fn test_empty_fan_out_drops_events() {
        let fan = FanOutSink::new();
        assert!(fan.is_empty());
        fan.emit(resumed(SessionId::new()));
    }

    #[test]
    fn test_recording_take_empties() {
        let sink = RecordingSink::new();
        sink.emit(resumed(SessionId::new()));
        assert_eq!(sink.take().len(), 1);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let sink = BroadcastSink::new(8);
        sink.emit(resumed(SessionId::new()));

        let mut rx = sink.subscribe();
        assert_eq!(sink.subscriber_count(), 1);
        let sid = SessionId::new();
        sink.emit(resumed(sid));
        assert_eq!(rx.recv().await.unwrap(), resumed(sid));
    }
}
