//! Event sink port
//!
//! The engine publishes every [`SyncEvent`] through this port. Emission is
//! synchronous and must not block; sinks that do I/O buffer internally.

use crate::domain::SyncEvent;

/// Port trait for event subscribers
pub trait IEventSink: Send + Sync {
    /// Publishes one event
    fn emit(&self, event: SyncEvent);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl IEventSink for NullEventSink {
    fn emit(&self, _event: SyncEvent) {}
}
