//! kdsync Activity - event consumers
//!
//! Provides:
//! - Event sinks: fan-out, broadcast, recording and tracing
//! - `ActivityLogger`: persists the event stream to the store's activity log
//! - `ActivityAggregator`: groups item events into notification sentences

pub mod aggregator;
pub mod logger;
pub mod sink;

pub use aggregator::{render, ActivityAggregator, ActivityMessage};
pub use logger::ActivityLogger;
pub use sink::{BroadcastSink, FanOutSink, RecordingSink, TracingSink};
