//! Event publication port
//!
//! Operations and the orchestrator publish through this trait; the bus
//! implementation (fan-out, per-consumer queues) lives in the events
//! crate. Publication is infallible and non-blocking by contract: a slow
//! or absent consumer must never stall a producer.

use crate::domain::event::{Event, HostRole, LogEvent, LogLevel, ProgressEvent};

/// Producer-side handle onto the event bus
pub trait IEventPublisher: Send + Sync {
    /// Publish an event to all current subscribers. Never blocks.
    fn publish(&self, event: Event);

    /// Convenience: publish a [`LogEvent`]
    fn log(&self, level: LogLevel, operation: &str, host: HostRole, message: &str) {
        self.publish(Event::Log(LogEvent::new(level, operation, host, message)));
    }

    /// Convenience: publish a [`ProgressEvent`]
    fn progress(&self, operation: &str, fraction: f64, current_item: &str) {
        self.publish(Event::Progress(ProgressEvent::new(
            operation,
            fraction,
            current_item,
        )));
    }
}

/// Publisher that discards everything. Useful in unit tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPublisher;

impl IEventPublisher for NullPublisher {
    fn publish(&self, _event: Event) {}
}
