//! Event bus and record pipeline
//!
//! In-process publish/subscribe for session events, plus the stock
//! consumers: a JSONL record writer, a live display sink, and the error
//! tracker that flips the session's `has_errors` flag.
//!
//! Producers never block: the bus is a bounded ring and a lagging
//! subscriber skips the oldest events instead of stalling publication.

pub mod bus;
pub mod recorder;
pub mod tracker;

pub use bus::{EventBus, Subscription};
pub use recorder::{DisplaySink, FileRecorder};
pub use tracker::spawn_error_tracker;
