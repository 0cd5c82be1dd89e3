//! Ports (driven/secondary interfaces)
//!
//! Traits the core depends on and the adapter crates implement: command
//! execution on either machine, file transfer, and event publication.

pub mod event_bus;
pub mod executor;
