//! MirrorSync core domain logic
//!
//! This crate holds everything the rest of the workspace agrees on:
//! the domain model (sessions, snapshots, events, error taxonomy), the
//! typed configuration, the ports (traits) that adapters implement, and
//! the operation contract every pluggable sync operation fulfills.
//!
//! The crate performs no I/O of its own apart from configuration file
//! loading; executors, the event bus, and the snapshot manager live in
//! sibling crates and plug into the ports defined here.

pub mod config;
pub mod domain;
pub mod operation;
pub mod ports;

pub use config::Config;
pub use operation::{ExecutionContext, Operation, OperationDescriptor, OperationRegistry};
