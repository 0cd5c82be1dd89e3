//! Built-in operation registry
//!
//! The closed, reviewable list of operation types this build knows about.
//! Selecting operations happens by name from the configuration table;
//! nothing is discovered at runtime.

use mirrorsync_core::operation::{OperationDescriptor, OperationRegistry};

use crate::operations::{install, snapshots};

/// Registry holding every built-in operation type
pub fn builtin_registry() -> anyhow::Result<OperationRegistry> {
    let mut registry = OperationRegistry::new();

    registry.register(OperationDescriptor {
        name: snapshots::NAME,
        required: true,
        validate_config: snapshots::validate_config,
        construct: Box::new(|ctx| Box::new(snapshots::SnapshotOperation::from_context(&ctx))),
    })?;

    registry.register(OperationDescriptor {
        name: install::NAME,
        required: true,
        validate_config: install::validate_config,
        construct: Box::new(|ctx| Box::new(install::InstallOperation::from_context(ctx))),
    })?;

    Ok(registry)
}
