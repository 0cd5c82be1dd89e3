//! SSH connection and command executors
//!
//! Adapters implementing the core execution ports. One persistent
//! authenticated SSH connection per session (OpenSSH control master),
//! multiplexed into a bounded number of concurrent command sessions;
//! local and remote executors expose the identical contract, so
//! operations never care which machine a command runs on.

pub mod connection;
pub mod local;
pub mod process;
pub mod remote;

pub use connection::Connection;
pub use local::LocalExecutor;
pub use remote::RemoteExecutor;
