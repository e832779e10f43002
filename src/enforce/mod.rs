//! Enforcement: privileged command execution and the gateway that applies
//! allow/block decisions to the host.

pub mod executor;
pub mod gateway;

pub use executor::{PrivilegedCommand, PrivilegedExecutor, RecordingExecutor, SystemExecutor};
pub use gateway::{BlockOutcome, EnforcementGateway, UnmountOutcome};
