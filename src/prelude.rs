//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use usb_gatekeeper::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{Result, UgkError};

// Devices
pub use crate::device::identity::{DeviceIdentity, HotplugAction, HotplugEvent};
pub use crate::device::resolver::{BlockDeviceResolver, SysfsResolver};
pub use crate::device::source::{HotplugSource, UdevadmMonitorSource};

// History + classifier
pub use crate::classifier::{ClassifierAdapter, Prediction, Predictor};
pub use crate::history::record::{Decision, DecisionRecord, DecisionSource, MountRecord};
pub use crate::history::store::{FileHistoryStore, HistoryStore, MemoryHistoryStore};

// Engine + enforcement
pub use crate::enforce::executor::{PrivilegedCommand, PrivilegedExecutor};
pub use crate::enforce::gateway::EnforcementGateway;
pub use crate::engine::admission::{AdmissionEngine, Handled, Ingest};
pub use crate::engine::pipeline::DecisionPipeline;
pub use crate::engine::prompt::{PromptReply, Prompter};

// Daemon
#[cfg(feature = "daemon")]
pub use crate::daemon::loop_main::{MonitorArgs, MonitorDaemon};
