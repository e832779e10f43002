//! Decision records and the mount records derived from them.

#![allow(missing_docs)]

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::identity::DeviceIdentity;

/// Admission outcome for one device instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Block,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Block => write!(f, "block"),
        }
    }
}

/// Pipeline stage that produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Vendor allow counter reached the auto-allow threshold.
    History,
    /// Classifier predicted allow.
    Classifier,
    /// A human answered the prompt.
    #[default]
    Prompt,
    /// The prompt failed or was cancelled; blocked by default.
    FailClosed,
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::History => write!(f, "history"),
            Self::Classifier => write!(f, "classifier"),
            Self::Prompt => write!(f, "prompt"),
            Self::FailClosed => write!(f, "fail_closed"),
        }
    }
}

/// One finalized admission event. Append-only.
///
/// `source`, `remember` and `timestamp` default when absent so logs written
/// without them still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub vendor_id: String,
    pub product_id: String,
    pub serial: String,
    pub device_node: PathBuf,
    pub decision: Decision,
    #[serde(default)]
    pub source: DecisionSource,
    #[serde(default)]
    pub remember: bool,
    #[serde(default)]
    pub timestamp: String,
    /// Engine run that wrote the record. USB device numbers restart at boot,
    /// so a node path only identifies a device within one run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl DecisionRecord {
    /// Record stamped with the current UTC time.
    pub fn new(
        identity: &DeviceIdentity,
        decision: Decision,
        source: DecisionSource,
        remember: bool,
    ) -> Self {
        Self {
            vendor_id: identity.vendor_id.clone(),
            product_id: identity.product_id.clone(),
            serial: identity.serial.clone(),
            device_node: identity.device_node.clone(),
            decision,
            source,
            remember,
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            session: None,
        }
    }

    #[must_use]
    pub fn in_session(mut self, session: &str) -> Self {
        self.session = Some(session.to_string());
        self
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(
            self.vendor_id.as_str(),
            self.product_id.as_str(),
            Some(self.serial.as_str()),
            self.device_node.clone(),
        )
    }
}

/// What detach handling needs to rebuild a mount point: detach events carry
/// only the device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub device_node: PathBuf,
    pub vendor_id: String,
    pub product_id: String,
    pub serial: String,
    pub decision: Decision,
}

impl From<&DecisionRecord> for MountRecord {
    fn from(record: &DecisionRecord) -> Self {
        Self {
            device_node: record.device_node.clone(),
            vendor_id: record.vendor_id.clone(),
            product_id: record.product_id.clone(),
            serial: record.serial.clone(),
            decision: record.decision,
        }
    }
}
