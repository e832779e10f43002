//! Device identity and raw hotplug events.

#![allow(missing_docs)]

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Serial recorded for devices that do not report one.
pub const UNKNOWN_SERIAL: &str = "Unknown";

/// Admission key for a USB device.
///
/// Not globally unique: several physical devices may share vendor, product
/// and serial. `device_node` disambiguates within one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: String,
    pub product_id: String,
    pub serial: String,
    pub device_node: PathBuf,
}

impl DeviceIdentity {
    /// Build an identity, substituting [`UNKNOWN_SERIAL`] for a missing or blank serial.
    pub fn new(
        vendor_id: impl Into<String>,
        product_id: impl Into<String>,
        serial: Option<&str>,
        device_node: impl Into<PathBuf>,
    ) -> Self {
        let serial = serial
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(UNKNOWN_SERIAL)
            .to_string();
        Self {
            vendor_id: vendor_id.into().trim().to_string(),
            product_id: product_id.into().trim().to_string(),
            serial,
            device_node: device_node.into(),
        }
    }

    /// Whether vendor and product are well-formed 4-digit hex USB ids.
    ///
    /// Ids are interpolated into udev rules, so nothing else may pass.
    pub fn has_valid_ids(&self) -> bool {
        is_valid_usb_id(&self.vendor_id) && is_valid_usb_id(&self.product_id)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} serial={} node={}",
            self.vendor_id,
            self.product_id,
            self.serial,
            self.device_node.display()
        )
    }
}

/// Whether `raw` is a 4-digit hexadecimal USB vendor/product id.
pub fn is_valid_usb_id(raw: &str) -> bool {
    static USB_ID: OnceLock<Regex> = OnceLock::new();
    USB_ID
        .get_or_init(|| Regex::new(r"^[0-9A-Fa-f]{4}$").expect("static regex compiles"))
        .is_match(raw)
}

/// Hotplug action carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotplugAction {
    Attach,
    Detach,
}

/// A raw hotplug notification as delivered by the event source.
///
/// Attach events may arrive with missing vendor/product information; detach
/// events usually carry only the device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    pub action: HotplugAction,
    pub vendor_id: Option<String>,
    pub product_id: Option<String>,
    pub serial: Option<String>,
    pub device_node: PathBuf,
}

impl HotplugEvent {
    pub fn attach(
        vendor_id: Option<&str>,
        product_id: Option<&str>,
        serial: Option<&str>,
        device_node: impl Into<PathBuf>,
    ) -> Self {
        Self {
            action: HotplugAction::Attach,
            vendor_id: non_blank(vendor_id),
            product_id: non_blank(product_id),
            serial: non_blank(serial),
            device_node: device_node.into(),
        }
    }

    pub fn detach(device_node: impl Into<PathBuf>) -> Self {
        Self {
            action: HotplugAction::Detach,
            vendor_id: None,
            product_id: None,
            serial: None,
            device_node: device_node.into(),
        }
    }

    pub fn device_node(&self) -> &Path {
        &self.device_node
    }

    /// Vendor and product are both present.
    pub fn is_complete(&self) -> bool {
        self.vendor_id.is_some() && self.product_id.is_some()
    }

    /// Identity for a complete event; `None` while vendor or product is missing.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        match (&self.vendor_id, &self.product_id) {
            (Some(vendor), Some(product)) => Some(DeviceIdentity::new(
                vendor.as_str(),
                product.as_str(),
                self.serial.as_deref(),
                self.device_node.clone(),
            )),
            _ => None,
        }
    }

    /// Fill fields still missing in `self` from `other`. Existing values win.
    pub fn merge_missing(&mut self, other: &Self) {
        if self.vendor_id.is_none() {
            self.vendor_id.clone_from(&other.vendor_id);
        }
        if self.product_id.is_none() {
            self.product_id.clone_from(&other.product_id);
        }
        if self.serial.is_none() {
            self.serial.clone_from(&other.serial);
        }
    }
}

fn non_blank(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}
