//! Block-device resolution: map a raw USB device node to the partition that
//! backs it.
//!
//! A hotplug event names the USB device (`/dev/bus/usb/BBB/DDD`), but mount and
//! block actions need the filesystem partition (`/dev/sdb1`). The Linux
//! resolver joins the two through sysfs: the USB device directory is found by
//! its `busnum`/`devnum` attributes, and a partition belongs to it when the
//! partition's canonical sysfs path descends from that directory.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::errors::{Result, UgkError};

/// Maps a USB device node to its backing block device.
pub trait BlockDeviceResolver: Send + Sync {
    fn resolve(&self, device_node: &Path) -> Result<PathBuf>;
}

/// sysfs-backed resolver (Linux).
#[derive(Debug, Clone)]
pub struct SysfsResolver {
    sys_root: PathBuf,
    dev_root: PathBuf,
}

impl Default for SysfsResolver {
    fn default() -> Self {
        Self::new("/sys", "/dev")
    }
}

impl SysfsResolver {
    pub fn new(sys_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
            dev_root: dev_root.into(),
        }
    }

    /// Canonical sysfs directory of the USB device addressed by `device_node`.
    fn usb_device_dir(&self, device_node: &Path) -> Result<PathBuf> {
        let (bus, dev) = parse_usb_node(&self.dev_root, device_node).ok_or_else(|| {
            UgkError::Resolution {
                device_node: device_node.to_path_buf(),
                details: "not a /dev/bus/usb/<bus>/<dev> node".to_string(),
            }
        })?;

        let devices = self.sys_root.join("bus").join("usb").join("devices");
        let entries = fs::read_dir(&devices).map_err(|source| UgkError::io(&devices, source))?;
        for entry in entries.flatten() {
            let dir = entry.path();
            if read_u32(&dir.join("busnum")) == Some(bus)
                && read_u32(&dir.join("devnum")) == Some(dev)
            {
                return fs::canonicalize(&dir).map_err(|source| UgkError::io(&dir, source));
            }
        }

        Err(UgkError::Resolution {
            device_node: device_node.to_path_buf(),
            details: format!("no sysfs usb device with busnum={bus} devnum={dev}"),
        })
    }

    /// First partition (by name) whose sysfs path lies beneath `usb_dir`.
    fn partition_under(&self, usb_dir: &Path) -> Option<String> {
        let class_block = self.sys_root.join("class").join("block");
        let mut names: Vec<String> = fs::read_dir(&class_block)
            .ok()?
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();

        names.into_iter().find(|name| {
            let Ok(canonical) = fs::canonicalize(class_block.join(name)) else {
                return false;
            };
            canonical.join("partition").exists() && canonical.starts_with(usb_dir)
        })
    }
}

impl BlockDeviceResolver for SysfsResolver {
    fn resolve(&self, device_node: &Path) -> Result<PathBuf> {
        let usb_dir = self.usb_device_dir(device_node)?;
        self.partition_under(&usb_dir)
            .map(|name| self.dev_root.join(name))
            .ok_or_else(|| UgkError::Resolution {
                device_node: device_node.to_path_buf(),
                details: format!("no block partition beneath {}", usb_dir.display()),
            })
    }
}

/// Fixed node → block-device table, for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    table: HashMap<PathBuf, PathBuf>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, device_node: impl Into<PathBuf>, block: impl Into<PathBuf>) -> Self {
        self.table.insert(device_node.into(), block.into());
        self
    }
}

impl BlockDeviceResolver for StaticResolver {
    fn resolve(&self, device_node: &Path) -> Result<PathBuf> {
        self.table
            .get(device_node)
            .cloned()
            .ok_or_else(|| UgkError::Resolution {
                device_node: device_node.to_path_buf(),
                details: "not in static table".to_string(),
            })
    }
}

/// Parse `<dev_root>/bus/usb/BBB/DDD` into `(bus, dev)`.
fn parse_usb_node(dev_root: &Path, node: &Path) -> Option<(u32, u32)> {
    let rest = node.strip_prefix(dev_root.join("bus").join("usb")).ok()?;
    let mut parts = rest.iter();
    let bus = parts.next()?.to_str()?.parse().ok()?;
    let dev = parts.next()?.to_str()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((bus, dev))
}

fn read_u32(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
