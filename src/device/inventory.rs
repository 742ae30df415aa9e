//! # Stage: Device Inventory
//!
//! ## Responsibility
//! Lists the devices of one subsystem together with the attributes the
//! admission predicates need (`DEVTYPE`, `removable`, parent subsystem).
//!
//! ## Guarantees
//! - Read-only: never writes anything
//! - Tolerant: a device whose attributes cannot be read is still listed, with
//!   the missing fields set to `None`
//! - Deterministic: devices come back sorted by name
//!
//! ## NOT Responsible For
//! - Deciding admission (plugins supply the predicate)
//! - Watching for changes (see [`super::hotplug`])

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use tracing::debug;

use super::Device;
use crate::sysfs::Sysfs;

/// Source of device listings for a subsystem.
pub trait DeviceInventory: Send + Sync {
    /// Every device currently present in `subsystem`, sorted by name.
    fn devices(&self, subsystem: &str) -> Vec<Device>;

    /// A single device, if present.
    fn device(&self, subsystem: &str, name: &str) -> Option<Device> {
        self.devices(subsystem).into_iter().find(|d| d.name == name)
    }
}

// ---------------------------------------------------------------------------
// SysfsInventory
// ---------------------------------------------------------------------------

/// Inventory backed by the kernel's sysfs tree.
///
/// Looks in `class/<subsystem>` first and falls back to
/// `bus/<subsystem>/devices`.
#[derive(Debug, Clone, Default)]
pub struct SysfsInventory {
    sysfs: Sysfs,
}

impl SysfsInventory {
    pub fn new(sysfs: Sysfs) -> Self {
        Self { sysfs }
    }

    fn read_device(&self, subsystem: &str, entry: &Path, name: String) -> Device {
        let device_type = self
            .sysfs
            .read(&entry.join("uevent"), true)
            .and_then(|uevent| uevent_value(&uevent, "DEVTYPE"));
        let removable = self
            .sysfs
            .read(&entry.join("removable"), true)
            .and_then(|v| v.parse::<u8>().ok())
            .map(|v| v != 0);
        let parent_subsystem = fs::read_link(entry.join("device").join("subsystem"))
            .ok()
            .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()));
        Device {
            name,
            subsystem: subsystem.to_string(),
            device_type,
            removable,
            parent_subsystem,
        }
    }
}

impl DeviceInventory for SysfsInventory {
    fn devices(&self, subsystem: &str) -> Vec<Device> {
        let class_dir = self.sysfs.path("class").join(subsystem);
        let dir = if class_dir.is_dir() {
            class_dir
        } else {
            self.sysfs.path("bus").join(subsystem).join("devices")
        };
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(subsystem, path = %dir.display(), error = %e, "subsystem not listed");
                return Vec::new();
            }
        };
        let mut devices: Vec<Device> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| {
                let name = entry.file_name().to_string_lossy().replace('!', "/");
                self.read_device(subsystem, &entry.path(), name)
            })
            .collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }
}

/// Value of `KEY=value` in a uevent file.
pub fn uevent_value(uevent: &str, key: &str) -> Option<String> {
    uevent.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k.trim() == key).then(|| v.trim().to_string())
    })
}

// ---------------------------------------------------------------------------
// StaticInventory: in-memory inventory for tests and dry runs
// ---------------------------------------------------------------------------

/// Mutable in-memory device list.
#[derive(Debug, Default)]
pub struct StaticInventory {
    devices: Mutex<BTreeMap<(String, String), Device>>,
}

impl StaticInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let inv = Self::new();
        for d in devices {
            inv.insert(d);
        }
        inv
    }

    /// Add or replace a device.
    pub fn insert(&self, device: Device) {
        if let Ok(mut map) = self.devices.lock() {
            map.insert((device.subsystem.clone(), device.name.clone()), device);
        }
    }

    pub fn remove(&self, subsystem: &str, name: &str) -> Option<Device> {
        self.devices
            .lock()
            .ok()
            .and_then(|mut map| map.remove(&(subsystem.to_string(), name.to_string())))
    }
}

impl DeviceInventory for StaticInventory {
    fn devices(&self, subsystem: &str) -> Vec<Device> {
        self.devices
            .lock()
            .map(|map| {
                map.values()
                    .filter(|d| d.subsystem == subsystem)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
