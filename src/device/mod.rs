//! # Module: device
//!
//! Device identity, enumeration and hotplug membership.
//!
//! ## Sub-modules
//! - [`inventory`]: enumerate devices of a subsystem
//! - [`hotplug`]: add/remove event stream per subsystem

pub mod hotplug;
pub mod inventory;

use serde::Serialize;

pub use hotplug::{HotplugEvent, HotplugSource, HotplugSubscription, InotifySource, RescanSource};
pub use inventory::{DeviceInventory, StaticInventory, SysfsInventory};

/// A discovered device, scoped to its subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Device {
    /// Kernel name with `/` restored (`cciss/c0d0`, `sda`, `1-1`).
    pub name: String,
    pub subsystem: String,
    /// `DEVTYPE` from the uevent file, when present.
    pub device_type: Option<String>,
    /// `removable` attribute, when present.
    pub removable: Option<bool>,
    /// Subsystem of the parent device; `None` for devices without a parent.
    pub parent_subsystem: Option<String>,
}

impl Device {
    pub fn new(subsystem: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subsystem: subsystem.into(),
            device_type: None,
            removable: None,
            parent_subsystem: None,
        }
    }

    pub fn with_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    pub fn with_removable(mut self, removable: bool) -> Self {
        self.removable = Some(removable);
        self
    }

    pub fn with_parent(mut self, parent_subsystem: impl Into<String>) -> Self {
        self.parent_subsystem = Some(parent_subsystem.into());
        self
    }

    /// Convenience for a fixed, non-removable disk on `parent`.
    pub fn disk(name: impl Into<String>, parent_subsystem: &str) -> Self {
        Self::new("block", name)
            .with_type("disk")
            .with_removable(false)
            .with_parent(parent_subsystem)
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.subsystem, self.name)
    }
}
