//! # Stage: Plugin Driver
//!
//! ## Responsibility
//! Owns the instances of one plugin and the plugin's device universe: which
//! admitted devices are still free and which instance each assigned device
//! belongs to. Startup enumeration and hotplug events both flow through here.
//!
//! ## Guarantees
//! - Each device is assigned to at most one instance, the first (in
//!   configuration order) whose selector matches
//! - Adds re-evaluate the admission predicate; removes are honored even for
//!   devices that would no longer be admitted
//! - Duplicate adds and removes of unknown devices are no-ops
//! - Event handling only touches in-memory state; command work is returned
//!   as [`DeviceJob`]s for the caller to run off the event path
//!
//! ## NOT Responsible For
//! - Running jobs or ticks (that is the daemon)

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::{resolve_options, DeviceJob, DeviceSelector, InstanceConfig, Plugin, Tunable};
use crate::device::hotplug::HotplugEvent;
use crate::device::Device;
use crate::error::Result;

/// Free and assigned devices of one plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSets {
    /// Last-known admitted devices not claimed by any instance.
    pub free: BTreeMap<String, Device>,
    /// Device name → index of the owning instance.
    pub assigned: BTreeMap<String, usize>,
}

impl DeviceSets {
    pub fn knows(&self, name: &str) -> bool {
        self.free.contains_key(name) || self.assigned.contains_key(name)
    }
}

struct ManagedInstance {
    selector: DeviceSelector,
    tunable: Arc<dyn Tunable>,
}

/// Lifecycle driver for all instances of one plugin.
pub struct PluginDriver {
    plugin: Arc<dyn Plugin>,
    instances: Vec<ManagedInstance>,
    sets: Mutex<DeviceSets>,
}

impl PluginDriver {
    /// Resolve options and initialize every instance of `plugin`.
    pub fn new(plugin: Arc<dyn Plugin>, configs: &[InstanceConfig]) -> Result<Self> {
        let mut instances = Vec::with_capacity(configs.len());
        for config in configs {
            let selector = DeviceSelector::new(&config.devices)?;
            let options = resolve_options(
                &config.name,
                plugin.config_options(),
                &config.options,
                plugin.accepts_any_option(),
            );
            let resolved = InstanceConfig {
                options,
                ..config.clone()
            };
            let tunable = plugin.instance_init(&resolved)?;
            info!(
                instance = %config.name,
                plugin = plugin.name(),
                static_tuning = tunable.has_static(),
                dynamic_tuning = tunable.has_dynamic(),
                "instance initialized"
            );
            instances.push(ManagedInstance { selector, tunable });
        }
        Ok(Self {
            plugin,
            instances,
            sets: Mutex::new(DeviceSets::default()),
        })
    }

    pub fn plugin(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }

    pub fn subsystem(&self) -> Option<&'static str> {
        self.plugin.as_hotplug().map(|h| h.subsystem())
    }

    pub fn tunables(&self) -> impl Iterator<Item = &Arc<dyn Tunable>> {
        self.instances.iter().map(|i| &i.tunable)
    }

    pub fn sets(&self) -> DeviceSets {
        self.sets.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Instance name → assigned device names.
    pub fn assignments(&self) -> BTreeMap<String, Vec<String>> {
        let sets = self.sets();
        let mut out: BTreeMap<String, Vec<String>> = self
            .instances
            .iter()
            .map(|i| (i.tunable.name().to_string(), Vec::new()))
            .collect();
        for (device, idx) in &sets.assigned {
            if let Some(inst) = self.instances.get(*idx) {
                out.entry(inst.tunable.name().to_string())
                    .or_default()
                    .push(device.clone());
            }
        }
        out
    }

    /// Hand the admitted devices of a subsystem listing to instances.
    /// Registration only; the caller applies static tuning afterwards.
    pub fn init_devices(&self, listing: &[Device]) -> Vec<Device> {
        let Some(hotplug) = self.plugin.as_hotplug() else {
            return Vec::new();
        };
        let admitted: Vec<Device> = listing
            .iter()
            .filter(|d| hotplug.device_is_supported(d))
            .cloned()
            .collect();
        for device in &admitted {
            self.add_device(device, false);
        }
        admitted
    }

    /// Apply one hotplug event; returns tuning work for newly assigned devices.
    pub fn handle_event(&self, event: &HotplugEvent) -> Vec<DeviceJob> {
        let Some(hotplug) = self.plugin.as_hotplug() else {
            return Vec::new();
        };
        match event {
            HotplugEvent::Add(device) => {
                if !hotplug.device_is_supported(device) {
                    debug!(plugin = self.plugin.name(), device = %device.name, "device not supported, ignored");
                    return Vec::new();
                }
                self.add_device(device, true).into_iter().collect()
            }
            HotplugEvent::Remove(device) => {
                self.remove_device(&device.name);
                Vec::new()
            }
        }
    }

    fn add_device(&self, device: &Device, apply: bool) -> Option<DeviceJob> {
        let Ok(mut sets) = self.sets.lock() else {
            return None;
        };
        if sets.knows(&device.name) {
            debug!(plugin = self.plugin.name(), device = %device.name, "device already known");
            return None;
        }
        let claimed = self.instances.iter().enumerate().find_map(|(idx, inst)| {
            let devices = inst.tunable.as_devices()?;
            inst.selector.matches(&device.name).then_some((idx, inst, devices))
        });
        let Some((idx, inst, devices)) = claimed else {
            sets.free.insert(device.name.clone(), device.clone());
            return None;
        };
        sets.assigned.insert(device.name.clone(), idx);

        info!(instance = %inst.tunable.name(), device = %device.name, "device assigned");
        devices.added_device(&device.name);
        if apply {
            devices.added_device_apply_tuning(&device.name)
        } else {
            None
        }
    }

    fn remove_device(&self, name: &str) {
        let Ok(mut sets) = self.sets.lock() else {
            return;
        };
        if sets.free.remove(name).is_some() {
            debug!(plugin = self.plugin.name(), device = name, "free device removed");
            return;
        }
        let Some(idx) = sets.assigned.remove(name) else {
            debug!(plugin = self.plugin.name(), device = name, "removal of unknown device ignored");
            return;
        };
        if let Some(inst) = self.instances.get(idx) {
            info!(instance = %inst.tunable.name(), device = name, "device removed");
            if let Some(devices) = inst.tunable.as_devices() {
                devices.removed_device(name);
            }
        }
    }
}

impl std::fmt::Debug for PluginDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDriver")
            .field("plugin", &self.plugin.name())
            .field("instances", &self.instances.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::plugins::{DeviceTunable, HotplugAware, OptionSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Admits scsi disks only; records membership calls.
    struct FakePlugin {
        jobs_run: Arc<AtomicUsize>,
    }

    struct FakeInstance {
        name: String,
        devices: Mutex<Vec<String>>,
        jobs_run: Arc<AtomicUsize>,
    }

    impl Plugin for FakePlugin {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn config_options(&self) -> OptionSpec {
            &[("level", Some("1"))]
        }
        fn as_hotplug(&self) -> Option<&dyn HotplugAware> {
            Some(self)
        }
        fn instance_init(&self, config: &InstanceConfig) -> Result<Arc<dyn Tunable>> {
            Ok(Arc::new(FakeInstance {
                name: config.name.clone(),
                devices: Mutex::new(Vec::new()),
                jobs_run: Arc::clone(&self.jobs_run),
            }))
        }
    }

    impl HotplugAware for FakePlugin {
        fn subsystem(&self) -> &'static str {
            "block"
        }
        fn device_is_supported(&self, device: &Device) -> bool {
            device.parent_subsystem.as_deref() == Some("scsi")
        }
    }

    impl Tunable for FakeInstance {
        fn name(&self) -> &str {
            &self.name
        }
        fn as_devices(&self) -> Option<&dyn DeviceTunable> {
            Some(self)
        }
    }

    impl DeviceTunable for FakeInstance {
        fn added_device(&self, name: &str) {
            self.devices.lock().unwrap().push(name.to_string());
        }
        fn added_device_apply_tuning(&self, _name: &str) -> Option<DeviceJob> {
            let counter = Arc::clone(&self.jobs_run);
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
        }
        fn removed_device(&self, name: &str) {
            self.devices.lock().unwrap().retain(|d| d != name);
        }
        fn assigned_devices(&self) -> Vec<String> {
            self.devices.lock().unwrap().clone()
        }
    }

    fn driver(configs: &[InstanceConfig]) -> (Arc<AtomicUsize>, PluginDriver) {
        let jobs = Arc::new(AtomicUsize::new(0));
        let plugin = Arc::new(FakePlugin { jobs_run: Arc::clone(&jobs) });
        (jobs, PluginDriver::new(plugin, configs).unwrap())
    }

    #[test]
    fn test_init_assigns_in_configuration_order() {
        let (_, d) = driver(&[
            InstanceConfig::new("first", "fake").with_devices(["sda"]),
            InstanceConfig::new("second", "fake"),
        ]);
        let listing = vec![
            Device::disk("sda", "scsi"),
            Device::disk("sdb", "scsi"),
            Device::disk("sdc", "usb"),
        ];
        let admitted = d.init_devices(&listing);
        assert_eq!(admitted.len(), 2);

        let a = d.assignments();
        assert_eq!(a["first"], vec!["sda"]);
        assert_eq!(a["second"], vec!["sdb"]);
        assert!(d.sets().free.is_empty());
    }

    #[test]
    fn test_unmatched_devices_stay_free() {
        let (_, d) = driver(&[InstanceConfig::new("only-a", "fake").with_devices(["sda"])]);
        d.init_devices(&[Device::disk("sda", "scsi"), Device::disk("sdb", "scsi")]);
        let sets = d.sets();
        assert!(sets.free.contains_key("sdb"));
        assert_eq!(sets.assigned.get("sda"), Some(&0));
    }

    #[test]
    fn test_hotplug_add_returns_apply_job_and_is_idempotent() {
        let (jobs, d) = driver(&[InstanceConfig::new("i", "fake")]);
        let ev = HotplugEvent::Add(Device::disk("sda", "scsi"));
        let work = d.handle_event(&ev);
        assert_eq!(work.len(), 1);
        for job in work {
            job();
        }
        assert_eq!(jobs.load(Ordering::SeqCst), 1);
        assert!(d.handle_event(&ev).is_empty(), "duplicate add is ignored");
        assert_eq!(d.assignments()["i"], vec!["sda"]);
    }

    #[test]
    fn test_unsupported_add_is_ignored() {
        let (_, d) = driver(&[InstanceConfig::new("i", "fake")]);
        assert!(d.handle_event(&HotplugEvent::Add(Device::disk("sdx", "usb"))).is_empty());
        assert_eq!(d.sets(), DeviceSets::default());
    }

    #[test]
    fn test_remove_is_honored_regardless_of_predicate() {
        let (_, d) = driver(&[InstanceConfig::new("i", "fake")]);
        d.init_devices(&[Device::disk("sda", "scsi")]);
        // The removal event carries a device that would no longer be admitted.
        d.handle_event(&HotplugEvent::Remove(Device::new("block", "sda")));
        assert!(d.assignments()["i"].is_empty());
        assert!(!d.sets().knows("sda"));

        // Unknown removal is a no-op.
        d.handle_event(&HotplugEvent::Remove(Device::new("block", "sdq")));
        assert_eq!(d.sets(), DeviceSets::default());
    }
}
