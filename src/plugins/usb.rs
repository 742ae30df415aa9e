//! USB autosuspend plugin.
//!
//! Manages `usb_device` entries of the `usb` subsystem. The single option,
//! `autosuspend`, is a boolean written as `1` / `0` to
//! `<sysfs>/bus/usb/devices/<dev>/power/autosuspend`.

use std::path::PathBuf;
use std::sync::Arc;

use super::{
    option_bool, verify_value, DeviceArena, DeviceJob, DeviceTunable, HotplugAware, InstanceConfig,
    OptionSpec, OriginalValues, Plugin, StaticTunable, Tunable,
};
use crate::device::Device;
use crate::error::Result;
use crate::sysfs::Sysfs;

const AUTOSUSPEND: &str = "autosuspend";

/// Factory for USB instances.
#[derive(Debug, Clone, Default)]
pub struct UsbPlugin {
    sysfs: Sysfs,
}

impl UsbPlugin {
    pub fn new(sysfs: Sysfs) -> Self {
        Self { sysfs }
    }
}

impl Plugin for UsbPlugin {
    fn name(&self) -> &'static str {
        "usb"
    }

    fn config_options(&self) -> OptionSpec {
        &[(AUTOSUSPEND, None)]
    }

    fn as_hotplug(&self) -> Option<&dyn HotplugAware> {
        Some(self)
    }

    fn instance_init(&self, config: &InstanceConfig) -> Result<Arc<dyn Tunable>> {
        Ok(Arc::new(UsbInstance {
            state: Arc::new(UsbState {
                name: config.name.clone(),
                sysfs: self.sysfs.clone(),
                autosuspend: config.options.get(AUTOSUSPEND).cloned(),
                devices: DeviceArena::new(),
                originals: OriginalValues::new(),
            }),
        }))
    }
}

impl HotplugAware for UsbPlugin {
    fn subsystem(&self) -> &'static str {
        "usb"
    }

    fn device_is_supported(&self, device: &Device) -> bool {
        device.device_type.as_deref() == Some("usb_device")
    }
}

struct UsbState {
    name: String,
    sysfs: Sysfs,
    autosuspend: Option<String>,
    devices: DeviceArena<()>,
    originals: OriginalValues,
}

impl UsbState {
    fn file(&self, device: &str) -> PathBuf {
        self.sysfs
            .path("bus/usb/devices")
            .join(device)
            .join("power/autosuspend")
    }

    fn set(&self, value: &str, device: &str, sim: bool) -> Option<String> {
        let enable = option_bool(value)?;
        let val = if enable { "1" } else { "0" };
        if !sim {
            self.sysfs.write(&self.file(device), val);
        }
        Some(val.to_string())
    }

    fn get(&self, device: &str, ignore_missing: bool) -> Option<String> {
        self.sysfs.read(&self.file(device), ignore_missing)
    }

    fn apply_device(&self, device: &str) {
        let (Some(value), Some(slot)) = (&self.autosuspend, self.devices.get(device)) else {
            return;
        };
        slot.with(|_| {
            if let Some(original) = self.get(device, false) {
                self.originals.record(AUTOSUSPEND, Some(device), original);
            }
            self.set(value, device, false);
        });
    }
}

/// One configured USB instance.
pub struct UsbInstance {
    state: Arc<UsbState>,
}

impl Tunable for UsbInstance {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn as_static(&self) -> Option<&dyn StaticTunable> {
        Some(self)
    }

    fn as_devices(&self) -> Option<&dyn DeviceTunable> {
        Some(self)
    }
}

impl StaticTunable for UsbInstance {
    fn instance_apply_static(&self) {
        for device in self.state.devices.names() {
            self.state.apply_device(&device);
        }
    }

    fn instance_verify_static(&self, ignore_missing: bool, devices: Option<&[String]>) -> bool {
        let Some(value) = &self.state.autosuspend else {
            return true;
        };
        let mut ok = true;
        for device in self.state.devices.names() {
            if devices.is_some_and(|only| !only.contains(&device)) {
                continue;
            }
            let expected = self.state.set(value, &device, true);
            let current = self.state.get(&device, ignore_missing);
            ok &= verify_value(
                AUTOSUSPEND,
                Some(&device),
                expected.as_deref(),
                current.as_deref(),
                ignore_missing,
            );
        }
        ok
    }

    fn instance_unapply_static(&self) {
        for device in self.state.devices.names() {
            if let Some(original) = self.state.originals.take(AUTOSUSPEND, Some(&device)) {
                self.state.sysfs.write(&self.state.file(&device), &original);
            }
        }
    }
}

impl DeviceTunable for UsbInstance {
    fn added_device(&self, name: &str) {
        self.state.devices.insert(name, ());
    }

    fn added_device_apply_tuning(&self, name: &str) -> Option<DeviceJob> {
        self.state.autosuspend.as_ref()?;
        let state = Arc::clone(&self.state);
        let name = name.to_string();
        Some(Box::new(move || state.apply_device(&name)))
    }

    fn removed_device(&self, name: &str) {
        self.state.devices.remove(name);
        self.state.originals.forget_device(name);
    }

    fn assigned_devices(&self) -> Vec<String> {
        self.state.devices.names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup(value: &str) -> (TempDir, Arc<dyn Tunable>) {
        let tmp = TempDir::new().unwrap();
        let power = tmp.path().join("bus/usb/devices/1-1/power");
        fs::create_dir_all(&power).unwrap();
        fs::write(power.join("autosuspend"), "2\n").unwrap();
        let plugin = UsbPlugin::new(Sysfs::new(tmp.path()));
        let inst = plugin
            .instance_init(&InstanceConfig::new("usb", "usb").with_option(AUTOSUSPEND, value))
            .unwrap();
        inst.as_devices().unwrap().added_device("1-1");
        (tmp, inst)
    }

    fn current(tmp: &TempDir) -> String {
        fs::read_to_string(tmp.path().join("bus/usb/devices/1-1/power/autosuspend"))
            .unwrap()
            .trim()
            .to_string()
    }

    #[test]
    fn test_predicate_admits_usb_devices_only() {
        let plugin = UsbPlugin::default();
        assert!(plugin.device_is_supported(&Device::new("usb", "1-1").with_type("usb_device")));
        assert!(!plugin.device_is_supported(&Device::new("usb", "1-1:1.0").with_type("usb_interface")));
    }

    #[test]
    fn test_autosuspend_written_as_flag_and_restored() {
        let (tmp, inst) = setup("true");
        let st = inst.as_static().unwrap();
        st.instance_apply_static();
        assert_eq!(current(&tmp), "1");
        assert!(st.instance_verify_static(false, None));
        st.instance_unapply_static();
        assert_eq!(current(&tmp), "2");
    }

    #[test]
    fn test_invalid_flag_writes_nothing() {
        let (tmp, inst) = setup("sometimes");
        inst.as_static().unwrap().instance_apply_static();
        assert_eq!(current(&tmp), "2");
    }

    #[test]
    fn test_apply_job_for_new_device() {
        let (tmp, inst) = setup("0");
        let job = inst.as_devices().unwrap().added_device_apply_tuning("1-1").unwrap();
        job();
        assert_eq!(current(&tmp), "0");
    }
}
