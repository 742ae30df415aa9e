//! # Stage: Disk Plugin
//!
//! ## Responsibility
//! Power and queue tuning for fixed block devices.
//!
//! Static options (`elevator`, `apm`, `spindown`, `readahead`,
//! `readahead_multiply`, `scheduler_quantum`) are written once per device and
//! restored at stop. With dynamic tuning on, every tick feeds each device's
//! activity counters into its [`DeviceTuning`] state machine, which then owns
//! `apm` and `spindown`.
//!
//! ## Guarantees
//! - No command on the hotplug path: the capability check runs lazily, on the
//!   first tick or static apply that needs it
//! - One in-flight command per device: static apply, verify, unapply and ticks
//!   all run under the device's slot lock
//! - A device removed mid-tick finishes that tick; later work on it is skipped
//! - Failures degrade to a log line and a skipped setting
//!
//! ## NOT Responsible For
//! - Counting command failures (shared [`CircuitBreaker`](crate::exec::CircuitBreaker))
//! - Scheduling ticks (the daemon)

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use super::{
    option_bool, verify_value, DeviceArena, DeviceJob, DeviceTunable, DynamicTunable, HotplugAware,
    InstanceConfig, OptionSpec, Options, OriginalValues, Plugin, StaticTunable, Tunable,
};
use crate::device::Device;
use crate::error::Result;
use crate::exec::breaker::CommandCategory;
use crate::exec::hdparm::{ApmSupport, Hdparm, SPINDOWN_UNKNOWN_VALUE};
use crate::monitor::{DiskLoadMonitor, LoadMonitor};
use crate::sysfs::{active_option, Sysfs};
use crate::tuning::controller::{ControllerConfig, DeviceTuning};

/// Parent subsystems whose disks are admitted.
pub const SUPPORTED_PARENTS: &[&str] = &["scsi", "virtio", "xen", "nvme"];

const DISK_OPTIONS: OptionSpec = &[
    ("dynamic", Some("true")),
    ("elevator", None),
    ("apm", None),
    ("spindown", None),
    ("readahead", None),
    ("readahead_multiply", None),
    ("scheduler_quantum", None),
];

const READAHEAD_MULTIPLY: &str = "readahead_multiply";

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-device static settings with a get/set pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiskOption {
    Elevator,
    Apm,
    Spindown,
    Readahead,
    SchedulerQuantum,
}

impl DiskOption {
    const ALL: [DiskOption; 5] = [
        DiskOption::Elevator,
        DiskOption::Apm,
        DiskOption::Spindown,
        DiskOption::Readahead,
        DiskOption::SchedulerQuantum,
    ];

    fn key(self) -> &'static str {
        match self {
            DiskOption::Elevator => "elevator",
            DiskOption::Apm => "apm",
            DiskOption::Spindown => "spindown",
            DiskOption::Readahead => "readahead",
            DiskOption::SchedulerQuantum => "scheduler_quantum",
        }
    }

    /// Owned by the controller while dynamic tuning runs.
    fn used_by_dynamic(self) -> bool {
        matches!(self, DiskOption::Apm | DiskOption::Spindown)
    }
}

/// Parse a read-ahead value: `N` (KiB) or `N s` (512-byte sectors).
pub fn parse_readahead(value: &str) -> Option<u64> {
    let mut parts = value.trim().splitn(2, char::is_whitespace);
    let n: u64 = parts.next()?.parse().ok()?;
    match parts.next().map(str::trim_start) {
        Some(unit) if unit.starts_with('s') => Some(n / 2),
        _ => Some(n),
    }
}

/// Admission predicate for the disk plugin.
pub fn disk_is_supported(device: &Device) -> bool {
    device.device_type.as_deref() == Some("disk")
        && device.removable == Some(false)
        && device
            .parent_subsystem
            .as_deref()
            .map_or(true, |p| SUPPORTED_PARENTS.contains(&p))
}

// ---------------------------------------------------------------------------
// DiskPlugin
// ---------------------------------------------------------------------------

/// State shared by every disk instance: sysfs, hdparm (and with it the
/// breaker), and the capability cache.
struct DiskShared {
    sysfs: Sysfs,
    hdparm: Hdparm,
    dynamic_tuning: bool,
    controller: ControllerConfig,
    apm_support: Mutex<BTreeMap<String, ApmSupport>>,
}

impl DiskShared {
    /// Whether `device` accepts hdparm power management, probing on first use.
    fn apm_supported(&self, device: &str) -> bool {
        if let Ok(cache) = self.apm_support.lock() {
            if let Some(support) = cache.get(device) {
                return *support == ApmSupport::Supported;
            }
        }
        let support = self.hdparm.apm_support(device);
        debug!(device, support = ?support, "apm capability checked");
        if let Ok(mut cache) = self.apm_support.lock() {
            cache.insert(device.to_string(), support);
        }
        support == ApmSupport::Supported
    }

    fn forget(&self, device: &str) {
        if let Ok(mut cache) = self.apm_support.lock() {
            cache.remove(device);
        }
    }

    fn file(&self, device: &str, suffix: &str) -> std::path::PathBuf {
        self.sysfs.device_path("block", device, suffix)
    }

    /// Value that is (or, with `sim`, would be) written; `None` when skipped.
    fn set(&self, option: DiskOption, value: &str, device: &str, sim: bool) -> Option<String> {
        match option {
            DiskOption::Elevator => {
                if !sim {
                    self.sysfs.write(&self.file(device, "queue/scheduler"), value);
                }
                Some(value.to_string())
            }
            DiskOption::Apm | DiskOption::Spindown => self.set_hdparm(option, value, device, sim),
            DiskOption::Readahead => {
                let Some(kb) = parse_readahead(value) else {
                    error!(device, value, "invalid readahead value");
                    return None;
                };
                if !sim {
                    self.sysfs.write(&self.file(device, "queue/read_ahead_kb"), &kb.to_string());
                }
                Some(kb.to_string())
            }
            DiskOption::SchedulerQuantum => {
                let Ok(quantum) = value.trim().parse::<i64>() else {
                    error!(device, value, "invalid scheduler_quantum value");
                    return None;
                };
                if !sim {
                    self.sysfs
                        .write(&self.file(device, "queue/iosched/quantum"), &quantum.to_string());
                }
                Some(quantum.to_string())
            }
        }
    }

    fn set_hdparm(&self, option: DiskOption, value: &str, device: &str, sim: bool) -> Option<String> {
        let Ok(level) = value.trim().parse::<u32>() else {
            error!(device, option = option.key(), value, "invalid value");
            return None;
        };
        if !self.apm_supported(device) {
            if sim {
                return Some(level.to_string());
            }
            info!(device, option = option.key(), "option is not supported for device");
            return None;
        }
        let category = match option {
            DiskOption::Apm => CommandCategory::PowerMode,
            _ => CommandCategory::Spindown,
        };
        if self.hdparm.breaker().is_frozen(category) {
            return None;
        }
        if !sim {
            match option {
                DiskOption::Apm => self.hdparm.apply_apm(device, level),
                _ => self.hdparm.apply_spindown(device, level),
            };
        }
        Some(level.to_string())
    }

    fn get(&self, option: DiskOption, device: &str, ignore_missing: bool) -> Option<String> {
        match option {
            DiskOption::Elevator => self
                .sysfs
                .read(&self.file(device, "queue/scheduler"), ignore_missing)
                .map(|content| active_option(&content, true)),
            DiskOption::Apm | DiskOption::Spindown => {
                if !self.apm_supported(device) {
                    if !ignore_missing {
                        info!(device, option = option.key(), "option is not supported for device");
                    }
                    return None;
                }
                match option {
                    DiskOption::Apm => self.hdparm.read_apm(device).map(|v| v.to_string()),
                    // The current spindown cannot be queried.
                    _ => Some(SPINDOWN_UNKNOWN_VALUE.to_string()),
                }
            }
            DiskOption::Readahead => self
                .sysfs
                .read(&self.file(device, "queue/read_ahead_kb"), ignore_missing)
                .and_then(|v| v.parse::<u64>().ok())
                .map(|v| v.to_string()),
            DiskOption::SchedulerQuantum => {
                let value = self
                    .sysfs
                    .read(&self.file(device, "queue/iosched/quantum"), ignore_missing)
                    .filter(|v| !v.is_empty());
                if value.is_none() && !ignore_missing {
                    info!(device, "scheduler_quantum option is not supported for device");
                }
                value
            }
        }
    }
}

/// Factory for disk instances.
pub struct DiskPlugin {
    shared: Arc<DiskShared>,
}

impl DiskPlugin {
    /// `dynamic_tuning` is the process-wide switch; instances can only turn
    /// dynamic tuning off, never on.
    pub fn new(sysfs: Sysfs, hdparm: Hdparm, dynamic_tuning: bool) -> Self {
        Self::with_controller(sysfs, hdparm, dynamic_tuning, ControllerConfig::default())
    }

    pub fn with_controller(
        sysfs: Sysfs,
        hdparm: Hdparm,
        dynamic_tuning: bool,
        controller: ControllerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(DiskShared {
                sysfs,
                hdparm,
                dynamic_tuning,
                controller,
                apm_support: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn hdparm(&self) -> &Hdparm {
        &self.shared.hdparm
    }
}

impl Plugin for DiskPlugin {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn config_options(&self) -> OptionSpec {
        DISK_OPTIONS
    }

    fn as_hotplug(&self) -> Option<&dyn HotplugAware> {
        Some(self)
    }

    fn instance_init(&self, config: &InstanceConfig) -> Result<Arc<dyn Tunable>> {
        let dynamic = self.shared.dynamic_tuning
            && config
                .options
                .get("dynamic")
                .map_or(true, |v| option_bool(v).unwrap_or(false));
        let monitor = dynamic.then(|| DiskLoadMonitor::new(self.shared.sysfs.clone()));
        Ok(Arc::new(DiskInstance {
            state: Arc::new(DiskState {
                name: config.name.clone(),
                shared: Arc::clone(&self.shared),
                options: config.options.clone(),
                dynamic,
                monitor: Mutex::new(monitor),
                devices: DeviceArena::new(),
                originals: OriginalValues::new(),
            }),
        }))
    }
}

impl HotplugAware for DiskPlugin {
    fn subsystem(&self) -> &'static str {
        "block"
    }

    fn device_is_supported(&self, device: &Device) -> bool {
        disk_is_supported(device)
    }
}

// ---------------------------------------------------------------------------
// DiskInstance
// ---------------------------------------------------------------------------

struct DiskState {
    name: String,
    shared: Arc<DiskShared>,
    options: Options,
    dynamic: bool,
    monitor: Mutex<Option<DiskLoadMonitor>>,
    devices: DeviceArena<DeviceTuning>,
    originals: OriginalValues,
}

impl DiskState {
    /// Configured static options, minus those the controller owns.
    fn static_options(&self) -> Vec<(DiskOption, &str)> {
        DiskOption::ALL
            .iter()
            .filter(|opt| !(self.dynamic && opt.used_by_dynamic()))
            .filter_map(|opt| self.options.get(opt.key()).map(|v| (*opt, v.as_str())))
            .collect()
    }

    fn apply_device(&self, device: &str) {
        let Some(slot) = self.devices.get(device) else {
            return;
        };
        slot.with(|_| {
            for (option, value) in self.static_options() {
                if let Some(original) = self.shared.get(option, device, false) {
                    self.originals.record(option.key(), Some(device), original);
                }
                self.shared.set(option, value, device, false);
            }
            if let Some(multiplier) = self.options.get(READAHEAD_MULTIPLY) {
                self.multiply_readahead(device, multiplier);
            }
        });
    }

    fn multiply_readahead(&self, device: &str, multiplier: &str) {
        if self.originals.get(READAHEAD_MULTIPLY, Some(device)).is_some() {
            return;
        }
        let Ok(factor) = multiplier.trim().parse::<f64>() else {
            error!(device, value = multiplier, "invalid readahead_multiply value");
            return;
        };
        let Some(old) = self
            .shared
            .get(DiskOption::Readahead, device, false)
            .and_then(|v| v.parse::<u64>().ok())
        else {
            return;
        };
        let new = (factor * old as f64).floor() as u64;
        self.originals
            .record(READAHEAD_MULTIPLY, Some(device), old.to_string());
        self.shared
            .set(DiskOption::Readahead, &new.to_string(), device, false);
    }

    fn unapply_device(&self, device: &str) {
        let Some(slot) = self.devices.get(device) else {
            return;
        };
        slot.with(|_| self.restore_device(device));
    }

    fn restore_device(&self, device: &str) {
        if let Some(old) = self.originals.take(READAHEAD_MULTIPLY, Some(device)) {
            self.shared.set(DiskOption::Readahead, &old, device, false);
        }
        for option in DiskOption::ALL.iter().rev() {
            if let Some(original) = self.originals.take(option.key(), Some(device)) {
                self.shared.set(*option, &original, device, false);
            }
        }
    }

    fn verify_device(&self, device: &str, ignore_missing: bool) -> bool {
        let Some(slot) = self.devices.get(device) else {
            return true;
        };
        slot.with(|_| {
            let mut ok = true;
            for (option, value) in self.static_options() {
                let expected = self.shared.set(option, value, device, true);
                let current = self.shared.get(option, device, ignore_missing);
                ok &= verify_value(
                    option.key(),
                    Some(device),
                    expected.as_deref(),
                    current.as_deref(),
                    ignore_missing,
                );
            }
            ok
        })
        .unwrap_or(true)
    }
}

/// One configured disk instance.
pub struct DiskInstance {
    state: Arc<DiskState>,
}

impl Tunable for DiskInstance {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn as_static(&self) -> Option<&dyn StaticTunable> {
        Some(self)
    }

    fn as_dynamic(&self) -> Option<&dyn DynamicTunable> {
        self.state.dynamic.then_some(self as &dyn DynamicTunable)
    }

    fn as_devices(&self) -> Option<&dyn DeviceTunable> {
        Some(self)
    }

    fn instance_cleanup(&self) {
        if let Ok(mut monitor) = self.state.monitor.lock() {
            if monitor.take().is_some() {
                debug!(instance = %self.state.name, "load monitor released");
            }
        }
    }
}

impl StaticTunable for DiskInstance {
    fn instance_apply_static(&self) {
        for device in self.state.devices.names() {
            self.state.apply_device(&device);
        }
    }

    fn instance_verify_static(&self, ignore_missing: bool, devices: Option<&[String]>) -> bool {
        let mut ok = true;
        for device in self.state.devices.names() {
            if devices.is_some_and(|only| !only.contains(&device)) {
                continue;
            }
            ok &= self.state.verify_device(&device, ignore_missing);
        }
        ok
    }

    fn instance_unapply_static(&self) {
        for device in self.state.devices.names() {
            self.state.unapply_device(&device);
        }
    }
}

impl DynamicTunable for DiskInstance {
    fn begin_tick(&self) {
        if let Ok(mut monitor) = self.state.monitor.lock() {
            if let Some(monitor) = monitor.as_mut() {
                monitor.refresh();
            }
        }
    }

    fn instance_update_dynamic(&self, device: &str) {
        let Some(slot) = self.state.devices.get(device) else {
            return;
        };
        let shared = &self.state.shared;
        // Capability check and sample read run under the device lock so a
        // concurrent apply on the same device never runs `hdparm -C` twice.
        slot.with(|tuning| {
            if !shared.apm_supported(device) {
                return;
            }
            let sample = self
                .state
                .monitor
                .lock()
                .ok()
                .and_then(|m| m.as_ref().and_then(|m| m.sample(device)));
            if let Some(sample) = sample {
                tuning.update(device, &sample, &shared.controller, &shared.hdparm);
            }
        });
    }

    fn instance_unapply_dynamic(&self, device: &str) {
        if let Some(slot) = self.state.devices.get(device) {
            slot.with(|tuning| *tuning = DeviceTuning::new());
        }
    }
}

impl DeviceTunable for DiskInstance {
    fn added_device(&self, name: &str) {
        if !self.state.devices.insert(name, DeviceTuning::new()) {
            return;
        }
        if let Ok(mut monitor) = self.state.monitor.lock() {
            if let Some(monitor) = monitor.as_mut() {
                monitor.attach(name);
            }
        }
    }

    fn added_device_apply_tuning(&self, name: &str) -> Option<DeviceJob> {
        let state = Arc::clone(&self.state);
        let name = name.to_string();
        Some(Box::new(move || state.apply_device(&name)))
    }

    fn removed_device(&self, name: &str) {
        self.state.devices.remove(name);
        if let Ok(mut monitor) = self.state.monitor.lock() {
            if let Some(monitor) = monitor.as_mut() {
                monitor.detach(name);
            }
        }
        self.state.originals.forget_device(name);
        self.state.shared.forget(name);
    }

    fn assigned_devices(&self) -> Vec<String> {
        self.state.devices.names()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
