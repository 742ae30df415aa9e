//! # Module: plugins
//!
//! The settings-plugin contract and the concrete device-class plugins.
//!
//! A [`Plugin`] is a factory registered once per process. Each configured
//! instance becomes a [`Tunable`], which exposes the lifecycle capabilities it
//! actually has:
//!
//! - [`StaticTunable`]: one-shot settings applied at start, verified on demand,
//!   restored at stop
//! - [`DynamicTunable`]: per-device settings recomputed every tick
//! - [`DeviceTunable`]: membership of devices handed out by the [`driver`]
//!
//! Device-class plugins additionally implement [`HotplugAware`] so the driver
//! knows which subsystem to enumerate and which devices to admit.
//!
//! ## Sub-modules
//! - [`driver`]: device sets and instance assignment for one plugin
//! - [`disk`]: block-device power management, the adaptive plugin
//! - [`sysfs`]: generic attribute writer with glob paths
//! - [`usb`]: USB autosuspend
//! - [`vm`]: transparent huge pages

pub mod disk;
pub mod driver;
pub mod sysfs;
pub mod usb;
pub mod vm;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info, warn};

use crate::device::Device;
use crate::error::{Result, TuneError};

pub use disk::DiskPlugin;
pub use driver::{DeviceSets, PluginDriver};
pub use sysfs::SysfsPlugin;
pub use usb::UsbPlugin;
pub use vm::VmPlugin;

// ---------------------------------------------------------------------------
// Instance configuration
// ---------------------------------------------------------------------------

/// Option name → value, all values normalized to strings.
pub type Options = BTreeMap<String, String>;

/// Known options of a plugin with their defaults (`None` = unset).
pub type OptionSpec = &'static [(&'static str, Option<&'static str>)];

/// One configured plugin instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub name: String,
    pub plugin: String,
    /// Device selectors; empty selects every device.
    pub devices: Vec<String>,
    pub options: Options,
}

impl InstanceConfig {
    pub fn new(name: impl Into<String>, plugin: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plugin: plugin.into(),
            devices: Vec::new(),
            options: Options::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_devices<I, S>(mut self, selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.devices = selectors.into_iter().map(Into::into).collect();
        self
    }
}

/// Merge `given` over the defaults in `spec`.
///
/// Unset defaults are left out. Unknown keys are dropped with a warning unless
/// `accept_unknown` is set.
pub fn resolve_options(instance: &str, spec: OptionSpec, given: &Options, accept_unknown: bool) -> Options {
    let mut resolved: Options = spec
        .iter()
        .filter_map(|(k, v)| v.map(|v| (k.to_string(), v.to_string())))
        .collect();
    for (key, value) in given {
        if accept_unknown || spec.iter().any(|(k, _)| k == key) {
            resolved.insert(key.clone(), value.clone());
        } else {
            warn!(instance, option = %key, "unknown option, ignored");
        }
    }
    resolved
}

/// Boolean option parsing. Unrecognized text yields `None`.
pub fn option_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// DeviceSelector
// ---------------------------------------------------------------------------

/// Glob selectors over device names; `!pattern` excludes.
#[derive(Debug, Clone, Default)]
pub struct DeviceSelector {
    include: Vec<glob::Pattern>,
    exclude: Vec<glob::Pattern>,
}

impl DeviceSelector {
    pub fn new(selectors: &[String]) -> Result<Self> {
        let mut sel = Self::default();
        for raw in selectors {
            let (negated, text) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest.trim()),
                None => (false, raw.trim()),
            };
            let pattern = glob::Pattern::new(text).map_err(|source| TuneError::Pattern {
                pattern: raw.clone(),
                source,
            })?;
            if negated {
                sel.exclude.push(pattern);
            } else {
                sel.include.push(pattern);
            }
        }
        Ok(sel)
    }

    pub fn matches(&self, name: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|p| p.matches(name));
        included && !self.exclude.iter().any(|p| p.matches(name))
    }
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Deferred per-device work, run on the blocking pool.
pub type DeviceJob = Box<dyn FnOnce() + Send + 'static>;

/// Factory for instances of one kind of settings plugin.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn config_options(&self) -> OptionSpec;
    /// Whether option keys outside [`config_options`](Self::config_options)
    /// are meaningful (the key itself is the setting).
    fn accepts_any_option(&self) -> bool {
        false
    }
    fn as_hotplug(&self) -> Option<&dyn HotplugAware> {
        None
    }
    /// Build an instance. `config.options` are already resolved.
    fn instance_init(&self, config: &InstanceConfig) -> Result<Arc<dyn Tunable>>;
}

/// Plugins that manage devices of one subsystem.
pub trait HotplugAware: Send + Sync {
    fn subsystem(&self) -> &'static str;
    /// Admission predicate.
    fn device_is_supported(&self, device: &Device) -> bool;
}

/// A live plugin instance.
pub trait Tunable: Send + Sync {
    fn name(&self) -> &str;
    fn as_static(&self) -> Option<&dyn StaticTunable> {
        None
    }
    fn as_dynamic(&self) -> Option<&dyn DynamicTunable> {
        None
    }
    fn as_devices(&self) -> Option<&dyn DeviceTunable> {
        None
    }
    fn has_static(&self) -> bool {
        self.as_static().is_some()
    }
    fn has_dynamic(&self) -> bool {
        self.as_dynamic().is_some()
    }
    /// Release scoped resources acquired at init.
    fn instance_cleanup(&self) {}
}

/// One-shot settings.
pub trait StaticTunable: Send + Sync {
    /// Apply every static setting; repeated calls keep the first recorded
    /// originals.
    fn instance_apply_static(&self);
    /// Compare current values against the intended ones. `devices` restricts
    /// per-device options; `None` means every assigned device.
    fn instance_verify_static(&self, ignore_missing: bool, devices: Option<&[String]>) -> bool;
    /// Restore recorded originals.
    fn instance_unapply_static(&self);
}

/// Per-tick adaptive settings.
pub trait DynamicTunable: Send + Sync {
    /// Called once per tick before any device update.
    fn begin_tick(&self) {}
    fn instance_update_dynamic(&self, device: &str);
    /// Release adaptive state of `device`.
    fn instance_unapply_dynamic(&self, device: &str);
}

/// Device membership.
pub trait DeviceTunable: Send + Sync {
    /// Register a newly assigned device. Must not run external commands.
    fn added_device(&self, name: &str);
    /// Work that tunes a device assigned after startup.
    fn added_device_apply_tuning(&self, name: &str) -> Option<DeviceJob>;
    /// Forget a device. Must not run external commands.
    fn removed_device(&self, name: &str);
    fn assigned_devices(&self) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// Verification and original values
// ---------------------------------------------------------------------------

/// Compare `current` with `expected`, logging the verdict.
///
/// Values that both parse as integers compare numerically. An unknown
/// `expected` always passes; a missing `current` passes only with
/// `ignore_missing`.
pub fn verify_value(
    option: &str,
    device: Option<&str>,
    expected: Option<&str>,
    current: Option<&str>,
    ignore_missing: bool,
) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    let Some(current) = current else {
        if ignore_missing {
            info!(option, device, "verify: value missing, ignored");
            return true;
        }
        error!(option, device, expected, "verify: failed, value missing");
        return false;
    };
    let equal = match (expected.trim().parse::<i64>(), current.trim().parse::<i64>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => expected.trim() == current.trim(),
    };
    if equal {
        info!(option, device, value = current, "verify: passed");
    } else {
        error!(option, device, expected, current, "verify: failed");
    }
    equal
}

type OriginalKey = (String, Option<String>);

/// Values recorded before the first write, restored on unapply.
#[derive(Debug, Default)]
pub struct OriginalValues {
    values: Mutex<BTreeMap<OriginalKey, String>>,
}

impl OriginalValues {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Option<MutexGuard<'_, BTreeMap<OriginalKey, String>>> {
        self.values.lock().ok()
    }

    /// Record `value` unless an original for the key already exists.
    pub fn record(&self, option: &str, device: Option<&str>, value: String) {
        if let Some(mut v) = self.lock() {
            v.entry((option.to_string(), device.map(str::to_string)))
                .or_insert(value);
        }
    }

    pub fn get(&self, option: &str, device: Option<&str>) -> Option<String> {
        self.lock()?
            .get(&(option.to_string(), device.map(str::to_string)))
            .cloned()
    }

    pub fn take(&self, option: &str, device: Option<&str>) -> Option<String> {
        self.lock()?
            .remove(&(option.to_string(), device.map(str::to_string)))
    }

    /// Remove and return everything recorded, in key order.
    pub fn drain(&self) -> Vec<(String, Option<String>, String)> {
        let Some(mut v) = self.lock() else {
            return Vec::new();
        };
        std::mem::take(&mut *v)
            .into_iter()
            .map(|((option, device), value)| (option, device, value))
            .collect()
    }

    /// Drop every original recorded for `device`.
    pub fn forget_device(&self, device: &str) {
        if let Some(mut v) = self.lock() {
            v.retain(|(_, d), _| d.as_deref() != Some(device));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().map(|v| v.is_empty()).unwrap_or(true)
    }
}

// ---------------------------------------------------------------------------
// Device-state arena
// ---------------------------------------------------------------------------

/// State of one attached device.
///
/// The mutex serializes every operation on the device, so at most one
/// command is in flight for it. Once detached, operations are skipped.
#[derive(Debug)]
pub struct DeviceSlot<T> {
    name: String,
    state: Mutex<T>,
    detached: AtomicBool,
}

impl<T> DeviceSlot<T> {
    fn new(name: &str, state: T) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(state),
            detached: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Run `f` on the state while holding the device lock. Returns `None`
    /// when the device was detached before or while waiting for the lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        if self.is_detached() {
            return None;
        }
        let mut state = self.state.lock().ok()?;
        if self.is_detached() {
            return None;
        }
        Some(f(&mut state))
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }
}

/// Name-keyed arena of [`DeviceSlot`]s.
#[derive(Debug)]
pub struct DeviceArena<T> {
    slots: Mutex<BTreeMap<String, Arc<DeviceSlot<T>>>>,
}

impl<T> Default for DeviceArena<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<T> DeviceArena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh slot. Returns false if the device is already present.
    pub fn insert(&self, name: &str, state: T) -> bool {
        let Ok(mut slots) = self.slots.lock() else {
            return false;
        };
        if slots.contains_key(name) {
            return false;
        }
        slots.insert(name.to_string(), Arc::new(DeviceSlot::new(name, state)));
        true
    }

    /// Remove and detach a slot.
    pub fn remove(&self, name: &str) -> Option<Arc<DeviceSlot<T>>> {
        let slot = self.slots.lock().ok()?.remove(name)?;
        slot.detach();
        Some(slot)
    }

    pub fn get(&self, name: &str) -> Option<Arc<DeviceSlot<T>>> {
        self.slots.lock().ok()?.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.slots
            .lock()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
