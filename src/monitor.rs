//! # Stage: Load Monitor
//!
//! ## Responsibility
//! Keeps the latest cumulative activity sample for every attached device.
//! A refresh re-reads the kernel's per-device stat file; the controller then
//! asks for the sample of each device it ticks.
//!
//! ## Guarantees
//! - `sample` is `None` until the device has been refreshed at least once
//!   after `attach`, and `None` forever after `detach`
//! - A refresh never blocks on the device itself: the stat file is served
//!   by the kernel without touching the drive
//! - An unreadable or short stat file clears the sample, so the next tick for
//!   that device is skipped rather than fed stale counters
//!
//! ## NOT Responsible For
//! - Computing deltas or normalized load (that is the controller)

use std::collections::BTreeMap;

use tracing::debug;

use crate::sysfs::Sysfs;
use crate::tuning::controller::{SampleVector, SAMPLE_FIELDS};

/// Per-device cumulative counter source.
pub trait LoadMonitor: Send {
    /// Start tracking `device`.
    fn attach(&mut self, device: &str);
    /// Stop tracking `device` and forget its last sample.
    fn detach(&mut self, device: &str);
    /// Re-read counters for every attached device.
    fn refresh(&mut self);
    /// Latest sample for `device`, if any.
    fn sample(&self, device: &str) -> Option<SampleVector>;
    fn attached(&self) -> Vec<String>;
}

/// Load monitor over `<sysfs>/block/<dev>/stat`.
#[derive(Debug, Clone, Default)]
pub struct DiskLoadMonitor {
    sysfs: Sysfs,
    devices: BTreeMap<String, Option<SampleVector>>,
}

impl DiskLoadMonitor {
    pub fn new(sysfs: Sysfs) -> Self {
        Self {
            sysfs,
            devices: BTreeMap::new(),
        }
    }

    fn read(&self, device: &str) -> Option<SampleVector> {
        let path = self.sysfs.device_path("block", device, "stat");
        let content = self.sysfs.read(&path, true)?;
        let sample = parse_stat(&content);
        if sample.is_none() {
            debug!(device, "stat file has too few fields");
        }
        sample
    }
}

impl LoadMonitor for DiskLoadMonitor {
    fn attach(&mut self, device: &str) {
        self.devices.entry(device.to_string()).or_insert(None);
    }

    fn detach(&mut self, device: &str) {
        self.devices.remove(device);
    }

    fn refresh(&mut self) {
        let names: Vec<String> = self.devices.keys().cloned().collect();
        for name in names {
            let sample = self.read(&name);
            self.devices.insert(name, sample);
        }
    }

    fn sample(&self, device: &str) -> Option<SampleVector> {
        self.devices.get(device).copied().flatten()
    }

    fn attached(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }
}

/// First [`SAMPLE_FIELDS`] integers of a stat line.
pub fn parse_stat(content: &str) -> Option<SampleVector> {
    let line = content.lines().next()?;
    let mut sample = [0u64; SAMPLE_FIELDS];
    let mut fields = line.split_whitespace();
    for slot in sample.iter_mut() {
        *slot = fields.next()?.parse().ok()?;
    }
    Some(sample)
}
