//! # Stage: Sysfs Plugin
//!
//! ## Responsibility
//! Writes arbitrary kernel attributes. Each option key is a path glob, each
//! value the text to write to every match.
//!
//! ## Guarantees
//! - Hard boundary: a match outside the sanctioned sysfs root is rejected and
//!   logged, never written
//! - Originals are recorded on the first apply and restored on unapply
//!
//! ## NOT Responsible For
//! - Variable expansion in values

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, warn};

use super::{
    verify_value, InstanceConfig, OptionSpec, OriginalValues, Plugin, StaticTunable, Tunable,
};
use crate::error::{Result, TuneError};
use crate::sysfs::{active_option, normalize, Sysfs};

/// Factory for sysfs instances.
#[derive(Debug, Clone, Default)]
pub struct SysfsPlugin {
    sysfs: Sysfs,
}

impl SysfsPlugin {
    pub fn new(sysfs: Sysfs) -> Self {
        Self { sysfs }
    }
}

impl Plugin for SysfsPlugin {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn config_options(&self) -> OptionSpec {
        &[]
    }

    fn accepts_any_option(&self) -> bool {
        true
    }

    fn instance_init(&self, config: &InstanceConfig) -> Result<Arc<dyn Tunable>> {
        let mut settings = Vec::with_capacity(config.options.len());
        for (key, value) in &config.options {
            let pattern = normalize(&PathBuf::from(key)).display().to_string();
            glob::Pattern::new(&pattern).map_err(|source| TuneError::Pattern {
                pattern: key.clone(),
                source,
            })?;
            settings.push((pattern, value.clone()));
        }
        Ok(Arc::new(SysfsInstance {
            name: config.name.clone(),
            sysfs: self.sysfs.clone(),
            settings,
            originals: OriginalValues::new(),
        }))
    }
}

/// One configured sysfs instance.
pub struct SysfsInstance {
    name: String,
    sysfs: Sysfs,
    /// Normalized path glob → value.
    settings: Vec<(String, String)>,
    originals: OriginalValues,
}

impl SysfsInstance {
    /// Every existing path matching `pattern`, sanctioned or not.
    fn matches(&self, pattern: &str) -> Vec<PathBuf> {
        match glob::glob(pattern) {
            Ok(paths) => paths.filter_map(|p| p.ok()).collect(),
            Err(e) => {
                warn!(instance = %self.name, pattern, error = %e, "invalid path pattern");
                Vec::new()
            }
        }
    }

    fn read(&self, path: &std::path::Path) -> Option<String> {
        self.sysfs
            .read(path, false)
            .filter(|v| !v.is_empty())
            .map(|v| active_option(&v, false))
    }
}

impl Tunable for SysfsInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_static(&self) -> Option<&dyn StaticTunable> {
        Some(self)
    }
}

impl StaticTunable for SysfsInstance {
    fn instance_apply_static(&self) {
        for (pattern, value) in &self.settings {
            for path in self.matches(pattern) {
                if !self.sysfs.is_sanctioned(&path) {
                    error!(
                        instance = %self.name,
                        path = %path.display(),
                        root = %self.sysfs.root().display(),
                        "rejecting write: not inside sysfs"
                    );
                    continue;
                }
                let key = path.display().to_string();
                if let Some(original) = self.read(&path) {
                    self.originals.record(&key, None, original);
                }
                self.sysfs.write(&path, value);
            }
        }
    }

    fn instance_verify_static(&self, ignore_missing: bool, _devices: Option<&[String]>) -> bool {
        let mut ok = true;
        for (pattern, value) in &self.settings {
            for path in self.matches(pattern) {
                if !self.sysfs.is_sanctioned(&path) {
                    continue;
                }
                let key = path.display().to_string();
                let current = self.read(&path);
                ok &= verify_value(&key, None, Some(value), current.as_deref(), ignore_missing);
            }
        }
        ok
    }

    fn instance_unapply_static(&self) {
        for (key, _, original) in self.originals.drain() {
            self.sysfs.write(&PathBuf::from(key), &original);
        }
    }
}
