//! Daemon configuration.
//!
//! Loaded from a TOML file with a `[daemon]` table and any number of
//! `[[instance]]` entries:
//!
//! ```toml
//! [daemon]
//! update_interval_secs = 10
//!
//! [[instance]]
//! name = "disk"
//! plugin = "disk"
//! devices = ["sd*", "!sdz"]
//! [instance.options]
//! elevator = "mq-deadline"
//! ```
//!
//! Option values may be strings, integers, floats or booleans and are
//! normalized to strings before they reach a plugin.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::hotplug::DEFAULT_RESCAN_PERIOD;
use crate::error::{Result, TuneError};
use crate::exec::breaker::DEFAULT_ERROR_THRESHOLD;
use crate::exec::hdparm::{DEFAULT_DEV_ROOT, DEFAULT_HDPARM};
use crate::plugins::{InstanceConfig, Options};
use crate::sysfs::DEFAULT_SYSFS_ROOT;
use crate::tuning::controller::{
    ControllerConfig, LevelTables, DEFAULT_LEVEL_STEPS, DEFAULT_POWER_MODES, DEFAULT_SPINDOWN_TIMEOUTS,
};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hwtune/hwtune.toml";

/// Plugin names the daemon knows how to build.
pub const KNOWN_PLUGINS: &[&str] = &["disk", "sysfs", "usb", "vm"];

// ---------------------------------------------------------------------------
// DaemonConfig
// ---------------------------------------------------------------------------

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Global switch for adaptive tuning.
    pub dynamic_tuning: bool,
    /// Tuning tick period in seconds.
    pub update_interval_secs: u64,
    /// Consecutive command failures before a category freezes.
    pub error_threshold: u32,
    pub sysfs_root: PathBuf,
    pub dev_root: PathBuf,
    pub proc_root: PathBuf,
    /// Power-management tool.
    pub hdparm: String,
    /// Fallback rescan period; node events under `dev_root` rescan at once.
    pub hotplug_rescan_millis: u64,
    pub hotplug_channel_capacity: usize,
    /// Idle ticks in both directions before a disk goes one level deeper.
    pub level_steps: u32,
    /// APM level per power level, most active first.
    pub power_levels: Vec<u32>,
    /// Spindown timeout per power level, parallel to `power_levels`.
    pub spindown_levels: Vec<u32>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            dynamic_tuning: true,
            update_interval_secs: 10,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            dev_root: PathBuf::from(DEFAULT_DEV_ROOT),
            proc_root: PathBuf::from("/proc"),
            hdparm: DEFAULT_HDPARM.to_string(),
            hotplug_rescan_millis: DEFAULT_RESCAN_PERIOD.as_millis() as u64,
            hotplug_channel_capacity: 64,
            level_steps: DEFAULT_LEVEL_STEPS,
            power_levels: DEFAULT_POWER_MODES.to_vec(),
            spindown_levels: DEFAULT_SPINDOWN_TIMEOUTS.to_vec(),
        }
    }
}

impl DaemonConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn hotplug_rescan(&self) -> Duration {
        Duration::from_millis(self.hotplug_rescan_millis)
    }

    /// Controller constants for the disk plugin.
    pub fn controller(&self) -> Result<ControllerConfig> {
        Ok(ControllerConfig {
            tables: LevelTables::new(self.power_levels.clone(), self.spindown_levels.clone())?,
            level_steps: self.level_steps,
            ..ControllerConfig::default()
        })
    }
}

// ---------------------------------------------------------------------------
// InstanceEntry
// ---------------------------------------------------------------------------

/// One `[[instance]]` table as written in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceEntry {
    pub name: String,
    /// Defaults to the instance name.
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub options: BTreeMap<String, toml::Value>,
}

fn default_enabled() -> bool {
    true
}

impl InstanceEntry {
    pub fn plugin(&self) -> &str {
        self.plugin.as_deref().unwrap_or(&self.name)
    }

    /// Convert to the plugin-facing form, normalizing option values.
    pub fn to_instance_config(&self) -> Result<InstanceConfig> {
        let mut options = Options::new();
        for (key, value) in &self.options {
            let text = option_text(value).ok_or_else(|| {
                TuneError::Config(format!(
                    "instance '{}': option '{key}' must be a string, number or boolean",
                    self.name
                ))
            })?;
            options.insert(key.clone(), text);
        }
        Ok(InstanceConfig {
            name: self.name.clone(),
            plugin: self.plugin().to_string(),
            devices: self.devices.clone(),
            options,
        })
    }
}

fn option_text(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default, rename = "instance")]
    pub instances: Vec<InstanceEntry>,
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| TuneError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.daemon.update_interval_secs == 0 {
            return Err(TuneError::Config("update_interval_secs must be positive".into()));
        }
        if self.daemon.error_threshold == 0 {
            return Err(TuneError::Config("error_threshold must be positive".into()));
        }
        if self.daemon.hotplug_channel_capacity == 0 {
            return Err(TuneError::Config("hotplug_channel_capacity must be positive".into()));
        }
        if self.daemon.level_steps == 0 {
            return Err(TuneError::Config("level_steps must be positive".into()));
        }
        self.daemon.controller()?;
        let mut seen = BTreeSet::new();
        for entry in &self.instances {
            if !seen.insert(entry.name.as_str()) {
                return Err(TuneError::Config(format!("duplicate instance name '{}'", entry.name)));
            }
            if !KNOWN_PLUGINS.contains(&entry.plugin()) {
                return Err(TuneError::UnknownPlugin(entry.plugin().to_string()));
            }
        }
        Ok(())
    }

    /// Enabled instances grouped by plugin, each group in file order.
    pub fn instances_by_plugin(&self) -> Result<BTreeMap<String, Vec<InstanceConfig>>> {
        let mut groups: BTreeMap<String, Vec<InstanceConfig>> = BTreeMap::new();
        for entry in self.instances.iter().filter(|e| e.enabled) {
            let config = entry.to_instance_config()?;
            groups.entry(config.plugin.clone()).or_default().push(config);
        }
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    const SAMPLE: &str = r#"
[daemon]
update_interval_secs = 5
error_threshold = 4
sysfs_root = "/tmp/sys"

[[instance]]
name = "disk"
devices = ["sd*", "!sdz"]
[instance.options]
dynamic = true
readahead = 4096
readahead_multiply = 1.5
elevator = "mq-deadline"

[[instance]]
name = "thp"
plugin = "vm"
[instance.options]
transparent_hugepages = "never"

[[instance]]
name = "off"
plugin = "usb"
enabled = false
"#;

    #[test]
    fn test_defaults() {
        let c = Config::from_toml("").unwrap();
        assert!(c.daemon.dynamic_tuning);
        assert_eq!(c.daemon.update_interval(), Duration::from_secs(10));
        assert_eq!(c.daemon.error_threshold, 3);
        assert_eq!(c.daemon.sysfs_root, PathBuf::from("/sys"));
        assert_eq!(c.daemon.hdparm, "hdparm");
        assert!(c.instances.is_empty());
    }

    #[test]
    fn test_parses_instances_and_normalizes_options() {
        let c = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(c.daemon.update_interval_secs, 5);
        assert_eq!(c.daemon.error_threshold, 4);
        assert!(c.daemon.dynamic_tuning, "unset fields keep their defaults");

        let groups = c.instances_by_plugin().unwrap();
        assert!(!groups.contains_key("usb"), "disabled instances are skipped");
        let disk = &groups["disk"][0];
        assert_eq!(disk.plugin, "disk");
        assert_eq!(disk.devices, vec!["sd*", "!sdz"]);
        assert_eq!(disk.options["dynamic"], "true");
        assert_eq!(disk.options["readahead"], "4096");
        assert_eq!(disk.options["readahead_multiply"], "1.5");
        assert_eq!(groups["vm"][0].name, "thp");
    }

    #[rstest]
    #[case("[daemon]\nupdate_interval_secs = 0\n")]
    #[case("[daemon]\nerror_threshold = 0\n")]
    #[case("[daemon]\nlevel_steps = 0\n")]
    #[case("[[instance]]\nname = \"a\"\nplugin = \"disk\"\n[[instance]]\nname = \"a\"\nplugin = \"vm\"\n")]
    fn test_validation_rejects(#[case] text: &str) {
        assert!(matches!(Config::from_toml(text), Err(TuneError::Config(_))));
    }

    #[test]
    fn test_unknown_plugin_rejected() {
        let err = Config::from_toml("[[instance]]\nname = \"cpu\"\n").unwrap_err();
        assert!(matches!(err, TuneError::UnknownPlugin(p) if p == "cpu"));
    }

    #[test]
    fn test_level_tables_must_be_parallel() {
        let err = Config::from_toml("[daemon]\npower_levels = [254, 128]\nspindown_levels = [0]\n").unwrap_err();
        assert!(matches!(err, TuneError::InvalidLevels(_)));

        let c = Config::from_toml("[daemon]\npower_levels = [254, 128]\nspindown_levels = [0, 120]\nlevel_steps = 2\n")
            .unwrap();
        let ctl = c.daemon.controller().unwrap();
        assert_eq!(ctl.tables.levels(), 2);
        assert_eq!(ctl.tables.power_mode(1), 128);
        assert_eq!(ctl.level_steps, 2);
    }

    #[test]
    fn test_unknown_field_is_a_parse_error() {
        let err = Config::from_toml("[daemon]\nbogus = 1\n").unwrap_err();
        assert!(matches!(err, TuneError::ConfigParse(_)));
    }

    #[test]
    fn test_table_option_value_rejected() {
        let c = Config::from_toml("[[instance]]\nname = \"sysfs\"\n[instance.options]\nx = { a = 1 }\n").unwrap();
        assert!(matches!(c.instances_by_plugin(), Err(TuneError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();
        let c = Config::load(f.path()).unwrap();
        assert_eq!(c.instances.len(), 3);

        let missing = Config::load(Path::new("/nonexistent/hwtune.toml")).unwrap_err();
        assert!(matches!(missing, TuneError::ConfigIo { .. }));
    }
}
