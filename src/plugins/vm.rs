//! Transparent-huge-page plugin.
//!
//! `transparent_hugepages` (alias `transparent_hugepage`) selects `always`,
//! `never` or `madvise`; `transparent_hugepage.defrag` selects the defrag
//! policy. A THP mode given on the kernel command line wins over the option.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use super::{verify_value, InstanceConfig, OptionSpec, Options, OriginalValues, Plugin, StaticTunable, Tunable};
use crate::error::Result;
use crate::sysfs::{active_option, Sysfs};

pub const DEFAULT_PROC_ROOT: &str = "/proc";

const THP_MODES: &[&str] = &["always", "never", "madvise"];

const VM_OPTIONS: OptionSpec = &[
    ("transparent_hugepages", None),
    ("transparent_hugepage", None),
    ("transparent_hugepage.defrag", None),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VmOption {
    Enabled,
    Defrag,
}

impl VmOption {
    fn for_key(key: &str) -> Option<Self> {
        match key {
            "transparent_hugepages" | "transparent_hugepage" => Some(VmOption::Enabled),
            "transparent_hugepage.defrag" => Some(VmOption::Defrag),
            _ => None,
        }
    }

    fn file(self) -> &'static str {
        match self {
            VmOption::Enabled => "enabled",
            VmOption::Defrag => "defrag",
        }
    }
}

/// Factory for vm instances.
#[derive(Debug, Clone)]
pub struct VmPlugin {
    sysfs: Sysfs,
    proc_root: PathBuf,
}

impl Default for VmPlugin {
    fn default() -> Self {
        Self::new(Sysfs::default(), DEFAULT_PROC_ROOT)
    }
}

impl VmPlugin {
    pub fn new(sysfs: Sysfs, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs,
            proc_root: proc_root.into(),
        }
    }
}

impl Plugin for VmPlugin {
    fn name(&self) -> &'static str {
        "vm"
    }

    fn config_options(&self) -> OptionSpec {
        VM_OPTIONS
    }

    fn instance_init(&self, config: &InstanceConfig) -> Result<Arc<dyn Tunable>> {
        Ok(Arc::new(VmInstance {
            name: config.name.clone(),
            sysfs: self.sysfs.clone(),
            proc_root: self.proc_root.clone(),
            options: config.options.clone(),
            originals: OriginalValues::new(),
        }))
    }
}

/// One configured vm instance.
pub struct VmInstance {
    name: String,
    sysfs: Sysfs,
    proc_root: PathBuf,
    options: Options,
    originals: OriginalValues,
}

impl VmInstance {
    fn thp_dir(&self) -> PathBuf {
        let path = self.sysfs.path("kernel/mm/transparent_hugepage");
        if path.exists() {
            path
        } else {
            self.sysfs.path("kernel/mm/redhat_transparent_hugepage")
        }
    }

    fn cmdline_sets_thp(&self) -> bool {
        fs::read_to_string(self.proc_root.join("cmdline"))
            .map(|c| c.contains("transparent_hugepage="))
            .unwrap_or(false)
    }

    fn settings(&self) -> Vec<(&str, VmOption, &str)> {
        self.options
            .iter()
            .filter_map(|(k, v)| VmOption::for_key(k).map(|o| (k.as_str(), o, v.as_str())))
            .collect()
    }

    fn set(&self, key: &str, option: VmOption, value: &str, sim: bool) -> Option<String> {
        if option == VmOption::Enabled {
            if !THP_MODES.contains(&value) {
                if !sim {
                    warn!(instance = %self.name, option = key, value, "incorrect value");
                }
                return None;
            }
            if self.cmdline_sets_thp() {
                if !sim {
                    info!(
                        instance = %self.name,
                        "transparent_hugepage is already set in kernel boot cmdline, ignoring value"
                    );
                }
                return None;
            }
        }
        let file = self.thp_dir().join(option.file());
        if !file.exists() {
            if !sim {
                warn!(instance = %self.name, option = key, "option is not supported on current hardware");
            }
            return None;
        }
        if !sim {
            self.sysfs.write(&file, value);
        }
        Some(value.to_string())
    }

    fn get(&self, option: VmOption) -> Option<String> {
        let file = self.thp_dir().join(option.file());
        if !file.exists() {
            return None;
        }
        self.sysfs
            .read(&file, false)
            .map(|content| active_option(&content, true))
    }
}

impl Tunable for VmInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_static(&self) -> Option<&dyn StaticTunable> {
        Some(self)
    }
}

impl StaticTunable for VmInstance {
    fn instance_apply_static(&self) {
        for (key, option, value) in self.settings() {
            let original = self.get(option);
            if self.set(key, option, value, false).is_some() {
                if let Some(original) = original {
                    self.originals.record(option.file(), None, original);
                }
            }
        }
    }

    fn instance_verify_static(&self, ignore_missing: bool, _devices: Option<&[String]>) -> bool {
        let mut ok = true;
        for (key, option, value) in self.settings() {
            let expected = self.set(key, option, value, true);
            let current = self.get(option);
            ok &= verify_value(key, None, expected.as_deref(), current.as_deref(), ignore_missing);
        }
        ok
    }

    fn instance_unapply_static(&self) {
        for (file, _, original) in self.originals.drain() {
            self.sysfs.write(&self.thp_dir().join(file), &original);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(dir: &str, cmdline: &str) -> (TempDir, VmPlugin) {
        let tmp = TempDir::new().unwrap();
        let thp = tmp.path().join("sys/kernel/mm").join(dir);
        fs::create_dir_all(&thp).unwrap();
        fs::write(thp.join("enabled"), "[always] madvise never\n").unwrap();
        fs::write(thp.join("defrag"), "always defer [madvise] never\n").unwrap();
        fs::create_dir_all(tmp.path().join("proc")).unwrap();
        fs::write(tmp.path().join("proc/cmdline"), cmdline).unwrap();
        let plugin = VmPlugin::new(Sysfs::new(tmp.path().join("sys")), tmp.path().join("proc"));
        (tmp, plugin)
    }

    fn read(tmp: &TempDir, dir: &str, file: &str) -> String {
        fs::read_to_string(tmp.path().join("sys/kernel/mm").join(dir).join(file))
            .unwrap()
            .trim()
            .to_string()
    }

    #[test]
    fn test_thp_apply_verify_unapply() {
        let (tmp, plugin) = setup("transparent_hugepage", "ro quiet\n");
        let inst = plugin
            .instance_init(
                &InstanceConfig::new("vm", "vm")
                    .with_option("transparent_hugepages", "never")
                    .with_option("transparent_hugepage.defrag", "defer"),
            )
            .unwrap();
        let st = inst.as_static().unwrap();
        assert!(!st.instance_verify_static(false, None));

        st.instance_apply_static();
        assert_eq!(read(&tmp, "transparent_hugepage", "enabled"), "never");
        assert_eq!(read(&tmp, "transparent_hugepage", "defrag"), "defer");
        assert!(st.instance_verify_static(false, None));

        st.instance_unapply_static();
        assert_eq!(read(&tmp, "transparent_hugepage", "enabled"), "always");
        assert_eq!(read(&tmp, "transparent_hugepage", "defrag"), "madvise");
    }

    #[test]
    fn test_alias_and_redhat_fallback() {
        let (tmp, plugin) = setup("redhat_transparent_hugepage", "ro\n");
        let inst = plugin
            .instance_init(&InstanceConfig::new("vm", "vm").with_option("transparent_hugepage", "madvise"))
            .unwrap();
        inst.as_static().unwrap().instance_apply_static();
        assert_eq!(read(&tmp, "redhat_transparent_hugepage", "enabled"), "madvise");
    }

    #[test]
    fn test_kernel_cmdline_wins() {
        let (tmp, plugin) = setup("transparent_hugepage", "ro transparent_hugepage=never\n");
        let inst = plugin
            .instance_init(&InstanceConfig::new("vm", "vm").with_option("transparent_hugepages", "madvise"))
            .unwrap();
        inst.as_static().unwrap().instance_apply_static();
        assert_eq!(read(&tmp, "transparent_hugepage", "enabled"), "[always] madvise never");
    }

    #[test]
    fn test_invalid_mode_is_ignored() {
        let (tmp, plugin) = setup("transparent_hugepage", "ro\n");
        let inst = plugin
            .instance_init(&InstanceConfig::new("vm", "vm").with_option("transparent_hugepages", "sometimes"))
            .unwrap();
        let st = inst.as_static().unwrap();
        st.instance_apply_static();
        assert_eq!(read(&tmp, "transparent_hugepage", "enabled"), "[always] madvise never");
        assert!(st.instance_verify_static(false, None), "nothing to verify for a rejected value");
    }
}
