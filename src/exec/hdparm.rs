//! `hdparm` front-end: capability check, spin-state query, and the breaker-
//! guarded power-mode (`-B`) and spindown (`-S`) commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info};

use super::breaker::{CircuitBreaker, CommandCategory};
use super::command::CommandOutcome;
use crate::tuning::controller::DriveControl;

pub const DEFAULT_HDPARM: &str = "hdparm";
pub const DEFAULT_DEV_ROOT: &str = "/dev";

/// Vendor-specific value reported for spindown, which cannot be queried.
pub const SPINDOWN_UNKNOWN_VALUE: u32 = 253;

/// Result of probing one device for power-management support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApmSupport {
    Supported,
    /// The device (or its driver) does not accept the commands.
    Unsupported,
    /// The tool is missing; nothing is supported.
    ToolMissing,
}

/// Thin wrapper that builds `hdparm` command lines for a device.
#[derive(Debug, Clone)]
pub struct Hdparm {
    breaker: Arc<CircuitBreaker>,
    binary: String,
    dev_root: PathBuf,
}

impl Hdparm {
    pub fn new(breaker: Arc<CircuitBreaker>, binary: impl Into<String>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            breaker,
            binary: binary.into(),
            dev_root: dev_root.into(),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn dev_root(&self) -> &Path {
        &self.dev_root
    }

    fn node(&self, device: &str) -> String {
        self.dev_root.join(device).display().to_string()
    }

    fn argv(&self, flag: String, device: &str) -> Vec<String> {
        vec![self.binary.clone(), flag, self.node(device)]
    }

    /// Check whether `device` accepts power-management commands.
    ///
    /// A missing tool disables every breaker category, so later checks and
    /// commands are skipped without spawning anything.
    pub fn apm_support(&self, device: &str) -> ApmSupport {
        if self.breaker.is_disabled() {
            return ApmSupport::ToolMissing;
        }
        match self.breaker.executor().execute(&self.argv("-C".into(), device)) {
            CommandOutcome::NotFound => {
                self.breaker.disable_all();
                ApmSupport::ToolMissing
            }
            CommandOutcome::Failed { code, message } => {
                info!(device, "device not supported by {}", self.binary);
                debug!(device, code, message = %message, "capability check failed");
                ApmSupport::Unsupported
            }
            CommandOutcome::Success { stdout } if stdout.contains("unknown") => {
                info!(device, "driver for device does not support apm command");
                ApmSupport::Unsupported
            }
            CommandOutcome::Success { .. } => ApmSupport::Supported,
        }
    }

    /// Set the power-mode (APM) level through the breaker. Returns whether the
    /// command ran and succeeded.
    pub fn apply_apm(&self, device: &str, level: u32) -> bool {
        self.breaker
            .execute(CommandCategory::PowerMode, &self.argv(format!("-B{level}"), device))
            .is_some_and(|o| o.is_success())
    }

    /// Set the spindown timeout through the breaker.
    pub fn apply_spindown(&self, device: &str, timeout: u32) -> bool {
        self.breaker
            .execute(CommandCategory::Spindown, &self.argv(format!("-S{timeout}"), device))
            .is_some_and(|o| o.is_success())
    }

    /// Read the current APM level (`APM_level = 128`). A missing tool is
    /// silent; a failed or unparseable query is logged.
    pub fn read_apm(&self, device: &str) -> Option<u32> {
        let level = match self.breaker.executor().execute(&self.argv("-B".into(), device)) {
            CommandOutcome::NotFound => return None,
            CommandOutcome::Failed { .. } => None,
            CommandOutcome::Success { stdout } => parse_apm_level(&stdout),
        };
        if level.is_none() {
            error!(device, "could not get current APM settings");
        }
        level
    }
}

impl DriveControl for Hdparm {
    fn is_frozen(&self, category: CommandCategory) -> bool {
        self.breaker.is_frozen(category)
    }

    fn drive_spinning(&self, device: &str) -> bool {
        if self.breaker.is_disabled() {
            return true;
        }
        let outcome = self.breaker.executor().execute(&self.argv("-C".into(), device));
        if outcome == CommandOutcome::NotFound {
            self.breaker.disable_all();
            return true;
        }
        let out = outcome.stdout();
        !out.contains("standby") && !out.contains("sleeping")
    }

    fn set_spindown(&self, device: &str, timeout: u32) {
        debug!(device, timeout, "changing spindown");
        self.apply_spindown(device, timeout);
    }

    fn set_power_mode(&self, device: &str, level: u32) {
        debug!(device, level, "changing APM level");
        self.apply_apm(device, level);
    }
}

/// Extract the integer following the last `=` that is followed by digits.
pub fn parse_apm_level(output: &str) -> Option<u32> {
    output.rmatch_indices('=').find_map(|(idx, _)| {
        let digits: String = output[idx + 1..]
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::command::ScriptedExecutor;

    fn hdparm() -> (Arc<ScriptedExecutor>, Hdparm) {
        let exec = Arc::new(ScriptedExecutor::new());
        let breaker = Arc::new(CircuitBreaker::new(exec.clone(), 3));
        (exec, Hdparm::new(breaker, "hdparm", "/dev"))
    }

    #[test]
    fn test_parse_apm_level() {
        assert_eq!(parse_apm_level("\n/dev/sda:\n APM_level\t= 128\n"), Some(128));
        assert_eq!(parse_apm_level(" APM_level = 254 (max performance)"), Some(254));
        assert_eq!(parse_apm_level(" APM_level = not supported"), None);
        assert_eq!(parse_apm_level(""), None);
    }

    #[test]
    fn test_apm_support_supported() {
        let (exec, h) = hdparm();
        exec.push(CommandOutcome::success("/dev/sda:\n drive state is:  active/idle\n"));
        assert_eq!(h.apm_support("sda"), ApmSupport::Supported);
        assert_eq!(exec.calls()[0], vec!["hdparm", "-C", "/dev/sda"]);
    }

    #[test]
    fn test_apm_support_unknown_state_is_unsupported() {
        let (exec, h) = hdparm();
        exec.push(CommandOutcome::success(" drive state is:  unknown\n"));
        assert_eq!(h.apm_support("sda"), ApmSupport::Unsupported);
    }

    #[test]
    fn test_apm_support_failure_is_unsupported() {
        let (exec, h) = hdparm();
        exec.push(CommandOutcome::failed(25, "Inappropriate ioctl for device"));
        assert_eq!(h.apm_support("loop0"), ApmSupport::Unsupported);
        assert!(!h.breaker().is_disabled());
    }

    #[test]
    fn test_apm_support_tool_missing_disables_everything() {
        let (exec, h) = hdparm();
        exec.push(CommandOutcome::NotFound);
        assert_eq!(h.apm_support("sda"), ApmSupport::ToolMissing);
        assert!(h.breaker().is_disabled());

        exec.clear_calls();
        assert_eq!(h.apm_support("sdb"), ApmSupport::ToolMissing);
        assert!(exec.calls().is_empty(), "later checks must not spawn");
    }

    #[test]
    fn test_drive_spinning_reads_state() {
        let (exec, h) = hdparm();
        exec.push(CommandOutcome::success(" drive state is:  standby\n"));
        exec.push(CommandOutcome::success(" drive state is:  sleeping\n"));
        exec.push(CommandOutcome::success(" drive state is:  active/idle\n"));
        assert!(!h.drive_spinning("sda"));
        assert!(!h.drive_spinning("sda"));
        assert!(h.drive_spinning("sda"));
    }

    #[test]
    fn test_drive_state_with_missing_tool_disables_breaker() {
        let (exec, h) = hdparm();
        exec.push(CommandOutcome::NotFound);
        assert!(h.drive_spinning("sda"));
        assert!(h.breaker.is_disabled());

        exec.clear_calls();
        assert!(h.drive_spinning("sda"));
        assert!(!h.apply_spindown("sda", 250));
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn test_set_commands_use_attached_flags() {
        let (exec, h) = hdparm();
        assert!(h.apply_apm("sda", 225));
        assert!(h.apply_spindown("sda", 250));
        assert_eq!(exec.calls()[0], vec!["hdparm", "-B225", "/dev/sda"]);
        assert_eq!(exec.calls()[1], vec!["hdparm", "-S250", "/dev/sda"]);
    }

    #[test]
    fn test_read_apm_outcomes() {
        let (exec, h) = hdparm();
        exec.push(CommandOutcome::success(" APM_level\t= 128\n"));
        exec.push(CommandOutcome::failed(1, "x"));
        exec.push(CommandOutcome::NotFound);
        assert_eq!(h.read_apm("sda"), Some(128));
        assert_eq!(h.read_apm("sda"), None);
        assert_eq!(h.read_apm("sda"), None);
    }
}
