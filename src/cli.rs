use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::*;

use crate::config::DEFAULT_CONFIG_PATH;
use crate::daemon::{InstanceDevices, VerifyReport};

#[derive(Parser, Debug)]
#[command(name = "hwtune")]
#[command(version)]
#[command(about = "Adaptive disk power management and hardware tuning daemon")]
pub struct Args {
    /// Configuration file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Apply settings and keep tuning until interrupted (default)
    Run,
    /// Check that the current system state matches the configuration
    Verify {
        /// Treat unreadable values as passing
        #[arg(long)]
        ignore_missing: bool,
    },
    /// List devices assigned to each instance
    Devices {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

impl Args {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

/// Render verification results, one line per instance.
pub fn render_verify(reports: &[VerifyReport]) -> String {
    let mut out = String::new();
    for r in reports {
        let verdict = if r.passed { "PASS".green().bold() } else { "FAIL".red().bold() };
        out.push_str(&format!("{verdict} {}\n", r.instance));
    }
    out
}

/// Render the device table.
pub fn render_devices(devices: &[InstanceDevices]) -> String {
    let mut out = String::new();
    for d in devices {
        let list = if d.devices.is_empty() {
            "-".dimmed().to_string()
        } else {
            d.devices.join(", ")
        };
        out.push_str(&format!("{} ({}): {list}\n", d.instance.bold(), d.plugin));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default_is_run() {
        let args = Args::parse_from(["hwtune"]);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(args.command(), Command::Run);
        assert!(args.log_level.is_none());
    }

    #[test]
    fn test_args_verify_flags() {
        let args = Args::parse_from(["hwtune", "-c", "/tmp/x.toml", "verify", "--ignore-missing"]);
        assert_eq!(args.config, PathBuf::from("/tmp/x.toml"));
        assert_eq!(args.command(), Command::Verify { ignore_missing: true });
    }

    #[test]
    fn test_args_devices_json() {
        let args = Args::parse_from(["hwtune", "--log-level", "debug", "devices", "--json"]);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(args.command(), Command::Devices { json: true });
    }

    #[test]
    fn test_render_verify() {
        colored::control::set_override(false);
        let out = render_verify(&[
            VerifyReport { instance: "disk".into(), passed: true },
            VerifyReport { instance: "vm".into(), passed: false },
        ]);
        assert_eq!(out, "PASS disk\nFAIL vm\n");
    }

    #[test]
    fn test_render_devices_empty_list() {
        colored::control::set_override(false);
        let out = render_devices(&[InstanceDevices {
            instance: "usb".into(),
            plugin: "usb".into(),
            devices: vec![],
        }]);
        assert_eq!(out, "usb (usb): -\n");
    }
}
