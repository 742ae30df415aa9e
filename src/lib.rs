//! # hwtune
//!
//! Adaptive hardware tuning engine. Instances of settings plugins apply
//! static kernel and device settings, follow devices as they come and go, and
//! (for disks) adjust power management to the observed load.
//!
//! ## Modules
//!
//! - [`config`]: TOML configuration.
//! - [`daemon`]: composition root, hotplug dispatch and tick loops.
//! - [`device`]: device model, inventory and hotplug sources.
//! - [`exec`]: external command execution and the failure circuit breaker.
//! - [`monitor`]: per-device load sampling.
//! - [`plugins`]: plugin traits, device assignment and the concrete plugins.
//! - [`sysfs`]: guarded attribute reads and writes.
//! - [`tuning`]: the adaptive power-level controller.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod device;
pub mod error;
pub mod exec;
pub mod logging;
pub mod monitor;
pub mod plugins;
pub mod sysfs;
pub mod tuning;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Result, TuneError};
