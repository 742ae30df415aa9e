//! # Daemon
//!
//! Composition root and runtime loop.
//!
//! ```text
//! InotifySource ─► mpsc ──► dispatcher ──► PluginDriver ──► DeviceTunable
//!                                                │
//! interval ──► tick loop ──► DynamicTunable ─────┴──► Hdparm ──► CircuitBreaker ──► executor
//! ```
//!
//! ## What It Does
//!
//! 1. Builds one executor, one breaker per disk plugin, the sysfs handle and
//!    the device inventory, and injects them into the plugins.
//! 2. Initializes every configured instance and hands out devices.
//! 3. [`start`](Daemon::start): applies static settings, subscribes to hotplug
//!    events (one dispatcher per subsystem) and starts one tick loop per
//!    dynamic instance.
//! 4. [`stop`](Daemon::stop): stops the event sources, drains the
//!    dispatchers, lets in-flight ticks finish, then unapplies dynamic and
//!    static settings and releases instance resources, in that order.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::device::hotplug::{HotplugEvent, HotplugSource, HotplugSubscription, InotifySource};
use crate::device::inventory::{DeviceInventory, SysfsInventory};
use crate::device::Device;
use crate::error::{Result, TuneError};
use crate::exec::breaker::CircuitBreaker;
use crate::exec::command::{CommandExecutor, SystemExecutor};
use crate::exec::hdparm::Hdparm;
use crate::plugins::{
    DiskPlugin, DeviceJob, Plugin, PluginDriver, SysfsPlugin, Tunable, UsbPlugin, VmPlugin,
};
use crate::sysfs::Sysfs;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Devices assigned to one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceDevices {
    pub instance: String,
    pub plugin: String,
    pub devices: Vec<String>,
}

/// Verification verdict for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub instance: String,
    pub passed: bool,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

struct Running {
    shutdown: watch::Sender<bool>,
    subscriptions: Vec<HotplugSubscription>,
    dispatchers: Vec<JoinHandle<()>>,
    tickers: Vec<JoinHandle<()>>,
}

/// The assembled tuning engine.
pub struct Daemon {
    config: Config,
    source: Arc<dyn HotplugSource>,
    drivers: Arc<Vec<Arc<PluginDriver>>>,
    /// Subsystem listing taken at init, the baseline for hotplug diffs.
    baselines: BTreeMap<&'static str, Vec<Device>>,
    running: Option<Running>,
}

impl Daemon {
    /// Compose against the real system: spawned commands and the sysfs tree.
    pub fn new(config: Config) -> Result<Self> {
        let inventory: Arc<dyn DeviceInventory> =
            Arc::new(SysfsInventory::new(Sysfs::new(&config.daemon.sysfs_root)));
        Self::with_services(config, Arc::new(SystemExecutor), inventory)
    }

    /// Compose with injected command execution and device inventory. Hotplug
    /// events come from rescanning the same inventory whenever a node under
    /// `dev_root` appears or vanishes, and on the rescan period.
    pub fn with_services(
        config: Config,
        executor: Arc<dyn CommandExecutor>,
        inventory: Arc<dyn DeviceInventory>,
    ) -> Result<Self> {
        config.validate()?;
        let source: Arc<dyn HotplugSource> = Arc::new(InotifySource::new(
            Arc::clone(&inventory),
            &config.daemon.dev_root,
            config.daemon.hotplug_rescan(),
        ));
        let sysfs = Sysfs::new(&config.daemon.sysfs_root);

        let mut drivers = Vec::new();
        for (plugin_name, instances) in config.instances_by_plugin()? {
            let plugin = build_plugin(&plugin_name, &config, &sysfs, &executor)?;
            drivers.push(Arc::new(PluginDriver::new(plugin, &instances)?));
        }

        let mut baselines = BTreeMap::new();
        for driver in &drivers {
            if let Some(subsystem) = driver.subsystem() {
                let listing = baselines
                    .entry(subsystem)
                    .or_insert_with(|| inventory.devices(subsystem));
                let admitted = driver.init_devices(listing);
                debug!(
                    plugin = driver.plugin().name(),
                    subsystem,
                    admitted = admitted.len(),
                    "devices enumerated"
                );
            }
        }

        Ok(Self {
            config,
            source,
            drivers: Arc::new(drivers),
            baselines,
            running: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn tunables(&self) -> Vec<Arc<dyn Tunable>> {
        self.drivers
            .iter()
            .flat_map(|d| d.tunables().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Assigned devices per instance.
    pub fn devices(&self) -> Vec<InstanceDevices> {
        let mut out = Vec::new();
        for driver in self.drivers.iter() {
            for (instance, devices) in driver.assignments() {
                out.push(InstanceDevices {
                    instance,
                    plugin: driver.plugin().name().to_string(),
                    devices,
                });
            }
        }
        out
    }

    /// Verify every instance's static settings without applying anything.
    pub async fn verify(&self, ignore_missing: bool) -> Vec<VerifyReport> {
        let drivers = Arc::clone(&self.drivers);
        let result = tokio::task::spawn_blocking(move || {
            drivers
                .iter()
                .flat_map(|d| d.tunables().cloned().collect::<Vec<_>>())
                .filter_map(|t| {
                    let passed = t.as_static()?.instance_verify_static(ignore_missing, None);
                    Some(VerifyReport {
                        instance: t.name().to_string(),
                        passed,
                    })
                })
                .collect::<Vec<_>>()
        })
        .await;
        result.unwrap_or_else(|e| {
            warn!(error = %e, "verification task failed");
            Vec::new()
        })
    }

    /// Apply static settings and start hotplug handling and tuning ticks.
    pub async fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        let drivers = Arc::clone(&self.drivers);
        let applied = tokio::task::spawn_blocking(move || {
            for tunable in drivers.iter().flat_map(|d| d.tunables().cloned().collect::<Vec<_>>()) {
                if let Some(st) = tunable.as_static() {
                    info!(instance = %tunable.name(), "applying static tuning");
                    st.instance_apply_static();
                }
            }
        })
        .await;
        if let Err(e) = applied {
            warn!(error = %e, "static tuning task failed");
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut subscriptions = Vec::new();
        let mut dispatchers = Vec::new();
        for (&subsystem, baseline) in &self.baselines {
            let (tx, rx) = mpsc::channel(self.config.daemon.hotplug_channel_capacity);
            subscriptions.push(self.source.subscribe(subsystem, baseline.clone(), tx));
            let interested: Vec<Arc<PluginDriver>> = self
                .drivers
                .iter()
                .filter(|d| d.subsystem() == Some(subsystem))
                .cloned()
                .collect();
            dispatchers.push(tokio::spawn(dispatch_loop(subsystem, rx, interested)));
        }

        let period = self.config.daemon.update_interval();
        let tickers = self
            .tunables()
            .into_iter()
            .filter(|t| t.has_dynamic())
            .map(|t| tokio::spawn(tick_loop(t, period, shutdown_rx.clone())))
            .collect();

        info!(
            instances = self.tunables().len(),
            subsystems = self.baselines.len(),
            "tuning started"
        );
        self.running = Some(Running {
            shutdown,
            subscriptions,
            dispatchers,
            tickers,
        });
    }

    /// Tear everything down. Safe to call when not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        for sub in running.subscriptions {
            sub.join().await;
        }
        for dispatcher in running.dispatchers {
            if let Err(e) = dispatcher.await {
                warn!(error = %e, "hotplug dispatcher failed");
            }
        }
        running.shutdown.send_replace(true);
        for ticker in running.tickers {
            if let Err(e) = ticker.await {
                warn!(error = %e, "tick loop failed");
            }
        }

        let drivers = Arc::clone(&self.drivers);
        let released = tokio::task::spawn_blocking(move || {
            for tunable in drivers.iter().flat_map(|d| d.tunables().cloned().collect::<Vec<_>>()) {
                release(tunable.as_ref());
            }
        })
        .await;
        if let Err(e) = released {
            warn!(error = %e, "teardown task failed");
        }
        info!("tuning stopped");
    }

    /// Start, wait for `signal`, then stop.
    pub async fn run_until<F>(&mut self, signal: F)
    where
        F: Future<Output = ()>,
    {
        self.start().await;
        signal.await;
        info!("shutdown requested");
        self.stop().await;
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("drivers", &self.drivers.len())
            .field("running", &self.running.is_some())
            .finish()
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            for sub in &running.subscriptions {
                sub.unsubscribe();
            }
            running.shutdown.send_replace(true);
        }
    }
}

fn build_plugin(
    name: &str,
    config: &Config,
    sysfs: &Sysfs,
    executor: &Arc<dyn CommandExecutor>,
) -> Result<Arc<dyn Plugin>> {
    let daemon = &config.daemon;
    let plugin: Arc<dyn Plugin> = match name {
        "disk" => {
            let breaker = Arc::new(CircuitBreaker::new(Arc::clone(executor), daemon.error_threshold));
            let hdparm = Hdparm::new(breaker, daemon.hdparm.clone(), &daemon.dev_root);
            Arc::new(DiskPlugin::with_controller(
                sysfs.clone(),
                hdparm,
                daemon.dynamic_tuning,
                daemon.controller()?,
            ))
        }
        "sysfs" => Arc::new(SysfsPlugin::new(sysfs.clone())),
        "usb" => Arc::new(UsbPlugin::new(sysfs.clone())),
        "vm" => Arc::new(VmPlugin::new(sysfs.clone(), &daemon.proc_root)),
        other => return Err(TuneError::UnknownPlugin(other.to_string())),
    };
    Ok(plugin)
}

/// Unapply dynamic state per device, then static settings, then cleanup.
fn release(tunable: &dyn Tunable) {
    if let Some(dynamic) = tunable.as_dynamic() {
        let devices = tunable
            .as_devices()
            .map(|d| d.assigned_devices())
            .unwrap_or_default();
        for device in devices {
            dynamic.instance_unapply_dynamic(&device);
        }
    }
    if let Some(st) = tunable.as_static() {
        info!(instance = %tunable.name(), "restoring static tuning");
        st.instance_unapply_static();
    }
    tunable.instance_cleanup();
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

async fn dispatch_loop(
    subsystem: &'static str,
    mut rx: mpsc::Receiver<HotplugEvent>,
    drivers: Vec<Arc<PluginDriver>>,
) {
    let mut jobs: Vec<JoinHandle<()>> = Vec::new();
    while let Some(event) = rx.recv().await {
        debug!(subsystem, device = %event.device().name, action = event.action(), "dispatching hotplug event");
        for driver in &drivers {
            for job in driver.handle_event(&event) {
                jobs.push(spawn_job(job));
            }
        }
        jobs.retain(|j| !j.is_finished());
    }
    for job in jobs {
        if let Err(e) = job.await {
            warn!(subsystem, error = %e, "device tuning job failed");
        }
    }
    debug!(subsystem, "hotplug dispatcher stopped");
}

fn spawn_job(job: DeviceJob) -> JoinHandle<()> {
    tokio::task::spawn_blocking(job)
}

async fn tick_loop(tunable: Arc<dyn Tunable>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        if *shutdown.borrow() {
            break;
        }
        run_tick(&tunable).await;
    }
    debug!(instance = %tunable.name(), "tick loop stopped");
}

/// One tuning tick: refresh the monitor, then update every device
/// concurrently on the blocking pool.
pub async fn run_tick(tunable: &Arc<dyn Tunable>) {
    let t = Arc::clone(tunable);
    let devices = tokio::task::spawn_blocking(move || {
        let dynamic = t.as_dynamic()?;
        dynamic.begin_tick();
        Some(t.as_devices().map(|d| d.assigned_devices()).unwrap_or_default())
    })
    .await;
    let devices = match devices {
        Ok(Some(devices)) => devices,
        Ok(None) => return,
        Err(e) => {
            warn!(instance = %tunable.name(), error = %e, "tick failed");
            return;
        }
    };

    let mut updates = JoinSet::new();
    for device in devices {
        let t = Arc::clone(tunable);
        updates.spawn_blocking(move || {
            if let Some(dynamic) = t.as_dynamic() {
                dynamic.instance_update_dynamic(&device);
            }
        });
    }
    while let Some(res) = updates.join_next().await {
        if let Err(e) = res {
            warn!(instance = %tunable.name(), error = %e, "device update failed");
        }
    }
}
