//! # Stage: Hotplug Source
//!
//! ## Responsibility
//! Turns device arrival and departure into typed [`HotplugEvent`]s delivered
//! over a bounded `tokio::sync::mpsc` channel, one stream per subsystem.
//!
//! [`InotifySource`] watches the device-node directory and diffs the
//! inventory listing against the devices it last saw whenever a node is
//! created or deleted. [`RescanSource`] does the same diff on a timer and
//! serves as the fallback when no watch can be set up.
//!
//! ## Guarantees
//! - Removals carry the last-known [`Device`], so consumers can purge a device
//!   that no longer exists (and would no longer pass any predicate)
//! - `unsubscribe` is idempotent; dropping the subscription also unsubscribes
//! - After [`HotplugSubscription::join`] returns, no further event is sent
//!
//! ## NOT Responsible For
//! - Admission (the dispatcher re-evaluates the predicate on every add)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use inotify::{EventStream, Inotify, WatchMask};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use super::inventory::DeviceInventory;
use super::Device;

// ---------------------------------------------------------------------------
// HotplugEvent
// ---------------------------------------------------------------------------

/// A membership change in one subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    Add(Device),
    Remove(Device),
}

impl HotplugEvent {
    pub fn device(&self) -> &Device {
        match self {
            HotplugEvent::Add(d) | HotplugEvent::Remove(d) => d,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            HotplugEvent::Add(_) => "add",
            HotplugEvent::Remove(_) => "remove",
        }
    }
}

// ---------------------------------------------------------------------------
// HotplugSubscription
// ---------------------------------------------------------------------------

/// Handle on a running event source.
#[derive(Debug)]
pub struct HotplugSubscription {
    subsystem: String,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl HotplugSubscription {
    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    /// Ask the source to stop. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        if !*self.stop.borrow() {
            debug!(subsystem = %self.subsystem, "unsubscribing from hotplug events");
        }
        self.stop.send_replace(true);
    }

    pub fn is_active(&self) -> bool {
        !*self.stop.borrow() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Unsubscribe and wait for the source task to exit.
    pub async fn join(mut self) {
        self.unsubscribe();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(subsystem = %self.subsystem, error = %e, "hotplug source task failed");
            }
        }
    }
}

impl Drop for HotplugSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ---------------------------------------------------------------------------
// HotplugSource
// ---------------------------------------------------------------------------

/// Something that can deliver hotplug events for a subsystem.
pub trait HotplugSource: Send + Sync {
    /// Start delivering events for `subsystem` into `tx`. `baseline` is the set
    /// of devices the caller already knows about; only changes relative to it
    /// are reported.
    fn subscribe(
        &self,
        subsystem: &str,
        baseline: Vec<Device>,
        tx: mpsc::Sender<HotplugEvent>,
    ) -> HotplugSubscription;
}

/// Default rescan period.
pub const DEFAULT_RESCAN_PERIOD: Duration = Duration::from_millis(2000);

fn baseline_map(baseline: Vec<Device>) -> BTreeMap<String, Device> {
    baseline.into_iter().map(|d| (d.name.clone(), d)).collect()
}

// ---------------------------------------------------------------------------
// RescanSource
// ---------------------------------------------------------------------------

/// Polling source that diffs successive inventory listings.
#[derive(Clone)]
pub struct RescanSource {
    inventory: Arc<dyn DeviceInventory>,
    period: Duration,
}

impl RescanSource {
    pub fn new(inventory: Arc<dyn DeviceInventory>, period: Duration) -> Self {
        Self {
            inventory,
            period: period.max(Duration::from_millis(1)),
        }
    }
}

impl std::fmt::Debug for RescanSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RescanSource").field("period", &self.period).finish()
    }
}

impl HotplugSource for RescanSource {
    fn subscribe(
        &self,
        subsystem: &str,
        baseline: Vec<Device>,
        tx: mpsc::Sender<HotplugEvent>,
    ) -> HotplugSubscription {
        let (stop_tx, stop_rx) = watch::channel(false);
        let scanner = Scanner {
            inventory: Arc::clone(&self.inventory),
            subsystem: subsystem.to_string(),
            known: baseline_map(baseline),
            tx,
        };
        let task = tokio::spawn(rescan_loop(scanner, self.period, stop_rx));
        debug!(subsystem, period_ms = self.period.as_millis() as u64, "hotplug rescan started");
        HotplugSubscription {
            subsystem: subsystem.to_string(),
            stop: stop_tx,
            task: Some(task),
        }
    }
}

async fn rescan_loop(mut scanner: Scanner, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; the baseline already covers it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }
        if *stop.borrow() || !scanner.scan(&mut stop).await {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// InotifySource
// ---------------------------------------------------------------------------

/// Event-driven source: device nodes created or deleted under a watched
/// directory (normally `/dev`) trigger an immediate inventory diff.
///
/// A slow rescan still runs alongside, for subsystems whose nodes do not
/// appear directly under the watched directory. If the watch cannot be set
/// up, subscriptions fall back to a plain [`RescanSource`].
#[derive(Clone)]
pub struct InotifySource {
    watch_dir: PathBuf,
    rescan: RescanSource,
}

impl InotifySource {
    pub fn new(inventory: Arc<dyn DeviceInventory>, watch_dir: impl Into<PathBuf>, period: Duration) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            rescan: RescanSource::new(inventory, period),
        }
    }

    pub fn watch_dir(&self) -> &Path {
        &self.watch_dir
    }

    fn events(&self) -> std::io::Result<EventStream<[u8; 1024]>> {
        let inotify = Inotify::init()?;
        inotify
            .watches()
            .add(&self.watch_dir, WatchMask::CREATE | WatchMask::DELETE)?;
        inotify.into_event_stream([0u8; 1024])
    }
}

impl std::fmt::Debug for InotifySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InotifySource")
            .field("watch_dir", &self.watch_dir)
            .field("period", &self.rescan.period)
            .finish()
    }
}

impl HotplugSource for InotifySource {
    fn subscribe(
        &self,
        subsystem: &str,
        baseline: Vec<Device>,
        tx: mpsc::Sender<HotplugEvent>,
    ) -> HotplugSubscription {
        let events = match self.events() {
            Ok(events) => events,
            Err(e) => {
                warn!(
                    subsystem,
                    dir = %self.watch_dir.display(),
                    error = %e,
                    "cannot watch device nodes, falling back to periodic rescan"
                );
                return self.rescan.subscribe(subsystem, baseline, tx);
            }
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        let scanner = Scanner {
            inventory: Arc::clone(&self.rescan.inventory),
            subsystem: subsystem.to_string(),
            known: baseline_map(baseline),
            tx,
        };
        let task = tokio::spawn(inotify_loop(scanner, events, self.rescan.period, stop_rx));
        debug!(subsystem, dir = %self.watch_dir.display(), "hotplug watch started");
        HotplugSubscription {
            subsystem: subsystem.to_string(),
            stop: stop_tx,
            task: Some(task),
        }
    }
}

async fn inotify_loop(
    mut scanner: Scanner,
    mut events: EventStream<[u8; 1024]>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
            event = events.next() => match event {
                Some(Ok(event)) => {
                    debug!(subsystem = %scanner.subsystem, node = ?event.name, mask = ?event.mask, "device node changed");
                }
                Some(Err(e)) => {
                    warn!(subsystem = %scanner.subsystem, error = %e, "device node watch failed");
                    continue;
                }
                None => {
                    warn!(subsystem = %scanner.subsystem, "device node watch closed");
                    break;
                }
            },
        }
        if *stop.borrow() || !scanner.scan(&mut stop).await {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Last-known listing of one subsystem and the channel its changes go to.
struct Scanner {
    inventory: Arc<dyn DeviceInventory>,
    subsystem: String,
    known: BTreeMap<String, Device>,
    tx: mpsc::Sender<HotplugEvent>,
}

impl Scanner {
    /// Re-list the subsystem and send the difference. Returns false once the
    /// source should stop (stop requested or receiver gone).
    async fn scan(&mut self, stop: &mut watch::Receiver<bool>) -> bool {
        let inv = Arc::clone(&self.inventory);
        let sub = self.subsystem.clone();
        let current = match tokio::task::spawn_blocking(move || inv.devices(&sub)).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(subsystem = %self.subsystem, error = %e, "device rescan failed");
                return true;
            }
        };
        let current = baseline_map(current);

        for event in diff(&self.known, &current) {
            debug!(subsystem = %self.subsystem, device = %event.device().name, action = event.action(), "hotplug event");
            tokio::select! {
                _ = stop.changed() => return false,
                sent = self.tx.send(event) => {
                    if sent.is_err() {
                        return false;
                    }
                }
            }
        }
        self.known = current;
        true
    }
}

/// Removals (last-known device) first, then additions, each sorted by name.
pub fn diff(known: &BTreeMap<String, Device>, current: &BTreeMap<String, Device>) -> Vec<HotplugEvent> {
    let removed = known
        .iter()
        .filter(|(name, _)| !current.contains_key(*name))
        .map(|(_, d)| HotplugEvent::Remove(d.clone()));
    let added = current
        .iter()
        .filter(|(name, _)| !known.contains_key(*name))
        .map(|(_, d)| HotplugEvent::Add(d.clone()));
    removed.chain(added).collect()
}
