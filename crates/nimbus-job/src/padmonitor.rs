//! Pad liveness monitors.
//!
//! A [`PadMonitor`] watches one pad with a one-shot buffer probe that
//! is reinstalled every probe period, and a periodic check that
//! compares the last arrival time against the check interval. The pad
//! is *active* while data keeps arriving; a starved pad goes inactive
//! and, when the monitor was attached with a reconnect callback (the
//! eater case), polls for a reconnect until data flows again.
//!
//! A [`PadMonitorSet`] aggregates the monitors of one component: it
//! reports the set inactive when the first monitor starves and active
//! again only once every monitor recovered. It never reports active on
//! first start; initial liveness is the component's own concern.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use nimbus_pipeline::{Pad, ProbeAction, ProbeId, ProbeKind};

/// How often the one-shot buffer probe is reinstalled.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(5_000);

/// How long a pad may be silent before it is inactive: 2.5 probe
/// periods, so a slow stream gets a couple of chances.
pub const CHECK_INTERVAL: Duration = Duration::from_millis(12_500);

#[derive(Debug, Clone, Copy)]
pub struct MonitorTiming {
    pub probe_interval: Duration,
    pub check_interval: Duration,
}

impl Default for MonitorTiming {
    fn default() -> Self {
        Self {
            probe_interval: PROBE_INTERVAL,
            check_interval: CHECK_INTERVAL,
        }
    }
}

/// Per-monitor activity callback; receives the monitor name.
pub type WatchFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Asks the application to reconnect the starved pad's upstream.
pub type ReconnectFn = Arc<dyn Fn(&str) + Send + Sync>;

enum LastData {
    /// No buffer seen since attach.
    Never,
    /// Silence already reported; nothing new to say until data flows.
    Silent,
    At(Instant),
}

struct MonState {
    last_data: LastData,
    active: bool,
    /// Allows the very first edge to fire even though `active`
    /// already matches.
    first: bool,
    probe: Option<ProbeId>,
    running: bool,
}

struct Shared {
    name: Arc<str>,
    pad: Pad,
    timing: MonitorTiming,
    state: Mutex<MonState>,
    check_now: Notify,
    on_active: WatchFn,
    on_inactive: WatchFn,
    reconnect: Option<ReconnectFn>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn install_probe(self: &Arc<Self>) {
        let mut st = self.state.lock().unwrap();
        if !st.running || st.probe.is_some() {
            return;
        }
        let shared = self.clone();
        let id = self.pad.add_probe(
            ProbeKind::Buffers,
            Arc::new(move |_| {
                shared.data_seen();
                ProbeAction::PassAndRemove
            }),
        );
        st.probe = Some(id);
    }

    /// Probe callback: record the arrival and re-run the check right
    /// away so a starved pad recovers as soon as data is back.
    fn data_seen(&self) {
        {
            let mut st = self.state.lock().unwrap();
            st.last_data = LastData::At(Instant::now());
            st.probe = None;
        }
        self.check_now.notify_one();
    }

    fn check(self: &Arc<Self>) {
        enum Edge {
            None,
            Active,
            Inactive,
        }
        let edge = {
            let mut st = self.state.lock().unwrap();
            if !st.running {
                return;
            }
            match st.last_data {
                LastData::Never => {
                    // A full check period with nothing at all is
                    // silence too.
                    st.last_data = LastData::Silent;
                    Edge::Inactive
                }
                LastData::Silent => Edge::None,
                LastData::At(t) => {
                    let delta = Instant::now() - t;
                    if st.active && delta > self.timing.check_interval {
                        Edge::Inactive
                    } else if !st.active && delta < self.timing.check_interval {
                        Edge::Active
                    } else {
                        Edge::None
                    }
                }
            }
        };
        match edge {
            Edge::Inactive => self.set_inactive(),
            Edge::Active => self.set_active(),
            Edge::None => {}
        }
    }

    fn set_inactive(self: &Arc<Self>) {
        {
            let mut st = self.state.lock().unwrap();
            if !st.active && !st.first {
                return;
            }
            st.active = false;
            st.first = false;
            if self.reconnect.is_some() {
                // A buffer still in flight from the dead connection
                // must not look like recovery.
                st.last_data = LastData::Silent;
            }
        }
        debug!(pad = %self.name, "pad inactive");
        (self.on_inactive)(&self.name);
        if self.reconnect.is_some() {
            self.start_reconnect_poller();
        }
    }

    fn set_active(self: &Arc<Self>) {
        {
            let mut st = self.state.lock().unwrap();
            if st.active && !st.first {
                return;
            }
            st.active = true;
            st.first = false;
        }
        debug!(pad = %self.name, "pad active");
        self.stop_reconnect_poller();
        (self.on_active)(&self.name);
    }

    fn start_reconnect_poller(self: &Arc<Self>) {
        if !self.state.lock().unwrap().running {
            return;
        }
        let mut slot = self.reconnect_task.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let shared = self.clone();
        *slot = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(shared.timing.check_interval);
            loop {
                tick.tick().await;
                let Some(reconnect) = shared.reconnect.as_ref() else {
                    return;
                };
                debug!(pad = %shared.name, "still starved, requesting reconnect");
                reconnect(&shared.name);
            }
        }));
    }

    fn stop_reconnect_poller(&self) {
        if let Some(task) = self.reconnect_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Liveness monitor for one pad.
pub struct PadMonitor {
    shared: Arc<Shared>,
    stop: watch::Sender<bool>,
}

impl PadMonitor {
    pub fn attach(
        pad: &Pad,
        name: &str,
        timing: MonitorTiming,
        on_active: WatchFn,
        on_inactive: WatchFn,
    ) -> Self {
        Self::spawn(pad, name, timing, on_active, on_inactive, None)
    }

    /// An eater's monitor: starving additionally polls `reconnect`
    /// every check interval until data flows again.
    pub fn attach_reconnecting(
        pad: &Pad,
        name: &str,
        timing: MonitorTiming,
        on_active: WatchFn,
        on_inactive: WatchFn,
        reconnect: ReconnectFn,
    ) -> Self {
        Self::spawn(pad, name, timing, on_active, on_inactive, Some(reconnect))
    }

    fn spawn(
        pad: &Pad,
        name: &str,
        timing: MonitorTiming,
        on_active: WatchFn,
        on_inactive: WatchFn,
        reconnect: Option<ReconnectFn>,
    ) -> Self {
        let shared = Arc::new(Shared {
            name: Arc::from(name),
            pad: pad.clone(),
            timing,
            state: Mutex::new(MonState {
                last_data: LastData::Never,
                active: false,
                first: true,
                probe: None,
                running: true,
            }),
            check_now: Notify::new(),
            on_active,
            on_inactive,
            reconnect,
            reconnect_task: Mutex::new(None),
        });
        let (stop, mut stop_rx) = watch::channel(false);

        let driver = shared.clone();
        tokio::spawn(async move {
            // The probe goes in immediately; the first liveness check
            // waits a full interval.
            let mut probe_tick = tokio::time::interval(driver.timing.probe_interval);
            let mut check_tick = tokio::time::interval_at(
                Instant::now() + driver.timing.check_interval,
                driver.timing.check_interval,
            );
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = probe_tick.tick() => driver.install_probe(),
                    _ = check_tick.tick() => driver.check(),
                    _ = driver.check_now.notified() => driver.check(),
                }
            }
            driver.stop_reconnect_poller();
        });

        Self { shared, stop }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_active(&self) -> bool {
        self.shared.state.lock().unwrap().active
    }

    /// Force the inactive path, e.g. when an EOS was seen on the pad.
    pub fn mark_inactive(&self) {
        self.shared.set_inactive();
    }

    pub fn detach(&self) {
        let probe = {
            let mut st = self.shared.state.lock().unwrap();
            st.running = false;
            st.probe.take()
        };
        if let Some(id) = probe {
            self.shared.pad.remove_probe(id);
        }
        self.shared.stop_reconnect_poller();
        let _ = self.stop.send(true);
    }
}

impl Drop for PadMonitor {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Aggregate callback; fires with no argument, the set speaks for the
/// component as a whole.
pub type SetWatchFn = Arc<dyn Fn() + Send + Sync>;

/// Per-monitor change notification `(name, active)`.
pub type MonitorChangeFn = Arc<dyn Fn(&str, bool) + Send + Sync>;

struct SetInner {
    timing: MonitorTiming,
    monitors: Mutex<HashMap<String, PadMonitor>>,
    /// Starts true so the set never reports active on first start.
    was_active: Mutex<bool>,
    on_set_active: SetWatchFn,
    on_set_inactive: SetWatchFn,
    on_monitor_change: MonitorChangeFn,
}

impl SetInner {
    fn monitor_active(self: &Arc<Self>, name: &str) {
        (self.on_monitor_change)(name, true);
        let fire = {
            let monitors = self.monitors.lock().unwrap();
            let all = monitors.values().all(|m| m.is_active());
            let mut was = self.was_active.lock().unwrap();
            if all && !*was {
                *was = true;
                true
            } else {
                false
            }
        };
        if fire {
            (self.on_set_active)();
        }
    }

    fn monitor_inactive(self: &Arc<Self>, name: &str) {
        (self.on_monitor_change)(name, false);
        let fire = {
            let mut was = self.was_active.lock().unwrap();
            if *was {
                *was = false;
                true
            } else {
                false
            }
        };
        if fire {
            (self.on_set_inactive)();
        }
    }
}

/// All pad monitors of one component, aggregated.
#[derive(Clone)]
pub struct PadMonitorSet {
    inner: Arc<SetInner>,
}

impl PadMonitorSet {
    pub fn new(
        timing: MonitorTiming,
        on_set_active: SetWatchFn,
        on_set_inactive: SetWatchFn,
        on_monitor_change: MonitorChangeFn,
    ) -> Self {
        Self {
            inner: Arc::new(SetInner {
                timing,
                monitors: Mutex::new(HashMap::new()),
                was_active: Mutex::new(true),
                on_set_active,
                on_set_inactive,
                on_monitor_change,
            }),
        }
    }

    fn hooks(&self) -> (WatchFn, WatchFn) {
        let active_inner = self.inner.clone();
        let inactive_inner = self.inner.clone();
        (
            Arc::new(move |name: &str| active_inner.monitor_active(name)),
            Arc::new(move |name: &str| inactive_inner.monitor_inactive(name)),
        )
    }

    pub fn attach(&self, pad: &Pad, name: &str) {
        let (on_active, on_inactive) = self.hooks();
        let monitor = PadMonitor::attach(pad, name, self.inner.timing, on_active, on_inactive);
        self.inner
            .monitors
            .lock()
            .unwrap()
            .insert(name.to_string(), monitor);
    }

    pub fn attach_eater(&self, pad: &Pad, name: &str, reconnect: ReconnectFn) {
        let (on_active, on_inactive) = self.hooks();
        let monitor = PadMonitor::attach_reconnecting(
            pad,
            name,
            self.inner.timing,
            on_active,
            on_inactive,
            reconnect,
        );
        self.inner
            .monitors
            .lock()
            .unwrap()
            .insert(name.to_string(), monitor);
    }

    /// Every monitor currently active. True for an empty set.
    pub fn is_active(&self) -> bool {
        self.inner
            .monitors
            .lock()
            .unwrap()
            .values()
            .all(|m| m.is_active())
    }

    pub fn mark_inactive(&self, name: &str) {
        // The monitor fires back into the set; do not hold the map
        // lock across the call.
        let shared = {
            let monitors = self.inner.monitors.lock().unwrap();
            monitors.get(name).map(|m| m.shared.clone())
        };
        if let Some(shared) = shared {
            shared.set_inactive();
        }
    }

    pub fn remove(&self, name: &str) {
        if let Some(monitor) = self.inner.monitors.lock().unwrap().remove(name) {
            monitor.detach();
        }
    }

    pub fn detach_all(&self) {
        for (_, monitor) in self.inner.monitors.lock().unwrap().drain() {
            monitor.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_pipeline::{Buffer, FeedItem};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> MonitorTiming {
        MonitorTiming {
            probe_interval: Duration::from_millis(20),
            check_interval: Duration::from_millis(50),
        }
    }

    fn counting() -> (WatchFn, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            Arc::new(move |_name: &str| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            count,
        )
    }

    fn buffer() -> FeedItem {
        FeedItem::Buffer(Buffer::new(&b"x"[..]))
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test]
    async fn first_silence_reports_inactive_once() {
        let pad = Pad::new("src");
        let (on_active, actives) = counting();
        let (on_inactive, inactives) = counting();
        let monitor = PadMonitor::attach(&pad, "eater:default", fast(), on_active, on_inactive);

        sleep_ms(180).await;
        assert_eq!(inactives.load(Ordering::SeqCst), 1);
        assert_eq!(actives.load(Ordering::SeqCst), 0);
        assert!(!monitor.is_active());
    }

    #[tokio::test]
    async fn buffer_arrival_activates_immediately() {
        let pad = Pad::new("src");
        let (on_active, actives) = counting();
        let (on_inactive, _) = counting();
        let monitor = PadMonitor::attach(&pad, "eater:default", fast(), on_active, on_inactive);

        // Let the probe go in, then push.
        sleep_ms(5).await;
        pad.push(buffer());
        sleep_ms(15).await;
        assert_eq!(actives.load(Ordering::SeqCst), 1);
        assert!(monitor.is_active());
    }

    #[tokio::test]
    async fn starved_pad_goes_inactive_and_recovers() {
        let pad = Pad::new("src");
        let (on_active, actives) = counting();
        let (on_inactive, inactives) = counting();
        let monitor = PadMonitor::attach(&pad, "eater:default", fast(), on_active, on_inactive);

        sleep_ms(5).await;
        pad.push(buffer());
        sleep_ms(15).await;
        assert!(monitor.is_active());

        // Starve past the check interval.
        sleep_ms(150).await;
        assert!(!monitor.is_active());
        assert_eq!(inactives.load(Ordering::SeqCst), 1);

        // Data returns; the reinstalled probe recovers right away.
        sleep_ms(25).await;
        pad.push(buffer());
        sleep_ms(15).await;
        assert!(monitor.is_active());
        assert_eq!(actives.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn starved_eater_polls_for_reconnect_until_data_returns() {
        let pad = Pad::new("src");
        let (on_active, _) = counting();
        let (on_inactive, _) = counting();
        let reconnects = Arc::new(AtomicUsize::new(0));
        let r = reconnects.clone();
        let monitor = PadMonitor::attach_reconnecting(
            &pad,
            "eater:default",
            fast(),
            on_active,
            on_inactive,
            Arc::new(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // First silence starts the poller, which fires immediately and
        // then every check interval.
        sleep_ms(200).await;
        assert!(reconnects.load(Ordering::SeqCst) >= 2);

        sleep_ms(25).await;
        pad.push(buffer());
        sleep_ms(15).await;
        assert!(monitor.is_active());

        // Recovery stops the poller.
        let settled = reconnects.load(Ordering::SeqCst);
        sleep_ms(30).await;
        assert_eq!(reconnects.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn set_reports_inactive_once_and_active_only_after_recovery() {
        let set_actives = Arc::new(AtomicUsize::new(0));
        let set_inactives = Arc::new(AtomicUsize::new(0));
        let a = set_actives.clone();
        let i = set_inactives.clone();
        let set = PadMonitorSet::new(
            fast(),
            Arc::new(move || {
                a.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(move || {
                i.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(|_, _| {}),
        );

        let eater = Pad::new("eater");
        let feeder = Pad::new("feeder");
        set.attach(&eater, "eater:default");
        set.attach(&feeder, "feeder:default");

        sleep_ms(5).await;
        eater.push(buffer());
        feeder.push(buffer());
        sleep_ms(15).await;
        assert!(set.is_active());
        // Never reported on first start.
        assert_eq!(set_actives.load(Ordering::SeqCst), 0);

        // Both starve; the set goes inactive exactly once.
        sleep_ms(150).await;
        assert_eq!(set_inactives.load(Ordering::SeqCst), 1);

        // One pad back is not enough.
        sleep_ms(25).await;
        eater.push(buffer());
        sleep_ms(15).await;
        assert_eq!(set_actives.load(Ordering::SeqCst), 0);

        feeder.push(buffer());
        sleep_ms(15).await;
        assert_eq!(set_actives.load(Ordering::SeqCst), 1);
        assert!(set.is_active());
    }
}
