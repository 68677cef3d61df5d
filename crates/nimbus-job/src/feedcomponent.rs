//! The feed component: one media pipeline, its eaters and feeders,
//! and the mood machinery around them.
//!
//! Everything that touches component state runs on one task, the
//! component loop. Media threads (fd readers, sink writers, pad
//! monitors) hand their findings to the loop as [`JobEvent`]s or bus
//! messages; the loop is the only place moods move and counters
//! update. The bus handler is an explicit dispatch table, one arm per
//! message kind.
//!
//! Mood machine, as seen from the job:
//!
//! - `waking -> happy` once the pipeline plays and every monitored pad
//!   has seen a buffer;
//! - `happy -> hungry` when any monitored pad starves, `hungry ->
//!   happy` when all of them recover;
//! - any error on the bus is `sad`, which sticks until a stop;
//! - `lost` is the manager's verdict, never set here.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use nimbus_core::config::ComponentConfig;
use nimbus_core::{AvatarId, ComponentMessage, Mood};
use nimbus_pipeline::{
    BusMessage, BusSender, ClockSource, DiscontMonitor, ElementMessage, FdSource, FdSink,
    FeedItem, NetClientClock, NetTimeProvider, Pad, Pipeline, PipelineError, PipelineState,
    ProbeAction, ProbeKind, PropertyTable, PropertyValue, StreamEvent,
};
use nimbus_state::{EaterState, FeederState, JobState};

use crate::error::{JobError, JobResult};
use crate::padmonitor::{MonitorTiming, PadMonitorSet};

/// How often feeder client statistics are sampled off the sinks.
pub const STATS_INTERVAL: Duration = Duration::from_millis(5_000);

/// All the periods the runtime runs on; tests shorten them.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeTiming {
    pub monitor: MonitorTiming,
    pub stats_interval: Duration,
}

impl Default for RuntimeTiming {
    fn default() -> Self {
        Self {
            monitor: MonitorTiming::default(),
            stats_interval: STATS_INTERVAL,
        }
    }
}

/// Asks the hosting worker to re-broker an eater connection:
/// `(eater alias, feed id)`.
pub type ReconnectRequestFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Runs after a feed client's fd has been fully released, on the
/// component loop.
pub type CleanupFn = Arc<dyn Fn(RawFd) + Send + Sync>;

enum JobEvent {
    MonitorChanged,
    PadsActive,
    PadsInactive,
    EaterEos(String),
    ReconnectEater(String),
    ClientRemoved { feeder: String, fd: RawFd },
}

struct Eater {
    alias: String,
    feed_id: Mutex<String>,
    source: FdSource,
    discont: DiscontMonitor,
    state: EaterState,
    /// The first new-segment passes; every later one (a reconnect)
    /// is swallowed, the pipeline already has its segment.
    seen_segment: Arc<AtomicBool>,
}

struct ClientEntry {
    client_id: String,
    cleanup: CleanupFn,
}

struct Feeder {
    feed_name: String,
    /// Input pad ahead of the sink; carries the feeder's monitor.
    pad: Pad,
    sink: FdSink,
    state: FeederState,
    clients: Mutex<HashMap<RawFd, ClientEntry>>,
}

struct ClockMaster {
    ip: String,
    port: u16,
    base_time_ns: i64,
    _provider: NetTimeProvider,
}

type CoercedProperties = std::collections::BTreeMap<String, PropertyValue>;

struct ComponentInner {
    avatar_id: AvatarId,
    pipeline: Pipeline,
    job: JobState,
    eaters: HashMap<String, Eater>,
    feeders: HashMap<String, Feeder>,
    monitors: PadMonitorSet,
    events: mpsc::UnboundedSender<JobEvent>,
    reconnect_request: ReconnectRequestFn,
    properties: CoercedProperties,
    clock: Mutex<Option<ClockMaster>>,
    stop: watch::Sender<bool>,
}

/// One feed component, as hosted by a job process. Clones share the
/// component.
#[derive(Clone)]
pub struct FeedComponent {
    inner: Arc<ComponentInner>,
}

impl FeedComponent {
    /// Parse the eater and feed sections, build the pipeline skeleton
    /// and the per-eater and per-feeder state objects, and start the
    /// component loop. The pipeline stays NULL until [`link`].
    ///
    /// `properties` is the property table of the component's element
    /// class; configured strings are coerced against it here so a bad
    /// document fails the setup, not the stream.
    ///
    /// [`link`]: FeedComponent::link
    pub async fn setup(
        avatar_id: AvatarId,
        config: &ComponentConfig,
        properties: &PropertyTable,
        job: JobState,
        reconnect_request: ReconnectRequestFn,
        timing: RuntimeTiming,
    ) -> JobResult<FeedComponent> {
        let coerced = properties.coerce_all(&config.component_type, &config.properties)?;

        let pipeline = Pipeline::new(&avatar_id.to_string());
        let bus_rx = pipeline
            .take_bus_receiver()
            .ok_or_else(|| PipelineError::BadState("bus receiver already taken".to_string()))?;
        let (events, events_rx) = mpsc::unbounded_channel();

        let mut eaters = HashMap::new();
        for (base_alias, feed_ids) in &config.eaters {
            for (i, feed_id) in feed_ids.iter().enumerate() {
                let alias = if i == 0 {
                    base_alias.clone()
                } else {
                    format!("{base_alias}-{}", i + 1)
                };
                let eater_name = format!("eater:{alias}");
                let state = job.ensure_eater(&alias, &eater_name).await?;
                let source = FdSource::new(&eater_name, pipeline.bus_sender());
                let discont =
                    DiscontMonitor::new(&format!("{eater_name}-identity"), pipeline.bus_sender());
                source.pad().link(discont.chain_fn());
                eaters.insert(
                    alias.clone(),
                    Eater {
                        alias,
                        feed_id: Mutex::new(feed_id.clone()),
                        source,
                        discont,
                        state,
                        seen_segment: Arc::new(AtomicBool::new(false)),
                    },
                );
            }
        }

        let mut feeders = HashMap::new();
        for feed_name in &config.feeds {
            let state = job.ensure_feeder(feed_name).await?;
            let sink = FdSink::new(&format!("feeder:{}:{feed_name}", config.name));
            let pad = Pad::new(&format!("feeder:{feed_name}.sink"));
            pad.link(sink.chain_fn());

            let removed_events = events.clone();
            let removed_name = feed_name.clone();
            sink.on_client_removed(Arc::new(move |fd| {
                let _ = removed_events.send(JobEvent::ClientRemoved {
                    feeder: removed_name.clone(),
                    fd,
                });
            }));

            feeders.insert(
                feed_name.clone(),
                Feeder {
                    feed_name: feed_name.clone(),
                    pad,
                    sink,
                    state,
                    clients: Mutex::new(HashMap::new()),
                },
            );
        }

        // Component graph: every eater fans out to every feeder. A
        // specialized component would splice its elements in here.
        let feeder_pads: Vec<Pad> = feeders.values().map(|f| f.pad.clone()).collect();
        for eater in eaters.values() {
            let pads = feeder_pads.clone();
            eater.discont.pad().link(Arc::new(move |item: FeedItem| {
                for pad in &pads {
                    pad.push(item.clone());
                }
            }));
        }

        let active_events = events.clone();
        let inactive_events = events.clone();
        let change_events = events.clone();
        let monitors = PadMonitorSet::new(
            timing.monitor,
            Arc::new(move || {
                let _ = active_events.send(JobEvent::PadsActive);
            }),
            Arc::new(move || {
                let _ = inactive_events.send(JobEvent::PadsInactive);
            }),
            Arc::new(move |_, _| {
                let _ = change_events.send(JobEvent::MonitorChanged);
            }),
        );

        let (stop, stop_rx) = watch::channel(false);
        let inner = Arc::new(ComponentInner {
            avatar_id,
            pipeline,
            job,
            eaters,
            feeders,
            monitors,
            events,
            reconnect_request,
            properties: coerced,
            clock: Mutex::new(None),
            stop,
        });

        tokio::spawn(run_loop(
            inner.clone(),
            bus_rx,
            events_rx,
            stop_rx,
            timing.stats_interval,
        ));

        Ok(FeedComponent { inner })
    }

    pub fn avatar_id(&self) -> &AvatarId {
        &self.inner.avatar_id
    }

    pub fn job(&self) -> &JobState {
        &self.inner.job
    }

    /// Element properties after coercion.
    pub fn properties(&self) -> &CoercedProperties {
        &self.inner.properties
    }

    /// For elements the component splices into its graph.
    pub fn bus_sender(&self) -> BusSender {
        self.inner.pipeline.bus_sender()
    }

    pub fn pipeline_state(&self) -> PipelineState {
        self.inner.pipeline.state()
    }

    pub fn mood(&self) -> Option<Mood> {
        self.inner.job.mood().ok().flatten()
    }

    pub fn eater_state(&self, alias: &str) -> Option<EaterState> {
        self.inner.eaters.get(alias).map(|e| e.state.clone())
    }

    pub fn feeder_state(&self, feed_name: &str) -> Option<FeederState> {
        self.inner.feeders.get(feed_name).map(|f| f.state.clone())
    }

    /// Install the eater probes, attach the pad monitors, and take the
    /// pipeline to PLAYING. Resolves once the PAUSED to PLAYING hop
    /// has happened; the happy mood follows when data arrives.
    pub async fn link(&self) -> JobResult<()> {
        for eater in self.inner.eaters.values() {
            let eos_events = self.inner.events.clone();
            let alias = eater.alias.clone();
            let seen_segment = eater.seen_segment.clone();
            eater.source.pad().add_probe(
                ProbeKind::Events,
                Arc::new(move |item| match item {
                    FeedItem::Event(StreamEvent::Eos) => {
                        // EOS into the graph would end the pipeline
                        // for good; swallow it and report upstairs.
                        let _ = eos_events.send(JobEvent::EaterEos(alias.clone()));
                        ProbeAction::Drop
                    }
                    FeedItem::Event(StreamEvent::NewSegment) => {
                        if seen_segment.swap(true, Ordering::SeqCst) {
                            ProbeAction::Drop
                        } else {
                            ProbeAction::Pass
                        }
                    }
                    _ => ProbeAction::Pass,
                }),
            );

            let reconnect_events = self.inner.events.clone();
            let reconnect_alias = eater.alias.clone();
            self.inner.monitors.attach_eater(
                eater.discont.pad(),
                &format!("eater:{}", eater.alias),
                Arc::new(move |_| {
                    let _ = reconnect_events.send(JobEvent::ReconnectEater(
                        reconnect_alias.clone(),
                    ));
                }),
            );
        }
        for feeder in self.inner.feeders.values() {
            self.inner
                .monitors
                .attach(&feeder.pad, &format!("feeder:{}", feeder.feed_name));
        }

        self.inner.pipeline.set_state(PipelineState::Playing).await?;
        Ok(())
    }

    /// Take ownership of `fd` as the new connection of an eater.
    ///
    /// Past READY the pad is blocked around the swap so nothing is
    /// lost; before that the fd is handed to the source directly.
    pub async fn eat_from_fd(&self, alias: &str, feed_id: &str, fd: OwnedFd) -> JobResult<()> {
        let eater = self
            .inner
            .eaters
            .get(alias)
            .ok_or_else(|| JobError::UnknownEater(alias.to_string()))?;
        let label = fd.as_raw_fd();
        info!(component = %self.inner.avatar_id, alias, %feed_id, fd = label, "eater fd handoff");

        if self.inner.pipeline.past_ready() {
            eater.source.pad().block();
            eater.source.attach_fd(fd)?;
            eater.discont.reset();
            eater.source.pad().unblock();
        } else {
            eater.source.attach_fd(fd)?;
        }

        *eater.feed_id.lock().unwrap() = feed_id.to_string();
        eater.state.connected(label as i64, feed_id, None).await?;
        Ok(())
    }

    /// Add a feed client fd to a feeder's sink. `cleanup` runs on the
    /// component loop once the fd is fully released.
    pub async fn feed_to_fd(
        &self,
        feed_name: &str,
        fd: OwnedFd,
        cleanup: CleanupFn,
        client_id: &str,
    ) -> JobResult<()> {
        let feeder = self
            .inner
            .feeders
            .get(feed_name)
            .ok_or_else(|| JobError::UnknownFeeder(feed_name.to_string()))?;
        let label = feeder.sink.add_fd(fd)?;
        info!(component = %self.inner.avatar_id, feed = feed_name, client_id, fd = label, "feed client added");

        feeder.clients.lock().unwrap().insert(
            label,
            ClientEntry {
                client_id: client_id.to_string(),
                cleanup,
            },
        );
        let client = feeder.state.ensure_client(client_id).await?;
        client.connected(label as i64, None).await?;
        Ok(())
    }

    /// Ask a feeder to drop one client; the cleanup registered with
    /// [`feed_to_fd`] runs when the fd is released.
    ///
    /// [`feed_to_fd`]: FeedComponent::feed_to_fd
    pub fn remove_feed_client(&self, feed_name: &str, fd: RawFd) -> JobResult<()> {
        let feeder = self
            .inner
            .feeders
            .get(feed_name)
            .ok_or_else(|| JobError::UnknownFeeder(feed_name.to_string()))?;
        feeder.sink.remove_fd(fd);
        Ok(())
    }

    /// Become the flow's clock master: pause, publish a time provider
    /// on `port` (0 picks one), and report `(ip, port, base_time)` for
    /// the other components to slave to. Idempotent; a second call
    /// reports the existing provider.
    pub async fn provide_master_clock(&self, port: u16) -> JobResult<(String, u16, i64)> {
        {
            let clock = self.inner.clock.lock().unwrap();
            if let Some(master) = clock.as_ref() {
                return Ok((master.ip.clone(), master.port, master.base_time_ns));
            }
        }
        self.inner.pipeline.set_state(PipelineState::Paused).await?;
        let provider = NetTimeProvider::publish(port).await?;
        let master = ClockMaster {
            ip: local_ip(),
            port: provider.port(),
            base_time_ns: self.inner.pipeline.base_time_ns(),
            _provider: provider,
        };
        info!(component = %self.inner.avatar_id, ip = %master.ip, port = master.port, "providing master clock");
        let result = (master.ip.clone(), master.port, master.base_time_ns);
        *self.inner.clock.lock().unwrap() = Some(master);
        Ok(result)
    }

    /// Slave the pipeline to the flow's clock master.
    pub async fn set_master_clock(&self, ip: &str, port: u16, base_time_ns: i64) -> JobResult<()> {
        let clock = NetClientClock::attach(ip, port, base_time_ns).await?;
        info!(component = %self.inner.avatar_id, %ip, port, "slaved to master clock");
        self.inner.pipeline.set_clock(ClockSource::Net(clock));
        Ok(())
    }

    /// Stop everything: monitors, sources, clock provider, pipeline.
    /// Clears any sticky sad; the component ends up sleeping.
    pub async fn stop(&self) -> JobResult<()> {
        info!(component = %self.inner.avatar_id, "component stopping");
        self.inner.monitors.detach_all();
        for eater in self.inner.eaters.values() {
            eater.source.stop();
        }
        *self.inner.clock.lock().unwrap() = None;
        self.inner.pipeline.set_state(PipelineState::Null).await?;
        self.inner.job.set_mood(Mood::Sleeping).await?;
        let _ = self.inner.stop.send(true);
        Ok(())
    }
}

/// Best local address for peers to reach the clock provider on. The
/// connect never sends a packet; it only selects a route.
fn local_ip() -> String {
    let guess = std::net::UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
        socket.connect("10.255.255.255:1")?;
        socket.local_addr()
    });
    match guess {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => "127.0.0.1".to_string(),
    }
}

async fn run_loop(
    inner: Arc<ComponentInner>,
    mut bus_rx: mpsc::UnboundedReceiver<BusMessage>,
    mut events_rx: mpsc::UnboundedReceiver<JobEvent>,
    mut stop_rx: watch::Receiver<bool>,
    stats_interval: Duration,
) {
    let mut stats_tick = tokio::time::interval(stats_interval);
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            Some(message) = bus_rx.recv() => inner.handle_bus(message).await,
            Some(event) = events_rx.recv() => inner.handle_event(event).await,
            _ = stats_tick.tick() => inner.sample_feeder_stats().await,
        }
    }
    debug!(component = %inner.avatar_id, "component loop done");
}

impl ComponentInner {
    fn mood_now(&self) -> Option<Mood> {
        self.job.mood().ok().flatten()
    }

    async fn transition(&self, to: Mood) {
        let current = self.mood_now();
        if current == Some(to) {
            return;
        }
        // Sad is sticky; only a stop clears it.
        if current == Some(Mood::Sad) && to != Mood::Sleeping {
            return;
        }
        info!(component = %self.avatar_id, mood = %to, "mood change");
        if let Err(e) = self.job.set_mood(to).await {
            warn!(component = %self.avatar_id, error = %e, "mood update failed");
        }
    }

    async fn maybe_wake_to_happy(&self) {
        if self.mood_now() == Some(Mood::Waking)
            && self.pipeline.state() == PipelineState::Playing
            && self.monitors.is_active()
        {
            self.transition(Mood::Happy).await;
        }
    }

    async fn handle_bus(&self, message: BusMessage) {
        match message {
            BusMessage::StateChanged { element, new, .. } => {
                if element == self.pipeline.name() && new == PipelineState::Playing {
                    self.maybe_wake_to_happy().await;
                }
            }
            BusMessage::Error { element, text, debug } => {
                warn!(component = %self.avatar_id, %element, %text, "error on the bus");
                let message = ComponentMessage::error(&format!("pipeline-error-{element}"), &text)
                    .with_debug(&debug);
                if let Err(e) = self.job.post_message(&message).await {
                    warn!(component = %self.avatar_id, error = %e, "message post failed");
                }
                self.transition(Mood::Sad).await;
            }
            BusMessage::Eos { element } => {
                // Eater EOS never reaches the bus; anything else is
                // informational.
                debug!(component = %self.avatar_id, %element, "eos on the bus");
            }
            BusMessage::Element { element, message } => {
                self.handle_element(&element, message).await;
            }
        }
    }

    /// Discontinuity reports carry the identity element's name; route
    /// them to the owning eater's counters.
    async fn handle_element(&self, element: &str, message: ElementMessage) {
        let alias = element
            .strip_prefix("eater:")
            .and_then(|s| s.strip_suffix("-identity"));
        let Some(eater) = alias.and_then(|a| self.eaters.get(a)) else {
            return;
        };
        let result = match message {
            ElementMessage::ImperfectTimestamp { gap_secs, timestamp_secs } => {
                debug!(component = %self.avatar_id, element, gap_secs, "timestamp discontinuity");
                eater.state.timestamp_discont(gap_secs, timestamp_secs).await
            }
            ElementMessage::ImperfectOffset { gap_units, offset } => {
                debug!(component = %self.avatar_id, element, gap_units, "offset discontinuity");
                eater.state.offset_discont(gap_units, offset).await
            }
        };
        if let Err(e) = result {
            warn!(component = %self.avatar_id, error = %e, "discontinuity accounting failed");
        }
    }

    async fn handle_event(&self, event: JobEvent) {
        match event {
            JobEvent::MonitorChanged => self.maybe_wake_to_happy().await,
            JobEvent::PadsInactive => {
                if matches!(self.mood_now(), Some(Mood::Happy | Mood::Waking)) {
                    self.transition(Mood::Hungry).await;
                }
            }
            JobEvent::PadsActive => {
                if self.mood_now() == Some(Mood::Hungry) {
                    self.transition(Mood::Happy).await;
                }
            }
            JobEvent::EaterEos(alias) => {
                info!(component = %self.avatar_id, alias, "eater hit end of stream");
                if let Some(eater) = self.eaters.get(&alias) {
                    if let Err(e) = eater.state.disconnected(None).await {
                        warn!(component = %self.avatar_id, error = %e, "eater state update failed");
                    }
                }
                // Starves the monitor, which starts the reconnect
                // polling.
                self.monitors.mark_inactive(&format!("eater:{alias}"));
            }
            JobEvent::ReconnectEater(alias) => {
                if let Some(eater) = self.eaters.get(&alias) {
                    let feed_id = eater.feed_id.lock().unwrap().clone();
                    debug!(component = %self.avatar_id, alias, %feed_id, "requesting eater reconnect");
                    (self.reconnect_request)(&alias, &feed_id);
                }
            }
            JobEvent::ClientRemoved { feeder, fd } => {
                let Some(feeder) = self.feeders.get(&feeder) else {
                    return;
                };
                let entry = feeder.clients.lock().unwrap().remove(&fd);
                let Some(entry) = entry else {
                    return;
                };
                debug!(component = %self.avatar_id, feed = %feeder.feed_name, fd, "feed client gone");
                match feeder.state.client(&entry.client_id) {
                    Ok(Some(client)) => {
                        if let Err(e) = client.disconnected(fd as i64, None).await {
                            warn!(component = %self.avatar_id, error = %e, "client state update failed");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(component = %self.avatar_id, error = %e, "client lookup failed");
                    }
                }
                // The writer task is done with the fd by now; safe to
                // hand it back from the loop.
                (entry.cleanup)(fd);
            }
        }
    }

    async fn sample_feeder_stats(&self) {
        for feeder in self.feeders.values() {
            let clients: Vec<(RawFd, String)> = feeder
                .clients
                .lock()
                .unwrap()
                .iter()
                .map(|(fd, entry)| (*fd, entry.client_id.clone()))
                .collect();
            for (fd, client_id) in clients {
                // A reclaimed fd means "no stats this tick", not
                // "client gone"; removal arrives as its own event.
                let Some(stats) = feeder.sink.get_stats(fd) else {
                    continue;
                };
                let client = match feeder.state.client(&client_id) {
                    Ok(Some(client)) => client,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(component = %self.avatar_id, error = %e, "client lookup failed");
                        continue;
                    }
                };
                let last_activity = stats.time_last_activity_ns as f64 / 1e9;
                if let Err(e) = client
                    .set_stats(stats.bytes_sent, last_activity, stats.buffers_dropped)
                    .await
                {
                    warn!(component = %self.avatar_id, error = %e, "stats update failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use nimbus_core::config::ComponentConfig;
    use nimbus_pipeline::{wire, Buffer};
    use nimbus_state::StateRegistry;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    fn fast_timing() -> RuntimeTiming {
        RuntimeTiming {
            monitor: MonitorTiming {
                probe_interval: Duration::from_millis(20),
                check_interval: Duration::from_millis(50),
            },
            stats_interval: Duration::from_millis(25),
        }
    }

    fn config(name: &str) -> ComponentConfig {
        let mut eaters = BTreeMap::new();
        eaters.insert("default".to_string(), vec!["producer:default".to_string()]);
        ComponentConfig {
            name: name.to_string(),
            component_type: "passthrough".to_string(),
            worker: "w1".to_string(),
            eaters,
            feeds: vec!["default".to_string()],
            properties: BTreeMap::new(),
            needs_synchronization: false,
            clock_priority: 0,
        }
    }

    struct Harness {
        component: FeedComponent,
        reconnects: Arc<Mutex<Vec<(String, String)>>>,
    }

    async fn harness(name: &str) -> Harness {
        harness_with(config(name)).await
    }

    async fn harness_with(config: ComponentConfig) -> Harness {
        let job = JobState::create(Arc::new(StateRegistry::new()), "w1", 4242);
        let reconnects = Arc::new(Mutex::new(Vec::new()));
        let seen = reconnects.clone();
        let component = FeedComponent::setup(
            AvatarId::new("default", &config.name),
            &config,
            &PropertyTable::default(),
            job,
            Arc::new(move |alias: &str, feed_id: &str| {
                seen.lock()
                    .unwrap()
                    .push((alias.to_string(), feed_id.to_string()));
            }),
            fast_timing(),
        )
        .await
        .unwrap();
        Harness {
            component,
            reconnects,
        }
    }

    fn stream_pair() -> (OwnedFd, UnixStream) {
        let (ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();
        theirs.set_nonblocking(true).unwrap();
        (
            OwnedFd::from(ours),
            UnixStream::from_std(theirs).unwrap(),
        )
    }

    async fn write_item(stream: &mut UnixStream, item: &FeedItem) {
        stream
            .write_all(&wire::encode_to_bytes(item))
            .await
            .unwrap();
    }

    async fn read_item(stream: &mut UnixStream) -> FeedItem {
        let mut acc = BytesMut::with_capacity(1024);
        loop {
            if let Some(item) = wire::decode(&mut acc).unwrap() {
                return item;
            }
            let n = stream.read_buf(&mut acc).await.unwrap();
            assert!(n > 0, "feed stream closed mid-item");
        }
    }

    fn buffer(n: u8) -> FeedItem {
        FeedItem::Buffer(Buffer::new(vec![n]).with_timestamp(n as f64))
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test]
    async fn data_flows_and_the_component_goes_happy() {
        let h = harness("muxer").await;
        h.component.link().await.unwrap();
        assert_eq!(h.component.mood(), Some(Mood::Waking));

        let (eat_fd, mut producer) = stream_pair();
        h.component
            .eat_from_fd("default", "producer:default", eat_fd)
            .await
            .unwrap();

        let (feed_fd, mut consumer) = stream_pair();
        h.component
            .feed_to_fd("default", feed_fd, Arc::new(|_| {}), "/default/consumer:default")
            .await
            .unwrap();

        sleep_ms(5).await;
        write_item(&mut producer, &FeedItem::Event(StreamEvent::NewSegment)).await;
        write_item(&mut producer, &buffer(1)).await;

        assert_eq!(
            read_item(&mut consumer).await,
            FeedItem::Event(StreamEvent::NewSegment)
        );
        assert_eq!(read_item(&mut consumer).await, buffer(1));

        sleep_ms(30).await;
        assert_eq!(h.component.mood(), Some(Mood::Happy));

        let eater = h.component.eater_state("default").unwrap();
        assert_eq!(eater.total_connections().unwrap(), 1);
    }

    #[tokio::test]
    async fn starvation_goes_hungry_and_recovery_returns_happy() {
        let h = harness("muxer").await;
        h.component.link().await.unwrap();

        let (eat_fd, mut producer) = stream_pair();
        h.component
            .eat_from_fd("default", "producer:default", eat_fd)
            .await
            .unwrap();
        sleep_ms(5).await;
        write_item(&mut producer, &buffer(1)).await;
        sleep_ms(30).await;
        assert_eq!(h.component.mood(), Some(Mood::Happy));

        // Starve past the check interval.
        sleep_ms(150).await;
        assert_eq!(h.component.mood(), Some(Mood::Hungry));
        assert!(
            !h.reconnects.lock().unwrap().is_empty(),
            "a starved eater keeps asking for a reconnect"
        );

        // Data returns.
        for n in 2..6 {
            write_item(&mut producer, &buffer(n)).await;
            sleep_ms(15).await;
        }
        assert_eq!(h.component.mood(), Some(Mood::Happy));
    }

    #[tokio::test]
    async fn a_bus_error_is_sad_and_sticky() {
        let h = harness("muxer").await;
        h.component.link().await.unwrap();

        h.component.bus_sender().post(BusMessage::Error {
            element: "mux".to_string(),
            text: "could not negotiate format".to_string(),
            debug: "caps mismatch".to_string(),
        });
        sleep_ms(20).await;
        assert_eq!(h.component.mood(), Some(Mood::Sad));
        let messages = h.component.job().messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].text.contains("negotiate"));

        // Data arriving afterwards must not cheer it up.
        let (eat_fd, mut producer) = stream_pair();
        h.component
            .eat_from_fd("default", "producer:default", eat_fd)
            .await
            .unwrap();
        sleep_ms(5).await;
        write_item(&mut producer, &buffer(1)).await;
        sleep_ms(30).await;
        assert_eq!(h.component.mood(), Some(Mood::Sad));

        // Only a stop clears it.
        h.component.stop().await.unwrap();
        assert_eq!(h.component.mood(), Some(Mood::Sleeping));
    }

    #[tokio::test]
    async fn eater_eos_is_swallowed_and_reconnect_requested() {
        let h = harness("muxer").await;
        h.component.link().await.unwrap();

        let (eat_fd, mut producer) = stream_pair();
        h.component
            .eat_from_fd("default", "producer:default", eat_fd)
            .await
            .unwrap();
        let (feed_fd, mut consumer) = stream_pair();
        h.component
            .feed_to_fd("default", feed_fd, Arc::new(|_| {}), "/default/consumer:default")
            .await
            .unwrap();

        sleep_ms(5).await;
        write_item(&mut producer, &buffer(1)).await;
        assert_eq!(read_item(&mut consumer).await, buffer(1));

        // Producer goes away; the EOS must not reach the consumer.
        drop(producer);
        sleep_ms(30).await;

        assert!(!h.reconnects.lock().unwrap().is_empty());
        assert_eq!(
            h.reconnects.lock().unwrap()[0],
            ("default".to_string(), "producer:default".to_string())
        );
        let eater = h.component.eater_state("default").unwrap();
        assert_eq!(eater.fd().unwrap(), None);
        assert_eq!(h.component.mood(), Some(Mood::Hungry));

        // Nothing further came down the feed.
        let mut probe = [0u8; 16];
        let pending = tokio::time::timeout(
            Duration::from_millis(30),
            consumer.read(&mut probe),
        )
        .await;
        assert!(pending.is_err(), "consumer saw data after eos: {pending:?}");
    }

    #[tokio::test]
    async fn reconnect_swallows_the_duplicate_new_segment() {
        let h = harness("muxer").await;
        h.component.link().await.unwrap();

        let (eat_fd, mut producer) = stream_pair();
        h.component
            .eat_from_fd("default", "producer:default", eat_fd)
            .await
            .unwrap();
        let (feed_fd, mut consumer) = stream_pair();
        h.component
            .feed_to_fd("default", feed_fd, Arc::new(|_| {}), "/default/consumer:default")
            .await
            .unwrap();

        sleep_ms(5).await;
        write_item(&mut producer, &FeedItem::Event(StreamEvent::NewSegment)).await;
        write_item(&mut producer, &buffer(1)).await;
        assert_eq!(
            read_item(&mut consumer).await,
            FeedItem::Event(StreamEvent::NewSegment)
        );
        assert_eq!(read_item(&mut consumer).await, buffer(1));

        // Reconnect: the new connection opens with its own new-segment,
        // which must not restart the downstream segment.
        let (eat_fd2, mut producer2) = stream_pair();
        h.component
            .eat_from_fd("default", "producer:default", eat_fd2)
            .await
            .unwrap();
        write_item(&mut producer2, &FeedItem::Event(StreamEvent::NewSegment)).await;
        write_item(&mut producer2, &buffer(2)).await;
        assert_eq!(read_item(&mut consumer).await, buffer(2));

        let eater = h.component.eater_state("default").unwrap();
        assert_eq!(eater.total_connections().unwrap(), 2);
    }

    #[tokio::test]
    async fn feed_client_cleanup_runs_after_fd_release() {
        let h = harness("muxer").await;
        h.component.link().await.unwrap();

        let (feed_fd, _consumer) = stream_pair();
        let cleaned = Arc::new(Mutex::new(Vec::new()));
        let sink = cleaned.clone();
        h.component
            .feed_to_fd(
                "default",
                feed_fd,
                Arc::new(move |fd| sink.lock().unwrap().push(fd)),
                "/default/consumer:default",
            )
            .await
            .unwrap();
        let feeder = h.component.feeder_state("default").unwrap();
        let client = feeder.client("/default/consumer:default").unwrap().unwrap();
        let fd = client.fd().unwrap().unwrap() as RawFd;

        h.component.remove_feed_client("default", fd).unwrap();
        for _ in 0..50 {
            if !cleaned.lock().unwrap().is_empty() {
                break;
            }
            sleep_ms(10).await;
        }
        assert_eq!(*cleaned.lock().unwrap(), vec![fd]);
        assert_eq!(client.fd().unwrap(), None);
    }

    #[tokio::test]
    async fn feeder_stats_reach_the_client_state() {
        let h = harness("muxer").await;
        h.component.link().await.unwrap();

        let (eat_fd, mut producer) = stream_pair();
        h.component
            .eat_from_fd("default", "producer:default", eat_fd)
            .await
            .unwrap();
        let (feed_fd, mut consumer) = stream_pair();
        h.component
            .feed_to_fd("default", feed_fd, Arc::new(|_| {}), "/default/consumer:default")
            .await
            .unwrap();

        sleep_ms(5).await;
        for n in 1..5 {
            write_item(&mut producer, &buffer(n)).await;
            assert_eq!(read_item(&mut consumer).await, buffer(n));
        }
        sleep_ms(60).await;

        let feeder = h.component.feeder_state("default").unwrap();
        let client = feeder.client("/default/consumer:default").unwrap().unwrap();
        assert!(client.bytes_read_total().unwrap() > 0);
    }

    #[tokio::test]
    async fn one_eater_section_with_two_feeds_gets_two_aliases() {
        let mut cfg = config("muxer");
        cfg.eaters.insert(
            "default".to_string(),
            vec![
                "producer:video".to_string(),
                "backup:video".to_string(),
            ],
        );
        let h = harness_with(cfg).await;
        assert!(h.component.eater_state("default").is_some());
        assert!(h.component.eater_state("default-2").is_some());
        assert!(h.component.eater_state("default-3").is_none());
    }

    #[tokio::test]
    async fn discont_reports_land_in_eater_counters() {
        let h = harness("muxer").await;
        h.component.link().await.unwrap();

        let (eat_fd, mut producer) = stream_pair();
        h.component
            .eat_from_fd("default", "producer:default", eat_fd)
            .await
            .unwrap();

        write_item(
            &mut producer,
            &FeedItem::Buffer(Buffer::new(&b"a"[..]).with_timestamp(0.0).with_duration(0.04)),
        )
        .await;
        // A two second hole.
        write_item(
            &mut producer,
            &FeedItem::Buffer(Buffer::new(&b"b"[..]).with_timestamp(2.04).with_duration(0.04)),
        )
        .await;
        sleep_ms(30).await;

        let eater = h.component.eater_state("default").unwrap();
        let registry = h.component.job().registry().clone();
        let total = registry
            .get(eater.handle(), "count-timestamp-discont")
            .unwrap();
        assert_eq!(total.as_int(), Some(1));
    }

    #[tokio::test]
    async fn provide_master_clock_is_idempotent() {
        let h = harness("producer").await;
        let first = h.component.provide_master_clock(0).await.unwrap();
        assert!(first.1 > 0);
        assert_eq!(h.component.pipeline_state(), PipelineState::Paused);

        let again = h.component.provide_master_clock(0).await.unwrap();
        assert_eq!(first, again);

        // A peer can slave to it.
        h.component
            .set_master_clock("127.0.0.1", first.1, first.2)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn bad_property_fails_setup() {
        use nimbus_pipeline::{PropertyKind, PropertySpec};
        let mut cfg = config("muxer");
        cfg.properties
            .insert("is-live".to_string(), "yes".to_string());
        let table = PropertyTable::new([PropertySpec::new("is-live", PropertyKind::Bool)]);

        let job = JobState::create(Arc::new(StateRegistry::new()), "w1", 1);
        let result = FeedComponent::setup(
            AvatarId::new("default", "muxer"),
            &cfg,
            &table,
            job,
            Arc::new(|_, _| {}),
            fast_timing(),
        )
        .await;
        assert!(matches!(result, Err(JobError::Pipeline(_))));
    }
}
