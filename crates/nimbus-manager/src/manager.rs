//! The planet authority.
//!
//! One manager owns the authoritative planet tree and the
//! worker-heaven state. It loads configuration documents, dispatches
//! component commands against the mood policy, arbitrates moods when
//! jobs disappear, elects clock masters per flow, and fans the whole
//! tree out to every attached admin.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use nimbus_core::{
    AvatarId, ComponentMessage, Error, Mood, PlanetConfig, ids::ATMOSPHERE,
    config::ComponentConfig,
};
use nimbus_rpc::Connection;
use nimbus_state::{
    AtmosphereState, ComponentState, FlowState, ListenerInterest, PlanetState, StateChange,
    StateHandle, StateRegistry, WorkerHeavenState,
};

use crate::admins::AdminFanout;
use crate::links::{ComponentLink, WorkerLink};

/// The elected clock master of one flow.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockMaster {
    pub avatar_id: String,
    pub ip: String,
    pub port: u16,
    pub base_time_ns: i64,
}

struct ManagerInner {
    registry: Arc<StateRegistry>,
    planet: PlanetState,
    heaven: WorkerHeavenState,
    fanout: AdminFanout,
    workers: Mutex<HashMap<String, Arc<dyn WorkerLink>>>,
    components: Mutex<HashMap<String, Arc<dyn ComponentLink>>>,
    moods: Mutex<HashMap<String, watch::Sender<Option<Mood>>>>,
    clocks: Mutex<HashMap<String, ClockMaster>>,
}

/// Handle to the authority. Cheap to clone.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

fn internal(e: impl std::fmt::Display) -> Error {
    Error::Other(e.to_string())
}

enum ContainerRef {
    Flow(FlowState),
    Atmosphere(AtmosphereState),
}

impl ContainerRef {
    fn component_by_name(&self, name: &str) -> Result<Option<ComponentState>, Error> {
        match self {
            ContainerRef::Flow(flow) => flow.component_by_name(name),
            ContainerRef::Atmosphere(atmosphere) => atmosphere.component_by_name(name),
        }
        .map_err(internal)
    }

    async fn add_component(
        &self,
        name: &str,
        component_type: &str,
        config_json: &str,
    ) -> Result<ComponentState, Error> {
        match self {
            ContainerRef::Flow(flow) => flow.add_component(name, component_type, config_json).await,
            ContainerRef::Atmosphere(atmosphere) => {
                atmosphere.add_component(name, component_type, config_json).await
            }
        }
        .map_err(internal)
    }

    async fn remove_component(&self, component: &ComponentState) -> Result<(), Error> {
        match self {
            ContainerRef::Flow(flow) => flow.remove_component(component).await,
            ContainerRef::Atmosphere(atmosphere) => atmosphere.remove_component(component).await,
        }
        .map_err(internal)
    }
}

impl Manager {
    pub fn new(planet_name: &str) -> Self {
        let registry = Arc::new(StateRegistry::new());
        let planet = PlanetState::create(registry.clone(), planet_name, env!("CARGO_PKG_VERSION"));
        let heaven = WorkerHeavenState::create(registry.clone());
        let fanout = AdminFanout::new(registry.clone());
        fanout.track(planet.handle());
        if let Ok(atmosphere) = planet.atmosphere() {
            fanout.track(atmosphere.handle());
        }
        fanout.track(heaven.handle());
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                planet,
                heaven,
                fanout,
                workers: Mutex::new(HashMap::new()),
                components: Mutex::new(HashMap::new()),
                moods: Mutex::new(HashMap::new()),
                clocks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn planet(&self) -> &PlanetState {
        &self.inner.planet
    }

    pub fn worker_heaven(&self) -> &WorkerHeavenState {
        &self.inner.heaven
    }

    pub fn registry(&self) -> &Arc<StateRegistry> {
        &self.inner.registry
    }

    // ── Configuration ──────────────────────────────────────────────

    /// Load a planet document. Loading the same document twice yields
    /// the same planet: existing flows and components are kept.
    pub async fn load_configuration(&self, text: &str) -> Result<(), Error> {
        let config = PlanetConfig::from_str(text)?;
        info!(planet = %config.planet.name, flows = config.flows.len(), "loading configuration");

        let atmosphere = ContainerRef::Atmosphere(self.inner.planet.atmosphere().map_err(internal)?);
        for component in &config.atmosphere.components {
            self.ensure_component(&atmosphere, component).await?;
        }
        for flow in &config.flows {
            let state = self.inner.planet.ensure_flow(&flow.name).await.map_err(internal)?;
            self.inner.fanout.track(state.handle());
            let container = ContainerRef::Flow(state);
            for component in &flow.components {
                self.ensure_component(&container, component).await?;
            }
        }
        Ok(())
    }

    async fn ensure_component(
        &self,
        container: &ContainerRef,
        config: &ComponentConfig,
    ) -> Result<(), Error> {
        if container.component_by_name(&config.name)?.is_some() {
            return Ok(());
        }
        let config_json = serde_json::to_string(config).map_err(internal)?;
        let component = container
            .add_component(&config.name, &config.component_type, &config_json)
            .await?;
        self.inner.fanout.track(component.handle());
        component
            .set_worker_requested(Some(&config.worker))
            .await
            .map_err(internal)?;
        component.set_mood(Mood::Sleeping).await.map_err(internal)?;

        let avatar = component.avatar_id().map_err(internal)?;
        self.watch_mood(&avatar, &component)?;
        debug!(%avatar, kind = %config.component_type, "component configured");
        Ok(())
    }

    /// Keep a watch channel fed from the component's proxied mood, so
    /// commands can await a target mood without polling.
    fn watch_mood(&self, avatar: &str, component: &ComponentState) -> Result<(), Error> {
        let (tx, _rx) = watch::channel(component.mood().ok().flatten());
        let sender = tx.clone();
        self.inner
            .registry
            .add_listener(
                component.handle(),
                Arc::new(move |_handle: StateHandle, change: &StateChange| -> Result<(), String> {
                    if let StateChange::Set { key, value } = change {
                        if key == "mood" {
                            let mood = value
                                .as_int()
                                .and_then(|i| u8::try_from(i).ok())
                                .and_then(Mood::from_ordinal);
                            let _ = sender.send(mood);
                        }
                    }
                    Ok(())
                }),
                ListenerInterest {
                    set: true,
                    append: false,
                    remove: false,
                    setitem: false,
                    delitem: false,
                    invalidate: false,
                },
            )
            .map_err(internal)?;
        self.inner.moods.lock().unwrap().insert(avatar.to_string(), tx);
        Ok(())
    }

    async fn wait_for_mood(&self, avatar_id: &str, targets: &[Mood]) -> Result<Mood, Error> {
        let mut rx = {
            let moods = self.inner.moods.lock().unwrap();
            moods
                .get(avatar_id)
                .ok_or_else(|| Error::Unknown("component".to_string(), avatar_id.to_string()))?
                .subscribe()
        };
        loop {
            if let Some(mood) = *rx.borrow_and_update() {
                if targets.contains(&mood) {
                    return Ok(mood);
                }
            }
            rx.changed()
                .await
                .map_err(|_| Error::Other(format!("mood watch for {avatar_id} closed")))?;
        }
    }

    // ── Lookup ─────────────────────────────────────────────────────

    fn container_of(&self, id: &AvatarId) -> Result<ContainerRef, Error> {
        if id.container == ATMOSPHERE {
            Ok(ContainerRef::Atmosphere(
                self.inner.planet.atmosphere().map_err(internal)?,
            ))
        } else {
            self.inner
                .planet
                .flow_by_name(&id.container)
                .map_err(internal)?
                .map(ContainerRef::Flow)
                .ok_or_else(|| Error::Unknown("flow".to_string(), id.container.clone()))
        }
    }

    pub fn component_by_avatar(&self, avatar_id: &str) -> Result<ComponentState, Error> {
        let id = AvatarId::parse(avatar_id)?;
        self.container_of(&id)?
            .component_by_name(&id.component)?
            .ok_or_else(|| Error::Unknown("component".to_string(), avatar_id.to_string()))
    }

    // ── Worker registry ────────────────────────────────────────────

    /// A worker authenticated. Duplicate names are rejected.
    pub async fn worker_logged_in(
        &self,
        name: &str,
        link: Arc<dyn WorkerLink>,
    ) -> Result<(), Error> {
        if self.inner.heaven.contains(name).map_err(internal)? {
            warn!(worker = name, "duplicate worker login rejected");
            return Err(Error::AlreadyRunning(name.to_string()));
        }
        self.inner.heaven.worker_logged_in(name).await.map_err(internal)?;
        self.inner.workers.lock().unwrap().insert(name.to_string(), link);
        info!(worker = name, "worker logged in");
        Ok(())
    }

    pub async fn worker_logged_out(&self, name: &str) -> Result<(), Error> {
        self.inner.workers.lock().unwrap().remove(name);
        self.inner.heaven.worker_logged_out(name).await.map_err(internal)?;
        info!(worker = name, "worker logged out");
        Ok(())
    }

    fn worker_link(&self, name: &str) -> Result<Arc<dyn WorkerLink>, Error> {
        self.inner
            .workers
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Unknown("worker".to_string(), name.to_string()))
    }

    // ── Component commands ─────────────────────────────────────────

    /// Start a component: spawn its job on the requested worker and
    /// wait until the proxied mood reaches happy, or sad on failure.
    pub async fn component_start(&self, avatar_id: &str) -> Result<(), Error> {
        let component = self.component_by_avatar(avatar_id)?;
        let mood = component.mood().map_err(internal)?.unwrap_or(Mood::Sleeping);
        if !mood.can_start() {
            return Err(Error::ComponentMood(
                avatar_id.to_string(),
                mood.name().to_string(),
            ));
        }

        let config: ComponentConfig =
            serde_json::from_str(&component.config_json().map_err(internal)?).map_err(internal)?;
        let worker = config.worker.clone();
        let link = match self.worker_link(&worker) {
            Ok(link) => link,
            Err(e) => {
                component
                    .post_message(&ComponentMessage::warning(
                        "worker-not-present",
                        &format!("worker {worker} is not logged in"),
                    ))
                    .await
                    .map_err(internal)?;
                return Err(e);
            }
        };

        component
            .set_mood_pending(Some(Mood::Happy))
            .await
            .map_err(internal)?;
        component
            .set_worker_name(Some(&worker))
            .await
            .map_err(internal)?;
        info!(%avatar_id, %worker, "starting component");

        if let Err(e) = link
            .create_component(&config.component_type, avatar_id, 0)
            .await
        {
            component.set_mood_pending(None).await.map_err(internal)?;
            component
                .post_message(&ComponentMessage::error("start-failed", &e.to_string()))
                .await
                .map_err(internal)?;
            return Err(e);
        }

        match self.wait_for_mood(avatar_id, &[Mood::Happy, Mood::Sad]).await? {
            Mood::Sad => {
                component.set_mood_pending(None).await.map_err(internal)?;
                Err(Error::ComponentStartHandled(avatar_id.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Stop a component's job and wait for it to reach sleeping.
    pub async fn component_stop(&self, avatar_id: &str) -> Result<(), Error> {
        let component = self.component_by_avatar(avatar_id)?;
        let mood = component.mood().map_err(internal)?.unwrap_or(Mood::Sleeping);
        if !mood.can_stop() {
            return Err(Error::ComponentMood(
                avatar_id.to_string(),
                mood.name().to_string(),
            ));
        }
        component
            .set_mood_pending(Some(Mood::Sleeping))
            .await
            .map_err(internal)?;

        // A lost component has no job left to ask; it goes straight
        // to sleeping.
        if mood == Mood::Lost {
            component.set_mood(Mood::Sleeping).await.map_err(internal)?;
            component.set_worker_name(None).await.map_err(internal)?;
            return Ok(());
        }

        let worker = component
            .worker_name()
            .map_err(internal)?
            .ok_or_else(|| Error::Unknown("worker".to_string(), avatar_id.to_string()))?;
        info!(%avatar_id, %worker, "stopping component");
        self.worker_link(&worker)?.stop_component(avatar_id).await?;
        match self
            .wait_for_mood(avatar_id, &[Mood::Sleeping, Mood::Sad])
            .await?
        {
            // The job died in error instead of sleeping.
            Mood::Sad => {
                component.set_mood_pending(None).await.map_err(internal)?;
                Err(Error::ComponentMood(
                    avatar_id.to_string(),
                    Mood::Sad.name().to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Delete a stopped component from the planet.
    pub async fn delete_component(&self, avatar_id: &str) -> Result<(), Error> {
        let component = self.component_by_avatar(avatar_id)?;
        let mood = component.mood().map_err(internal)?.unwrap_or(Mood::Sleeping);
        if mood.can_stop() {
            return Err(Error::BusyComponent(avatar_id.to_string()));
        }
        let id = AvatarId::parse(avatar_id)?;
        let container = self.container_of(&id)?;
        self.inner.fanout.untrack(component.handle());
        self.inner.moods.lock().unwrap().remove(avatar_id);
        container.remove_component(&component).await?;
        info!(%avatar_id, "component deleted");
        Ok(())
    }

    // ── Job attachment and arbitration ─────────────────────────────

    /// A job authenticated for `avatar_id`.
    pub async fn component_logged_in(
        &self,
        avatar_id: &str,
        pid: i64,
        worker_name: &str,
        link: Arc<dyn ComponentLink>,
    ) -> Result<(), Error> {
        let component = self.component_by_avatar(avatar_id)?;
        component.set_pid(Some(pid)).await.map_err(internal)?;
        component
            .set_worker_name(Some(worker_name))
            .await
            .map_err(internal)?;
        self.inner
            .components
            .lock()
            .unwrap()
            .insert(avatar_id.to_string(), link);
        info!(%avatar_id, pid, worker_name, "component logged in");
        Ok(())
    }

    /// The job's proxied mood changed.
    pub async fn component_mood_changed(&self, avatar_id: &str, mood: Mood) -> Result<(), Error> {
        let component = self.component_by_avatar(avatar_id)?;
        component.set_mood(mood).await.map_err(internal)?;
        debug!(%avatar_id, mood = %mood, "mood proxied");
        Ok(())
    }

    /// The job posted a message.
    pub async fn component_message(
        &self,
        avatar_id: &str,
        message: &ComponentMessage,
    ) -> Result<(), Error> {
        let component = self.component_by_avatar(avatar_id)?;
        component.post_message(message).await.map_err(internal)
    }

    /// The job's connection went away. An explicit stop pending means
    /// sleeping; anything else means lost. Sad stays sad.
    pub async fn component_detached(&self, avatar_id: &str) -> Result<(), Error> {
        self.inner.components.lock().unwrap().remove(avatar_id);
        let component = self.component_by_avatar(avatar_id)?;
        component.set_pid(None).await.map_err(internal)?;

        let mood = component.mood().map_err(internal)?;
        if mood == Some(Mood::Sad) {
            component.set_mood_pending(None).await.map_err(internal)?;
            debug!(%avatar_id, "job gone; sad mood kept");
            return Ok(());
        }
        if component.mood_pending().map_err(internal)? == Some(Mood::Sleeping) {
            component.set_mood(Mood::Sleeping).await.map_err(internal)?;
            component.set_worker_name(None).await.map_err(internal)?;
            info!(%avatar_id, "job stopped as requested");
        } else {
            component.set_mood(Mood::Lost).await.map_err(internal)?;
            warn!(%avatar_id, "job disappeared; component lost");
        }
        Ok(())
    }

    // ── Tunnels and introspection ──────────────────────────────────

    pub async fn worker_call_remote(
        &self,
        worker: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, Error> {
        self.worker_link(worker)?.call_remote(method, args).await
    }

    pub async fn component_call_remote(
        &self,
        avatar_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, Error> {
        let link = self
            .inner
            .components
            .lock()
            .unwrap()
            .get(avatar_id)
            .cloned()
            .ok_or_else(|| Error::SleepingComponent(avatar_id.to_string()))?;
        link.call_remote(method, args).await
    }

    pub fn get_planet_state(&self) -> Result<nimbus_state::Snapshot, Error> {
        self.inner
            .registry
            .snapshot(self.inner.planet.handle())
            .map_err(internal)
    }

    pub fn get_worker_heaven_state(&self) -> Result<nimbus_state::Snapshot, Error> {
        self.inner
            .registry
            .snapshot(self.inner.heaven.handle())
            .map_err(internal)
    }

    pub fn get_versions(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            "nimbus".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        )])
    }

    // ── Admins ─────────────────────────────────────────────────────

    pub fn admin_attached(&self, admin: &str, connection: Connection) -> Result<(), Error> {
        let roots: [(&str, StateHandle); 2] = [
            ("planet", self.inner.planet.handle()),
            ("workerHeaven", self.inner.heaven.handle()),
        ];
        self.inner.fanout.admin_joined(admin, connection, &roots)
    }

    pub fn admin_detached(&self, admin: &str) {
        self.inner.fanout.admin_left(admin);
    }

    // ── Clock election ─────────────────────────────────────────────

    /// Elect the clock master for `flow_name` among components whose
    /// type takes part in synchronization, ask it to provide the net
    /// clock, and distribute the result to the other candidates.
    pub async fn setup_flow_clock(
        &self,
        flow_name: &str,
        clock_port: u16,
    ) -> Result<Option<ClockMaster>, Error> {
        let flow = self
            .inner
            .planet
            .flow_by_name(flow_name)
            .map_err(internal)?
            .ok_or_else(|| Error::Unknown("flow".to_string(), flow_name.to_string()))?;

        let mut candidates: Vec<(u32, String)> = Vec::new();
        for component in flow.components().map_err(internal)? {
            let config: ComponentConfig =
                serde_json::from_str(&component.config_json().map_err(internal)?)
                    .map_err(internal)?;
            if config.needs_synchronization {
                candidates.push((config.clock_priority, component.avatar_id().map_err(internal)?));
            }
        }
        if candidates.is_empty() {
            return Ok(None);
        }
        // Highest priority first; the sort is stable, so ties keep
        // configuration order.
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let master_avatar = candidates[0].1.clone();
        let reply = self
            .component_call_remote(
                &master_avatar,
                "provide_master_clock",
                vec![Value::from(clock_port)],
            )
            .await?;
        let master = parse_clock_reply(&master_avatar, &reply)?;
        info!(flow = flow_name, master = %master.avatar_id, ip = %master.ip, port = master.port, "clock master elected");

        for (_, other) in &candidates[1..] {
            self.component_call_remote(
                other,
                "set_master_clock",
                vec![
                    Value::from(master.ip.clone()),
                    Value::from(master.port),
                    Value::from(master.base_time_ns),
                ],
            )
            .await?;
        }
        self.inner
            .clocks
            .lock()
            .unwrap()
            .insert(flow_name.to_string(), master.clone());
        Ok(Some(master))
    }

    pub fn flow_clock(&self, flow_name: &str) -> Option<ClockMaster> {
        self.inner.clocks.lock().unwrap().get(flow_name).cloned()
    }
}

/// The job replies `[ip, port, base_time_ns]`.
fn parse_clock_reply(avatar_id: &str, reply: &Value) -> Result<ClockMaster, Error> {
    let parts = reply.as_array();
    let parsed = parts.and_then(|parts| {
        let ip = parts.first()?.as_str()?.to_string();
        let port = u16::try_from(parts.get(1)?.as_u64()?).ok()?;
        let base_time_ns = parts.get(2)?.as_i64()?;
        Some(ClockMaster {
            avatar_id: avatar_id.to_string(),
            ip,
            port,
            base_time_ns,
        })
    });
    parsed.ok_or_else(|| Error::Other(format!("bad clock reply from {avatar_id}: {reply}")))
}
