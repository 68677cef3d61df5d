//! One admin's connection to one manager.
//!
//! The link authenticates, mirrors the planet and worker-heaven
//! trees into a local replica registry, and exposes the manager's
//! command surface as typed async methods. When the connection drops
//! the replicas are invalidated, never mutated, and the link
//! reconnects with backoff until its retry budget runs out.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use nimbus_core::Error;
use nimbus_rpc::{AckFuture, CallFuture, Connection, PeerHandler, RpcError};
use nimbus_state::{
    sync, HandleMap, PlanetState, Snapshot, StateEvent, StateHandle, StateRegistry, StateResult,
    WireEvent, WorkerHeavenState,
};

/// Byte stream a link can ride on.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxTransport = Box<dyn Transport>;
pub type ConnectFuture = Pin<Box<dyn Future<Output = std::io::Result<BoxTransport>> + Send>>;
pub type Connector = Arc<dyn Fn() -> ConnectFuture + Send + Sync>;

/// Reconnect behavior after a failed connect or a dropped session.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Consecutive failed connects tolerated before giving up;
    /// `None` keeps trying forever.
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }

    pub fn tenacious() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::bounded(5)
    }
}

/// Where the link currently stands. `Disconnected` is terminal: the
/// retry budget is spent or the link was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// The mirrored trees. Snapshots instantiate replica objects here;
/// wire events resolve through the handle map and apply to them.
struct Mirror {
    registry: Arc<StateRegistry>,
    map: Mutex<HandleMap>,
    planet: Mutex<Option<StateHandle>>,
    heaven: Mutex<Option<StateHandle>>,
}

impl Mirror {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(StateRegistry::new()),
            map: Mutex::new(HandleMap::new()),
            planet: Mutex::new(None),
            heaven: Mutex::new(None),
        })
    }

    /// Mark every replica stale and forget the remote mapping, so a
    /// reconnect starts from fresh snapshots.
    async fn invalidate(&self) {
        let roots = [
            *self.planet.lock().unwrap(),
            *self.heaven.lock().unwrap(),
        ];
        *self.map.lock().unwrap() = HandleMap::new();
        for handle in roots.into_iter().flatten() {
            if let Err(e) = self.registry.invalidate(handle).await {
                debug!(error = %e, "replica invalidation skipped");
            }
        }
    }
}

struct MirrorPeer {
    mirror: Arc<Mirror>,
}

impl PeerHandler for MirrorPeer {
    fn handle_call(&self, _target: &str, method: &str, _args: Vec<Value>) -> CallFuture {
        let method = method.to_string();
        Box::pin(async move { Err(Error::NoSuchMethod(method)) })
    }

    fn handle_snapshot(&self, name: &str, snapshot: Snapshot) {
        let local = {
            let mut map = self.mirror.map.lock().unwrap();
            self.mirror.registry.instantiate(&snapshot, &mut map)
        };
        match local {
            Ok(handle) => match name {
                "planet" => *self.mirror.planet.lock().unwrap() = Some(handle),
                "workerHeaven" => *self.mirror.heaven.lock().unwrap() = Some(handle),
                other => warn!(root = other, "unexpected snapshot root ignored"),
            },
            Err(e) => warn!(root = name, error = %e, "snapshot rejected"),
        }
    }

    fn handle_state_event(&self, event: WireEvent) -> AckFuture {
        let resolved: StateResult<StateEvent> = {
            let mut map = self.mirror.map.lock().unwrap();
            sync::resolve_event(&self.mirror.registry, event, &mut map)
        };
        let registry = self.mirror.registry.clone();
        Box::pin(async move {
            let event = resolved.map_err(|e| e.to_string())?;
            registry.apply_event(event).await.map_err(|e| e.to_string())
        })
    }
}

struct LinkInner {
    manager_id: String,
    admin_id: String,
    mirror: Arc<Mirror>,
    connection: Mutex<Option<Connection>>,
    status: watch::Sender<LinkStatus>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Handle to one manager link. Cheap to clone.
#[derive(Clone)]
pub struct AdminLink {
    inner: Arc<LinkInner>,
}

fn unwire(error: RpcError) -> Error {
    match error {
        RpcError::Remote(kind) => kind,
        other => Error::Other(other.to_string()),
    }
}

impl AdminLink {
    /// Connect over TCP.
    pub fn connect(manager_id: &str, admin_id: &str, host: &str, port: u16, policy: ReconnectPolicy) -> Self {
        let address = format!("{host}:{port}");
        let connector: Connector = Arc::new(move || {
            let address = address.clone();
            Box::pin(async move {
                let stream = TcpStream::connect(&address).await?;
                Ok(Box::new(stream) as BoxTransport)
            })
        });
        Self::open(manager_id, admin_id, connector, policy)
    }

    /// Connect over an arbitrary transport source.
    pub fn open(
        manager_id: &str,
        admin_id: &str,
        connector: Connector,
        policy: ReconnectPolicy,
    ) -> Self {
        let (status, _) = watch::channel(LinkStatus::Connecting);
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(LinkInner {
            manager_id: manager_id.to_string(),
            admin_id: admin_id.to_string(),
            mirror: Mirror::new(),
            connection: Mutex::new(None),
            status,
            shutdown,
            task: Mutex::new(None),
        });
        let task = tokio::spawn(run_link(inner.clone(), connector, policy));
        *inner.task.lock().unwrap() = Some(task);
        Self { inner }
    }

    pub fn manager_id(&self) -> &str {
        &self.inner.manager_id
    }

    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.status.borrow() == LinkStatus::Connected
    }

    /// Wait for the first connection; fails once the link gives up.
    pub async fn wait_connected(&self) -> Result<(), Error> {
        let mut status = self.inner.status.subscribe();
        loop {
            match *status.borrow_and_update() {
                LinkStatus::Connected => return Ok(()),
                LinkStatus::Disconnected => {
                    return Err(Error::ConnectionRefused(self.inner.manager_id.clone()))
                }
                LinkStatus::Connecting => {}
            }
            if status.changed().await.is_err() {
                return Err(Error::ConnectionRefused(self.inner.manager_id.clone()));
            }
        }
    }

    /// Stop reconnecting and drop the session; replicas are
    /// invalidated one last time.
    pub async fn close(&self) {
        let _ = self.inner.shutdown.send(true);
        let task = self.inner.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    // ── Mirrored state ─────────────────────────────────────────────

    pub fn registry(&self) -> &Arc<StateRegistry> {
        &self.inner.mirror.registry
    }

    pub fn planet(&self) -> Option<PlanetState> {
        let handle = (*self.inner.mirror.planet.lock().unwrap())?;
        Some(PlanetState::wrap(self.inner.mirror.registry.clone(), handle))
    }

    pub fn worker_heaven(&self) -> Option<WorkerHeavenState> {
        let handle = (*self.inner.mirror.heaven.lock().unwrap())?;
        Some(WorkerHeavenState::wrap(
            self.inner.mirror.registry.clone(),
            handle,
        ))
    }

    // ── Commands ───────────────────────────────────────────────────

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, Error> {
        let connection = self
            .inner
            .connection
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| {
                Error::ConnectionFailed(
                    self.inner.manager_id.clone(),
                    "not connected".to_string(),
                )
            })?;
        connection.call_remote("manager", method, args).await.map_err(unwire)
    }

    pub async fn component_start(&self, avatar_id: &str) -> Result<(), Error> {
        self.call("component_start", vec![Value::from(avatar_id)])
            .await
            .map(|_| ())
    }

    pub async fn component_stop(&self, avatar_id: &str) -> Result<(), Error> {
        self.call("component_stop", vec![Value::from(avatar_id)])
            .await
            .map(|_| ())
    }

    pub async fn delete_component(&self, avatar_id: &str) -> Result<(), Error> {
        self.call("delete_component", vec![Value::from(avatar_id)])
            .await
            .map(|_| ())
    }

    pub async fn component_call_remote(
        &self,
        avatar_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, Error> {
        self.call(
            "component_call_remote",
            vec![Value::from(avatar_id), Value::from(method), Value::from(args)],
        )
        .await
    }

    pub async fn worker_call_remote(
        &self,
        worker: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, Error> {
        self.call(
            "worker_call_remote",
            vec![Value::from(worker), Value::from(method), Value::from(args)],
        )
        .await
    }

    /// Tunnel an arbitrary method call to the manager itself.
    pub async fn call_remote(&self, method: &str, args: Vec<Value>) -> Result<Value, Error> {
        self.call(method, args).await
    }

    pub async fn load_configuration(&self, text: &str) -> Result<(), Error> {
        self.call("load_configuration", vec![Value::from(text)])
            .await
            .map(|_| ())
    }

    pub async fn get_versions(&self) -> Result<BTreeMap<String, String>, Error> {
        let value = self.call("get_versions", vec![]).await?;
        serde_json::from_value(value).map_err(|e| Error::Other(e.to_string()))
    }
}

async fn run_link(inner: Arc<LinkInner>, connector: Connector, policy: ReconnectPolicy) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut attempts = 0u32;
    let mut delay = policy.initial_delay;

    loop {
        if *shutdown.borrow() {
            break;
        }
        match (connector)().await {
            Ok(stream) => {
                attempts = 0;
                delay = policy.initial_delay;
                let peer = Arc::new(MirrorPeer {
                    mirror: inner.mirror.clone(),
                });
                let connection = Connection::spawn(stream, peer);
                // Authenticate; the manager attaches us to the planet
                // on success and the snapshots follow.
                let login = connection
                    .call_remote("manager", "admin_login", vec![Value::from(inner.admin_id.as_str())])
                    .await;
                if let Err(e) = login {
                    warn!(manager = %inner.manager_id, error = %e, "admin login failed");
                    connection.close();
                } else {
                    *inner.connection.lock().unwrap() = Some(connection.clone());
                    let _ = inner.status.send(LinkStatus::Connected);
                    info!(manager = %inner.manager_id, "admin link up");

                    tokio::select! {
                        _ = connection.closed() => {}
                        _ = shutdown.changed() => connection.close(),
                    }
                    *inner.connection.lock().unwrap() = None;
                    inner.mirror.invalidate().await;
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!(manager = %inner.manager_id, "admin link lost; reconnecting");
                    let _ = inner.status.send(LinkStatus::Connecting);
                    continue;
                }
            }
            Err(e) => {
                debug!(manager = %inner.manager_id, error = %e, "connect failed");
            }
        }

        attempts += 1;
        if let Some(max) = policy.max_attempts {
            if attempts >= max {
                warn!(manager = %inner.manager_id, attempts, "retry budget spent; giving up");
                break;
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
        delay = (delay * 2).min(policy.max_delay);
    }

    inner.mirror.invalidate().await;
    let _ = inner.status.send(LinkStatus::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::Mood;
    use nimbus_manager::Manager;
    use tokio::time::{timeout, Duration};

    const CONFIG: &str = r#"
        [planet]
        name = "test"

        [[flow]]
        name = "default"

        [[flow.component]]
        name = "producer"
        type = "videotest"
        worker = "general"
    "#;

    /// Server side of a test session: answers the admin's calls with
    /// the real manager.
    struct ManagerPeer {
        manager: Manager,
        connection: Mutex<Option<Connection>>,
    }

    impl PeerHandler for ManagerPeer {
        fn handle_call(&self, _target: &str, method: &str, args: Vec<Value>) -> CallFuture {
            let manager = self.manager.clone();
            let connection = self.connection.lock().unwrap().clone();
            let method = method.to_string();
            Box::pin(async move {
                let arg = |n: usize| args.get(n).and_then(Value::as_str).unwrap_or_default();
                match method.as_str() {
                    "admin_login" => {
                        let connection =
                            connection.ok_or_else(|| Error::Other("no connection".to_string()))?;
                        manager.admin_attached(arg(0), connection)?;
                        Ok(Value::Null)
                    }
                    "component_start" => {
                        manager.component_start(arg(0)).await.map(|_| Value::Null)
                    }
                    "get_versions" => serde_json::to_value(manager.get_versions())
                        .map_err(|e| Error::Other(e.to_string())),
                    other => Err(Error::NoSuchMethod(other.to_string())),
                }
            })
        }

        fn handle_snapshot(&self, _name: &str, _snapshot: Snapshot) {}

        fn handle_state_event(&self, _event: WireEvent) -> AckFuture {
            Box::pin(async { Ok(()) })
        }
    }

    /// A connector that serves up to `sessions` duplex sessions
    /// against the manager, then refuses.
    fn manager_connector(
        manager: Manager,
        sessions: usize,
    ) -> (Connector, Arc<Mutex<Vec<Connection>>>) {
        let remaining = Arc::new(Mutex::new(sessions));
        let server_side: Arc<Mutex<Vec<Connection>>> = Arc::new(Mutex::new(Vec::new()));
        let servers = server_side.clone();
        let connector: Connector = Arc::new(move || {
            let manager = manager.clone();
            let remaining = remaining.clone();
            let servers = servers.clone();
            Box::pin(async move {
                {
                    let mut left = remaining.lock().unwrap();
                    if *left == 0 {
                        return Err(std::io::Error::other("refused"));
                    }
                    *left -= 1;
                }
                let (client, server) = tokio::io::duplex(64 * 1024);
                let peer = Arc::new(ManagerPeer {
                    manager,
                    connection: Mutex::new(None),
                });
                let connection = Connection::spawn(server, peer.clone());
                *peer.connection.lock().unwrap() = Some(connection.clone());
                servers.lock().unwrap().push(connection);
                Ok(Box::new(client) as BoxTransport)
            })
        });
        (connector, server_side)
    }

    fn quick(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: Some(max_attempts),
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn replica_mood(link: &AdminLink, avatar: &str) -> Option<Mood> {
        let planet = link.planet()?;
        let flow = planet.flow_by_name("default").ok()??;
        let name = avatar.rsplit('/').next()?;
        let component = flow.component_by_name(name).ok()??;
        component.mood().ok()?
    }

    #[tokio::test]
    async fn the_mirror_follows_the_manager() {
        let manager = Manager::new("test");
        manager.load_configuration(CONFIG).await.unwrap();
        let (connector, _servers) = manager_connector(manager.clone(), 1);

        let link = AdminLink::open("m1", "admin-1", connector, quick(1));
        link.wait_connected().await.unwrap();
        wait_until(|| link.planet().is_some()).await;
        assert_eq!(
            replica_mood(&link, "/default/producer"),
            Some(Mood::Sleeping)
        );

        // The mutation's completion covers the admin's ack.
        manager
            .component_mood_changed("/default/producer", Mood::Happy)
            .await
            .unwrap();
        assert_eq!(replica_mood(&link, "/default/producer"), Some(Mood::Happy));

        // Commands round-trip, error kinds included.
        let versions = link.get_versions().await.unwrap();
        assert_eq!(versions.get("nimbus").map(String::as_str), Some(env!("CARGO_PKG_VERSION")));
        manager
            .component_mood_changed("/default/producer", Mood::Sleeping)
            .await
            .unwrap();
        match link.component_start("/default/producer").await {
            Err(Error::Unknown(kind, name)) => {
                assert_eq!(kind, "worker");
                assert_eq!(name, "general");
            }
            other => panic!("expected Unknown, got {other:?}"),
        }

        link.close().await;
        assert_eq!(*link.status().borrow(), LinkStatus::Disconnected);
    }

    #[tokio::test]
    async fn a_dropped_link_invalidates_and_reconnects() {
        let manager = Manager::new("test");
        manager.load_configuration(CONFIG).await.unwrap();
        let (connector, servers) = manager_connector(manager.clone(), 2);

        let link = AdminLink::open("m1", "admin-1", connector, quick(5));
        link.wait_connected().await.unwrap();
        wait_until(|| link.planet().is_some()).await;
        let first = link.planet().unwrap();

        // The manager side drops the session.
        servers.lock().unwrap()[0].close();
        wait_until(|| {
            link.planet()
                .map(|p| p.handle() != first.handle())
                .unwrap_or(false)
        })
        .await;

        assert!(link.registry().is_invalidated(first.handle()).unwrap());
        assert!(link.is_connected());
        assert_eq!(
            replica_mood(&link, "/default/producer"),
            Some(Mood::Sleeping)
        );
        link.close().await;
    }

    #[tokio::test]
    async fn the_retry_budget_is_bounded() {
        let connector: Connector =
            Arc::new(|| Box::pin(async { Err(std::io::Error::other("refused")) }));
        let link = AdminLink::open("m1", "admin-1", connector, quick(2));
        match link.wait_connected().await {
            Err(Error::ConnectionRefused(id)) => assert_eq!(id, "m1"),
            other => panic!("expected ConnectionRefused, got {other:?}"),
        }
        assert_eq!(*link.status().borrow(), LinkStatus::Disconnected);
    }

    #[tokio::test]
    async fn commands_fail_fast_while_disconnected() {
        let connector: Connector =
            Arc::new(|| Box::pin(async { Err(std::io::Error::other("refused")) }));
        let link = AdminLink::open("m1", "admin-1", connector, quick(1));
        let _ = link.wait_connected().await;
        match link.component_stop("/default/producer").await {
            Err(Error::ConnectionFailed(id, _)) => assert_eq!(id, "m1"),
            other => panic!("expected ConnectionFailed, got {other:?}"),
        }
    }
}
