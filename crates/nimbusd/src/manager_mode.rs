//! Manager role: serve admins, workers, and jobs over one TCP port.
//!
//! Every peer speaks the same framed RPC; its first call is a login
//! (`admin_login`, `worker_login`, or `job_login`) that fixes its
//! identity, and the connection teardown is interpreted against that
//! identity (admin detach, worker logout, job loss).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use nimbus_core::{ComponentMessage, Error, FeedId, Mood};
use nimbus_manager::{Manager, RemoteComponentLink, RemoteWorkerLink};
use nimbus_rpc::{AckFuture, CallFuture, Connection, PeerHandler};
use nimbus_state::{Snapshot, WireEvent};

/// Feed-server address per logged-in worker.
type FeedDirectory = Arc<Mutex<HashMap<String, (String, u16)>>>;

pub async fn run(name: &str, config: Option<PathBuf>, port: u16) -> anyhow::Result<()> {
    info!(planet = name, "manager starting");

    let manager = Manager::new(name);
    if let Some(path) = config {
        let text = std::fs::read_to_string(&path)?;
        manager.load_configuration(&text).await?;
        info!(path = %path.display(), "configuration loaded");
    }

    let feeds: FeedDirectory = Arc::new(Mutex::new(HashMap::new()));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "manager listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted?;
                info!(%peer_addr, "peer connected");
                tokio::spawn(serve_peer(manager.clone(), feeds.clone(), stream));
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    info!("manager stopped");
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum Identity {
    Unknown,
    Admin(String),
    Worker(String),
    Job(String),
}

struct Peer {
    manager: Manager,
    feeds: FeedDirectory,
    identity: Arc<Mutex<Identity>>,
    connection: Mutex<Option<Connection>>,
}

async fn serve_peer(manager: Manager, feeds: FeedDirectory, stream: tokio::net::TcpStream) {
    let peer = Arc::new(Peer {
        manager: manager.clone(),
        feeds: feeds.clone(),
        identity: Arc::new(Mutex::new(Identity::Unknown)),
        connection: Mutex::new(None),
    });
    let connection = Connection::spawn(stream, peer.clone());
    *peer.connection.lock().unwrap() = Some(connection.clone());

    connection.closed().await;

    let identity = peer.identity.lock().unwrap().clone();
    match identity {
        Identity::Unknown => {}
        Identity::Admin(admin) => manager.admin_detached(&admin),
        Identity::Worker(name) => {
            feeds.lock().unwrap().remove(&name);
            if let Err(e) = manager.worker_logged_out(&name).await {
                warn!(worker = %name, error = %e, "worker logout failed");
            }
        }
        Identity::Job(avatar) => {
            if let Err(e) = manager.component_detached(&avatar).await {
                warn!(%avatar, error = %e, "job detach failed");
            }
        }
    }
}

impl PeerHandler for Peer {
    fn handle_call(&self, _target: &str, method: &str, args: Vec<Value>) -> CallFuture {
        let manager = self.manager.clone();
        let feeds = self.feeds.clone();
        let connection = self.connection.lock().unwrap().clone();
        let identity = self.identity.clone();
        let method = method.to_string();
        Box::pin(
            async move { dispatch(identity, manager, feeds, connection, &method, args).await },
        )
    }

    fn handle_snapshot(&self, name: &str, _snapshot: Snapshot) {
        warn!(root = name, "unexpected snapshot from peer ignored");
    }

    fn handle_state_event(&self, _event: WireEvent) -> AckFuture {
        Box::pin(async { Err("peers do not push state here".to_string()) })
    }
}

async fn dispatch(
    identity: Arc<Mutex<Identity>>,
    manager: Manager,
    feeds: FeedDirectory,
    connection: Option<Connection>,
    method: &str,
    args: Vec<Value>,
) -> Result<Value, Error> {
    let arg = |n: usize| -> Result<&str, Error> {
        args.get(n)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Other(format!("{method}: missing argument {n}")))
    };
    let arg_num = |n: usize| -> Result<i64, Error> {
        args.get(n)
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Other(format!("{method}: missing argument {n}")))
    };
    let connection =
        connection.ok_or_else(|| Error::Other("connection not ready".to_string()))?;

    match method {
        // ── Logins ─────────────────────────────────────────────────
        "admin_login" => {
            let admin = arg(0)?;
            manager.admin_attached(admin, connection)?;
            *identity.lock().unwrap() = Identity::Admin(admin.to_string());
            Ok(Value::Null)
        }
        "worker_login" => {
            let name = arg(0)?;
            let feed_host = arg(1)?;
            let feed_port = u16::try_from(arg_num(2)?)
                .map_err(|_| Error::Other("bad feed port".to_string()))?;
            manager
                .worker_logged_in(name, Arc::new(RemoteWorkerLink::new(connection)))
                .await?;
            feeds
                .lock()
                .unwrap()
                .insert(name.to_string(), (feed_host.to_string(), feed_port));
            *identity.lock().unwrap() = Identity::Worker(name.to_string());
            Ok(Value::Null)
        }
        "job_login" => {
            let avatar = arg(0)?;
            let pid = arg_num(1)?;
            let worker = arg(2)?;
            manager
                .component_logged_in(avatar, pid, worker, Arc::new(RemoteComponentLink::new(connection)))
                .await?;
            *identity.lock().unwrap() = Identity::Job(avatar.to_string());
            Ok(Value::Null)
        }

        // ── Job reports ────────────────────────────────────────────
        "mood_changed" => {
            let avatar = arg(0)?;
            let mood = u8::try_from(arg_num(1)?)
                .ok()
                .and_then(Mood::from_ordinal)
                .ok_or_else(|| Error::Other("bad mood ordinal".to_string()))?;
            manager.component_mood_changed(avatar, mood).await?;
            Ok(Value::Null)
        }
        "post_message" => {
            let avatar = arg(0)?.to_string();
            let message: ComponentMessage = serde_json::from_value(
                args.get(1).cloned().unwrap_or(Value::Null),
            )
            .map_err(|e| Error::Other(e.to_string()))?;
            manager.component_message(&avatar, &message).await?;
            Ok(Value::Null)
        }
        "get_component_config" => {
            let component = manager.component_by_avatar(arg(0)?)?;
            let json = component
                .config_json()
                .map_err(|e| Error::Other(e.to_string()))?;
            Ok(Value::from(json))
        }
        "get_feed_location" => {
            let feed_id = FeedId::parse(arg(0)?)?;
            let (host, port) = feed_location(&manager, &feeds, &feed_id)?;
            Ok(serde_json::json!([host, port]))
        }

        // ── Admin commands ─────────────────────────────────────────
        "component_start" => manager.component_start(arg(0)?).await.map(|_| Value::Null),
        "component_stop" => manager.component_stop(arg(0)?).await.map(|_| Value::Null),
        "delete_component" => manager.delete_component(arg(0)?).await.map(|_| Value::Null),
        "load_configuration" => manager
            .load_configuration(arg(0)?)
            .await
            .map(|_| Value::Null),
        "get_versions" => {
            serde_json::to_value(manager.get_versions()).map_err(|e| Error::Other(e.to_string()))
        }
        "get_planet_state" => serde_json::to_value(manager.get_planet_state()?)
            .map_err(|e| Error::Other(e.to_string())),
        "get_worker_heaven_state" => serde_json::to_value(manager.get_worker_heaven_state()?)
            .map_err(|e| Error::Other(e.to_string())),
        "setup_flow_clock" => {
            let flow = arg(0)?;
            let port = u16::try_from(arg_num(1)?)
                .map_err(|_| Error::Other("bad clock port".to_string()))?;
            let master = manager.setup_flow_clock(flow, port).await?;
            serde_json::to_value(master.map(|m| (m.avatar_id, m.ip, m.port, m.base_time_ns)))
                .map_err(|e| Error::Other(e.to_string()))
        }
        "worker_call_remote" => {
            let worker = arg(0)?.to_string();
            let inner_method = arg(1)?.to_string();
            let inner_args = tunnel_args(args.get(2))?;
            manager
                .worker_call_remote(&worker, &inner_method, inner_args)
                .await
        }
        "component_call_remote" => {
            let avatar = arg(0)?.to_string();
            let inner_method = arg(1)?.to_string();
            let inner_args = tunnel_args(args.get(2))?;
            manager
                .component_call_remote(&avatar, &inner_method, inner_args)
                .await
        }

        other => Err(Error::NoSuchMethod(other.to_string())),
    }
}

fn tunnel_args(value: Option<&Value>) -> Result<Vec<Value>, Error> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(Error::Other(format!("bad argument list: {other}"))),
    }
}

/// Resolve a feed id to the feed-server address of the worker hosting
/// its producer.
fn feed_location(
    manager: &Manager,
    feeds: &FeedDirectory,
    feed_id: &FeedId,
) -> Result<(String, u16), Error> {
    let internal = |e: nimbus_state::StateError| Error::Other(e.to_string());
    let mut producer = None;
    let atmosphere = manager.planet().atmosphere().map_err(internal)?;
    if let Some(found) = atmosphere
        .component_by_name(&feed_id.component)
        .map_err(internal)?
    {
        producer = Some(found);
    }
    for flow in manager.planet().flows().map_err(internal)? {
        if producer.is_some() {
            break;
        }
        producer = flow
            .component_by_name(&feed_id.component)
            .map_err(internal)?;
    }
    let producer = producer
        .ok_or_else(|| Error::Unknown("component".to_string(), feed_id.component.clone()))?;
    let worker = producer
        .worker_name()
        .map_err(internal)?
        .ok_or_else(|| Error::SleepingComponent(feed_id.component.clone()))?;
    feeds
        .lock()
        .unwrap()
        .get(&worker)
        .cloned()
        .ok_or_else(|| Error::Unknown("worker".to_string(), worker))
}
