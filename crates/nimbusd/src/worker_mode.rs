//! Worker role: keep the job heaven running and serve the manager.
//!
//! The worker logs in to the manager, serves `heaven` calls
//! (create/stop component) over the same connection, and brokers feed
//! connections for its jobs: locally over socketpairs, remotely
//! through the producing worker's feed server, whose address the
//! manager resolves.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::Value;
use tokio::net::TcpStream;
use tracing::{error, info, warn};

use nimbus_core::{Error, FeedId};
use nimbus_rpc::{AckFuture, CallFuture, Connection, PeerHandler};
use nimbus_state::{Snapshot, WireEvent};
use nimbus_worker::{FeedServer, HeavenConfig, JobHeaven, TERM_GRACE};

pub struct WorkerOptions {
    pub name: String,
    pub manager_host: String,
    pub manager_port: u16,
    pub socket_path: PathBuf,
    pub feed_port: u16,
    pub feed_host: String,
}

/// Pieces that exist only after startup finishes; the peer handler
/// and the brokering callback read them through here.
#[derive(Default)]
struct Shared {
    heaven: OnceLock<JobHeaven>,
    connection: OnceLock<Connection>,
}

pub async fn run(options: WorkerOptions) -> anyhow::Result<()> {
    info!(worker = %options.name, "worker starting");

    let shared = Arc::new(Shared::default());

    let stream =
        TcpStream::connect((options.manager_host.as_str(), options.manager_port)).await?;
    let connection = Connection::spawn(
        stream,
        Arc::new(WorkerPeer {
            shared: shared.clone(),
        }),
    );
    let _ = shared.connection.set(connection.clone());

    if let Some(dir) = options.socket_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let job_program = std::env::current_exe()?;
    let heaven = JobHeaven::start(
        HeavenConfig {
            socket_path: options.socket_path.clone(),
            job_program,
            job_args: vec!["job".to_string(), "--worker-name".to_string(), options.name.clone()],
            manager_host: options.manager_host.clone(),
            manager_port: options.manager_port,
            term_grace: TERM_GRACE,
        },
        Arc::new(|avatar: &str, expected: bool| {
            // The manager learns of the loss through the job's own
            // connection dropping; locally it is only worth a line.
            if expected {
                info!(%avatar, "job exited");
            } else {
                warn!(%avatar, "job exited unexpectedly");
            }
        }),
        {
            let shared = shared.clone();
            Arc::new(move |avatar: &str, alias: &str, feed_id: &str| {
                let shared = shared.clone();
                let avatar = avatar.to_string();
                let alias = alias.to_string();
                let feed_id = feed_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = broker_feed(&shared, &avatar, &alias, &feed_id).await {
                        warn!(%avatar, alias = %alias, feed = %feed_id, error = %e, "feed brokering failed");
                    }
                });
            })
        },
    )
    .await?;
    let _ = shared.heaven.set(heaven.clone());

    let feed_server = FeedServer::start(heaven.clone(), options.feed_port).await?;
    info!(port = feed_server.port(), "feed server up");

    connection
        .call_remote(
            "manager",
            "worker_login",
            vec![
                Value::from(options.name.as_str()),
                Value::from(options.feed_host.as_str()),
                Value::from(feed_server.port()),
            ],
        )
        .await
        .map_err(|e| anyhow::anyhow!("worker login failed: {e}"))?;
    info!(worker = %options.name, "logged in to manager");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        _ = connection.closed() => error!("manager connection lost"),
    }

    feed_server.stop();
    heaven.shutdown().await;
    connection.close();
    info!("worker stopped");
    Ok(())
}

/// Wire one eater of `consumer_avatar` to its producer.
async fn broker_feed(
    shared: &Arc<Shared>,
    consumer_avatar: &str,
    alias: &str,
    feed_id: &str,
) -> anyhow::Result<()> {
    let heaven = shared
        .heaven
        .get()
        .ok_or_else(|| anyhow::anyhow!("heaven not up yet"))?;
    let parsed = FeedId::parse(feed_id)?;

    if let Some(producer_avatar) = heaven.avatar_for_component(&parsed.component) {
        heaven
            .connect_feed_local(&producer_avatar, &parsed.feed, consumer_avatar, alias, feed_id)
            .await?;
        return Ok(());
    }

    // Remote producer; ask the manager where its feed server lives.
    let connection = shared
        .connection
        .get()
        .ok_or_else(|| anyhow::anyhow!("manager connection not up yet"))?;
    let location = connection
        .call_remote("manager", "get_feed_location", vec![Value::from(feed_id)])
        .await?;
    let (host, port): (String, u16) = serde_json::from_value(location)?;
    heaven
        .connect_feed_remote(&host, port, feed_id, consumer_avatar, alias)
        .await?;
    Ok(())
}

struct WorkerPeer {
    shared: Arc<Shared>,
}

impl PeerHandler for WorkerPeer {
    fn handle_call(&self, target: &str, method: &str, args: Vec<Value>) -> CallFuture {
        let shared = self.shared.clone();
        let target = target.to_string();
        let method = method.to_string();
        Box::pin(async move {
            let heaven = shared
                .heaven
                .get()
                .ok_or_else(|| Error::Other("worker still starting".to_string()))?;
            let arg = |n: usize| -> Result<&str, Error> {
                args.get(n)
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Other(format!("{method}: missing argument {n}")))
            };

            match (target.as_str(), method.as_str()) {
                ("heaven", "create_component") => {
                    let component_type = arg(0)?;
                    let avatar_id = arg(1)?;
                    let nice = args.get(2).and_then(Value::as_i64).unwrap_or(0) as i32;
                    heaven
                        .create_component(component_type, avatar_id, nice)
                        .await?;
                    Ok(Value::Null)
                }
                ("heaven", "stop_component") => {
                    let pending = heaven
                        .stop_job(arg(0)?)
                        .map_err(|e| Error::Other(e.to_string()))?;
                    pending.wait().await;
                    Ok(Value::Null)
                }
                ("worker", "list_jobs") => {
                    let jobs: Vec<(String, u32)> = heaven
                        .jobs()
                        .into_iter()
                        .map(|j| (j.avatar_id, j.pid))
                        .collect();
                    serde_json::to_value(jobs).map_err(|e| Error::Other(e.to_string()))
                }
                (_, other) => Err(Error::NoSuchMethod(other.to_string())),
            }
        })
    }

    fn handle_snapshot(&self, name: &str, _snapshot: Snapshot) {
        warn!(root = name, "unexpected snapshot ignored");
    }

    fn handle_state_event(&self, _event: WireEvent) -> AckFuture {
        Box::pin(async { Err("workers hold no replicas".to_string()) })
    }
}
