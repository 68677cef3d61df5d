//! Job role: host exactly one feed component.
//!
//! Spawned by a worker's job heaven, never by hand. The job connects
//! back to the worker over its UNIX socket (frames out, descriptor
//! handoffs in), logs in to the manager over TCP, and then runs the
//! feed component until it is told to stop or loses the manager.

use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tokio::net::{TcpStream, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use nimbus_core::{AvatarId, Error};
use nimbus_core::config::ComponentConfig;
use nimbus_job::{FeedComponent, RuntimeTiming};
use nimbus_pipeline::{PropertyKind, PropertySpec, PropertyTable};
use nimbus_rpc::{AckFuture, CallFuture, Connection, PeerHandler};
use nimbus_state::{ListenerInterest, Snapshot, StateChange, StateHandle, StateRegistry, WireEvent};
use nimbus_state::JobState;
use nimbus_worker::jobproto::{self, Handoff, JobToWorker};

pub struct JobOptions {
    pub worker_name: String,
    pub avatar_id: String,
    pub worker_socket: PathBuf,
    pub manager_host: String,
    pub manager_port: u16,
}

/// Properties the in-process elements accept. A codec-backed engine
/// would introspect these per element class.
fn element_properties() -> PropertyTable {
    PropertyTable::new([
        PropertySpec::new("framerate", PropertyKind::Int),
        PropertySpec::new("is-live", PropertyKind::Bool),
        PropertySpec::new("sync", PropertyKind::Bool),
        PropertySpec::new("bitrate", PropertyKind::Int),
        PropertySpec::new("volume", PropertyKind::Float),
        PropertySpec::new("pattern", PropertyKind::Enum(vec![0, 1, 2])),
        PropertySpec::new("location", PropertyKind::Str),
    ])
}

pub async fn run(options: JobOptions) -> anyhow::Result<()> {
    let avatar = AvatarId::parse(&options.avatar_id)?;
    let pid = std::process::id();
    info!(avatar_id = %avatar, pid, "job starting");

    // Connect back to the worker first; the heaven's create resolves
    // on our hello.
    let worker = Arc::new(UnixStream::connect(&options.worker_socket).await?);
    jobproto::write_frame(
        &worker,
        &JobToWorker::Hello {
            avatar_id: options.avatar_id.clone(),
            pid,
        },
    )
    .await?;

    let component_slot: Arc<OnceLock<FeedComponent>> = Arc::new(OnceLock::new());
    let stream =
        TcpStream::connect((options.manager_host.as_str(), options.manager_port)).await?;
    let manager = Connection::spawn(
        stream,
        Arc::new(JobPeer {
            component: component_slot.clone(),
        }),
    );

    // The manager owns the authoritative configuration.
    let config_json = manager
        .call_remote(
            "manager",
            "get_component_config",
            vec![Value::from(options.avatar_id.as_str())],
        )
        .await?;
    let config: ComponentConfig = serde_json::from_str(
        config_json
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("bad configuration reply"))?,
    )?;

    let registry = Arc::new(StateRegistry::new());
    let job_state = JobState::create(registry.clone(), &options.worker_name, pid as i64);
    job_state.set_manager_ip(&options.manager_host).await?;
    forward_moods(&registry, job_state.handle(), &options.avatar_id, manager.clone())?;

    // Eater reconnect requests go to the worker as frames.
    let reconnect_worker = worker.clone();
    let reconnect = Arc::new(move |alias: &str, feed_id: &str| {
        let worker = reconnect_worker.clone();
        let frame = JobToWorker::ConnectEater {
            alias: alias.to_string(),
            feed_id: feed_id.to_string(),
        };
        tokio::spawn(async move {
            if let Err(e) = jobproto::write_frame(&worker, &frame).await {
                error!(error = %e, "eater reconnect request lost");
            }
        });
    });

    let component = FeedComponent::setup(
        avatar,
        &config,
        &element_properties(),
        job_state.clone(),
        reconnect,
        RuntimeTiming::default(),
    )
    .await?;
    let _ = component_slot.set(component.clone());

    manager
        .call_remote(
            "manager",
            "job_login",
            vec![
                Value::from(options.avatar_id.as_str()),
                Value::from(pid),
                Value::from(options.worker_name.as_str()),
            ],
        )
        .await?;
    info!(avatar_id = %options.avatar_id, "logged in to manager");

    component.link().await?;

    // Ask the worker for every configured eater connection; the
    // descriptors come back as handoffs.
    for (alias, feed_ids) in &config.eaters {
        for (i, feed_id) in feed_ids.iter().enumerate() {
            let alias = if i == 0 {
                alias.clone()
            } else {
                format!("{alias}-{}", i + 1)
            };
            jobproto::write_frame(
                &worker,
                &JobToWorker::ConnectEater {
                    alias,
                    feed_id: feed_id.clone(),
                },
            )
            .await?;
        }
    }

    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            handoff = jobproto::recv_handoff(&worker) => {
                match handoff {
                    Ok((handoff, fd)) => {
                        if let Err(e) = apply_handoff(&component, handoff, fd).await {
                            warn!(error = %e, "handoff failed");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "worker socket lost");
                        break;
                    }
                }
            }
            _ = terminate.recv() => {
                info!("stop requested");
                break;
            }
            _ = manager.closed() => {
                error!("manager connection lost");
                break;
            }
        }
    }

    component.stop().await?;
    manager.close();
    info!(avatar_id = %options.avatar_id, "job stopped");
    Ok(())
}

/// Push every proxied mood change to the manager.
fn forward_moods(
    registry: &Arc<StateRegistry>,
    handle: StateHandle,
    avatar_id: &str,
    manager: Connection,
) -> anyhow::Result<()> {
    let avatar_id = avatar_id.to_string();
    registry.add_listener(
        handle,
        Arc::new(
            move |_handle: StateHandle, change: &StateChange| -> Result<(), String> {
                if let StateChange::Set { key, value } = change {
                    if key == "mood" {
                        if let Some(ordinal) = value.as_int() {
                            let manager = manager.clone();
                            let avatar_id = avatar_id.clone();
                            tokio::spawn(async move {
                                let result = manager
                                    .call_remote(
                                        "manager",
                                        "mood_changed",
                                        vec![Value::from(avatar_id.as_str()), Value::from(ordinal)],
                                    )
                                    .await;
                                if let Err(e) = result {
                                    warn!(error = %e, "mood report lost");
                                }
                            });
                        }
                    }
                }
                Ok(())
            },
        ),
        ListenerInterest {
            set: true,
            append: false,
            remove: false,
            setitem: false,
            delitem: false,
            invalidate: false,
        },
    )?;
    Ok(())
}

async fn apply_handoff(
    component: &FeedComponent,
    handoff: Handoff,
    fd: std::os::fd::OwnedFd,
) -> anyhow::Result<()> {
    match handoff {
        Handoff::EatFromFd { alias, feed_id } => {
            info!(alias = %alias, feed = %feed_id, fd = fd.as_raw_fd(), "eating from fd");
            component.eat_from_fd(&alias, &feed_id, fd).await?;
        }
        Handoff::FeedToFd { feed_name, client_id } => {
            info!(feed = %feed_name, client = %client_id, fd = fd.as_raw_fd(), "feeding to fd");
            component
                .feed_to_fd(&feed_name, fd, Arc::new(|_fd| {}), &client_id)
                .await?;
        }
        Handoff::RedirectStdout => redirect(fd, libc::STDOUT_FILENO)?,
        Handoff::RedirectStderr => redirect(fd, libc::STDERR_FILENO)?,
    }
    Ok(())
}

fn redirect(fd: std::os::fd::OwnedFd, target: i32) -> std::io::Result<()> {
    let rc = unsafe { libc::dup2(fd.as_raw_fd(), target) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

struct JobPeer {
    component: Arc<OnceLock<FeedComponent>>,
}

impl PeerHandler for JobPeer {
    fn handle_call(&self, _target: &str, method: &str, args: Vec<Value>) -> CallFuture {
        let component = self.component.clone();
        let method = method.to_string();
        Box::pin(async move {
            let component = component
                .get()
                .ok_or_else(|| Error::Other("component still starting".to_string()))?;
            match method.as_str() {
                "provide_master_clock" => {
                    let port = args
                        .first()
                        .and_then(Value::as_u64)
                        .and_then(|p| u16::try_from(p).ok())
                        .ok_or_else(|| Error::Other("bad clock port".to_string()))?;
                    let (ip, port, base) = component
                        .provide_master_clock(port)
                        .await
                        .map_err(|e| Error::Other(e.to_string()))?;
                    Ok(serde_json::json!([ip, port, base]))
                }
                "set_master_clock" => {
                    let ip = args
                        .first()
                        .and_then(Value::as_str)
                        .ok_or_else(|| Error::Other("bad clock ip".to_string()))?;
                    let port = args
                        .get(1)
                        .and_then(Value::as_u64)
                        .and_then(|p| u16::try_from(p).ok())
                        .ok_or_else(|| Error::Other("bad clock port".to_string()))?;
                    let base = args
                        .get(2)
                        .and_then(Value::as_i64)
                        .ok_or_else(|| Error::Other("bad clock base".to_string()))?;
                    component
                        .set_master_clock(ip, port, base)
                        .await
                        .map_err(|e| Error::Other(e.to_string()))?;
                    Ok(Value::Null)
                }
                "get_mood" => Ok(component
                    .mood()
                    .map(|m| Value::from(m.ordinal()))
                    .unwrap_or(Value::Null)),
                other => Err(Error::NoSuchMethod(other.to_string())),
            }
        })
    }

    fn handle_snapshot(&self, name: &str, _snapshot: Snapshot) {
        warn!(root = name, "unexpected snapshot ignored");
    }

    fn handle_state_event(&self, _event: WireEvent) -> AckFuture {
        Box::pin(async { Err("jobs hold no replicas".to_string()) })
    }
}
