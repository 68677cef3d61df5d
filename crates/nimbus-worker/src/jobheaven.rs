//! Job heaven — spawning and supervising job processes.
//!
//! The heaven owns a UNIX-domain listening socket that spawned jobs
//! connect back to. Creates and shutdowns are linearized per avatar id
//! through a [`StartSet`]; a create resolves when the job's hello
//! arrives, and fails if the process dies first. Feed handoffs travel
//! to connected jobs as tagged descriptor messages.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::{UnixListener, UnixStream};
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nimbus_core::{AvatarId, Error, StartSet};

use crate::error::{WorkerError, WorkerResult};
use crate::feedserver;
use crate::jobproto::{self, Handoff, JobToWorker};

/// How long SIGTERM gets before escalating to SIGKILL.
pub const TERM_GRACE: Duration = Duration::from_secs(5);

/// Fired when a job process has exited and been reaped. The flag says
/// whether a shutdown was pending for it; an unexpected exit is the
/// manager's cue to mark the component lost.
pub type JobExitFn = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Fired when a job asks for an eater's feed connection to be remade:
/// `(avatar_id, eater_alias, feed_id)`.
pub type EaterRequestFn = Arc<dyn Fn(&str, &str, &str) + Send + Sync>;

/// How to run this heaven.
#[derive(Debug, Clone)]
pub struct HeavenConfig {
    /// Where the connect-back socket lives.
    pub socket_path: PathBuf,
    /// The job program and its leading arguments, typically the
    /// daemon binary with the `job` subcommand.
    pub job_program: PathBuf,
    pub job_args: Vec<String>,
    /// Passed to every job so it can report the manager contact.
    pub manager_host: String,
    pub manager_port: u16,
    pub term_grace: Duration,
}

/// What the heaven remembers about one spawned job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub pid: u32,
    pub avatar_id: String,
    pub component_type: String,
    pub nice: i32,
}

struct Job {
    info: JobInfo,
    /// Present once the job has connected back.
    stream: Option<Arc<UnixStream>>,
}

struct HeavenInner {
    config: HeavenConfig,
    jobs: Arc<Mutex<HashMap<String, Job>>>,
    start_set: StartSet,
    on_job_exit: JobExitFn,
    on_eater_request: EaterRequestFn,
    shutting_down: AtomicBool,
    /// Signalled whenever a job is reaped out of the map.
    reaped: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running job heaven. Cheap to clone.
#[derive(Clone)]
pub struct JobHeaven {
    inner: Arc<HeavenInner>,
}

impl JobHeaven {
    /// Bind the connect-back socket and start accepting jobs. A stale
    /// socket file from a previous run is removed first.
    pub async fn start(
        config: HeavenConfig,
        on_job_exit: JobExitFn,
        on_eater_request: EaterRequestFn,
    ) -> WorkerResult<Self> {
        match std::fs::remove_file(&config.socket_path) {
            Ok(()) => debug!(path = %config.socket_path.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&config.socket_path)?;
        info!(path = %config.socket_path.display(), "job heaven listening");

        let jobs: Arc<Mutex<HashMap<String, Job>>> = Arc::new(Mutex::new(HashMap::new()));
        let running = jobs.clone();
        let start_set = StartSet::new(Arc::new(move |id: &str| {
            running
                .lock()
                .unwrap()
                .get(id)
                .is_some_and(|job| job.stream.is_some())
        }));

        let inner = Arc::new(HeavenInner {
            config,
            jobs,
            start_set,
            on_job_exit,
            on_eater_request,
            shutting_down: AtomicBool::new(false),
            reaped: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let accept_inner = inner.clone();
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let conn_inner = accept_inner.clone();
                        tokio::spawn(async move {
                            handle_connection(conn_inner, stream).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "connect-back accept failed");
                    }
                }
            }
        });
        inner.tasks.lock().unwrap().push(accept);

        Ok(Self { inner })
    }

    /// Spawn a job for `avatar_id` and wait for it to connect back.
    ///
    /// Duplicate requests fail per the start-set rules; a request that
    /// arrives while a shutdown for the same avatar is in flight waits
    /// for the old process to be reaped before spawning.
    pub async fn create_component(
        &self,
        component_type: &str,
        avatar_id: &str,
        nice: i32,
    ) -> Result<(), Error> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Other("worker is shutting down".to_string()));
        }
        let pending = self.inner.start_set.create_start(avatar_id)?;

        // Never run two processes under one avatar id. The old entry
        // disappears when its reap task fires.
        loop {
            let reaped = self.inner.reaped.notified();
            if !self.inner.jobs.lock().unwrap().contains_key(avatar_id) {
                break;
            }
            reaped.await;
        }

        match self.spawn_job(component_type, avatar_id, nice) {
            Ok(()) => {}
            Err(e) => {
                self.inner
                    .start_set
                    .create_failed(avatar_id, Error::Other(format!("spawn failed: {e}")));
            }
        }
        pending.wait().await.map(|_| ())
    }

    fn spawn_job(&self, component_type: &str, avatar_id: &str, nice: i32) -> io::Result<()> {
        let config = &self.inner.config;
        let mut command = Command::new(&config.job_program);
        command
            .args(&config.job_args)
            .arg("--avatar-id")
            .arg(avatar_id)
            .arg("--worker-socket")
            .arg(&config.socket_path)
            .arg("--manager-host")
            .arg(&config.manager_host)
            .arg("--manager-port")
            .arg(config.manager_port.to_string())
            .stdin(Stdio::null());
        if nice != 0 {
            unsafe {
                command.pre_exec(move || {
                    if libc::setpriority(libc::PRIO_PROCESS, 0, nice) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        let mut child = command.spawn()?;
        let pid = child.id().unwrap_or_default();
        info!(%avatar_id, pid, component_type, nice, "spawned job");

        self.inner.jobs.lock().unwrap().insert(
            avatar_id.to_string(),
            Job {
                info: JobInfo {
                    pid,
                    avatar_id: avatar_id.to_string(),
                    component_type: component_type.to_string(),
                    nice,
                },
                stream: None,
            },
        );

        let reap_inner = self.inner.clone();
        let avatar = avatar_id.to_string();
        let reap = tokio::spawn(async move {
            let status = child.wait().await;
            handle_job_exit(&reap_inner, &avatar, status);
        });
        self.inner.tasks.lock().unwrap().push(reap);
        Ok(())
    }

    /// Everything currently spawned, connected back or not.
    pub fn jobs(&self) -> Vec<JobInfo> {
        self.inner
            .jobs
            .lock()
            .unwrap()
            .values()
            .map(|job| job.info.clone())
            .collect()
    }

    pub fn job_info(&self, avatar_id: &str) -> Option<JobInfo> {
        self.inner
            .jobs
            .lock()
            .unwrap()
            .get(avatar_id)
            .map(|job| job.info.clone())
    }

    /// The avatar of the connected job hosting `component`, if any.
    pub fn avatar_for_component(&self, component: &str) -> Option<String> {
        let jobs = self.inner.jobs.lock().unwrap();
        jobs.iter().find_map(|(avatar, job)| {
            if job.stream.is_none() {
                return None;
            }
            match AvatarId::parse(avatar) {
                Ok(id) if id.component == component => Some(avatar.clone()),
                _ => None,
            }
        })
    }

    fn job_stream(&self, avatar_id: &str) -> WorkerResult<Arc<UnixStream>> {
        let jobs = self.inner.jobs.lock().unwrap();
        let job = jobs
            .get(avatar_id)
            .ok_or_else(|| WorkerError::UnknownJob(avatar_id.to_string()))?;
        job.stream
            .clone()
            .ok_or_else(|| WorkerError::NotConnected(avatar_id.to_string()))
    }

    /// Hand the job descriptors to write its log output to.
    pub async fn redirect_job_output(
        &self,
        avatar_id: &str,
        stdout: RawFd,
        stderr: RawFd,
    ) -> WorkerResult<()> {
        let stream = self.job_stream(avatar_id)?;
        jobproto::send_handoff(&stream, &Handoff::RedirectStdout, stdout).await?;
        jobproto::send_handoff(&stream, &Handoff::RedirectStderr, stderr).await?;
        Ok(())
    }

    /// SIGKILL, no ceremony.
    pub fn kill_job(&self, avatar_id: &str) -> WorkerResult<()> {
        let info = self
            .job_info(avatar_id)
            .ok_or_else(|| WorkerError::UnknownJob(avatar_id.to_string()))?;
        warn!(%avatar_id, pid = info.pid, "killing job");
        signal(info.pid, libc::SIGKILL)?;
        Ok(())
    }

    /// Ask the job to stop with SIGTERM. The returned pending resolves
    /// once the process has been reaped.
    pub fn stop_job(&self, avatar_id: &str) -> WorkerResult<nimbus_core::ShutdownPending> {
        let info = self
            .job_info(avatar_id)
            .ok_or_else(|| WorkerError::UnknownJob(avatar_id.to_string()))?;
        let pending = self.inner.start_set.shutdown_start(avatar_id);
        info!(%avatar_id, pid = info.pid, "stopping job");
        signal(info.pid, libc::SIGTERM)?;
        Ok(pending)
    }

    /// Wire a producing and a consuming job on this worker together
    /// over a fresh socketpair.
    pub async fn connect_feed_local(
        &self,
        producer_avatar: &str,
        feed_name: &str,
        consumer_avatar: &str,
        eater_alias: &str,
        feed_id: &str,
    ) -> WorkerResult<()> {
        let producer = self.job_stream(producer_avatar)?;
        let consumer = self.job_stream(consumer_avatar)?;
        let (feed_end, eat_end) = std::os::unix::net::UnixStream::pair()?;
        let client_id = format!("{consumer_avatar}:{eater_alias}");
        debug!(%feed_id, %client_id, "brokering local feed");
        jobproto::send_handoff(
            &producer,
            &Handoff::FeedToFd {
                feed_name: feed_name.to_string(),
                client_id,
            },
            feed_end.as_raw_fd(),
        )
        .await?;
        jobproto::send_handoff(
            &consumer,
            &Handoff::EatFromFd {
                alias: eater_alias.to_string(),
                feed_id: feed_id.to_string(),
            },
            eat_end.as_raw_fd(),
        )
        .await?;
        // Our ends drop here; the jobs keep the kernel duplicates.
        Ok(())
    }

    /// Dial another worker's feed server and hand the resulting
    /// socket to the consuming job.
    pub async fn connect_feed_remote(
        &self,
        host: &str,
        port: u16,
        feed_id: &str,
        consumer_avatar: &str,
        eater_alias: &str,
    ) -> WorkerResult<()> {
        let consumer = self.job_stream(consumer_avatar)?;
        let client_id = format!("{consumer_avatar}:{eater_alias}");
        let socket = feedserver::request_feed(host, port, feed_id, &client_id).await?;
        let socket = socket.into_std()?;
        debug!(%feed_id, %client_id, host, port, "brokered remote feed");
        jobproto::send_handoff(
            &consumer,
            &Handoff::EatFromFd {
                alias: eater_alias.to_string(),
                feed_id: feed_id.to_string(),
            },
            socket.as_raw_fd(),
        )
        .await?;
        Ok(())
    }

    /// Hand an already-open feed socket to the producing job hosting
    /// `component`. Used by the feed server for accepted dials.
    pub(crate) async fn pass_feed_to(
        &self,
        component: &str,
        feed_name: &str,
        client_id: &str,
        fd: RawFd,
    ) -> WorkerResult<()> {
        let avatar = self
            .avatar_for_component(component)
            .ok_or_else(|| WorkerError::UnknownJob(component.to_string()))?;
        let producer = self.job_stream(&avatar)?;
        jobproto::send_handoff(
            &producer,
            &Handoff::FeedToFd {
                feed_name: feed_name.to_string(),
                client_id: client_id.to_string(),
            },
            fd,
        )
        .await?;
        Ok(())
    }

    /// Stop everything: SIGTERM to every job, a grace period, then
    /// SIGKILL for the stubborn, and finally the socket file goes.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        info!("job heaven shutting down");

        let pids: Vec<(String, u32)> = self
            .inner
            .jobs
            .lock()
            .unwrap()
            .values()
            .map(|job| (job.info.avatar_id.clone(), job.info.pid))
            .collect();
        for (avatar, pid) in &pids {
            if let Err(e) = signal(*pid, libc::SIGTERM) {
                warn!(%avatar, pid, error = %e, "SIGTERM failed");
            }
        }

        let grace = self.inner.config.term_grace;
        if !self.wait_until_empty(grace).await {
            let remaining: Vec<(String, u32)> = self
                .inner
                .jobs
                .lock()
                .unwrap()
                .values()
                .map(|job| (job.info.avatar_id.clone(), job.info.pid))
                .collect();
            for (avatar, pid) in &remaining {
                warn!(%avatar, pid, "job survived the grace period");
                if let Err(e) = signal(*pid, libc::SIGKILL) {
                    warn!(%avatar, pid, error = %e, "SIGKILL failed");
                }
            }
            self.wait_until_empty(grace).await;
        }

        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.inner.config.socket_path);
        info!("job heaven down");
    }

    async fn wait_until_empty(&self, limit: Duration) -> bool {
        let wait = async {
            loop {
                let reaped = self.inner.reaped.notified();
                if self.inner.jobs.lock().unwrap().is_empty() {
                    return;
                }
                reaped.await;
            }
        };
        tokio::time::timeout(limit, wait).await.is_ok()
    }
}

async fn handle_connection(inner: Arc<HeavenInner>, stream: UnixStream) {
    let mut acc = BytesMut::with_capacity(4096);
    let hello = match jobproto::read_frame::<JobToWorker>(&stream, &mut acc).await {
        Ok(Some(message)) => message,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "bad connect-back hello");
            return;
        }
    };
    let (avatar, pid) = match hello {
        JobToWorker::Hello { avatar_id, pid } => (avatar_id, pid),
        other => {
            warn!(?other, "job spoke before saying hello");
            return;
        }
    };

    let stream = Arc::new(stream);
    {
        let mut jobs = inner.jobs.lock().unwrap();
        match jobs.get_mut(&avatar) {
            Some(job) => job.stream = Some(stream.clone()),
            None => {
                warn!(%avatar, pid, "connect-back from a job we never spawned");
                return;
            }
        }
    }
    info!(%avatar, pid, "job connected back");
    inner.start_set.avatar_started(&avatar);

    loop {
        match jobproto::read_frame::<JobToWorker>(&stream, &mut acc).await {
            Ok(Some(JobToWorker::ConnectEater { alias, feed_id })) => {
                debug!(%avatar, %alias, %feed_id, "eater reconnect requested");
                (inner.on_eater_request)(&avatar, &alias, &feed_id);
            }
            Ok(Some(other)) => warn!(%avatar, ?other, "unexpected job message"),
            Ok(None) => break,
            Err(e) => {
                debug!(%avatar, error = %e, "job socket read failed");
                break;
            }
        }
    }

    // The socket went away; the reap task removes the entry once the
    // process itself is gone.
    if let Some(job) = inner.jobs.lock().unwrap().get_mut(&avatar) {
        job.stream = None;
    }
}

fn handle_job_exit(
    inner: &Arc<HeavenInner>,
    avatar: &str,
    status: io::Result<std::process::ExitStatus>,
) {
    inner.jobs.lock().unwrap().remove(avatar);
    inner.reaped.notify_waiters();

    // Computed before avatar_stopped resolves the pending shutdown.
    let expected = inner.start_set.shutdown_registered(avatar);
    inner.start_set.avatar_stopped(avatar, |id| {
        Error::Other(format!("job {id} exited before connecting back"))
    });

    match status {
        Ok(status) => info!(%avatar, %status, expected, "job exited"),
        Err(e) => warn!(%avatar, error = %e, "job reap failed"),
    }
    (inner.on_job_exit)(avatar, expected);
}

fn signal(pid: u32, sig: libc::c_int) -> io::Result<()> {
    if pid == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "pid unknown"));
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
