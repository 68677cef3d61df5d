//! StartSet — serializes asynchronous creates and shutdowns per id.
//!
//! Used by the worker to linearize job creates/shutdowns per avatar id
//! and by the multi-admin to disallow duplicate manager connections.
//! The id is opaque here; callers know what it names.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::Error;

type IsRunning = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A pending create. Resolves when the avatar is ready, or fails with
/// whatever [`StartSet::create_failed`] supplied.
#[derive(Debug)]
pub struct CreatePending {
    /// Set when the create was registered behind an in-flight
    /// shutdown; the create only resolves after that shutdown does.
    shutdown_first: Option<oneshot::Receiver<()>>,
    create: oneshot::Receiver<Result<String, Error>>,
}

impl CreatePending {
    pub async fn wait(self) -> Result<String, Error> {
        if let Some(shutdown) = self.shutdown_first {
            // A dropped sender means the shutdown side went away;
            // proceed with the create either way.
            let _ = shutdown.await;
        }
        match self.create.await {
            Ok(result) => result,
            Err(_) => Err(Error::Other("create abandoned".to_string())),
        }
    }
}

/// A pending shutdown. Resolves when the avatar has stopped.
pub struct ShutdownPending {
    rx: oneshot::Receiver<()>,
}

impl ShutdownPending {
    pub async fn wait(self) {
        let _ = self.rx.await;
    }
}

struct Inner {
    creates: HashMap<String, oneshot::Sender<Result<String, Error>>>,
    shutdowns: HashMap<String, Vec<oneshot::Sender<()>>>,
}

/// Serializer for asynchronous starts and shutdowns keyed by id.
pub struct StartSet {
    is_running: IsRunning,
    inner: Mutex<Inner>,
}

impl StartSet {
    /// `is_running` answers whether the given id is currently logged
    /// in and ready; the caller tracks ready avatars, we do not
    /// duplicate that set here.
    pub fn new(is_running: IsRunning) -> Self {
        Self {
            is_running,
            inner: Mutex::new(Inner {
                creates: HashMap::new(),
                shutdowns: HashMap::new(),
            }),
        }
    }

    /// Register a pending create for `id`.
    ///
    /// Fails with [`Error::AlreadyStarting`] if a create is pending,
    /// [`Error::AlreadyRunning`] if the avatar is already ready.
    /// If a shutdown is in flight the create chains behind it.
    pub fn create_start(&self, id: &str) -> Result<CreatePending, Error> {
        let mut inner = self.inner.lock().unwrap();

        if inner.creates.contains_key(id) {
            debug!(%id, "create already pending");
            return Err(Error::AlreadyStarting(id.to_string()));
        }

        let shutdown_first = if inner.shutdowns.contains_key(id) {
            debug!(%id, "create waits for in-flight shutdown");
            let (tx, rx) = oneshot::channel();
            inner.shutdowns.get_mut(id).unwrap().push(tx);
            Some(rx)
        } else if (self.is_running)(id) {
            debug!(%id, "avatar already running");
            return Err(Error::AlreadyRunning(id.to_string()));
        } else {
            None
        };

        let (tx, rx) = oneshot::channel();
        inner.creates.insert(id.to_string(), tx);
        debug!(%id, "create registered");

        Ok(CreatePending {
            shutdown_first,
            create: rx,
        })
    }

    /// Resolve a pending create for `id`. Duplicate calls are ignored
    /// with a warning.
    pub fn create_success(&self, id: &str) {
        let sender = self.inner.lock().unwrap().creates.remove(id);
        match sender {
            Some(tx) => {
                debug!(%id, "create resolved");
                let _ = tx.send(Ok(id.to_string()));
            }
            None => warn!(%id, "no create registered"),
        }
    }

    /// Fail a pending create for `id`. Duplicate calls are ignored
    /// with a warning.
    pub fn create_failed(&self, id: &str, err: Error) {
        let sender = self.inner.lock().unwrap().creates.remove(id);
        match sender {
            Some(tx) => {
                debug!(%id, %err, "create failed");
                let _ = tx.send(Err(err));
            }
            None => warn!(%id, "no create registered"),
        }
    }

    /// Is a create pending for `id`?
    pub fn create_registered(&self, id: &str) -> bool {
        self.inner.lock().unwrap().creates.contains_key(id)
    }

    /// Register a pending shutdown for `id`. Registering again while
    /// one is in flight returns another handle on the same completion.
    pub fn shutdown_start(&self, id: &str) -> ShutdownPending {
        let mut inner = self.inner.lock().unwrap();
        let (tx, rx) = oneshot::channel();
        if let Some(waiters) = inner.shutdowns.get_mut(id) {
            warn!(%id, "shutdown already registered");
            waiters.push(tx);
        } else {
            debug!(%id, "shutdown registered");
            inner.shutdowns.insert(id.to_string(), vec![tx]);
        }
        ShutdownPending { rx }
    }

    /// Resolve a pending shutdown for `id`. Duplicate calls are
    /// ignored with a warning.
    pub fn shutdown_success(&self, id: &str) {
        let waiters = self.inner.lock().unwrap().shutdowns.remove(id);
        match waiters {
            Some(waiters) => {
                debug!(%id, waiters = waiters.len(), "shutdown resolved");
                for tx in waiters {
                    let _ = tx.send(());
                }
            }
            None => warn!(%id, "no shutdown registered"),
        }
    }

    /// Is a shutdown pending for `id`?
    pub fn shutdown_registered(&self, id: &str) -> bool {
        self.inner.lock().unwrap().shutdowns.contains_key(id)
    }

    /// An avatar logged in and is ready; resolves its pending create
    /// if any.
    pub fn avatar_started(&self, id: &str) {
        if self.create_registered(id) {
            self.create_success(id);
        } else {
            debug!(%id, "avatar started, but nobody was waiting");
        }
    }

    /// An avatar stopped. Resolves a pending shutdown, or fails a
    /// still-pending create with the failure `get_failure` produces.
    pub fn avatar_stopped(&self, id: &str, get_failure: impl FnOnce(&str) -> Error) {
        if self.create_registered(id) {
            self.create_failed(id, get_failure(id));
        } else if self.shutdown_registered(id) {
            self.shutdown_success(id);
        } else {
            debug!(%id, "unknown avatar stopped");
        }
    }
}
