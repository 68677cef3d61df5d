//! What the manager needs from its logged-in peers.
//!
//! Workers and components reach the manager over connections the
//! server layer owns; the manager itself only depends on these two
//! small traits, so the decision logic can be driven without any
//! sockets in tests.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use nimbus_core::Error;
use nimbus_rpc::{Connection, RpcError};

pub type LinkFuture<T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send>>;

/// A logged-in worker, as seen by the manager.
pub trait WorkerLink: Send + Sync {
    /// Ask the worker's job heaven to spawn a job; resolves once the
    /// job has connected back to the worker.
    fn create_component(&self, component_type: &str, avatar_id: &str, nice: i32)
        -> LinkFuture<()>;

    /// Ask the worker to stop the job hosting `avatar_id`.
    fn stop_component(&self, avatar_id: &str) -> LinkFuture<()>;

    /// Tunnel an arbitrary method call to the worker.
    fn call_remote(&self, method: &str, args: Vec<Value>) -> LinkFuture<Value>;
}

/// A logged-in component job, as seen by the manager.
pub trait ComponentLink: Send + Sync {
    fn call_remote(&self, method: &str, args: Vec<Value>) -> LinkFuture<Value>;
}

fn unwire(error: RpcError) -> Error {
    match error {
        RpcError::Remote(kind) => kind,
        other => Error::Other(other.to_string()),
    }
}

/// [`WorkerLink`] over a live connection; calls target the worker's
/// `heaven` object.
pub struct RemoteWorkerLink {
    connection: Connection,
}

impl RemoteWorkerLink {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }
}

impl WorkerLink for RemoteWorkerLink {
    fn create_component(
        &self,
        component_type: &str,
        avatar_id: &str,
        nice: i32,
    ) -> LinkFuture<()> {
        let connection = self.connection.clone();
        let args = vec![
            Value::from(component_type),
            Value::from(avatar_id),
            Value::from(nice),
        ];
        Box::pin(async move {
            connection
                .call_remote("heaven", "create_component", args)
                .await
                .map(|_| ())
                .map_err(unwire)
        })
    }

    fn stop_component(&self, avatar_id: &str) -> LinkFuture<()> {
        let connection = self.connection.clone();
        let args = vec![Value::from(avatar_id)];
        Box::pin(async move {
            connection
                .call_remote("heaven", "stop_component", args)
                .await
                .map(|_| ())
                .map_err(unwire)
        })
    }

    fn call_remote(&self, method: &str, args: Vec<Value>) -> LinkFuture<Value> {
        let connection = self.connection.clone();
        let method = method.to_string();
        Box::pin(async move {
            connection
                .call_remote("worker", &method, args)
                .await
                .map_err(unwire)
        })
    }
}

/// [`ComponentLink`] over a live connection; calls target the job's
/// `component` object.
pub struct RemoteComponentLink {
    connection: Connection,
}

impl RemoteComponentLink {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }
}

impl ComponentLink for RemoteComponentLink {
    fn call_remote(&self, method: &str, args: Vec<Value>) -> LinkFuture<Value> {
        let connection = self.connection.clone();
        let method = method.to_string();
        Box::pin(async move {
            connection
                .call_remote("component", &method, args)
                .await
                .map_err(unwire)
        })
    }
}
