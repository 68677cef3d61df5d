//! A connection peer: framed envelopes over any byte stream.
//!
//! Both sides are equal: either may call the other, push state
//! events, or answer. Calls return completion tokens backed by a
//! pending map; state events are acknowledged only after the receiver
//! has applied them and run its listeners, which is what makes a
//! mutation's completion signal meaningful across the wire.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use nimbus_state::{Snapshot, WireEvent};

use crate::error::{RpcError, RpcResult};
use crate::frame;
use crate::message::Envelope;

pub type CallFuture = Pin<Box<dyn Future<Output = Result<Value, nimbus_core::Error>> + Send>>;
pub type AckFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// What a peer exposes to the other side.
pub trait PeerHandler: Send + Sync {
    /// Dispatch a call on a named object.
    fn handle_call(&self, target: &str, method: &str, args: Vec<Value>) -> CallFuture;

    /// An initial replica snapshot arrived.
    fn handle_snapshot(&self, name: &str, snapshot: Snapshot);

    /// A state event arrived; the returned future resolves once the
    /// event is applied locally. The ack is sent either way, so a
    /// broken replica cannot hang the producer.
    fn handle_state_event(&self, event: WireEvent) -> AckFuture;
}

struct Inner {
    tx: mpsc::UnboundedSender<Envelope>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, nimbus_core::Error>>>>,
    pending_acks: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    closed_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a live connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Take over a stream and start the reader and writer tasks.
    pub fn spawn<S>(stream: S, handler: Arc<dyn PeerHandler>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let (closed_tx, closed_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            tx: tx.clone(),
            pending: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            closed_rx,
            tasks: Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(e) = frame::write_message(&mut write_half, &envelope).await {
                    debug!(error = %e, "connection write failed");
                    return;
                }
            }
        });

        let reader_inner = inner.clone();
        let reader = tokio::spawn(async move {
            let mut acc = BytesMut::with_capacity(8192);
            loop {
                let envelope: Envelope =
                    match frame::read_message(&mut read_half, &mut acc).await {
                        Ok(Some(envelope)) => envelope,
                        Ok(None) => break,
                        Err(e) => {
                            debug!(error = %e, "connection read failed");
                            break;
                        }
                    };
                dispatch(&reader_inner, &handler, envelope);
            }
            // Fail every waiter; dropping the senders does it.
            reader_inner.pending.lock().unwrap().clear();
            reader_inner.pending_acks.lock().unwrap().clear();
            let _ = closed_tx.send(true);
        });

        inner.tasks.lock().unwrap().extend([writer, reader]);
        Self { inner }
    }

    /// Call `method` on the peer's object `target`.
    pub async fn call_remote(
        &self,
        target: &str,
        method: &str,
        args: Vec<Value>,
    ) -> RpcResult<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(id, done_tx);
        self.send(Envelope::Call {
            id,
            target: target.to_string(),
            method: method.to_string(),
            args,
        })?;
        match done_rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(kind)) => Err(RpcError::Remote(kind)),
            Err(_) => Err(RpcError::ConnectionClosed),
        }
    }

    /// Establish a replica of `snapshot` on the peer under `name`.
    pub fn send_snapshot(&self, name: &str, snapshot: Snapshot) -> RpcResult<()> {
        self.send(Envelope::StateSnapshot {
            name: name.to_string(),
            snapshot,
        })
    }

    /// Push one state event; resolves when the peer has acknowledged
    /// it.
    pub async fn push_state_event(&self, event: WireEvent) -> RpcResult<()> {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner.pending_acks.lock().unwrap().insert(seq, ack_tx);
        self.send(Envelope::StateEvent { seq, event })?;
        ack_rx.await.map_err(|_| RpcError::ConnectionClosed)
    }

    fn send(&self, envelope: Envelope) -> RpcResult<()> {
        self.inner
            .tx
            .send(envelope)
            .map_err(|_| RpcError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed_rx.borrow()
    }

    /// Resolves when the peer goes away.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Tear the connection down.
    pub fn close(&self) {
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.inner.pending.lock().unwrap().clear();
        self.inner.pending_acks.lock().unwrap().clear();
    }
}

fn dispatch(inner: &Arc<Inner>, handler: &Arc<dyn PeerHandler>, envelope: Envelope) {
    match envelope {
        Envelope::Call {
            id,
            target,
            method,
            args,
        } => {
            let future = handler.handle_call(&target, &method, args);
            let tx = inner.tx.clone();
            tokio::spawn(async move {
                let reply = match future.await {
                    Ok(result) => Envelope::Reply { id, result },
                    Err(error) => Envelope::Fault { id, error },
                };
                let _ = tx.send(reply);
            });
        }
        Envelope::Reply { id, result } => {
            if let Some(tx) = inner.pending.lock().unwrap().remove(&id) {
                let _ = tx.send(Ok(result));
            }
        }
        Envelope::Fault { id, error } => {
            if let Some(tx) = inner.pending.lock().unwrap().remove(&id) {
                let _ = tx.send(Err(error));
            }
        }
        Envelope::StateSnapshot { name, snapshot } => {
            handler.handle_snapshot(&name, snapshot);
        }
        Envelope::StateEvent { seq, event } => {
            let future = handler.handle_state_event(event);
            let tx = inner.tx.clone();
            tokio::spawn(async move {
                if let Err(e) = future.await {
                    warn!(seq, error = %e, "state event application failed");
                }
                let _ = tx.send(Envelope::StateAck { seq });
            });
        }
        Envelope::StateAck { seq } => {
            if let Some(tx) = inner.pending_acks.lock().unwrap().remove(&seq) {
                let _ = tx.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct EchoHandler {
        events: Mutex<Vec<WireEvent>>,
        snapshots: AtomicUsize,
    }

    impl EchoHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                snapshots: AtomicUsize::new(0),
            })
        }
    }

    impl PeerHandler for EchoHandler {
        fn handle_call(&self, target: &str, method: &str, args: Vec<Value>) -> CallFuture {
            let target = target.to_string();
            let method = method.to_string();
            Box::pin(async move {
                match method.as_str() {
                    "echo" => Ok(Value::Array(args)),
                    _ => Err(nimbus_core::Error::NoSuchMethod(format!(
                        "{target}.{method}"
                    ))),
                }
            })
        }

        fn handle_snapshot(&self, _name: &str, _snapshot: Snapshot) {
            self.snapshots.fetch_add(1, Ordering::SeqCst);
        }

        fn handle_state_event(&self, event: WireEvent) -> AckFuture {
            self.events.lock().unwrap().push(event);
            Box::pin(async { Ok(()) })
        }
    }

    fn pair() -> (Connection, Connection, Arc<EchoHandler>, Arc<EchoHandler>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let handler_a = EchoHandler::new();
        let handler_b = EchoHandler::new();
        let conn_a = Connection::spawn(a, handler_a.clone() as Arc<dyn PeerHandler>);
        let conn_b = Connection::spawn(b, handler_b.clone() as Arc<dyn PeerHandler>);
        (conn_a, conn_b, handler_a, handler_b)
    }

    #[tokio::test]
    async fn calls_cross_in_both_directions() {
        let (a, b, _, _) = pair();
        let from_a = a
            .call_remote("peer", "echo", vec![Value::from(1)])
            .await
            .unwrap();
        assert_eq!(from_a, Value::Array(vec![Value::from(1)]));

        let from_b = b
            .call_remote("peer", "echo", vec![Value::from("x")])
            .await
            .unwrap();
        assert_eq!(from_b, Value::Array(vec![Value::from("x")]));
    }

    #[tokio::test]
    async fn faults_reconstruct_the_error_kind() {
        let (a, _b, _, _) = pair();
        let err = a
            .call_remote("manager", "bogus", vec![])
            .await
            .unwrap_err();
        match err.remote_kind() {
            Some(nimbus_core::Error::NoSuchMethod(what)) => {
                assert_eq!(what, "manager.bogus");
            }
            other => panic!("expected NoSuchMethod, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn state_events_are_acknowledged_after_application() {
        use nimbus_state::{StateHandle, WireChange, WireValue};
        let (a, _b, _ha, hb) = pair();

        let event = WireEvent {
            handle: StateHandle(1),
            change: WireChange::Set {
                key: "mood".to_string(),
                value: WireValue::Plain(0i64.into()),
            },
        };
        a.push_state_event(event.clone()).await.unwrap();
        assert_eq!(hb.events.lock().unwrap().as_slice(), &[event]);
    }

    #[tokio::test]
    async fn peer_disappearing_fails_pending_calls() {
        let (a, b, _, _) = pair();
        b.close();
        let err = a.call_remote("peer", "echo", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
        a.closed().await;
        assert!(a.is_closed());
    }
}
