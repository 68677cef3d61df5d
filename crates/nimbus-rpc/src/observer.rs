//! Bridges a local cacheable to a remote replica.
//!
//! Attach a [`RemoteObserver`] to a state object and every mutation is
//! expanded to its wire form and pushed to the peer; the mutation's
//! completion token resolves when the peer acknowledges.

use std::sync::Arc;

use nimbus_state::{
    sync, AckFuture, StateEvent, StateObserver, StateRegistry,
};

use crate::connection::Connection;

pub struct RemoteObserver {
    registry: Arc<StateRegistry>,
    connection: Connection,
}

impl RemoteObserver {
    pub fn new(registry: Arc<StateRegistry>, connection: Connection) -> Arc<Self> {
        Arc::new(Self {
            registry,
            connection,
        })
    }
}

impl StateObserver for RemoteObserver {
    fn deliver(&self, event: StateEvent) -> AckFuture {
        let expanded = sync::expand_event(&self.registry, &event);
        let connection = self.connection.clone();
        Box::pin(async move {
            let wire = expanded.map_err(|e| e.to_string())?;
            connection
                .push_state_event(wire)
                .await
                .map_err(|e| e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{AckFuture as PeerAckFuture, CallFuture, PeerHandler};
    use nimbus_state::{
        HandleMap, KeyDecl, ReplicaTag, Snapshot, StateResult, WireEvent,
    };
    use serde_json::Value;
    use std::sync::Mutex;

    /// Receiving side: applies incoming events to a replica registry.
    struct ReplicaPeer {
        registry: Arc<StateRegistry>,
        map: Mutex<HandleMap>,
    }

    impl PeerHandler for ReplicaPeer {
        fn handle_call(&self, _t: &str, m: &str, _a: Vec<Value>) -> CallFuture {
            let m = m.to_string();
            Box::pin(async move { Err(nimbus_core::Error::NoSuchMethod(m)) })
        }

        fn handle_snapshot(&self, _name: &str, snapshot: Snapshot) {
            let mut map = self.map.lock().unwrap();
            let _ = self.registry.instantiate(&snapshot, &mut map);
        }

        fn handle_state_event(&self, event: WireEvent) -> PeerAckFuture {
            let resolved: StateResult<StateEvent> = {
                let mut map = self.map.lock().unwrap();
                sync::resolve_event(&self.registry, event, &mut map)
            };
            let registry = self.registry.clone();
            Box::pin(async move {
                let event = resolved.map_err(|e| e.to_string())?;
                registry.apply_event(event).await.map_err(|e| e.to_string())
            })
        }
    }

    struct NullPeer;
    impl PeerHandler for NullPeer {
        fn handle_call(&self, _t: &str, m: &str, _a: Vec<Value>) -> CallFuture {
            let m = m.to_string();
            Box::pin(async move { Err(nimbus_core::Error::NoSuchMethod(m)) })
        }
        fn handle_snapshot(&self, _name: &str, _snapshot: Snapshot) {}
        fn handle_state_event(&self, _event: WireEvent) -> PeerAckFuture {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn mutations_replicate_across_a_connection() {
        let producer_registry = Arc::new(StateRegistry::new());
        let replica_registry = Arc::new(StateRegistry::new());

        let (left, right) = tokio::io::duplex(64 * 1024);
        let replica_peer = Arc::new(ReplicaPeer {
            registry: replica_registry.clone(),
            map: Mutex::new(HandleMap::new()),
        });
        let producer_conn = Connection::spawn(left, Arc::new(NullPeer));
        let _replica_conn = Connection::spawn(right, replica_peer.clone());

        let handle = producer_registry.create_object(
            "component",
            ReplicaTag::Local,
            &[
                KeyDecl::scalar("name", "producer"),
                KeyDecl::scalar("mood", 3i64),
            ],
        );

        // Establish the replica, then attach the wire observer.
        let snapshot = producer_registry.snapshot(handle).unwrap();
        producer_conn.send_snapshot("component", snapshot).unwrap();
        producer_registry
            .add_observer(
                handle,
                RemoteObserver::new(producer_registry.clone(), producer_conn.clone()),
            )
            .unwrap();

        // The mutation's completion covers the remote ack, so the
        // replica is up to date as soon as `set` returns.
        producer_registry.set(handle, "mood", 0i64).await.unwrap();

        let local = {
            let map = replica_peer.map.lock().unwrap();
            map.local(handle).unwrap()
        };
        assert_eq!(
            replica_registry.snapshot(local).unwrap().to_tree(),
            producer_registry.snapshot(handle).unwrap().to_tree()
        );
    }
}
