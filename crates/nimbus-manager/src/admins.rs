//! Admin fan-out: every authenticated admin mirrors the whole tree.
//!
//! A joining admin receives deep snapshots of the roots, then a
//! [`RemoteObserver`] is attached to every tracked state object so
//! that each later mutation is pushed and acknowledged. Objects
//! created afterwards are tracked as they appear; their initial
//! content reaches existing replicas through the parent's append
//! event, which expands child references into snapshots.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use nimbus_core::Error;
use nimbus_rpc::{Connection, RemoteObserver};
use nimbus_state::{ObserverId, StateHandle, StateRegistry};

struct FanoutInner {
    admins: HashMap<String, Connection>,
    /// Every live object in the replicated tree.
    objects: Vec<StateHandle>,
    /// Per admin, the observers we attached for it.
    attached: HashMap<String, Vec<(StateHandle, ObserverId)>>,
}

pub struct AdminFanout {
    registry: Arc<StateRegistry>,
    inner: Mutex<FanoutInner>,
}

impl AdminFanout {
    pub fn new(registry: Arc<StateRegistry>) -> Self {
        Self {
            registry,
            inner: Mutex::new(FanoutInner {
                admins: HashMap::new(),
                objects: Vec::new(),
                attached: HashMap::new(),
            }),
        }
    }

    /// A new tree object exists; every current admin starts observing
    /// it.
    pub fn track(&self, handle: StateHandle) {
        let mut inner = self.inner.lock().unwrap();
        if inner.objects.contains(&handle) {
            return;
        }
        inner.objects.push(handle);
        let admins: Vec<(String, Connection)> = inner
            .admins
            .iter()
            .map(|(id, connection)| (id.clone(), connection.clone()))
            .collect();
        for (admin, connection) in admins {
            match self
                .registry
                .add_observer(handle, RemoteObserver::new(self.registry.clone(), connection))
            {
                Ok(id) => inner.attached.entry(admin).or_default().push((handle, id)),
                Err(e) => warn!(%handle, %admin, error = %e, "observer attach failed"),
            }
        }
    }

    /// An object is about to be released; detach every observer.
    pub fn untrack(&self, handle: StateHandle) {
        let mut inner = self.inner.lock().unwrap();
        inner.objects.retain(|h| *h != handle);
        for entries in inner.attached.values_mut() {
            for (h, id) in entries.iter() {
                if *h == handle {
                    let _ = self.registry.remove_observer(*h, *id);
                }
            }
            entries.retain(|(h, _)| *h != handle);
        }
    }

    /// Attach an admin: push the root snapshots, then observe every
    /// tracked object on its behalf.
    pub fn admin_joined(
        &self,
        admin: &str,
        connection: Connection,
        roots: &[(&str, StateHandle)],
    ) -> Result<(), Error> {
        for (name, handle) in roots {
            let snapshot = self
                .registry
                .snapshot(*handle)
                .map_err(|e| Error::Other(e.to_string()))?;
            connection
                .send_snapshot(name, snapshot)
                .map_err(|e| Error::ConnectionFailed(admin.to_string(), e.to_string()))?;
        }

        let mut inner = self.inner.lock().unwrap();
        // A reconnect under the same id sheds the dead session's
        // observers first.
        if let Some(stale) = inner.attached.remove(admin) {
            for (handle, id) in stale {
                let _ = self.registry.remove_observer(handle, id);
            }
        }
        let mut attached = Vec::new();
        for handle in inner.objects.clone() {
            match self.registry.add_observer(
                handle,
                RemoteObserver::new(self.registry.clone(), connection.clone()),
            ) {
                Ok(id) => attached.push((handle, id)),
                Err(e) => warn!(%handle, admin, error = %e, "observer attach failed"),
            }
        }
        inner.attached.insert(admin.to_string(), attached);
        inner.admins.insert(admin.to_string(), connection);
        debug!(admin, "admin attached to the planet");
        Ok(())
    }

    /// Detach an admin and all of its observers.
    pub fn admin_left(&self, admin: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.admins.remove(admin);
        if let Some(entries) = inner.attached.remove(admin) {
            for (handle, id) in entries {
                let _ = self.registry.remove_observer(handle, id);
            }
        }
        debug!(admin, "admin detached");
    }

    pub fn admin_count(&self) -> usize {
        self.inner.lock().unwrap().admins.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::Manager;
    use nimbus_core::Mood;
    use nimbus_rpc::{CallFuture, PeerHandler};
    use nimbus_state::{sync, HandleMap, Snapshot, StateEvent, StateResult, WireEvent};
    use serde_json::Value;

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

        fn handle_state_event(&self, event: WireEvent) -> nimbus_rpc::AckFuture {
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
        fn handle_state_event(&self, _event: WireEvent) -> nimbus_rpc::AckFuture {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn an_attached_admin_mirrors_the_planet() {
        let manager = Manager::new("test");
        manager.load_configuration(CONFIG).await.unwrap();

        let replica_registry = Arc::new(StateRegistry::new());
        let replica = Arc::new(ReplicaPeer {
            registry: replica_registry.clone(),
            map: Mutex::new(HandleMap::new()),
        });
        let (left, right) = tokio::io::duplex(64 * 1024);
        let manager_conn = Connection::spawn(left, Arc::new(NullPeer));
        let _admin_conn = Connection::spawn(right, replica.clone());

        manager.admin_attached("admin-1", manager_conn).unwrap();

        // The mutation's completion covers the admin's ack, so the
        // mirror is current as soon as the call returns.
        manager
            .component_mood_changed("/default/producer", Mood::Happy)
            .await
            .unwrap();

        let planet_handle = manager.planet().handle();
        let local = {
            let map = replica.map.lock().unwrap();
            map.local(planet_handle).unwrap()
        };
        assert_eq!(
            replica_registry.snapshot(local).unwrap().to_tree(),
            manager.registry().snapshot(planet_handle).unwrap().to_tree()
        );

        // Components added after the attach replicate through the
        // flow's append event.
        let flow = manager.planet().flow_by_name("default").unwrap().unwrap();
        flow.add_component("late", "encoder", "{}").await.unwrap();
        assert_eq!(
            replica_registry.snapshot(local).unwrap().to_tree(),
            manager.registry().snapshot(planet_handle).unwrap().to_tree()
        );

        manager.admin_detached("admin-1");
    }
}
