//! Supervises admin links to several managers at once.
//!
//! Connects and disconnects are serialized per manager id through the
//! StartSet, so a UI cannot race two connects to the same manager.
//! Losing one link leaves every other link untouched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use nimbus_core::{Error, StartSet};

use crate::link::{AdminLink, Connector, LinkStatus, ReconnectPolicy};

struct MultiInner {
    admin_id: String,
    links: Arc<Mutex<HashMap<String, AdminLink>>>,
    start_set: StartSet,
}

/// One per UI/CLI process; holds every manager link.
#[derive(Clone)]
pub struct MultiAdmin {
    inner: Arc<MultiInner>,
}

impl MultiAdmin {
    pub fn new(admin_id: &str) -> Self {
        let links: Arc<Mutex<HashMap<String, AdminLink>>> = Arc::new(Mutex::new(HashMap::new()));
        let running = links.clone();
        let start_set = StartSet::new(Arc::new(move |id: &str| {
            running
                .lock()
                .unwrap()
                .get(id)
                .is_some_and(|link| link.is_connected())
        }));
        Self {
            inner: Arc::new(MultiInner {
                admin_id: admin_id.to_string(),
                links,
                start_set,
            }),
        }
    }

    /// Connect to one more manager. A connect already in flight fails
    /// with `AlreadyStarting`, an established one with
    /// `AlreadyRunning`.
    pub async fn add_manager(
        &self,
        manager_id: &str,
        connector: Connector,
        policy: ReconnectPolicy,
    ) -> Result<(), Error> {
        let pending = self.inner.start_set.create_start(manager_id)?;

        let link = AdminLink::open(manager_id, &self.inner.admin_id, connector, policy);
        self.inner
            .links
            .lock()
            .unwrap()
            .insert(manager_id.to_string(), link.clone());

        let inner = self.inner.clone();
        let id = manager_id.to_string();
        tokio::spawn(async move {
            match link.wait_connected().await {
                Ok(()) => inner.start_set.avatar_started(&id),
                Err(e) => {
                    inner.links.lock().unwrap().remove(&id);
                    inner.start_set.create_failed(&id, e);
                    return;
                }
            }
            // Watch for the terminal drop; bounded links die on their
            // own, closed ones through remove_manager.
            let mut status = link.status();
            loop {
                if *status.borrow_and_update() == LinkStatus::Disconnected {
                    break;
                }
                if status.changed().await.is_err() {
                    break;
                }
            }
            inner.links.lock().unwrap().remove(&id);
            inner
                .start_set
                .avatar_stopped(&id, |id| Error::ConnectionFailed(id.to_string(), "link lost".to_string()));
            warn!(manager = %id, "manager link gone");
        });

        pending.wait().await.map(|_| ())?;
        info!(manager = manager_id, "manager link established");
        Ok(())
    }

    /// Disconnect from one manager; other links are untouched.
    pub async fn remove_manager(&self, manager_id: &str) -> Result<(), Error> {
        let link = self
            .inner
            .links
            .lock()
            .unwrap()
            .get(manager_id)
            .cloned()
            .ok_or_else(|| Error::Unknown("manager".to_string(), manager_id.to_string()))?;
        let pending = self.inner.start_set.shutdown_start(manager_id);
        link.close().await;
        pending.wait().await;
        Ok(())
    }

    pub fn link(&self, manager_id: &str) -> Option<AdminLink> {
        self.inner.links.lock().unwrap().get(manager_id).cloned()
    }

    pub fn managers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.links.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::BoxTransport;
    use nimbus_rpc::{AckFuture, CallFuture, Connection, PeerHandler};
    use nimbus_state::{Snapshot, WireEvent};
    use serde_json::Value;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Accepts the login and nothing else; enough for link lifecycle.
    struct LoginOnlyPeer;

    impl PeerHandler for LoginOnlyPeer {
        fn handle_call(&self, _target: &str, method: &str, _args: Vec<Value>) -> CallFuture {
            let method = method.to_string();
            Box::pin(async move {
                match method.as_str() {
                    "admin_login" => Ok(Value::Null),
                    other => Err(Error::NoSuchMethod(other.to_string())),
                }
            })
        }
        fn handle_snapshot(&self, _name: &str, _snapshot: Snapshot) {}
        fn handle_state_event(&self, _event: WireEvent) -> AckFuture {
            Box::pin(async { Ok(()) })
        }
    }

    fn accepting_connector() -> Connector {
        Arc::new(|| {
            Box::pin(async {
                let (client, server) = tokio::io::duplex(64 * 1024);
                let _server = Connection::spawn(server, Arc::new(LoginOnlyPeer));
                Ok(Box::new(client) as BoxTransport)
            })
        })
    }

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: Some(2),
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn duplicate_connects_are_rejected() {
        let multi = MultiAdmin::new("admin-1");
        multi
            .add_manager("m1", accepting_connector(), policy())
            .await
            .unwrap();

        match multi.add_manager("m1", accepting_connector(), policy()).await {
            Err(Error::AlreadyRunning(id)) => assert_eq!(id, "m1"),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
        assert_eq!(multi.managers(), vec!["m1"]);
    }

    #[tokio::test]
    async fn a_connect_in_flight_blocks_a_second_one() {
        let multi = MultiAdmin::new("admin-1");
        // Never resolves; the first connect stays pending.
        let stuck: Connector = Arc::new(|| Box::pin(std::future::pending()));

        let racer = multi.clone();
        let first = tokio::spawn(async move {
            racer.add_manager("m1", stuck, ReconnectPolicy::tenacious()).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        match multi.add_manager("m1", accepting_connector(), policy()).await {
            Err(Error::AlreadyStarting(id)) => assert_eq!(id, "m1"),
            other => panic!("expected AlreadyStarting, got {other:?}"),
        }
        first.abort();
    }

    #[tokio::test]
    async fn losing_one_manager_leaves_the_rest_alone() {
        let multi = MultiAdmin::new("admin-1");
        multi
            .add_manager("m1", accepting_connector(), policy())
            .await
            .unwrap();
        multi
            .add_manager("m2", accepting_connector(), policy())
            .await
            .unwrap();
        assert_eq!(multi.managers(), vec!["m1", "m2"]);

        multi.remove_manager("m1").await.unwrap();
        assert_eq!(multi.managers(), vec!["m2"]);
        assert!(multi.link("m2").unwrap().is_connected());

        // A removed manager can be added again.
        multi
            .add_manager("m1", accepting_connector(), policy())
            .await
            .unwrap();
        assert_eq!(multi.managers(), vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn a_failed_connect_surfaces_and_frees_the_slot() {
        let multi = MultiAdmin::new("admin-1");
        let refusing: Connector =
            Arc::new(|| Box::pin(async { Err(std::io::Error::other("refused")) }));

        let result = timeout(
            Duration::from_secs(5),
            multi.add_manager("m1", refusing, policy()),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(Error::ConnectionRefused(_))));
        assert!(multi.managers().is_empty());

        // The slot is free for a working connector.
        multi
            .add_manager("m1", accepting_connector(), policy())
            .await
            .unwrap();
    }
}
