//! Worker-heaven state: which workers are logged in.

use std::sync::Arc;

use crate::error::StateResult;
use crate::registry::{KeyDecl, ReplicaTag, StateHandle, StateRegistry};

/// The set of currently logged-in worker names, kept by the manager
/// and replicated to admin clients.
#[derive(Clone)]
pub struct WorkerHeavenState {
    registry: Arc<StateRegistry>,
    handle: StateHandle,
}

impl WorkerHeavenState {
    pub fn create(registry: Arc<StateRegistry>) -> Self {
        let handle = registry.create_object(
            "worker-heaven",
            ReplicaTag::Local,
            &[KeyDecl::list("names")],
        );
        Self { registry, handle }
    }

    pub fn wrap(registry: Arc<StateRegistry>, handle: StateHandle) -> Self {
        Self { registry, handle }
    }

    pub fn handle(&self) -> StateHandle {
        self.handle
    }

    pub fn names(&self) -> StateResult<Vec<String>> {
        Ok(self
            .registry
            .get_list(self.handle, "names")?
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    pub fn contains(&self, name: &str) -> StateResult<bool> {
        Ok(self.names()?.iter().any(|n| n == name))
    }

    pub async fn worker_logged_in(&self, name: &str) -> StateResult<()> {
        if self.contains(name)? {
            return Ok(());
        }
        self.registry.append(self.handle, "names", name).await
    }

    pub async fn worker_logged_out(&self, name: &str) -> StateResult<()> {
        if !self.contains(name)? {
            return Ok(());
        }
        self.registry.remove(self.handle, "names", name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn login_logout_round_trip() {
        let heaven = WorkerHeavenState::create(Arc::new(StateRegistry::new()));
        heaven.worker_logged_in("general").await.unwrap();
        heaven.worker_logged_in("encoder-box").await.unwrap();
        // A second login of the same name is a no-op.
        heaven.worker_logged_in("general").await.unwrap();
        assert_eq!(heaven.names().unwrap(), vec!["general", "encoder-box"]);

        heaven.worker_logged_out("general").await.unwrap();
        heaven.worker_logged_out("general").await.unwrap();
        assert_eq!(heaven.names().unwrap(), vec!["encoder-box"]);
    }
}
