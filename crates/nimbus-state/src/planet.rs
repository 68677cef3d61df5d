//! Typed wrappers over the planet state tree.
//!
//! The tree is planet → atmosphere/flows → components. Wrappers are
//! cheap handles into a shared registry; parent/child links are
//! `Ref` values, so the shape stays acyclic at the ownership level
//! even though components point back at their parent.
//!
//! Messages are stored as their JSON encoding. `StateValue` carries
//! scalars only, and messages already have a stable wire form.

use std::sync::Arc;

use nimbus_core::{ComponentMessage, Mood};

use crate::error::{StateError, StateResult};
use crate::registry::{KeyDecl, ReplicaTag, StateHandle, StateRegistry};
use crate::value::StateValue;

/// Root of the state tree.
#[derive(Clone)]
pub struct PlanetState {
    registry: Arc<StateRegistry>,
    handle: StateHandle,
}

impl PlanetState {
    /// Create a planet with an empty atmosphere.
    pub fn create(registry: Arc<StateRegistry>, name: &str, version: &str) -> Self {
        let atmosphere = registry.create_object(
            "atmosphere",
            ReplicaTag::Local,
            &[
                KeyDecl::scalar("name", "atmosphere"),
                KeyDecl::scalar("parent", StateValue::Null),
                KeyDecl::list("components"),
            ],
        );
        let handle = registry.create_object(
            "planet",
            ReplicaTag::Local,
            &[
                KeyDecl::scalar("name", name),
                KeyDecl::scalar("version", version),
                KeyDecl::scalar("manager", StateValue::Null),
                KeyDecl::scalar("atmosphere", atmosphere),
                KeyDecl::list("flows"),
                KeyDecl::dict("messages"),
            ],
        );
        Self { registry, handle }
    }

    /// Wrap an existing object, typically a replica after
    /// instantiation.
    pub fn wrap(registry: Arc<StateRegistry>, handle: StateHandle) -> Self {
        Self { registry, handle }
    }

    pub fn handle(&self) -> StateHandle {
        self.handle
    }

    pub fn registry(&self) -> &Arc<StateRegistry> {
        &self.registry
    }

    pub fn name(&self) -> StateResult<String> {
        require_str(self.registry.get(self.handle, "name")?, "name")
    }

    pub async fn set_name(&self, name: &str) -> StateResult<()> {
        self.registry.set(self.handle, "name", name).await
    }

    pub fn atmosphere(&self) -> StateResult<AtmosphereState> {
        let value = self.registry.get(self.handle, "atmosphere")?;
        let handle = value.as_ref_handle().ok_or(StateError::MissingEntry {
            key: "atmosphere".to_string(),
            detail: "planet has no atmosphere".to_string(),
        })?;
        Ok(AtmosphereState {
            registry: self.registry.clone(),
            handle,
        })
    }

    pub fn flows(&self) -> StateResult<Vec<FlowState>> {
        Ok(self
            .registry
            .get_list(self.handle, "flows")?
            .into_iter()
            .filter_map(|v| v.as_ref_handle())
            .map(|handle| FlowState {
                registry: self.registry.clone(),
                handle,
            })
            .collect())
    }

    pub fn flow_by_name(&self, name: &str) -> StateResult<Option<FlowState>> {
        for flow in self.flows()? {
            if flow.name()? == name {
                return Ok(Some(flow));
            }
        }
        Ok(None)
    }

    /// Add a flow; flow names are unique within a planet, so an
    /// existing flow of the same name is returned instead.
    pub async fn ensure_flow(&self, name: &str) -> StateResult<FlowState> {
        if let Some(existing) = self.flow_by_name(name)? {
            return Ok(existing);
        }
        let handle = self.registry.create_object(
            "flow",
            ReplicaTag::Local,
            &[
                KeyDecl::scalar("name", name),
                KeyDecl::scalar("parent", self.handle),
                KeyDecl::list("components"),
            ],
        );
        self.registry.append(self.handle, "flows", handle).await?;
        Ok(FlowState {
            registry: self.registry.clone(),
            handle,
        })
    }

    pub async fn remove_flow(&self, flow: &FlowState) -> StateResult<()> {
        self.registry
            .remove(self.handle, "flows", flow.handle)
            .await?;
        self.registry.release(flow.handle);
        Ok(())
    }

    /// Post a planet-level message, replacing any previous message
    /// with the same id.
    pub async fn post_message(&self, message: &ComponentMessage) -> StateResult<()> {
        let encoded = serde_json::to_string(message)
            .map_err(|e| StateError::BadSnapshot(e.to_string()))?;
        self.registry
            .setitem(self.handle, "messages", &message.id, encoded)
            .await
    }
}

/// A named flow owning components.
#[derive(Clone)]
pub struct FlowState {
    registry: Arc<StateRegistry>,
    handle: StateHandle,
}

/// The container for components living outside any flow.
#[derive(Clone)]
pub struct AtmosphereState {
    registry: Arc<StateRegistry>,
    handle: StateHandle,
}

macro_rules! container_impl {
    ($ty:ident) => {
        impl $ty {
            pub fn wrap(registry: Arc<StateRegistry>, handle: StateHandle) -> Self {
                Self { registry, handle }
            }

            pub fn handle(&self) -> StateHandle {
                self.handle
            }

            pub fn name(&self) -> StateResult<String> {
                require_str(self.registry.get(self.handle, "name")?, "name")
            }

            pub fn components(&self) -> StateResult<Vec<ComponentState>> {
                Ok(self
                    .registry
                    .get_list(self.handle, "components")?
                    .into_iter()
                    .filter_map(|v| v.as_ref_handle())
                    .map(|handle| ComponentState {
                        registry: self.registry.clone(),
                        handle,
                    })
                    .collect())
            }

            pub fn component_by_name(&self, name: &str) -> StateResult<Option<ComponentState>> {
                for component in self.components()? {
                    if component.name()? == name {
                        return Ok(Some(component));
                    }
                }
                Ok(None)
            }

            /// Create a component in this container. Component names
            /// are unique within their parent.
            pub async fn add_component(
                &self,
                name: &str,
                component_type: &str,
                config_json: &str,
            ) -> StateResult<ComponentState> {
                if self.component_by_name(name)?.is_some() {
                    return Err(StateError::Duplicate {
                        key: "components".to_string(),
                        detail: format!("component name {name}"),
                    });
                }
                let handle = self.registry.create_object(
                    "component",
                    ReplicaTag::Local,
                    &component_keys(name, component_type, self.handle, config_json),
                );
                self.registry
                    .append(self.handle, "components", handle)
                    .await?;
                Ok(ComponentState {
                    registry: self.registry.clone(),
                    handle,
                })
            }

            pub async fn remove_component(&self, component: &ComponentState) -> StateResult<()> {
                self.registry
                    .remove(self.handle, "components", component.handle)
                    .await?;
                self.registry.release(component.handle);
                Ok(())
            }
        }
    };
}

container_impl!(FlowState);
container_impl!(AtmosphereState);

fn component_keys(
    name: &str,
    component_type: &str,
    parent: StateHandle,
    config_json: &str,
) -> Vec<KeyDecl> {
    vec![
        // Authored at the manager.
        KeyDecl::scalar("name", name),
        KeyDecl::scalar("type", component_type),
        KeyDecl::scalar("parent", parent),
        KeyDecl::scalar("moodPending", StateValue::Null),
        KeyDecl::scalar("workerRequested", StateValue::Null),
        KeyDecl::scalar("config", config_json),
        KeyDecl::scalar("lastKnownPid", StateValue::Null),
        // Proxied up from the job.
        KeyDecl::scalar("mood", StateValue::Null),
        KeyDecl::scalar("manager-ip", StateValue::Null),
        KeyDecl::scalar("pid", StateValue::Null),
        KeyDecl::scalar("workerName", StateValue::Null),
        KeyDecl::list("messages"),
    ]
}

/// One component's state, authored at the manager and partly proxied
/// from the job running it.
#[derive(Clone)]
pub struct ComponentState {
    registry: Arc<StateRegistry>,
    handle: StateHandle,
}

impl ComponentState {
    pub fn wrap(registry: Arc<StateRegistry>, handle: StateHandle) -> Self {
        Self { registry, handle }
    }

    pub fn handle(&self) -> StateHandle {
        self.handle
    }

    pub fn name(&self) -> StateResult<String> {
        require_str(self.registry.get(self.handle, "name")?, "name")
    }

    pub fn component_type(&self) -> StateResult<String> {
        require_str(self.registry.get(self.handle, "type")?, "type")
    }

    pub fn parent(&self) -> StateResult<Option<StateHandle>> {
        Ok(self.registry.get(self.handle, "parent")?.as_ref_handle())
    }

    pub fn config_json(&self) -> StateResult<String> {
        require_str(self.registry.get(self.handle, "config")?, "config")
    }

    pub fn mood(&self) -> StateResult<Option<Mood>> {
        Ok(self
            .registry
            .get(self.handle, "mood")?
            .as_int()
            .and_then(|i| u8::try_from(i).ok())
            .and_then(Mood::from_ordinal))
    }

    pub fn mood_pending(&self) -> StateResult<Option<Mood>> {
        Ok(self
            .registry
            .get(self.handle, "moodPending")?
            .as_int()
            .and_then(|i| u8::try_from(i).ok())
            .and_then(Mood::from_ordinal))
    }

    /// Set the proxied mood. Clears `moodPending` when the mood
    /// reaches it.
    pub async fn set_mood(&self, mood: Mood) -> StateResult<()> {
        self.registry
            .set(self.handle, "mood", mood.ordinal() as i64)
            .await?;
        if self.mood_pending()? == Some(mood) {
            self.registry
                .set(self.handle, "moodPending", StateValue::Null)
                .await?;
        }
        Ok(())
    }

    pub async fn set_mood_pending(&self, mood: Option<Mood>) -> StateResult<()> {
        let value = match mood {
            Some(m) => StateValue::Int(m.ordinal() as i64),
            None => StateValue::Null,
        };
        self.registry.set(self.handle, "moodPending", value).await
    }

    pub fn worker_requested(&self) -> StateResult<Option<String>> {
        Ok(self
            .registry
            .get(self.handle, "workerRequested")?
            .as_str()
            .map(str::to_string))
    }

    pub async fn set_worker_requested(&self, worker: Option<&str>) -> StateResult<()> {
        self.registry
            .set(self.handle, "workerRequested", StateValue::from(worker))
            .await
    }

    pub fn worker_name(&self) -> StateResult<Option<String>> {
        Ok(self
            .registry
            .get(self.handle, "workerName")?
            .as_str()
            .map(str::to_string))
    }

    pub async fn set_worker_name(&self, worker: Option<&str>) -> StateResult<()> {
        self.registry
            .set(self.handle, "workerName", StateValue::from(worker))
            .await
    }

    pub fn pid(&self) -> StateResult<Option<i64>> {
        Ok(self.registry.get(self.handle, "pid")?.as_int())
    }

    pub async fn set_pid(&self, pid: Option<i64>) -> StateResult<()> {
        self.registry
            .set(self.handle, "pid", StateValue::from(pid))
            .await?;
        if let Some(pid) = pid {
            self.registry.set(self.handle, "lastKnownPid", pid).await?;
        }
        Ok(())
    }

    pub fn last_known_pid(&self) -> StateResult<Option<i64>> {
        Ok(self.registry.get(self.handle, "lastKnownPid")?.as_int())
    }

    pub async fn set_manager_ip(&self, ip: Option<&str>) -> StateResult<()> {
        self.registry
            .set(self.handle, "manager-ip", StateValue::from(ip))
            .await
    }

    /// Append a message, first removing any earlier message with the
    /// same id so re-posts do not pile up.
    pub async fn post_message(&self, message: &ComponentMessage) -> StateResult<()> {
        let encoded = serde_json::to_string(message)
            .map_err(|e| StateError::BadSnapshot(e.to_string()))?;
        for existing in self.messages()? {
            if existing.id == message.id {
                let old = serde_json::to_string(&existing)
                    .map_err(|e| StateError::BadSnapshot(e.to_string()))?;
                self.registry.remove(self.handle, "messages", old).await?;
            }
        }
        self.registry.append(self.handle, "messages", encoded).await
    }

    pub fn messages(&self) -> StateResult<Vec<ComponentMessage>> {
        let mut out = Vec::new();
        for value in self.registry.get_list(self.handle, "messages")? {
            if let Some(json) = value.as_str() {
                if let Ok(message) = serde_json::from_str(json) {
                    out.push(message);
                }
            }
        }
        Ok(out)
    }

    /// Full avatar id, `/container/component`.
    pub fn avatar_id(&self) -> StateResult<String> {
        let parent = self.parent()?.ok_or(StateError::MissingEntry {
            key: "parent".to_string(),
            detail: "component has no parent".to_string(),
        })?;
        let container = require_str(self.registry.get(parent, "name")?, "name")?;
        Ok(format!("/{}/{}", container, self.name()?))
    }
}

fn require_str(value: StateValue, key: &str) -> StateResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or(StateError::WrongShape {
            key: key.to_string(),
            expected: "scalar",
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::MessageLevel;

    fn planet() -> PlanetState {
        PlanetState::create(Arc::new(StateRegistry::new()), "testing", "0.1.0")
    }

    #[tokio::test]
    async fn planet_owns_one_atmosphere() {
        let planet = planet();
        let atmosphere = planet.atmosphere().unwrap();
        assert_eq!(atmosphere.name().unwrap(), "atmosphere");
        assert!(atmosphere.components().unwrap().is_empty());
    }

    #[tokio::test]
    async fn flow_names_are_unique() {
        let planet = planet();
        let a = planet.ensure_flow("default").await.unwrap();
        let b = planet.ensure_flow("default").await.unwrap();
        assert_eq!(a.handle(), b.handle());
        assert_eq!(planet.flows().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn component_names_unique_within_parent() {
        let planet = planet();
        let flow = planet.ensure_flow("default").await.unwrap();
        flow.add_component("producer", "videotest", "{}").await.unwrap();
        assert!(flow
            .add_component("producer", "videotest", "{}")
            .await
            .is_err());

        // Same name in a different container is fine.
        planet
            .atmosphere()
            .unwrap()
            .add_component("producer", "videotest", "{}")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn mood_pending_clears_when_mood_reaches_it() {
        let planet = planet();
        let flow = planet.ensure_flow("default").await.unwrap();
        let component = flow
            .add_component("producer", "videotest", "{}")
            .await
            .unwrap();

        component.set_mood_pending(Some(Mood::Happy)).await.unwrap();
        component.set_mood(Mood::Waking).await.unwrap();
        assert_eq!(component.mood_pending().unwrap(), Some(Mood::Happy));

        component.set_mood(Mood::Happy).await.unwrap();
        assert_eq!(component.mood_pending().unwrap(), None);
        assert_eq!(component.mood().unwrap(), Some(Mood::Happy));
    }

    #[tokio::test]
    async fn avatar_id_names_container_and_component() {
        let planet = planet();
        let flow = planet.ensure_flow("live").await.unwrap();
        let component = flow
            .add_component("encoder", "theora", "{}")
            .await
            .unwrap();
        assert_eq!(component.avatar_id().unwrap(), "/live/encoder");

        let util = planet
            .atmosphere()
            .unwrap()
            .add_component("porter", "porter", "{}")
            .await
            .unwrap();
        assert_eq!(util.avatar_id().unwrap(), "/atmosphere/porter");
    }

    #[tokio::test]
    async fn set_pid_tracks_last_known() {
        let planet = planet();
        let flow = planet.ensure_flow("default").await.unwrap();
        let component = flow
            .add_component("producer", "videotest", "{}")
            .await
            .unwrap();

        component.set_pid(Some(4242)).await.unwrap();
        component.set_pid(None).await.unwrap();
        assert_eq!(component.pid().unwrap(), None);
        assert_eq!(component.last_known_pid().unwrap(), Some(4242));
    }

    #[tokio::test]
    async fn messages_deduplicate_by_id() {
        let planet = planet();
        let flow = planet.ensure_flow("default").await.unwrap();
        let component = flow
            .add_component("producer", "videotest", "{}")
            .await
            .unwrap();

        let mut message =
            ComponentMessage::new(MessageLevel::Warning, "eater-starved", "no data");
        component.post_message(&message).await.unwrap();
        message.text = "still no data".to_string();
        component.post_message(&message).await.unwrap();

        let messages = component.messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "still no data");
    }

    #[tokio::test]
    async fn remove_component_releases_its_state() {
        let planet = planet();
        let flow = planet.ensure_flow("default").await.unwrap();
        let component = flow
            .add_component("producer", "videotest", "{}")
            .await
            .unwrap();
        let handle = component.handle();

        flow.remove_component(&component).await.unwrap();
        assert!(flow.components().unwrap().is_empty());
        assert!(!planet.registry().contains(handle));
    }
}
