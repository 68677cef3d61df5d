//! Wire form of state events and handle translation.
//!
//! Handles are registry-local. When a change event crosses a
//! connection, any `Ref` value it carries is expanded into the child's
//! full snapshot so the receiving side can build its own replica; the
//! receiver keeps a [`HandleMap`] from producer handles to the local
//! handles it allocated, and translates every incoming event through
//! it. A ref to a child the receiver already knows travels as a plain
//! producer handle instead of a snapshot.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};
use crate::events::{StateChange, StateEvent};
use crate::registry::{StateHandle, StateRegistry};
use crate::value::{Snapshot, StateValue};

/// Producer-handle → local-handle translation table, one per upstream
/// connection.
#[derive(Debug, Default)]
pub struct HandleMap {
    to_local: HashMap<u64, StateHandle>,
    to_remote: HashMap<u64, StateHandle>,
}

impl HandleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, remote: StateHandle, local: StateHandle) {
        self.to_local.insert(remote.0, local);
        self.to_remote.insert(local.0, remote);
    }

    pub fn local(&self, remote: StateHandle) -> Option<StateHandle> {
        self.to_local.get(&remote.0).copied()
    }

    pub fn remote(&self, local: StateHandle) -> Option<StateHandle> {
        self.to_remote.get(&local.0).copied()
    }

    /// Drop the translation for a released local replica.
    pub fn forget_local(&mut self, local: StateHandle) {
        if let Some(remote) = self.to_remote.remove(&local.0) {
            self.to_local.remove(&remote.0);
        }
    }

    pub fn len(&self) -> usize {
        self.to_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_local.is_empty()
    }
}

/// A value as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "w", content = "c", rename_all = "snake_case")]
pub enum WireValue {
    /// A scalar, or a ref to a child the peer already replicated.
    Plain(StateValue),
    /// A child the peer has not seen yet, expanded in full.
    Tree(Snapshot),
}

/// [`StateChange`] with wire-safe values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WireChange {
    Set { key: String, value: WireValue },
    Append { key: String, value: WireValue },
    Remove { key: String, value: WireValue },
    SetItem {
        key: String,
        subkey: String,
        value: WireValue,
    },
    DelItem { key: String, subkey: String },
    Invalidate,
}

/// A change event addressed by producer handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub handle: StateHandle,
    pub change: WireChange,
}

/// Producer side: turn a local event into its wire form, expanding a
/// ref introduced by `set`, `append`, or `setitem` into the child's
/// snapshot. A ref removed by `remove` names a child the peer already
/// holds, so it stays a plain handle.
pub fn expand_event(registry: &StateRegistry, event: &StateEvent) -> StateResult<WireEvent> {
    let change = match &event.change {
        StateChange::Set { key, value } => WireChange::Set {
            key: key.clone(),
            value: expand_value(registry, value)?,
        },
        StateChange::Append { key, value } => WireChange::Append {
            key: key.clone(),
            value: expand_value(registry, value)?,
        },
        StateChange::Remove { key, value } => WireChange::Remove {
            key: key.clone(),
            value: WireValue::Plain(value.clone()),
        },
        StateChange::SetItem { key, subkey, value } => WireChange::SetItem {
            key: key.clone(),
            subkey: subkey.clone(),
            value: expand_value(registry, value)?,
        },
        StateChange::DelItem { key, subkey } => WireChange::DelItem {
            key: key.clone(),
            subkey: subkey.clone(),
        },
        StateChange::Invalidate => WireChange::Invalidate,
    };
    Ok(WireEvent {
        handle: event.handle,
        change,
    })
}

fn expand_value(registry: &StateRegistry, value: &StateValue) -> StateResult<WireValue> {
    match value {
        StateValue::Ref(child) => Ok(WireValue::Tree(registry.snapshot(*child)?)),
        other => Ok(WireValue::Plain(other.clone())),
    }
}

/// Receiver side: translate a wire event into a local event,
/// instantiating any expanded child trees into `registry` and
/// recording their handles in `map`.
pub fn resolve_event(
    registry: &StateRegistry,
    wire: WireEvent,
    map: &mut HandleMap,
) -> StateResult<StateEvent> {
    let handle = map
        .local(wire.handle)
        .ok_or(StateError::UnmappedHandle(wire.handle.0))?;
    let change = match wire.change {
        WireChange::Set { key, value } => StateChange::Set {
            key,
            value: resolve_value(registry, value, map)?,
        },
        WireChange::Append { key, value } => StateChange::Append {
            key,
            value: resolve_value(registry, value, map)?,
        },
        WireChange::Remove { key, value } => StateChange::Remove {
            key,
            value: resolve_value(registry, value, map)?,
        },
        WireChange::SetItem { key, subkey, value } => StateChange::SetItem {
            key,
            subkey,
            value: resolve_value(registry, value, map)?,
        },
        WireChange::DelItem { key, subkey } => StateChange::DelItem { key, subkey },
        WireChange::Invalidate => StateChange::Invalidate,
    };
    Ok(StateEvent { handle, change })
}

fn resolve_value(
    registry: &StateRegistry,
    value: WireValue,
    map: &mut HandleMap,
) -> StateResult<StateValue> {
    match value {
        WireValue::Plain(StateValue::Ref(remote)) => map
            .local(remote)
            .map(StateValue::Ref)
            .ok_or(StateError::UnmappedHandle(remote.0)),
        WireValue::Plain(value) => Ok(value),
        WireValue::Tree(snapshot) => {
            // Reconnections can resend a tree the replica already
            // holds; reuse the existing copy instead of duplicating.
            if let Some(existing) = map.local(snapshot.handle) {
                return Ok(StateValue::Ref(existing));
            }
            let local = registry.instantiate(&snapshot, map)?;
            Ok(StateValue::Ref(local))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{KeyDecl, ReplicaTag};

    fn producer_tree(reg: &StateRegistry) -> (StateHandle, StateHandle) {
        let flow = reg.create_object(
            "flow",
            ReplicaTag::Local,
            &[KeyDecl::scalar("name", "default"), KeyDecl::list("components")],
        );
        let component = reg.create_object(
            "component",
            ReplicaTag::Local,
            &[
                KeyDecl::scalar("name", "producer"),
                KeyDecl::scalar("mood", 3i64),
            ],
        );
        (flow, component)
    }

    async fn mirror(
        producer: &StateRegistry,
        replica: &StateRegistry,
        map: &mut HandleMap,
        event: StateEvent,
    ) {
        let wire = expand_event(producer, &event).unwrap();
        // Frame round trip, as the RPC layer would do it.
        let bytes = serde_json::to_vec(&wire).unwrap();
        let wire: WireEvent = serde_json::from_slice(&bytes).unwrap();
        let local = resolve_event(replica, wire, map).unwrap();
        replica.apply_event(local).await.unwrap();
    }

    #[tokio::test]
    async fn replica_tracks_producer_through_wire_events() {
        let producer = StateRegistry::new();
        let replica = StateRegistry::new();
        let (flow, component) = producer_tree(&producer);

        let mut map = HandleMap::new();
        let snapshot = producer.snapshot(flow).unwrap();
        replica.instantiate(&snapshot, &mut map).unwrap();

        // Child appears, mutates, and disappears again.
        producer.append(flow, "components", component).await.unwrap();
        mirror(
            &producer,
            &replica,
            &mut map,
            StateEvent {
                handle: flow,
                change: StateChange::Append {
                    key: "components".to_string(),
                    value: component.into(),
                },
            },
        )
        .await;

        producer.set(component, "mood", 0i64).await.unwrap();
        mirror(
            &producer,
            &replica,
            &mut map,
            StateEvent {
                handle: component,
                change: StateChange::Set {
                    key: "mood".to_string(),
                    value: 0i64.into(),
                },
            },
        )
        .await;

        assert_eq!(
            replica.snapshot(map.local(flow).unwrap()).unwrap().to_tree(),
            producer.snapshot(flow).unwrap().to_tree()
        );

        producer.remove(flow, "components", component).await.unwrap();
        mirror(
            &producer,
            &replica,
            &mut map,
            StateEvent {
                handle: flow,
                change: StateChange::Remove {
                    key: "components".to_string(),
                    value: component.into(),
                },
            },
        )
        .await;

        assert_eq!(
            replica.snapshot(map.local(flow).unwrap()).unwrap().to_tree(),
            producer.snapshot(flow).unwrap().to_tree()
        );
    }

    #[tokio::test]
    async fn event_for_unknown_handle_is_rejected() {
        let replica = StateRegistry::new();
        let mut map = HandleMap::new();
        let wire = WireEvent {
            handle: StateHandle(99),
            change: WireChange::Invalidate,
        };
        match resolve_event(&replica, wire, &mut map) {
            Err(StateError::UnmappedHandle(99)) => {}
            other => panic!("expected UnmappedHandle, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resent_tree_reuses_existing_replica() {
        let producer = StateRegistry::new();
        let replica = StateRegistry::new();
        let (flow, component) = producer_tree(&producer);
        producer.append(flow, "components", component).await.unwrap();

        let mut map = HandleMap::new();
        let snapshot = producer.snapshot(flow).unwrap();
        replica.instantiate(&snapshot, &mut map).unwrap();
        let first = map.local(component).unwrap();

        let wire = expand_event(
            &producer,
            &StateEvent {
                handle: flow,
                change: StateChange::Append {
                    key: "components".to_string(),
                    value: component.into(),
                },
            },
        )
        .unwrap();
        let resolved = resolve_event(&replica, wire, &mut map).unwrap();
        match resolved.change {
            StateChange::Append { value, .. } => {
                assert_eq!(value.as_ref_handle(), Some(first));
            }
            other => panic!("expected Append, got {other:?}"),
        }
    }

    #[test]
    fn forget_local_drops_both_directions() {
        let mut map = HandleMap::new();
        map.insert(StateHandle(7), StateHandle(1));
        map.forget_local(StateHandle(1));
        assert!(map.is_empty());
        assert_eq!(map.local(StateHandle(7)), None);
        assert_eq!(map.remote(StateHandle(1)), None);
    }
}
