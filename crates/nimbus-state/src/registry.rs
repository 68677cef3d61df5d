//! The state registry — arena of observable state objects.
//!
//! All state objects of a process live in one registry and address
//! each other by [`StateHandle`]. Mutators run in two phases: apply
//! under the lock, then deliver change events to observers without
//! holding it. Observer acknowledgements are awaited serially; the
//! returned future is the mutation's completion token.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::events::{
    ListenerInterest, ObserverHook, StateChange, StateEvent, StateListener, StateObserver,
};
use crate::value::{FieldShape, Snapshot, SnapshotEntry, SnapshotField, StateValue};

/// Opaque address of a state object within its registry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct StateHandle(pub u64);

impl std::fmt::Display for StateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Whether an object is an authoritative copy, a replica, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaTag {
    Local,
    Remote,
    Proxy,
}

/// Declaration of one field on a state object.
#[derive(Debug, Clone)]
pub struct KeyDecl {
    pub name: &'static str,
    pub shape: FieldShape,
    pub initial: StateValue,
}

impl KeyDecl {
    pub fn scalar(name: &'static str, initial: impl Into<StateValue>) -> Self {
        Self {
            name,
            shape: FieldShape::Scalar,
            initial: initial.into(),
        }
    }

    pub fn list(name: &'static str) -> Self {
        Self {
            name,
            shape: FieldShape::List,
            initial: StateValue::Null,
        }
    }

    pub fn dict(name: &'static str) -> Self {
        Self {
            name,
            shape: FieldShape::Dict,
            initial: StateValue::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Field {
    Scalar(StateValue),
    List(Vec<StateValue>),
    Dict(BTreeMap<String, StateValue>),
}

/// Identifies an attached observer for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

struct ObjectSlot {
    kind: String,
    tag: ReplicaTag,
    fields: HashMap<String, Field>,
    observers: Vec<(ObserverId, Arc<dyn StateObserver>)>,
    listeners: Vec<(ListenerInterest, Arc<dyn StateListener>)>,
    hook: Option<Arc<dyn ObserverHook>>,
    invalidated: bool,
    next_observer_id: u64,
}

struct Inner {
    next_handle: u64,
    objects: HashMap<u64, ObjectSlot>,
}

/// Arena of observable state objects.
pub struct StateRegistry {
    inner: Mutex<Inner>,
}

/// Work captured under the lock, executed outside it.
struct Dispatch {
    event: StateEvent,
    listeners: Vec<Arc<dyn StateListener>>,
    observers: Vec<Arc<dyn StateObserver>>,
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StateRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_handle: 1,
                objects: HashMap::new(),
            }),
        }
    }

    /// Create an object with the given declared keys.
    pub fn create_object(&self, kind: &str, tag: ReplicaTag, keys: &[KeyDecl]) -> StateHandle {
        let mut fields = HashMap::new();
        for decl in keys {
            let field = match decl.shape {
                FieldShape::Scalar => Field::Scalar(decl.initial.clone()),
                FieldShape::List => Field::List(Vec::new()),
                FieldShape::Dict => Field::Dict(BTreeMap::new()),
            };
            fields.insert(decl.name.to_string(), field);
        }

        let mut inner = self.inner.lock().unwrap();
        let handle = StateHandle(inner.next_handle);
        inner.next_handle += 1;
        inner.objects.insert(
            handle.0,
            ObjectSlot {
                kind: kind.to_string(),
                tag,
                fields,
                observers: Vec::new(),
                listeners: Vec::new(),
                hook: None,
                invalidated: false,
                next_observer_id: 1,
            },
        );
        debug!(%handle, kind, "state object created");
        handle
    }

    /// Drop an object and, recursively, every object its fields
    /// reference. The application decides when; the registry never
    /// releases on its own.
    pub fn release(&self, handle: StateHandle) {
        let mut inner = self.inner.lock().unwrap();
        release_recursive(&mut inner, handle);
    }

    pub fn contains(&self, handle: StateHandle) -> bool {
        self.inner.lock().unwrap().objects.contains_key(&handle.0)
    }

    pub fn kind(&self, handle: StateHandle) -> StateResult<String> {
        let inner = self.inner.lock().unwrap();
        let slot = slot_ref(&inner, handle)?;
        Ok(slot.kind.clone())
    }

    pub fn tag(&self, handle: StateHandle) -> StateResult<ReplicaTag> {
        let inner = self.inner.lock().unwrap();
        Ok(slot_ref(&inner, handle)?.tag)
    }

    pub fn is_invalidated(&self, handle: StateHandle) -> StateResult<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(slot_ref(&inner, handle)?.invalidated)
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get(&self, handle: StateHandle, key: &str) -> StateResult<StateValue> {
        let inner = self.inner.lock().unwrap();
        let slot = slot_ref(&inner, handle)?;
        match field_ref(slot, key)? {
            Field::Scalar(value) => Ok(value.clone()),
            _ => Err(StateError::WrongShape {
                key: key.to_string(),
                expected: "scalar",
            }),
        }
    }

    pub fn get_list(&self, handle: StateHandle, key: &str) -> StateResult<Vec<StateValue>> {
        let inner = self.inner.lock().unwrap();
        let slot = slot_ref(&inner, handle)?;
        match field_ref(slot, key)? {
            Field::List(values) => Ok(values.clone()),
            _ => Err(StateError::WrongShape {
                key: key.to_string(),
                expected: "list",
            }),
        }
    }

    pub fn get_dict(
        &self,
        handle: StateHandle,
        key: &str,
    ) -> StateResult<BTreeMap<String, StateValue>> {
        let inner = self.inner.lock().unwrap();
        let slot = slot_ref(&inner, handle)?;
        match field_ref(slot, key)? {
            Field::Dict(entries) => Ok(entries.clone()),
            _ => Err(StateError::WrongShape {
                key: key.to_string(),
                expected: "dict",
            }),
        }
    }

    pub fn get_item(
        &self,
        handle: StateHandle,
        key: &str,
        subkey: &str,
    ) -> StateResult<Option<StateValue>> {
        Ok(self.get_dict(handle, key)?.get(subkey).cloned())
    }

    // ── Mutators ───────────────────────────────────────────────────

    pub async fn set(
        &self,
        handle: StateHandle,
        key: &str,
        value: impl Into<StateValue>,
    ) -> StateResult<()> {
        let change = StateChange::Set {
            key: key.to_string(),
            value: value.into(),
        };
        let dispatch = self.apply(handle, change)?;
        self.run_dispatch(dispatch).await;
        Ok(())
    }

    pub async fn append(
        &self,
        handle: StateHandle,
        key: &str,
        value: impl Into<StateValue>,
    ) -> StateResult<()> {
        let change = StateChange::Append {
            key: key.to_string(),
            value: value.into(),
        };
        let dispatch = self.apply(handle, change)?;
        self.run_dispatch(dispatch).await;
        Ok(())
    }

    pub async fn remove(
        &self,
        handle: StateHandle,
        key: &str,
        value: impl Into<StateValue>,
    ) -> StateResult<()> {
        let change = StateChange::Remove {
            key: key.to_string(),
            value: value.into(),
        };
        let dispatch = self.apply(handle, change)?;
        self.run_dispatch(dispatch).await;
        Ok(())
    }

    pub async fn setitem(
        &self,
        handle: StateHandle,
        key: &str,
        subkey: &str,
        value: impl Into<StateValue>,
    ) -> StateResult<()> {
        let change = StateChange::SetItem {
            key: key.to_string(),
            subkey: subkey.to_string(),
            value: value.into(),
        };
        let dispatch = self.apply(handle, change)?;
        self.run_dispatch(dispatch).await;
        Ok(())
    }

    pub async fn delitem(
        &self,
        handle: StateHandle,
        key: &str,
        subkey: &str,
    ) -> StateResult<()> {
        let change = StateChange::DelItem {
            key: key.to_string(),
            subkey: subkey.to_string(),
        };
        let dispatch = self.apply(handle, change)?;
        self.run_dispatch(dispatch).await;
        Ok(())
    }

    /// Mark the object invalid and tell observers and listeners.
    /// Application-initiated only; disconnection never invalidates.
    pub async fn invalidate(&self, handle: StateHandle) -> StateResult<()> {
        let dispatch = self.apply(handle, StateChange::Invalidate)?;
        self.run_dispatch(dispatch).await;
        Ok(())
    }

    /// Replay a change event against a replica (or proxy).
    ///
    /// The event's handle must already be translated to this
    /// registry's handle space. Proxies re-emit the change to their
    /// own observers, except invalidation.
    pub async fn apply_event(&self, event: StateEvent) -> StateResult<()> {
        let dispatch = self.apply(event.handle, event.change)?;
        self.run_dispatch(dispatch).await;
        Ok(())
    }

    /// Apply a change under the lock; collect the dispatch work.
    fn apply(&self, handle: StateHandle, change: StateChange) -> StateResult<Dispatch> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .objects
            .get_mut(&handle.0)
            .ok_or(StateError::NoSuchHandle(handle.0))?;

        apply_change(slot, &change)?;

        let listeners = slot
            .listeners
            .iter()
            .filter(|(interest, _)| interest.covers(&change))
            .map(|(_, listener)| listener.clone())
            .collect();

        // Invalidation stops at a proxy; everything else re-emits.
        let emit = match slot.tag {
            ReplicaTag::Local => true,
            ReplicaTag::Proxy => change != StateChange::Invalidate,
            ReplicaTag::Remote => false,
        };
        let observers = if emit {
            slot.observers.iter().map(|(_, o)| o.clone()).collect()
        } else {
            Vec::new()
        };

        Ok(Dispatch {
            event: StateEvent { handle, change },
            listeners,
            observers,
        })
    }

    /// Notify listeners synchronously, then deliver to observers and
    /// await every acknowledgement. Failures are logged and contained.
    async fn run_dispatch(&self, dispatch: Dispatch) {
        for listener in &dispatch.listeners {
            if let Err(e) = listener.on_change(dispatch.event.handle, &dispatch.event.change) {
                warn!(handle = %dispatch.event.handle, error = %e, "state listener failed");
            }
        }
        for observer in &dispatch.observers {
            if let Err(e) = observer.deliver(dispatch.event.clone()).await {
                warn!(handle = %dispatch.event.handle, error = %e, "observer delivery failed");
            }
        }
    }

    // ── Observers, listeners, hooks ────────────────────────────────

    /// Attach an observer; fires the object's hook with the new count.
    pub fn add_observer(
        &self,
        handle: StateHandle,
        observer: Arc<dyn StateObserver>,
    ) -> StateResult<ObserverId> {
        let (id, hook, count) = {
            let mut inner = self.inner.lock().unwrap();
            let slot = inner
                .objects
                .get_mut(&handle.0)
                .ok_or(StateError::NoSuchHandle(handle.0))?;
            let id = ObserverId(slot.next_observer_id);
            slot.next_observer_id += 1;
            slot.observers.push((id, observer));
            (id, slot.hook.clone(), slot.observers.len())
        };
        if let Some(hook) = hook {
            hook.observer_appended(count);
        }
        Ok(id)
    }

    /// Detach an observer; fires the hook with the remaining count.
    pub fn remove_observer(&self, handle: StateHandle, id: ObserverId) -> StateResult<()> {
        let (hook, count) = {
            let mut inner = self.inner.lock().unwrap();
            let slot = inner
                .objects
                .get_mut(&handle.0)
                .ok_or(StateError::NoSuchHandle(handle.0))?;
            let before = slot.observers.len();
            slot.observers.retain(|(oid, _)| *oid != id);
            if slot.observers.len() == before {
                return Ok(());
            }
            (slot.hook.clone(), slot.observers.len())
        };
        if let Some(hook) = hook {
            hook.observer_removed(count);
        }
        Ok(())
    }

    pub fn observer_count(&self, handle: StateHandle) -> StateResult<usize> {
        let inner = self.inner.lock().unwrap();
        Ok(slot_ref(&inner, handle)?.observers.len())
    }

    /// Register a listener with the given interest.
    ///
    /// If the object was already invalidated and the listener is
    /// interested in invalidation, it is called back immediately.
    pub fn add_listener(
        &self,
        handle: StateHandle,
        listener: Arc<dyn StateListener>,
        interest: ListenerInterest,
    ) -> StateResult<()> {
        if !interest.any() {
            return Err(StateError::EmptyInterest);
        }
        let catch_up = {
            let mut inner = self.inner.lock().unwrap();
            let slot = inner
                .objects
                .get_mut(&handle.0)
                .ok_or(StateError::NoSuchHandle(handle.0))?;
            slot.listeners.push((interest, listener.clone()));
            slot.invalidated && interest.invalidate
        };
        if catch_up {
            if let Err(e) = listener.on_change(handle, &StateChange::Invalidate) {
                warn!(%handle, error = %e, "state listener failed during invalidate catch-up");
            }
        }
        Ok(())
    }

    pub fn set_hook(&self, handle: StateHandle, hook: Arc<dyn ObserverHook>) -> StateResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .objects
            .get_mut(&handle.0)
            .ok_or(StateError::NoSuchHandle(handle.0))?;
        slot.hook = Some(hook);
        Ok(())
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Deep snapshot of the object and every object it references.
    pub fn snapshot(&self, handle: StateHandle) -> StateResult<Snapshot> {
        let inner = self.inner.lock().unwrap();
        snapshot_recursive(&inner, handle)
    }

    /// Build a `Remote` replica subtree from a snapshot, recording
    /// producer-handle → local-handle translations in `map`.
    pub fn instantiate(
        &self,
        snapshot: &Snapshot,
        map: &mut crate::sync::HandleMap,
    ) -> StateResult<StateHandle> {
        // Children first, so refs can be rewritten on the way up.
        let mut fields = HashMap::new();
        for (key, field) in &snapshot.fields {
            let resolved = match field {
                SnapshotField::Scalar(entry) => {
                    Field::Scalar(self.resolve_entry(entry, map)?)
                }
                SnapshotField::List(entries) => Field::List(
                    entries
                        .iter()
                        .map(|e| self.resolve_entry(e, map))
                        .collect::<StateResult<Vec<_>>>()?,
                ),
                SnapshotField::Dict(entries) => {
                    let mut dict = BTreeMap::new();
                    for (subkey, entry) in entries {
                        dict.insert(subkey.clone(), self.resolve_entry(entry, map)?);
                    }
                    Field::Dict(dict)
                }
            };
            fields.insert(key.clone(), resolved);
        }

        let mut inner = self.inner.lock().unwrap();
        let handle = StateHandle(inner.next_handle);
        inner.next_handle += 1;
        inner.objects.insert(
            handle.0,
            ObjectSlot {
                kind: snapshot.kind.clone(),
                tag: ReplicaTag::Remote,
                fields,
                observers: Vec::new(),
                listeners: Vec::new(),
                hook: None,
                invalidated: false,
                next_observer_id: 1,
            },
        );
        map.insert(snapshot.handle, handle);
        Ok(handle)
    }

    fn resolve_entry(
        &self,
        entry: &SnapshotEntry,
        map: &mut crate::sync::HandleMap,
    ) -> StateResult<StateValue> {
        match entry {
            SnapshotEntry::Value(StateValue::Ref(h)) => Err(StateError::BadSnapshot(format!(
                "unexpanded child ref {h}"
            ))),
            SnapshotEntry::Value(value) => Ok(value.clone()),
            SnapshotEntry::Child(child) => {
                let local = self.instantiate(child, map)?;
                Ok(StateValue::Ref(local))
            }
        }
    }
}

fn slot_ref<'a>(inner: &'a Inner, handle: StateHandle) -> StateResult<&'a ObjectSlot> {
    inner
        .objects
        .get(&handle.0)
        .ok_or(StateError::NoSuchHandle(handle.0))
}

fn field_ref<'a>(slot: &'a ObjectSlot, key: &str) -> StateResult<&'a Field> {
    slot.fields.get(key).ok_or_else(|| StateError::UnknownKey {
        kind: slot.kind.clone(),
        key: key.to_string(),
    })
}

fn apply_change(slot: &mut ObjectSlot, change: &StateChange) -> StateResult<()> {
    match change {
        StateChange::Set { key, value } => {
            match slot.fields.get_mut(key) {
                Some(Field::Scalar(slot_value)) => {
                    *slot_value = value.clone();
                    Ok(())
                }
                Some(_) => Err(StateError::WrongShape {
                    key: key.clone(),
                    expected: "scalar",
                }),
                None => Err(StateError::UnknownKey {
                    kind: slot.kind.clone(),
                    key: key.clone(),
                }),
            }
        }
        StateChange::Append { key, value } => match slot.fields.get_mut(key) {
            Some(Field::List(values)) => {
                values.push(value.clone());
                Ok(())
            }
            Some(_) => Err(StateError::WrongShape {
                key: key.clone(),
                expected: "list",
            }),
            None => Err(StateError::UnknownKey {
                kind: slot.kind.clone(),
                key: key.clone(),
            }),
        },
        StateChange::Remove { key, value } => match slot.fields.get_mut(key) {
            Some(Field::List(values)) => {
                match values.iter().position(|v| v == value) {
                    Some(index) => {
                        values.remove(index);
                        Ok(())
                    }
                    None => Err(StateError::MissingEntry {
                        key: key.clone(),
                        detail: format!("{value:?} not in list"),
                    }),
                }
            }
            Some(_) => Err(StateError::WrongShape {
                key: key.clone(),
                expected: "list",
            }),
            None => Err(StateError::UnknownKey {
                kind: slot.kind.clone(),
                key: key.clone(),
            }),
        },
        StateChange::SetItem { key, subkey, value } => match slot.fields.get_mut(key) {
            Some(Field::Dict(entries)) => {
                entries.insert(subkey.clone(), value.clone());
                Ok(())
            }
            Some(_) => Err(StateError::WrongShape {
                key: key.clone(),
                expected: "dict",
            }),
            None => Err(StateError::UnknownKey {
                kind: slot.kind.clone(),
                key: key.clone(),
            }),
        },
        StateChange::DelItem { key, subkey } => match slot.fields.get_mut(key) {
            Some(Field::Dict(entries)) => match entries.remove(subkey) {
                Some(_) => Ok(()),
                None => Err(StateError::MissingEntry {
                    key: key.clone(),
                    detail: format!("no subkey {subkey}"),
                }),
            },
            Some(_) => Err(StateError::WrongShape {
                key: key.clone(),
                expected: "dict",
            }),
            None => Err(StateError::UnknownKey {
                kind: slot.kind.clone(),
                key: key.clone(),
            }),
        },
        StateChange::Invalidate => {
            slot.invalidated = true;
            Ok(())
        }
    }
}

fn snapshot_recursive(inner: &Inner, handle: StateHandle) -> StateResult<Snapshot> {
    let slot = slot_ref(inner, handle)?;
    let mut fields = BTreeMap::new();
    for (key, field) in &slot.fields {
        let snap_field = match field {
            Field::Scalar(value) => SnapshotField::Scalar(snapshot_entry(inner, value)?),
            Field::List(values) => SnapshotField::List(
                values
                    .iter()
                    .map(|v| snapshot_entry(inner, v))
                    .collect::<StateResult<Vec<_>>>()?,
            ),
            Field::Dict(entries) => {
                let mut dict = BTreeMap::new();
                for (subkey, value) in entries {
                    dict.insert(subkey.clone(), snapshot_entry(inner, value)?);
                }
                SnapshotField::Dict(dict)
            }
        };
        fields.insert(key.clone(), snap_field);
    }
    Ok(Snapshot {
        handle,
        kind: slot.kind.clone(),
        fields,
    })
}

fn snapshot_entry(inner: &Inner, value: &StateValue) -> StateResult<SnapshotEntry> {
    match value {
        StateValue::Ref(child) if inner.objects.contains_key(&child.0) => {
            Ok(SnapshotEntry::Child(snapshot_recursive(inner, *child)?))
        }
        other => Ok(SnapshotEntry::Value(other.clone())),
    }
}

fn release_recursive(inner: &mut Inner, handle: StateHandle) {
    let Some(slot) = inner.objects.remove(&handle.0) else {
        return;
    };
    let mut children = Vec::new();
    for field in slot.fields.values() {
        match field {
            Field::Scalar(value) => collect_ref(value, &mut children),
            Field::List(values) => values.iter().for_each(|v| collect_ref(v, &mut children)),
            Field::Dict(entries) => entries.values().for_each(|v| collect_ref(v, &mut children)),
        }
    }
    for child in children {
        release_recursive(inner, child);
    }
}

fn collect_ref(value: &StateValue, out: &mut Vec<StateHandle>) {
    if let StateValue::Ref(h) = value {
        out.push(*h);
    }
}
