//! Change events, observers, and listeners.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::registry::StateHandle;
use crate::value::StateValue;

/// One mutation applied to one state object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StateChange {
    Set { key: String, value: StateValue },
    Append { key: String, value: StateValue },
    Remove { key: String, value: StateValue },
    SetItem {
        key: String,
        subkey: String,
        value: StateValue,
    },
    DelItem { key: String, subkey: String },
    Invalidate,
}

/// A change addressed to a specific object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub handle: StateHandle,
    pub change: StateChange,
}

/// Acknowledgement future returned by an observer delivery.
pub type AckFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// Receives change events from a cacheable and acknowledges them.
///
/// The RPC layer implements this to push events to a peer; tests
/// implement it in-process.
pub trait StateObserver: Send + Sync {
    fn deliver(&self, event: StateEvent) -> AckFuture;
}

/// Which of the six events a listener wants.
///
/// At least one flag must be set; registration rejects an empty
/// interest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerInterest {
    pub set: bool,
    pub append: bool,
    pub remove: bool,
    pub setitem: bool,
    pub delitem: bool,
    pub invalidate: bool,
}

impl ListenerInterest {
    pub fn all() -> Self {
        Self {
            set: true,
            append: true,
            remove: true,
            setitem: true,
            delitem: true,
            invalidate: true,
        }
    }

    pub fn any(&self) -> bool {
        self.set || self.append || self.remove || self.setitem || self.delitem || self.invalidate
    }

    pub fn covers(&self, change: &StateChange) -> bool {
        match change {
            StateChange::Set { .. } => self.set,
            StateChange::Append { .. } => self.append,
            StateChange::Remove { .. } => self.remove,
            StateChange::SetItem { .. } => self.setitem,
            StateChange::DelItem { .. } => self.delitem,
            StateChange::Invalidate => self.invalidate,
        }
    }
}

/// Local listener on a replica. Called synchronously, in registration
/// order, after the local copy has been updated. Errors are logged and
/// swallowed; they never stop later listeners.
pub trait StateListener: Send + Sync {
    fn on_change(&self, handle: StateHandle, change: &StateChange) -> Result<(), String>;
}

/// Observer attach/detach hook on a cacheable, so higher layers can
/// notice the first observer arriving and the last one leaving.
pub trait ObserverHook: Send + Sync {
    fn observer_appended(&self, count: usize);
    fn observer_removed(&self, count: usize);
}

impl<F> StateListener for F
where
    F: Fn(StateHandle, &StateChange) -> Result<(), String> + Send + Sync,
{
    fn on_change(&self, handle: StateHandle, change: &StateChange) -> Result<(), String> {
        self(handle, change)
    }
}
