//! nimbus-state — the replicated observable state backbone.
//!
//! A [`StateRegistry`] is an arena of observable state objects. Each
//! object is a container of pre-declared fields in three shapes
//! (scalar, ordered list, keyed dict) and carries a replica tag:
//!
//! - `Local`: the authoritative copy; mutations multicast change
//!   events to attached observers and resolve when all have
//!   acknowledged.
//! - `Remote`: a read-only cache; change events are replayed against
//!   it and local listeners are notified synchronously in
//!   registration order.
//! - `Proxy`: both at once; applied events are re-emitted outward
//!   (except invalidation, which never crosses a proxy).
//!
//! Parent/child links between objects are opaque handles into the
//! registry, never owning references, so the cyclic
//! planet ↔ flow ↔ component shape cannot leak.

pub mod error;
pub mod events;
pub mod jobstate;
pub mod planet;
pub mod registry;
pub mod sync;
pub mod value;
pub mod workerstate;

pub use error::{StateError, StateResult};
pub use jobstate::{EaterState, FeederClientState, FeederState, JobState};
pub use planet::{AtmosphereState, ComponentState, FlowState, PlanetState};
pub use workerstate::WorkerHeavenState;
pub use events::{
    AckFuture, ListenerInterest, ObserverHook, StateChange, StateEvent, StateListener,
    StateObserver,
};
pub use registry::{KeyDecl, ObserverId, ReplicaTag, StateHandle, StateRegistry};
pub use sync::{HandleMap, WireChange, WireEvent, WireValue};
pub use value::{FieldShape, Snapshot, SnapshotEntry, SnapshotField, StateValue};
