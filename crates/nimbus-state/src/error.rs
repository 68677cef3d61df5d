//! Error types for the state registry.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    /// The key was not declared when the object was created.
    #[error("unknown key {key} on {kind} state")]
    UnknownKey { kind: String, key: String },

    /// `remove`/`delitem` of an entry that is not present.
    #[error("missing entry under {key}: {detail}")]
    MissingEntry { key: String, detail: String },

    /// Insert that would violate a uniqueness invariant.
    #[error("duplicate entry under {key}: {detail}")]
    Duplicate { key: String, detail: String },

    /// Operation and field shape disagree (e.g. `append` on a scalar).
    #[error("key {key} is not a {expected}")]
    WrongShape { key: String, expected: &'static str },

    /// The handle does not name a live object in this registry.
    #[error("no such state object: {0}")]
    NoSuchHandle(u64),

    /// A listener registered with no interest in any event.
    #[error("listener has no interest in any event")]
    EmptyInterest,

    /// A snapshot could not be instantiated.
    #[error("bad snapshot: {0}")]
    BadSnapshot(String),

    /// An event referenced a handle the replica has never seen.
    #[error("unmapped remote handle: {0}")]
    UnmappedHandle(u64),
}
