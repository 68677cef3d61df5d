//! Error kinds that cross process boundaries.
//!
//! RPC replies carry these serialized; the calling side reconstructs
//! the same kind so that policy errors (mood violations, busy
//! components, ...) survive the wire verbatim.

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

/// Cross-process error kinds.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Error {
    /// Cannot reach a peer.
    #[error("connection to {0} failed: {1}")]
    ConnectionFailed(String, String),

    /// Peer actively refused.
    #[error("connection to {0} refused")]
    ConnectionRefused(String),

    /// Operation disallowed by the component's current mood.
    #[error("component {0} is {1}; operation not allowed")]
    ComponentMood(String, String),

    /// Delete attempted on a component that is not stopped.
    #[error("component {0} is busy; stop it first")]
    BusyComponent(String),

    /// A pipeline error that was already surfaced as a component
    /// message; callers should not report it again.
    #[error("component {0} start failed (already reported)")]
    ComponentStartHandled(String),

    /// Remote method not implemented by the callee.
    #[error("no such method: {0}")]
    NoSuchMethod(String),

    /// UI state requested while the component is sleeping.
    #[error("component {0} is sleeping")]
    SleepingComponent(String),

    /// A create was requested while one is already pending.
    #[error("{0} is already starting")]
    AlreadyStarting(String),

    /// A create was requested for an avatar that is already running.
    #[error("{0} is already running")]
    AlreadyRunning(String),

    /// A required pipeline element is not installed.
    #[error("missing element {element} for component {component}")]
    MissingElement { component: String, element: String },

    /// Set/get of an unknown or ill-typed element property.
    #[error("property error on {element}.{property}: {reason}")]
    Property {
        element: String,
        property: String,
        reason: String,
    },

    /// Malformed avatar or feed id.
    #[error("invalid id: {0}")]
    InvalidId(String),

    /// Component/flow/worker not present in the planet.
    #[error("unknown {0}: {1}")]
    Unknown(String, String),

    /// Configuration document could not be interpreted.
    #[error("configuration error: {0}")]
    Config(String),

    /// Anything that does not fit a policy kind.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Short machine name for the kind, as carried on the wire tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConnectionFailed(..) => "connection_failed",
            Error::ConnectionRefused(..) => "connection_refused",
            Error::ComponentMood(..) => "component_mood",
            Error::BusyComponent(..) => "busy_component",
            Error::ComponentStartHandled(..) => "component_start_handled",
            Error::NoSuchMethod(..) => "no_such_method",
            Error::SleepingComponent(..) => "sleeping_component",
            Error::AlreadyStarting(..) => "already_starting",
            Error::AlreadyRunning(..) => "already_running",
            Error::MissingElement { .. } => "missing_element",
            Error::Property { .. } => "property",
            Error::InvalidId(..) => "invalid_id",
            Error::Unknown(..) => "unknown",
            Error::Config(..) => "config",
            Error::Other(..) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_survive_the_wire() {
        let err = Error::ComponentMood("/default/producer".into(), "sad".into());
        let json = serde_json::to_string(&err).unwrap();
        let back: Error = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
        assert_eq!(back.kind(), "component_mood");
    }

    #[test]
    fn display_is_operator_readable() {
        let err = Error::BusyComponent("/default/muxer".into());
        assert_eq!(err.to_string(), "component /default/muxer is busy; stop it first");
    }
}
