//! The wire messages a connection exchanges.
//!
//! The protocol is symmetric: either side may call the other, push
//! state events, or answer. Remote object references travel as tagged
//! strings and are resolved by the receiving side's dispatch table.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use nimbus_state::{Snapshot, WireEvent};

/// A reference to an object living on the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    #[serde(rename = "$ref")]
    pub name: String,
}

impl RemoteRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum Envelope {
    /// Asynchronous call on a named remote object.
    Call {
        id: u64,
        target: String,
        method: String,
        args: Vec<Value>,
    },
    /// Successful reply to a call.
    Reply { id: u64, result: Value },
    /// Failed reply; `error` reconstructs the error kind at the
    /// caller.
    Fault { id: u64, error: nimbus_core::Error },
    /// A full snapshot establishing a replica on the peer.
    StateSnapshot { name: String, snapshot: Snapshot },
    /// One state mutation; must be acknowledged with `StateAck`.
    StateEvent { seq: u64, event: WireEvent },
    /// Acknowledges `StateEvent { seq }` after local application and
    /// listener dispatch.
    StateAck { seq: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_state::{StateHandle, WireChange, WireValue};

    #[test]
    fn envelopes_survive_the_wire() {
        let messages = vec![
            Envelope::Call {
                id: 1,
                target: "manager".to_string(),
                method: "component_start".to_string(),
                args: vec![Value::String("/default/producer".to_string())],
            },
            Envelope::Fault {
                id: 1,
                error: nimbus_core::Error::SleepingComponent(
                    "/default/producer".to_string(),
                ),
            },
            Envelope::StateEvent {
                seq: 9,
                event: WireEvent {
                    handle: StateHandle(3),
                    change: WireChange::Set {
                        key: "mood".to_string(),
                        value: WireValue::Plain(0i64.into()),
                    },
                },
            },
            Envelope::StateAck { seq: 9 },
        ];
        for message in messages {
            let json = serde_json::to_string(&message).unwrap();
            let back: Envelope = serde_json::from_str(&json).unwrap();
            assert_eq!(back, message);
        }
    }

    #[test]
    fn remote_refs_use_the_ref_tag() {
        let reference = RemoteRef::new("component:/default/producer");
        let json = serde_json::to_value(&reference).unwrap();
        assert_eq!(json["$ref"], "component:/default/producer");
    }
}
