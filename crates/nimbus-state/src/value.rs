//! State values, field shapes, and snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::registry::StateHandle;

/// A single state value.
///
/// `Ref` points at another object in the same registry; on the wire a
/// ref is expanded into the child's snapshot (see [`crate::sync`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum StateValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ref(StateHandle),
}

impl StateValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            StateValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            StateValue::Float(f) => Some(*f),
            StateValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_ref_handle(&self) -> Option<StateHandle> {
        match self {
            StateValue::Ref(h) => Some(*h),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }
}

impl From<bool> for StateValue {
    fn from(v: bool) -> Self {
        StateValue::Bool(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        StateValue::Int(v)
    }
}

impl From<u32> for StateValue {
    fn from(v: u32) -> Self {
        StateValue::Int(v as i64)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Float(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::Str(v.to_string())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::Str(v)
    }
}

impl From<StateHandle> for StateValue {
    fn from(v: StateHandle) -> Self {
        StateValue::Ref(v)
    }
}

impl<T> From<Option<T>> for StateValue
where
    T: Into<StateValue>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => StateValue::Null,
        }
    }
}

/// The three field shapes an object can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldShape {
    Scalar,
    List,
    Dict,
}

/// A deep copy of an object's fields with child refs expanded.
///
/// The `handle` is the handle on the *producing* side; replicas keep a
/// translation map rather than reusing it (see [`crate::sync`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub handle: StateHandle,
    pub kind: String,
    pub fields: BTreeMap<String, SnapshotField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "data", rename_all = "snake_case")]
pub enum SnapshotField {
    Scalar(SnapshotEntry),
    List(Vec<SnapshotEntry>),
    Dict(BTreeMap<String, SnapshotEntry>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "e", content = "d", rename_all = "snake_case")]
pub enum SnapshotEntry {
    Value(StateValue),
    Child(Snapshot),
}

impl Snapshot {
    /// Render the snapshot as a plain JSON tree with handles erased.
    ///
    /// Two replicas of the same object produce equal trees regardless
    /// of the handle values each side allocated.
    pub fn to_tree(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("kind".to_string(), self.kind.clone().into());
        let mut fields = serde_json::Map::new();
        for (key, field) in &self.fields {
            fields.insert(key.clone(), field.to_tree());
        }
        map.insert("fields".to_string(), fields.into());
        map.into()
    }
}

impl SnapshotField {
    fn to_tree(&self) -> serde_json::Value {
        match self {
            SnapshotField::Scalar(entry) => entry.to_tree(),
            SnapshotField::List(entries) => {
                entries.iter().map(SnapshotEntry::to_tree).collect()
            }
            SnapshotField::Dict(entries) => entries
                .iter()
                .map(|(k, v)| (k.clone(), v.to_tree()))
                .collect::<serde_json::Map<_, _>>()
                .into(),
        }
    }
}

impl SnapshotEntry {
    fn to_tree(&self) -> serde_json::Value {
        match self {
            SnapshotEntry::Value(StateValue::Null) => serde_json::Value::Null,
            SnapshotEntry::Value(StateValue::Bool(b)) => (*b).into(),
            SnapshotEntry::Value(StateValue::Int(i)) => (*i).into(),
            SnapshotEntry::Value(StateValue::Float(f)) => (*f).into(),
            SnapshotEntry::Value(StateValue::Str(s)) => s.clone().into(),
            // A bare ref in a snapshot means the child was not
            // expanded; render the erased marker.
            SnapshotEntry::Value(StateValue::Ref(_)) => "<ref>".into(),
            SnapshotEntry::Child(snapshot) => snapshot.to_tree(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_conversions() {
        assert_eq!(StateValue::from(3i64).as_int(), Some(3));
        assert_eq!(StateValue::from("x").as_str(), Some("x"));
        assert_eq!(StateValue::from(true).as_bool(), Some(true));
        assert_eq!(StateValue::from(2.5f64).as_float(), Some(2.5));
        assert_eq!(StateValue::from(7i64).as_float(), Some(7.0));
        assert!(StateValue::from(None::<i64>).is_null());
    }

    #[test]
    fn values_survive_the_wire() {
        for value in [
            StateValue::Null,
            StateValue::Bool(false),
            StateValue::Int(-4),
            StateValue::Float(0.5),
            StateValue::Str("feed".to_string()),
        ] {
            let json = serde_json::to_string(&value).unwrap();
            let back: StateValue = serde_json::from_str(&json).unwrap();
            assert_eq!(back, value);
        }
    }
}
