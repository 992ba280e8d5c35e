// Transactions and the mutations they carry.
//
// A `Transaction` is the unit of replication: an ordered list of `Mutation`s
// plus semantic `Event`s, applied atomically. The leader assigns `index`;
// before that it is `None` (or, on a follower's proposal, the index the
// follower expects it to land at).
//
// `Mutation` is a tagged variant instead of sentinel path markers:
// - `Set`:    write `value` at `path`, creating intermediate objects.
// - `Delete`: remove `path` from its container (object key or array splice).
// - `Append`: push `value` onto the array at `path`. The concrete slot is
//             resolved against the live store at apply time, so two appends
//             racing for the same array never collide.
//
// Paths are resolved when the mutation is applied, not when it is enqueued
// (see `lockstep_store::tree`).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{MutationId, MutationIndex};

/// One step of a path into the JSON document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(u64),
    Key(String),
}

impl From<&str> for PathSegment {
    fn from(s: &str) -> Self {
        Self::Key(s.to_owned())
    }
}

impl From<String> for PathSegment {
    fn from(s: String) -> Self {
        Self::Key(s)
    }
}

impl From<u64> for PathSegment {
    fn from(i: u64) -> Self {
        Self::Index(i)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "[{i}]"),
            Self::Key(k) => write!(f, ".{k}"),
        }
    }
}

/// Build a path from a mix of keys and indices: `path!["board", 3u64, "piece"]`.
#[macro_export]
macro_rules! path {
    ($($seg:expr),* $(,)?) => {
        vec![$($crate::transaction::PathSegment::from($seg)),*]
    };
}

/// Render a path for log output, e.g. `.board[3].piece`.
pub fn display_path(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return "<root>".into();
    }
    path.iter().map(ToString::to_string).collect()
}

/// A single change to the replicated document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Mutation {
    Set { path: Vec<PathSegment>, value: Value },
    Delete { path: Vec<PathSegment> },
    Append { path: Vec<PathSegment>, value: Value },
}

impl Mutation {
    pub fn set(path: Vec<PathSegment>, value: impl Into<Value>) -> Self {
        Self::Set {
            path,
            value: value.into(),
        }
    }

    pub fn delete(path: Vec<PathSegment>) -> Self {
        Self::Delete { path }
    }

    pub fn append(path: Vec<PathSegment>, value: impl Into<Value>) -> Self {
        Self::Append {
            path,
            value: value.into(),
        }
    }

    pub fn path(&self) -> &[PathSegment] {
        match self {
            Self::Set { path, .. } | Self::Delete { path } | Self::Append { path, .. } => path,
        }
    }
}

/// A semantic event carried alongside mutations ("piece moved", "chat
/// sent"). Dispatched to store observers exactly once per peer, after the
/// transaction's state change is in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }
}

/// An atomic, ordered group of mutations plus events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub index: Option<MutationIndex>,
    pub mutations: Vec<Mutation>,
    #[serde(default)]
    pub events: Vec<Event>,
    pub mutation_id: MutationId,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::ClientId;

    #[test]
    fn mutation_wire_shape() {
        let m = Mutation::append(path!["moves"], json!({"from": "e2", "to": "e4"}));
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(
            v,
            json!({"op": "append", "path": ["moves"], "value": {"from": "e2", "to": "e4"}})
        );

        let d: Mutation = serde_json::from_value(json!({"op": "delete", "path": ["a", 2]})).unwrap();
        assert_eq!(d, Mutation::delete(path!["a", 2u64]));
    }

    #[test]
    fn path_segments_keep_their_kind() {
        let p: Vec<PathSegment> = serde_json::from_value(json!(["board", 3, "7"])).unwrap();
        assert_eq!(
            p,
            vec![
                PathSegment::Key("board".into()),
                PathSegment::Index(3),
                PathSegment::Key("7".into()),
            ]
        );
        assert_eq!(display_path(&p), ".board[3].7");
    }

    #[test]
    fn transaction_uses_camel_case_fields() {
        let txn = Transaction {
            index: None,
            mutations: vec![Mutation::set(path!["ayy"], "ayy")],
            events: vec![],
            mutation_id: MutationId::new(&ClientId::from("c1"), 0),
        };
        let v = serde_json::to_value(&txn).unwrap();
        assert_eq!(v["mutationId"], json!("c1:0"));
        assert_eq!(v["index"], Value::Null);
    }

    #[test]
    fn events_default_when_absent() {
        let txn: Transaction = serde_json::from_value(json!({
            "index": 3,
            "mutations": [],
            "mutationId": "c:1",
        }))
        .unwrap();
        assert!(txn.events.is_empty());
        assert_eq!(txn.index, Some(MutationIndex(3)));
    }
}
