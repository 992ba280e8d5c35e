// Core ID types for the replication protocol.
//
// Lightweight newtypes used by `message.rs`, `transaction.rs`, the relay's
// network bookkeeping (`lockstep_relay::network`) and the peer-side store
// (`lockstep_store`). Client and network ids are opaque strings on the wire;
// the relay generates them randomly. `MutationIndex` is the position of a
// committed transaction in a network's total order.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Relay-assigned client id, unique within a network.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    /// Fresh random id. The relay regenerates on the (unlikely) collision
    /// with an id already present in the same network.
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of a network (room).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(pub String);

impl NetworkId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NetworkId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Position of a transaction in a network's committed order. Gap-free,
/// starting at 0.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MutationIndex(pub u64);

impl MutationIndex {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for MutationIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `"<originatingClientId>:<localCounter>"`. Lets a follower tell its own
/// transaction apart from someone else's that landed at the same index, and
/// lets the relay route a rejection back to the author.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(pub String);

impl MutationId {
    pub fn new(origin: &ClientId, counter: u64) -> Self {
        Self(format!("{}:{counter}", origin.0))
    }

    /// The client that authored this transaction.
    pub fn origin(&self) -> Result<ClientId, ProtocolError> {
        match self.0.rsplit_once(':') {
            Some((client, counter))
                if !client.is_empty() && counter.parse::<u64>().is_ok() =>
            {
                Ok(ClientId(client.to_owned()))
            }
            _ => Err(ProtocolError::MalformedMutationId(self.0.clone())),
        }
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_id_origin() {
        let id = MutationId::new(&ClientId::from("abc"), 7);
        assert_eq!(id.0, "abc:7");
        assert_eq!(id.origin().unwrap(), ClientId::from("abc"));
    }

    #[test]
    fn malformed_mutation_id_rejected() {
        assert!(MutationId("nocounter".into()).origin().is_err());
        assert!(MutationId(":3".into()).origin().is_err());
        assert!(MutationId("abc:x".into()).origin().is_err());
    }

    #[test]
    fn random_client_ids_differ() {
        assert_ne!(ClientId::random(), ClientId::random());
    }

    #[test]
    fn index_serializes_as_bare_number() {
        let json = serde_json::to_string(&MutationIndex(4)).unwrap();
        assert_eq!(json, "4");
    }
}
