// lockstep_protocol: wire protocol for the replication relay.
//
// This crate defines the message types, transactions, framing and snapshot
// encoding used by the relay (`lockstep_relay`) and by peers
// (`lockstep_store`). It is shared between both sides and knows nothing
// about sockets.
//
// Module overview:
// - `types.rs`:        ID newtypes: `ClientId`, `NetworkId`, `MutationIndex`,
//                      `MutationId`.
// - `transaction.rs`:  `Transaction`, `Mutation` (Set/Delete/Append),
//                      `PathSegment`, `Event`.
// - `message.rs`:      Peer-to-relay and relay-to-peer message enums.
// - `framing.rs`:      One JSON message per WebSocket text frame, size cap,
//                      base64 state snapshots (`EncodedState`).
// - `error.rs`:        `ProtocolError`.
//
// Design decisions:
// - **JSON with a `type` tag.** Every envelope is a JSON object discriminated
//   by `type`, so non-Rust peers can speak the protocol.
// - **Opaque snapshots.** Full-state dumps are base64 blobs; the relay
//   forwards them without parsing.

pub mod error;
pub mod framing;
pub mod message;
pub mod transaction;
pub mod types;

pub use error::ProtocolError;
pub use framing::{EncodedState, MAX_MESSAGE_SIZE, decode_message, encode_message};
pub use message::{ClientMessage, ClientSlot, ClientSlotUpdates, ServerMessage};
pub use transaction::{Event, Mutation, PathSegment, Transaction};
pub use types::{ClientId, MutationId, MutationIndex, NetworkId};
