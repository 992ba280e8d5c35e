// lockstep_store: optimistic replicated JSON store.
//
// A peer joins a network through the relay (`lockstep_relay`) and receives a
// role. The leader owns the canonical transaction log: it applies its own
// writes immediately, commits proposals routed to it, and broadcasts every
// committed transaction. Followers apply their writes speculatively, send
// them as proposals, and reconcile against the leader's committed stream,
// rewinding and replaying when their guess was wrong. All peers converge on
// the leader's order.
//
// Module overview:
// - `tree.rs`:          `StateTree`, the JSON document, and the undo
//                       records that make speculation reversible.
// - `replica.rs`:       `Replica`, the synchronous core: rollback/lockstep
//                       trees, speculative tail, reconciliation, promotion.
// - `store.rs`:         `ReplicatedStore`, the async handle. Owns the
//                       driver task and the pending-confirmation table.
// - `builder.rs`:       `TransactionBuilder` / `BuilderHandle` for
//                       assembling one transaction from several call sites.
// - `client_state.rs`:  Per-peer client-controlled state (presence).
// - `transport.rs`:     WebSocket connection to the relay.
// - `config.rs`:        `StoreConfig`.
// - `error.rs`:         `StoreError`, `TransportError`.

pub mod builder;
pub mod client_state;
pub mod config;
pub mod error;
pub mod replica;
pub mod store;
pub mod transport;
pub mod tree;

pub use builder::{BuilderHandle, TransactionBuilder};
pub use client_state::ClientStates;
pub use config::StoreConfig;
pub use error::{StoreError, TransportError};
pub use replica::{Replica, Role};
pub use store::{ReplicatedStore, StoreUpdate};
pub use transport::{Transport, TransportSender};
pub use tree::{StateTree, Undo};
