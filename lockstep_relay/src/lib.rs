// lockstep_relay: relay server for optimistic state replication.
//
// The relay is a message broker with just enough state to keep a
// replication group consistent: it assigns client ids, picks and replaces
// the leader, routes proposals to the leader and fans committed
// transactions out to everyone else. It never applies a transaction and
// treats state snapshots as opaque.
//
// Module overview:
// - `network.rs`:   `Network`, the per-group state machine: membership,
//                   election, buffering, routing, client-controlled state.
// - `registry.rs`:  `Registry`, the id -> network table and the empty-network
//                   sweep.
// - `server.rs`:    axum routes, WebSocket reader/writer tasks, idle
//                   timeouts, the sweeper task, `start_relay`.
// - `error.rs`:     `RelayError`.
//
// Dependencies: `lockstep_protocol` for message types and framing. The relay
// can run as a standalone binary (`main.rs`) or be embedded via
// `start_relay`, which is how the integration tests drive it.

pub mod error;
pub mod network;
pub mod registry;
pub mod server;

pub use error::RelayError;
pub use server::{RelayConfig, RelayHandle, router, start_relay};
