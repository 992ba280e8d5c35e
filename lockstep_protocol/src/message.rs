// Protocol messages for peer-relay communication.
//
// Two enums define the full protocol vocabulary:
// - `ClientMessage`: sent by peers (leader or follower) to the relay.
// - `ServerMessage`: sent by the relay to peers.
//
// On the wire every message is a JSON object with a `type` discriminator
// (kebab-case) and camelCase fields, one message per WebSocket text frame
// (see `framing.rs`).
//
// The relay only interprets what it needs for leader bookkeeping: the
// `committed` flag on mutations, `state` replies addressed to a joining
// client, client-controlled-state slots and the promotion handshake.
// Transactions and state snapshots pass through untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::framing::EncodedState;
use crate::transaction::Transaction;
use crate::types::{ClientId, MutationId, MutationIndex};

/// One peer's client-controlled-state slot.
pub type ClientSlot = Map<String, Value>;

/// Slot updates keyed by client. `None` means the client left and its slot
/// must be dropped.
pub type ClientSlotUpdates = BTreeMap<ClientId, Option<ClientSlot>>;

/// Messages sent by a peer to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// A transaction. `committed` is only legitimate from the leader; the
    /// relay downgrades anything else to a proposal.
    Mutation {
        transaction: Transaction,
        committed: bool,
    },
    /// Leader's reply to `ServerMessage::RequestState`.
    State {
        for_client: ClientId,
        state: EncodedState,
        last_mutation_index: Option<MutationIndex>,
    },
    /// Replace (or, with `merge`, merge into) this peer's own slot.
    SetClientControlledState { state: ClientSlot, merge: bool },
    /// Ask for every peer's current slot.
    RequestClientControlledStates,
    /// Candidate accepts a `PromoteToLeader`.
    AckPromoteToLeader,
    /// Leader could not apply a proposal to its current state.
    RejectMutation {
        mutation_id: MutationId,
        reason: String,
    },
}

impl ClientMessage {
    /// Election-control messages bypass the per-client buffering that holds
    /// traffic while a network has no leader.
    pub fn is_election_control(&self) -> bool {
        matches!(self, Self::AckPromoteToLeader)
    }
}

/// Messages sent by the relay to a peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Handshake reply: identity, role and initial state.
    ClientConfig {
        client_id: ClientId,
        is_leader: bool,
        state: EncodedState,
        last_mutation_index: Option<MutationIndex>,
        client_controlled_states: BTreeMap<ClientId, ClientSlot>,
    },
    /// A transaction, either a proposal routed to the leader or a committed
    /// transaction fanned out to followers.
    Mutation {
        transaction: Transaction,
        committed: bool,
    },
    /// Sent to the leader: dump full state for a joining client.
    RequestState { for_client: ClientId },
    /// Client-controlled-state slots. `for_client` scopes a reply to one
    /// requester; broadcasts leave it empty.
    ClientControlledStates {
        states: ClientSlotUpdates,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        for_client: Option<ClientId>,
    },
    /// Sent to the election candidate.
    PromoteToLeader,
    /// The connection was idle too long and is being closed.
    MessageTimeout { idle_ms: u64 },
    /// A proposal was refused by the leader.
    OrderInvariantMutationFailed {
        mutation_id: MutationId,
        reason: String,
    },
}
