// Per-network relay state: membership, leader election, message routing.
//
// `Network` is the data structure `server.rs` drives for one replication
// group. Socket tasks call into it under the network's own mutex; it never
// blocks and never awaits. Outgoing traffic goes into each client's
// unbounded `Outbox`, which that client's writer task drains onto the
// socket, so a slow peer never stalls the others.
//
// Key responsibilities:
// - Membership: the first client to join an empty network becomes leader
//   with an empty snapshot. Later joiners are followers; the leader is asked
//   for a snapshot (`RequestState`) and the joiner gets its `ClientConfig`
//   once the leader answers. Until then everything addressed to the joiner
//   is held in its send buffer.
// - Routing: committed mutations from the leader fan out to everyone else.
//   Any other mutation is a proposal and goes to the leader, including a
//   stray "committed" one from a follower or an old leader.
// - Election: when the leader leaves, the first configured follower (join
//   order) is sent `PromoteToLeader` and becomes leader once it acks. While
//   there is no leader, inbound messages are parked per client and replayed
//   after promotion; only the ack itself bypasses that buffer.
// - Client-controlled state: each client's slot lives here. Departures are
//   broadcast as `None` slots, but only once a leader exists.
// - Cleanup: a network that becomes empty gets a deadline; `Registry::sweep`
//   removes it once that passes and nobody rejoined.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use lockstep_protocol::{
    ClientId, ClientMessage, ClientSlot, ClientSlotUpdates, EncodedState, MutationIndex,
    NetworkId, ServerMessage, Transaction,
};
use tokio::sync::mpsc;

use crate::error::RelayError;

/// What a client's writer task should do next.
#[derive(Debug)]
pub enum Outbound {
    Message(ServerMessage),
    Close,
}

pub type Outbox = mpsc::UnboundedSender<Outbound>;

struct ConnectedClient {
    outbox: Outbox,
    /// Has received its `ClientConfig`.
    configured: bool,
    /// Held until `configured`.
    send_buffer: Vec<ServerMessage>,
    /// Held while the network has no leader.
    recv_buffer: Vec<ClientMessage>,
    slot: ClientSlot,
}

/// One replication group.
pub struct Network {
    pub id: NetworkId,
    grace: Duration,
    clients: HashMap<ClientId, ConnectedClient>,
    /// Non-leader clients in join order.
    followers: Vec<ClientId>,
    leader: Option<ClientId>,
    /// Election candidate awaiting `AckPromoteToLeader`.
    next_leader: Option<ClientId>,
    pending_departures: Vec<ClientId>,
    cleanup_deadline: Option<Instant>,
    closed: bool,
}

impl Network {
    /// A new, empty network. It is swept if nobody joins within `grace`.
    pub fn new(id: NetworkId, grace: Duration, now: Instant) -> Self {
        Self {
            id,
            grace,
            clients: HashMap::new(),
            followers: Vec::new(),
            leader: None,
            next_leader: None,
            pending_departures: Vec::new(),
            cleanup_deadline: Some(now + grace),
            closed: false,
        }
    }

    pub fn leader(&self) -> Option<&ClientId> {
        self.leader.as_ref()
    }

    pub fn next_leader(&self) -> Option<&ClientId> {
        self.next_leader.as_ref()
    }

    pub fn followers(&self) -> &[ClientId] {
        &self.followers
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn cleanup_deadline(&self) -> Option<Instant> {
        self.cleanup_deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.cleanup_deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Register a new connection and return its id.
    pub fn add_client(&mut self, outbox: Outbox) -> Result<ClientId, RelayError> {
        if self.closed {
            return Err(RelayError::NetworkClosed(self.id.clone()));
        }
        let id = loop {
            let candidate = ClientId::random();
            if !self.clients.contains_key(&candidate) {
                break candidate;
            }
        };
        self.cleanup_deadline = None;
        self.clients.insert(
            id.clone(),
            ConnectedClient {
                outbox,
                configured: false,
                send_buffer: Vec::new(),
                recv_buffer: Vec::new(),
                slot: ClientSlot::new(),
            },
        );

        if self.leader.is_none() && self.next_leader.is_none() && self.followers.is_empty() {
            tracing::info!(network = %self.id, client = %id, "first client becomes leader");
            self.leader = Some(id.clone());
            self.configure(&id, true, EncodedState::empty(), None);
        } else {
            tracing::info!(network = %self.id, client = %id, "follower joined");
            self.followers.push(id.clone());
            if let Some(leader) = self.leader.clone() {
                self.deliver(&leader, ServerMessage::RequestState { for_client: id.clone() });
            }
        }
        Ok(id)
    }

    /// Route one message from `from`.
    pub fn handle_message(&mut self, from: &ClientId, msg: ClientMessage) {
        let Some(client) = self.clients.get_mut(from) else {
            return;
        };
        if self.leader.is_none() && !msg.is_election_control() {
            tracing::debug!(network = %self.id, client = %from, "no leader; buffering message");
            client.recv_buffer.push(msg);
            return;
        }
        self.dispatch(from, msg);
    }

    fn dispatch(&mut self, from: &ClientId, msg: ClientMessage) {
        let from_leader = self.leader.as_ref() == Some(from);
        match msg {
            ClientMessage::Mutation {
                transaction,
                committed: true,
            } if from_leader => self.fan_out_committed(from, transaction),
            ClientMessage::Mutation {
                transaction,
                committed,
            } => {
                if committed {
                    tracing::warn!(
                        network = %self.id,
                        client = %from,
                        "committed mutation from non-leader; treating as proposal"
                    );
                }
                if let Some(leader) = self.leader.clone() {
                    self.deliver(
                        &leader,
                        ServerMessage::Mutation {
                            transaction,
                            committed: false,
                        },
                    );
                }
            }
            ClientMessage::State {
                for_client,
                state,
                last_mutation_index,
            } => {
                if !from_leader {
                    tracing::warn!(network = %self.id, client = %from, "state from non-leader ignored");
                    return;
                }
                let waiting = self
                    .clients
                    .get(&for_client)
                    .is_some_and(|c| !c.configured);
                if waiting {
                    tracing::debug!(
                        network = %self.id,
                        client = %for_client,
                        ?last_mutation_index,
                        "configuring joiner"
                    );
                    self.configure(&for_client, false, state, last_mutation_index);
                } else {
                    tracing::debug!(network = %self.id, client = %for_client, "state for unknown or configured client");
                }
            }
            ClientMessage::SetClientControlledState { state, merge } => {
                let Some(client) = self.clients.get_mut(from) else {
                    return;
                };
                if merge {
                    merge_slot(&mut client.slot, state);
                } else {
                    client.slot = state;
                }
                let slot = client.slot.clone();
                let mut states = ClientSlotUpdates::new();
                states.insert(from.clone(), Some(slot));
                self.broadcast_except(
                    from,
                    ServerMessage::ClientControlledStates {
                        states,
                        for_client: None,
                    },
                );
            }
            ClientMessage::RequestClientControlledStates => {
                let states = self
                    .clients
                    .iter()
                    .map(|(id, c)| (id.clone(), Some(c.slot.clone())))
                    .collect();
                self.deliver(
                    from,
                    ServerMessage::ClientControlledStates {
                        states,
                        for_client: Some(from.clone()),
                    },
                );
            }
            ClientMessage::AckPromoteToLeader => {
                if self.next_leader.as_ref() == Some(from) {
                    self.complete_promotion(from.clone());
                } else {
                    tracing::debug!(network = %self.id, client = %from, "stale promotion ack");
                }
            }
            ClientMessage::RejectMutation {
                mutation_id,
                reason,
            } => {
                if !from_leader {
                    tracing::warn!(network = %self.id, client = %from, "rejection from non-leader ignored");
                    return;
                }
                match mutation_id.origin() {
                    Ok(origin) => self.deliver(
                        &origin,
                        ServerMessage::OrderInvariantMutationFailed {
                            mutation_id,
                            reason,
                        },
                    ),
                    Err(e) => tracing::warn!(network = %self.id, error = %e, "cannot route rejection"),
                }
            }
        }
    }

    fn fan_out_committed(&mut self, from: &ClientId, transaction: Transaction) {
        tracing::debug!(
            network = %self.id,
            index = ?transaction.index,
            id = %transaction.mutation_id,
            "fanning out committed mutation"
        );
        self.broadcast_except(
            from,
            ServerMessage::Mutation {
                transaction,
                committed: true,
            },
        );
    }

    /// Forget a disconnected client, electing a new leader if needed.
    pub fn remove_client(&mut self, id: &ClientId, now: Instant) {
        if self.clients.remove(id).is_none() {
            return;
        }
        self.followers.retain(|c| c != id);
        self.pending_departures.push(id.clone());
        tracing::info!(network = %self.id, client = %id, "client left");

        if self.clients.is_empty() {
            self.leader = None;
            self.next_leader = None;
            self.pending_departures.clear();
            self.cleanup_deadline = Some(now + self.grace);
            tracing::info!(network = %self.id, "network empty; scheduled for cleanup");
            return;
        }

        if self.leader.as_ref() == Some(id) {
            tracing::warn!(network = %self.id, client = %id, "leader left; starting election");
            self.leader = None;
            self.elect();
        } else if self.next_leader.as_ref() == Some(id) {
            tracing::warn!(network = %self.id, client = %id, "election candidate left; retrying");
            self.next_leader = None;
            self.elect();
        }

        if self.leader.is_some() {
            self.flush_departures();
        }
    }

    /// Close a connection that has been idle for `idle`.
    pub fn time_out(&mut self, id: &ClientId, idle: Duration) {
        if let Some(client) = self.clients.get(id) {
            tracing::info!(network = %self.id, client = %id, ?idle, "closing idle connection");
            let idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
            let _ = client
                .outbox
                .send(Outbound::Message(ServerMessage::MessageTimeout { idle_ms }));
            let _ = client.outbox.send(Outbound::Close);
        }
    }

    /// Close every connection; later joins are refused.
    pub fn close_all(&mut self) {
        self.closed = true;
        for client in self.clients.values() {
            let _ = client.outbox.send(Outbound::Close);
        }
    }

    fn elect(&mut self) {
        let candidate = self
            .followers
            .iter()
            .find(|id| self.clients.get(*id).is_some_and(|c| c.configured))
            .cloned();
        if let Some(candidate) = candidate {
            tracing::info!(network = %self.id, client = %candidate, "promoting follower");
            self.next_leader = Some(candidate.clone());
            self.deliver(&candidate, ServerMessage::PromoteToLeader);
            return;
        }

        // Nobody holds a snapshot any more: start the document over with the
        // oldest remaining client as leader.
        if self.followers.is_empty() {
            tracing::warn!(network = %self.id, "no election candidates; network is leaderless");
            return;
        }
        let first = self.followers.remove(0);
        tracing::warn!(
            network = %self.id,
            client = %first,
            "no follower holds state; restarting with empty state"
        );
        self.leader = Some(first.clone());
        self.configure(&first, true, EncodedState::empty(), None);
        self.install_leader(&first);
    }

    fn complete_promotion(&mut self, id: ClientId) {
        tracing::info!(network = %self.id, client = %id, "leader elected");
        self.next_leader = None;
        self.followers.retain(|c| *c != id);
        self.leader = Some(id.clone());
        self.install_leader(&id);
    }

    /// Catch the network up after a leader change: ask for snapshots for
    /// joiners still waiting, replay parked messages, announce departures.
    fn install_leader(&mut self, leader: &ClientId) {
        let waiting: Vec<ClientId> = self
            .followers
            .iter()
            .filter(|id| self.clients.get(*id).is_some_and(|c| !c.configured))
            .cloned()
            .collect();
        for joiner in waiting {
            self.deliver(leader, ServerMessage::RequestState { for_client: joiner });
        }

        let mut order = vec![leader.clone()];
        order.extend(self.followers.iter().cloned());
        for id in order {
            let parked = match self.clients.get_mut(&id) {
                Some(client) => std::mem::take(&mut client.recv_buffer),
                None => continue,
            };
            for msg in parked {
                self.dispatch(&id, msg);
            }
        }

        self.flush_departures();
    }

    fn flush_departures(&mut self) {
        if self.pending_departures.is_empty() {
            return;
        }
        let states: ClientSlotUpdates = self
            .pending_departures
            .drain(..)
            .map(|id| (id, None))
            .collect();
        let ids: Vec<ClientId> = self.clients.keys().cloned().collect();
        for id in ids {
            self.deliver(
                &id,
                ServerMessage::ClientControlledStates {
                    states: states.clone(),
                    for_client: None,
                },
            );
        }
    }

    /// Send `ClientConfig` directly, then release anything held for the
    /// client.
    fn configure(
        &mut self,
        id: &ClientId,
        is_leader: bool,
        state: EncodedState,
        last_mutation_index: Option<MutationIndex>,
    ) {
        let client_controlled_states: BTreeMap<ClientId, ClientSlot> = self
            .clients
            .iter()
            .filter(|(other, _)| *other != id)
            .map(|(other, c)| (other.clone(), c.slot.clone()))
            .collect();
        let Some(client) = self.clients.get_mut(id) else {
            return;
        };
        let config = ServerMessage::ClientConfig {
            client_id: id.clone(),
            is_leader,
            state,
            last_mutation_index,
            client_controlled_states,
        };
        let _ = client.outbox.send(Outbound::Message(config));
        client.configured = true;
        for msg in client.send_buffer.drain(..) {
            let _ = client.outbox.send(Outbound::Message(msg));
        }
    }

    fn deliver(&mut self, id: &ClientId, msg: ServerMessage) {
        let Some(client) = self.clients.get_mut(id) else {
            return;
        };
        if client.configured {
            // A closed outbox means the socket task is already gone; its
            // disconnect will follow.
            let _ = client.outbox.send(Outbound::Message(msg));
        } else {
            client.send_buffer.push(msg);
        }
    }

    fn broadcast_except(&mut self, except: &ClientId, msg: ServerMessage) {
        let ids: Vec<ClientId> = self
            .clients
            .keys()
            .filter(|id| *id != except)
            .cloned()
            .collect();
        for id in ids {
            self.deliver(&id, msg.clone());
        }
    }
}

/// Last write wins per key; `null` removes the key.
fn merge_slot(slot: &mut ClientSlot, patch: ClientSlot) {
    for (key, value) in patch {
        if value.is_null() {
            slot.remove(&key);
        } else {
            slot.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use lockstep_protocol::{Mutation, MutationId, path};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;

    const GRACE: Duration = Duration::from_secs(30);

    fn network() -> Network {
        Network::new(NetworkId::from("net"), GRACE, Instant::now())
    }

    fn join(net: &mut Network) -> (ClientId, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = net.add_client(tx).unwrap();
        (id, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Message(msg) = item {
                out.push(msg);
            }
        }
        out
    }

    fn proposal(origin: &ClientId, index: u64) -> Transaction {
        Transaction {
            index: Some(MutationIndex(index)),
            mutations: vec![Mutation::set(path!["k"], index)],
            events: vec![],
            mutation_id: MutationId::new(origin, index),
        }
    }

    /// Join a follower and complete its snapshot handshake.
    fn join_configured(
        net: &mut Network,
        leader: &ClientId,
        leader_rx: &mut UnboundedReceiver<Outbound>,
    ) -> (ClientId, UnboundedReceiver<Outbound>) {
        let (id, mut rx) = join(net);
        let request = drain(leader_rx);
        assert_eq!(
            request,
            vec![ServerMessage::RequestState {
                for_client: id.clone()
            }]
        );
        net.handle_message(
            leader,
            ClientMessage::State {
                for_client: id.clone(),
                state: EncodedState::empty(),
                last_mutation_index: None,
            },
        );
        let config = drain(&mut rx);
        assert!(matches!(
            config.as_slice(),
            [ServerMessage::ClientConfig {
                is_leader: false,
                ..
            }]
        ));
        (id, rx)
    }

    #[test]
    fn first_client_is_leader_with_empty_state() {
        let mut net = network();
        assert!(net.cleanup_deadline().is_some());
        let (a, mut rx) = join(&mut net);
        assert_eq!(net.leader(), Some(&a));
        assert!(net.cleanup_deadline().is_none());
        match drain(&mut rx).as_slice() {
            [ServerMessage::ClientConfig {
                client_id,
                is_leader: true,
                state,
                last_mutation_index: None,
                ..
            }] => {
                assert_eq!(client_id, &a);
                assert_eq!(state.decode().unwrap(), json!({}));
            }
            other => panic!("expected leader ClientConfig, got {other:?}"),
        }
    }

    #[test]
    fn joiner_buffers_until_configured() {
        let mut net = network();
        let (leader, mut leader_rx) = join(&mut net);
        drain(&mut leader_rx);

        let (b, mut b_rx) = join(&mut net);
        assert_eq!(
            drain(&mut leader_rx),
            vec![ServerMessage::RequestState {
                for_client: b.clone()
            }]
        );
        // A commit made before the snapshot is answered is held for b.
        let early = proposal(&leader, 0);
        net.handle_message(
            &leader,
            ClientMessage::Mutation {
                transaction: early.clone(),
                committed: true,
            },
        );
        assert!(drain(&mut b_rx).is_empty());

        net.handle_message(
            &leader,
            ClientMessage::State {
                for_client: b.clone(),
                state: EncodedState::encode(&json!({"k": 0})).unwrap(),
                last_mutation_index: Some(MutationIndex(0)),
            },
        );
        let msgs = drain(&mut b_rx);
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[0], ServerMessage::ClientConfig { .. }));
        assert_eq!(
            msgs[1],
            ServerMessage::Mutation {
                transaction: early,
                committed: true
            }
        );
    }

    #[test]
    fn proposals_go_to_leader_and_commits_fan_out() {
        let mut net = network();
        let (leader, mut leader_rx) = join(&mut net);
        drain(&mut leader_rx);
        let (b, mut b_rx) = join_configured(&mut net, &leader, &mut leader_rx);
        let (c, mut c_rx) = join_configured(&mut net, &leader, &mut leader_rx);
        drain(&mut b_rx);

        let txn = proposal(&b, 0);
        net.handle_message(
            &b,
            ClientMessage::Mutation {
                transaction: txn.clone(),
                committed: false,
            },
        );
        assert_eq!(
            drain(&mut leader_rx),
            vec![ServerMessage::Mutation {
                transaction: txn.clone(),
                committed: false
            }]
        );
        assert!(drain(&mut c_rx).is_empty());

        net.handle_message(
            &leader,
            ClientMessage::Mutation {
                transaction: txn.clone(),
                committed: true,
            },
        );
        let expected = vec![ServerMessage::Mutation {
            transaction: txn,
            committed: true,
        }];
        assert_eq!(drain(&mut b_rx), expected);
        assert_eq!(drain(&mut c_rx), expected);
        assert!(drain(&mut leader_rx).is_empty());

        // A follower claiming "committed" is downgraded to a proposal.
        let forged = proposal(&c, 1);
        net.handle_message(
            &c,
            ClientMessage::Mutation {
                transaction: forged.clone(),
                committed: true,
            },
        );
        assert_eq!(
            drain(&mut leader_rx),
            vec![ServerMessage::Mutation {
                transaction: forged,
                committed: false
            }]
        );
        assert!(drain(&mut b_rx).is_empty());
    }

    #[test]
    fn leader_loss_promotes_first_follower_after_ack() {
        let mut net = network();
        let (leader, mut leader_rx) = join(&mut net);
        drain(&mut leader_rx);
        let (b, mut b_rx) = join_configured(&mut net, &leader, &mut leader_rx);
        let (c, mut c_rx) = join_configured(&mut net, &leader, &mut leader_rx);
        drain(&mut b_rx);
        drain(&mut c_rx);

        net.remove_client(&leader, Instant::now());
        assert_eq!(net.leader(), None);
        assert_eq!(net.next_leader(), Some(&b));
        assert_eq!(drain(&mut b_rx), vec![ServerMessage::PromoteToLeader]);

        // c's proposal is parked while there is no leader.
        let txn = proposal(&c, 0);
        net.handle_message(
            &c,
            ClientMessage::Mutation {
                transaction: txn.clone(),
                committed: false,
            },
        );
        assert!(drain(&mut b_rx).is_empty());

        // Ack from anyone but the candidate is stale.
        net.handle_message(&c, ClientMessage::AckPromoteToLeader);
        assert_eq!(net.leader(), None);

        net.handle_message(&b, ClientMessage::AckPromoteToLeader);
        assert_eq!(net.leader(), Some(&b));
        assert_eq!(net.followers(), &[c.clone()]);

        let msgs = drain(&mut b_rx);
        assert!(msgs.contains(&ServerMessage::Mutation {
            transaction: txn,
            committed: false
        }));
        let departed: ClientSlotUpdates = [(leader.clone(), None)].into_iter().collect();
        let departure = ServerMessage::ClientControlledStates {
            states: departed,
            for_client: None,
        };
        assert!(msgs.contains(&departure));
        assert!(drain(&mut c_rx).contains(&departure));
    }

    #[test]
    fn candidate_leaving_retries_with_next_follower() {
        let mut net = network();
        let (leader, mut leader_rx) = join(&mut net);
        drain(&mut leader_rx);
        let (b, _b_rx) = join_configured(&mut net, &leader, &mut leader_rx);
        let (c, mut c_rx) = join_configured(&mut net, &leader, &mut leader_rx);
        drain(&mut c_rx);

        net.remove_client(&leader, Instant::now());
        assert_eq!(net.next_leader(), Some(&b));
        net.remove_client(&b, Instant::now());
        assert_eq!(net.next_leader(), Some(&c));
        assert_eq!(drain(&mut c_rx), vec![ServerMessage::PromoteToLeader]);
    }

    #[test]
    fn empty_network_gets_cleanup_deadline_and_new_joiner_leads() {
        let mut net = network();
        let (a, _rx) = join(&mut net);
        let now = Instant::now();
        net.remove_client(&a, now);
        assert_eq!(net.client_count(), 0);
        assert!(!net.is_expired(now));
        assert!(net.is_expired(now + GRACE));

        let (b, mut b_rx) = join(&mut net);
        assert_eq!(net.leader(), Some(&b));
        assert!(net.cleanup_deadline().is_none());
        assert!(matches!(
            drain(&mut b_rx).as_slice(),
            [ServerMessage::ClientConfig { is_leader: true, .. }]
        ));
    }

    #[test]
    fn unconfigured_followers_restart_when_leader_leaves() {
        let mut net = network();
        let (leader, mut leader_rx) = join(&mut net);
        drain(&mut leader_rx);
        let (b, mut b_rx) = join(&mut net);
        let (c, mut c_rx) = join(&mut net);

        net.remove_client(&leader, Instant::now());
        assert_eq!(net.leader(), Some(&b));
        let msgs = drain(&mut b_rx);
        assert!(matches!(
            msgs.first(),
            Some(ServerMessage::ClientConfig { is_leader: true, .. })
        ));
        // c is still waiting for a snapshot; b is asked for one.
        assert!(msgs.contains(&ServerMessage::RequestState {
            for_client: c.clone()
        }));
        assert!(drain(&mut c_rx).is_empty());
        net.handle_message(
            &b,
            ClientMessage::State {
                for_client: c.clone(),
                state: EncodedState::empty(),
                last_mutation_index: None,
            },
        );
        assert!(matches!(
            drain(&mut c_rx).first(),
            Some(ServerMessage::ClientConfig { is_leader: false, .. })
        ));
    }

    #[test]
    fn client_state_merge_and_request() {
        let mut net = network();
        let (leader, mut leader_rx) = join(&mut net);
        drain(&mut leader_rx);
        let (b, mut b_rx) = join_configured(&mut net, &leader, &mut leader_rx);

        let patch = json!({"cursor": 3, "color": "red"}).as_object().cloned().unwrap();
        net.handle_message(
            &b,
            ClientMessage::SetClientControlledState {
                state: patch,
                merge: false,
            },
        );
        let patch = json!({"color": null}).as_object().cloned().unwrap();
        net.handle_message(
            &b,
            ClientMessage::SetClientControlledState {
                state: patch,
                merge: true,
            },
        );
        let msgs = drain(&mut leader_rx);
        let expected: ClientSlot = json!({"cursor": 3}).as_object().cloned().unwrap();
        match msgs.last() {
            Some(ServerMessage::ClientControlledStates { states, for_client: None }) => {
                assert_eq!(states.get(&b), Some(&Some(expected.clone())));
            }
            other => panic!("expected slot broadcast, got {other:?}"),
        }

        drain(&mut b_rx);
        net.handle_message(&b, ClientMessage::RequestClientControlledStates);
        match drain(&mut b_rx).as_slice() {
            [ServerMessage::ClientControlledStates { states, for_client }] => {
                assert_eq!(for_client.as_ref(), Some(&b));
                assert_eq!(states.len(), 2);
                assert_eq!(states.get(&b), Some(&Some(expected)));
            }
            other => panic!("expected scoped reply, got {other:?}"),
        }
    }

    #[test]
    fn rejection_is_routed_to_the_proposer() {
        let mut net = network();
        let (leader, mut leader_rx) = join(&mut net);
        drain(&mut leader_rx);
        let (b, mut b_rx) = join_configured(&mut net, &leader, &mut leader_rx);
        let id = MutationId::new(&b, 4);
        net.handle_message(
            &leader,
            ClientMessage::RejectMutation {
                mutation_id: id.clone(),
                reason: "invalid path".into(),
            },
        );
        assert_eq!(
            drain(&mut b_rx),
            vec![ServerMessage::OrderInvariantMutationFailed {
                mutation_id: id,
                reason: "invalid path".into()
            }]
        );
    }

    #[test]
    fn time_out_sends_notice_then_close() {
        let mut net = network();
        let (a, mut rx) = join(&mut net);
        drain(&mut rx);
        net.time_out(&a, Duration::from_millis(1500));
        assert!(matches!(
            rx.try_recv(),
            Ok(Outbound::Message(ServerMessage::MessageTimeout { idle_ms: 1500 }))
        ));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
    }

    #[test]
    fn closed_network_refuses_joins() {
        let mut net = network();
        net.close_all();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(net.add_client(tx).is_err());
    }
}
