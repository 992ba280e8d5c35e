// Async replicated store: a `Replica` wired to the relay.
//
// `ReplicatedStore::connect()` opens the transport, waits for the relay's
// `ClientConfig`, seeds the replica from the snapshot it carries, and then
// spawns a single driver task that owns the inbound half of the socket. The
// driver is the only code path that applies remote traffic; local callers
// go through `submit()`. Both take the same `parking_lot` lock around the
// replica and send while holding it, so the order messages leave in always
// matches the order indices were claimed or assigned.
//
// Leaders commit locally and resolve immediately. Followers speculate,
// register a `oneshot` keyed by the proposal's `MutationId`, and await it.
// The driver resolves waiters `true` when their id commits and `false` when
// the replica reports them superseded, the leader rejects them, this peer
// is promoted, or the connection goes away. `confirmation_timeout` bounds
// the wait in case the leader silently drops the proposal and nothing else
// ever claims its index; a timed-out proposal is rewound like a rejected
// one so it stops holding that index.
//
// Observers subscribe to a `broadcast` of `StoreUpdate`s. State changes are
// announced before the events of the transactions that caused them, so an
// event handler always sees the state the event describes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use lockstep_protocol::{
    ClientId, ClientMessage, ClientSlot, EncodedState, Event, Mutation, MutationId, MutationIndex,
    PathSegment, ServerMessage, Transaction,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::builder::TransactionBuilder;
use crate::client_state::ClientStates;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::replica::{ProposalOutcome, Reconciled, Replica, Role};
use crate::transport::{Transport, TransportSender};

/// Buffered notifications per subscriber before the oldest are dropped.
const UPDATE_CAPACITY: usize = 256;

/// Something observers may want to react to.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreUpdate {
    /// An event carried by a committed (or, on the leader, local)
    /// transaction.
    Event(Event),
    /// The rollback state changed.
    StateChanged,
    /// Some peer's client-controlled state changed or a peer left.
    ClientStatesChanged,
    /// This peer became the leader.
    Promoted,
    /// The connection to the relay is gone; the store is read-only now.
    Disconnected,
}

/// A peer's handle on a replicated network. Cheap to clone; all clones share
/// one connection.
#[derive(Clone)]
pub struct ReplicatedStore {
    shared: Arc<Shared>,
}

struct Shared {
    client_id: ClientId,
    peer: Mutex<Peer>,
    sender: TransportSender,
    updates: broadcast::Sender<StoreUpdate>,
    config: StoreConfig,
    driver: Mutex<Option<JoinHandle<()>>>,
}

struct Peer {
    replica: Replica,
    client_states: ClientStates,
    waiters: HashMap<MutationId, oneshot::Sender<bool>>,
    connected: bool,
}

struct Handshake {
    client_id: ClientId,
    is_leader: bool,
    state: EncodedState,
    last_mutation_index: Option<MutationIndex>,
    client_controlled_states: BTreeMap<ClientId, ClientSlot>,
}

impl ReplicatedStore {
    /// Join the network behind `url` (`ws://host:port/networks/<id>`).
    /// Returns once this peer holds a consistent snapshot and the initial
    /// client-controlled states.
    pub async fn connect(url: &str, config: StoreConfig) -> Result<Self> {
        let transport = Transport::connect(url).await?;
        let (sender, mut inbox) = transport.into_parts();

        let handshake = match tokio::time::timeout(
            config.handshake_timeout,
            await_client_config(&mut inbox),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                sender.dispose();
                return Err(StoreError::HandshakeTimeout);
            }
        };

        let state = handshake.state.decode()?;
        let role = if handshake.is_leader {
            Role::Leader
        } else {
            Role::Follower
        };
        tracing::info!(
            client = %handshake.client_id,
            is_leader = handshake.is_leader,
            last_mutation_index = ?handshake.last_mutation_index,
            "joined network"
        );

        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let shared = Arc::new(Shared {
            client_id: handshake.client_id.clone(),
            peer: Mutex::new(Peer {
                replica: Replica::new(
                    handshake.client_id.clone(),
                    role,
                    state,
                    handshake.last_mutation_index,
                ),
                client_states: ClientStates::new(
                    handshake.client_id,
                    handshake.client_controlled_states,
                ),
                waiters: HashMap::new(),
                connected: true,
            }),
            sender,
            updates,
            config,
            driver: Mutex::new(None),
        });

        {
            let mut peer = shared.peer.lock();
            let initial = shared.config.initial_client_state.clone();
            if !initial.is_empty() {
                let slot = peer.client_states.set_own(initial);
                shared.sender.send(ClientMessage::SetClientControlledState {
                    state: slot,
                    merge: false,
                })?;
            }
            shared
                .sender
                .send(ClientMessage::RequestClientControlledStates)?;
        }

        let (ready_tx, mut ready_rx) = watch::channel(false);
        let driver = tokio::spawn(drive(Arc::clone(&shared), inbox, ready_tx));
        *shared.driver.lock() = Some(driver);

        let ready = tokio::time::timeout(
            shared.config.handshake_timeout,
            ready_rx.wait_for(|ready| *ready),
        )
        .await;
        match ready {
            Ok(Ok(_)) => Ok(Self { shared }),
            Ok(Err(_)) => Err(StoreError::Disconnected),
            Err(_) => {
                shared.sender.dispose();
                Err(StoreError::HandshakeTimeout)
            }
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.shared.client_id
    }

    pub fn is_leader(&self) -> bool {
        self.shared.peer.lock().replica.role() == Role::Leader
    }

    pub fn is_connected(&self) -> bool {
        self.shared.peer.lock().connected
    }

    /// Current state including this peer's unconfirmed proposals.
    pub fn rollback_state(&self) -> Value {
        self.shared.peer.lock().replica.rollback().root().clone()
    }

    /// Current committed state.
    pub fn lockstep_state(&self) -> Value {
        self.shared.peer.lock().replica.lockstep().root().clone()
    }

    /// Read one value from the rollback state.
    pub fn get(&self, path: &[PathSegment]) -> Option<Value> {
        self.shared.peer.lock().replica.rollback().get(path).cloned()
    }

    pub fn last_mutation_index(&self) -> Option<MutationIndex> {
        self.shared.peer.lock().replica.last_mutation_index()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.shared.updates.subscribe()
    }

    /// Apply one mutation. Resolves `true` once it is part of the committed
    /// history, `false` if another transaction took its place.
    pub async fn set_store(&self, mutation: Mutation) -> Result<bool> {
        self.submit(vec![mutation], Vec::new(), true).await
    }

    /// Apply several mutations, and the events describing them, as one
    /// atomic transaction.
    pub async fn set_store_transaction(
        &self,
        mutations: Vec<Mutation>,
        events: Vec<Event>,
    ) -> Result<bool> {
        self.submit(mutations, events, true).await
    }

    /// Propose a transaction that does not depend on the state it was
    /// computed from. Followers skip speculation; the leader commits it at
    /// whatever index is next, and a refusal comes back as a rejection.
    pub async fn set_store_unordered(
        &self,
        mutations: Vec<Mutation>,
        events: Vec<Event>,
    ) -> Result<bool> {
        self.submit(mutations, events, false).await
    }

    /// Recompute and resubmit a transaction until it commits. `build` sees
    /// the rollback state of each attempt; at most `num_retries + 1`
    /// attempts are made. An empty mutation list counts as success.
    pub async fn set_store_with_retries<F>(&self, mut build: F, num_retries: usize) -> Result<bool>
    where
        F: FnMut(&Value) -> Vec<Mutation>,
    {
        for attempt in 0..=num_retries {
            let mutations = build(&self.rollback_state());
            if mutations.is_empty() {
                return Ok(true);
            }
            if self.set_store_transaction(mutations, Vec::new()).await? {
                return Ok(true);
            }
            tracing::debug!(attempt, "transaction superseded, retrying");
        }
        Ok(false)
    }

    pub async fn set_store_with_default_retries<F>(&self, build: F) -> Result<bool>
    where
        F: FnMut(&Value) -> Vec<Mutation>,
    {
        self.set_store_with_retries(build, self.shared.config.default_retries)
            .await
    }

    /// Start collecting mutations from several call sites into one
    /// transaction.
    pub fn transaction(&self) -> TransactionBuilder {
        TransactionBuilder::new(self.clone())
    }

    /// Replace this peer's client-controlled state.
    pub fn set_client_controlled_state(&self, slot: ClientSlot) -> Result<()> {
        let mut peer = self.shared.peer.lock();
        let slot = peer.client_states.set_own(slot);
        self.shared
            .sender
            .send(ClientMessage::SetClientControlledState {
                state: slot,
                merge: false,
            })?;
        drop(peer);
        self.shared.notify(StoreUpdate::ClientStatesChanged);
        Ok(())
    }

    /// Merge keys into this peer's client-controlled state; `null` removes
    /// a key.
    pub fn merge_client_controlled_state(&self, patch: ClientSlot) -> Result<()> {
        let mut peer = self.shared.peer.lock();
        peer.client_states.merge_own(patch.clone());
        self.shared
            .sender
            .send(ClientMessage::SetClientControlledState {
                state: patch,
                merge: true,
            })?;
        drop(peer);
        self.shared.notify(StoreUpdate::ClientStatesChanged);
        Ok(())
    }

    /// Every connected peer's client-controlled state, this one included.
    pub fn client_controlled_states(&self) -> BTreeMap<ClientId, ClientSlot> {
        self.shared.peer.lock().client_states.all().clone()
    }

    /// Close the connection and wait for the driver to finish. Pending
    /// proposals resolve `false`.
    pub async fn close(&self) {
        self.shared.sender.dispose();
        let driver = self.shared.driver.lock().take();
        if let Some(mut driver) = driver {
            let timeout = self.shared.config.handshake_timeout;
            if tokio::time::timeout(timeout, &mut driver).await.is_err() {
                tracing::warn!("relay did not close the socket; aborting driver");
                driver.abort();
                self.shared.disconnect();
            }
        }
    }

    pub(crate) async fn submit(
        &self,
        mutations: Vec<Mutation>,
        events: Vec<Event>,
        ordered: bool,
    ) -> Result<bool> {
        if mutations.is_empty() && events.is_empty() {
            return Ok(true);
        }

        let (mutation_id, confirmation) = {
            let mut peer = self.shared.peer.lock();
            if !peer.connected {
                return Err(StoreError::Disconnected);
            }
            if peer.replica.role() == Role::Leader {
                let transaction = peer.replica.commit_local(mutations, events)?;
                let events = transaction.events.clone();
                self.shared.sender.send(ClientMessage::Mutation {
                    transaction,
                    committed: true,
                })?;
                drop(peer);
                self.shared.dispatch(events, true);
                return Ok(true);
            }

            let transaction = if ordered {
                peer.replica.speculate(mutations, events)?
            } else {
                peer.replica.propose_unordered(mutations, events)
            };
            let mutation_id = transaction.mutation_id.clone();
            let (tx, rx) = oneshot::channel();
            peer.waiters.insert(mutation_id.clone(), tx);
            tracing::debug!(id = %mutation_id, index = ?transaction.index, "proposing");
            self.shared.sender.send(ClientMessage::Mutation {
                transaction,
                committed: false,
            })?;
            (mutation_id, rx)
        };
        if ordered {
            self.shared.notify(StoreUpdate::StateChanged);
        }

        match tokio::time::timeout(self.shared.config.confirmation_timeout, confirmation).await {
            Ok(Ok(accepted)) => Ok(accepted),
            // Waiter dropped without an answer: the connection went away.
            Ok(Err(_)) => Ok(false),
            Err(_) => {
                // The leader dropped it and nothing took its index. Rewind it
                // so later proposals claim the index it was holding.
                tracing::debug!(id = %mutation_id, "confirmation timed out");
                self.shared.abandon(mutation_id);
                Ok(false)
            }
        }
    }
}

async fn await_client_config(
    inbox: &mut mpsc::UnboundedReceiver<ServerMessage>,
) -> Result<Handshake> {
    match inbox.recv().await {
        Some(ServerMessage::ClientConfig {
            client_id,
            is_leader,
            state,
            last_mutation_index,
            client_controlled_states,
        }) => Ok(Handshake {
            client_id,
            is_leader,
            state,
            last_mutation_index,
            client_controlled_states,
        }),
        Some(other) => Err(StoreError::Handshake(format!("{other:?}"))),
        None => Err(StoreError::Disconnected),
    }
}

/// Driver task: apply everything the relay sends until the socket closes.
async fn drive(
    shared: Arc<Shared>,
    mut inbox: mpsc::UnboundedReceiver<ServerMessage>,
    ready: watch::Sender<bool>,
) {
    while let Some(msg) = inbox.recv().await {
        shared.handle(msg, &ready);
    }
    shared.disconnect();
}

impl Shared {
    fn handle(&self, msg: ServerMessage, ready: &watch::Sender<bool>) {
        match msg {
            ServerMessage::Mutation {
                transaction,
                committed: true,
            } => self.on_committed(transaction),
            ServerMessage::Mutation {
                transaction,
                committed: false,
            } => self.on_proposal(transaction),
            ServerMessage::RequestState { for_client } => self.on_request_state(for_client),
            ServerMessage::PromoteToLeader => self.on_promote(),
            ServerMessage::ClientControlledStates { states, for_client } => {
                let changed = self.peer.lock().client_states.apply_updates(states);
                if changed {
                    self.notify(StoreUpdate::ClientStatesChanged);
                }
                if for_client.as_ref() == Some(&self.client_id) {
                    ready.send_replace(true);
                }
            }
            ServerMessage::OrderInvariantMutationFailed {
                mutation_id,
                reason,
            } => self.on_rejected(mutation_id, reason),
            ServerMessage::MessageTimeout { idle_ms } => {
                tracing::warn!(idle_ms, "relay is closing this idle connection");
            }
            ServerMessage::ClientConfig { .. } => {
                tracing::warn!("ignoring repeated client config");
            }
        }
    }

    fn on_committed(&self, transaction: Transaction) {
        let reconciled = {
            let mut peer = self.peer.lock();
            if peer.replica.role() == Role::Leader {
                tracing::warn!(id = %transaction.mutation_id, "leader received a committed transaction");
            }
            match peer.replica.receive_committed(transaction) {
                Ok(reconciled) => {
                    resolve(&mut peer.waiters, &reconciled);
                    reconciled
                }
                Err(e) => {
                    tracing::error!(error = %e, "cannot apply committed transaction");
                    return;
                }
            }
        };
        let changed = reconciled.applied > 0 || !reconciled.superseded.is_empty();
        self.dispatch(reconciled.events, changed);
    }

    fn on_proposal(&self, transaction: Transaction) {
        let mut peer = self.peer.lock();
        let id = transaction.mutation_id.clone();
        match peer.replica.receive_proposal(transaction) {
            Ok(ProposalOutcome::Committed(transaction)) => {
                tracing::debug!(%id, index = ?transaction.index, "committed proposal");
                let events = transaction.events.clone();
                self.send(ClientMessage::Mutation {
                    transaction,
                    committed: true,
                });
                drop(peer);
                self.dispatch(events, true);
            }
            Ok(ProposalOutcome::OutOfOrder { claimed, expected }) => {
                tracing::debug!(%id, %claimed, %expected, "dropping out-of-order proposal");
            }
            Ok(ProposalOutcome::Rejected {
                mutation_id,
                reason,
            }) => {
                tracing::debug!(%mutation_id, %reason, "rejecting proposal");
                self.send(ClientMessage::RejectMutation {
                    mutation_id,
                    reason,
                });
            }
            Ok(ProposalOutcome::Stale) => {
                tracing::debug!(%id, "dropping own proposal from before promotion");
            }
            Ok(ProposalOutcome::NotLeader) => {
                tracing::warn!(%id, "received a proposal while not leader");
            }
            Err(e) => tracing::error!(%id, error = %e, "failed to process proposal"),
        }
    }

    fn on_request_state(&self, for_client: ClientId) {
        let peer = self.peer.lock();
        if peer.replica.role() != Role::Leader {
            tracing::warn!(%for_client, "state requested from a follower");
            return;
        }
        let (state, last_mutation_index) = peer.replica.snapshot();
        match EncodedState::encode(&state) {
            Ok(state) => {
                tracing::debug!(%for_client, ?last_mutation_index, "sending state snapshot");
                self.send(ClientMessage::State {
                    for_client,
                    state,
                    last_mutation_index,
                });
            }
            Err(e) => tracing::error!(error = %e, "failed to encode state snapshot"),
        }
    }

    fn on_promote(&self) {
        let superseded = {
            let mut peer = self.peer.lock();
            let superseded = match peer.replica.promote() {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::error!(error = %e, "failed to rewind speculation on promotion");
                    return;
                }
            };
            for id in &superseded {
                if let Some(waiter) = peer.waiters.remove(id) {
                    let _ = waiter.send(false);
                }
            }
            self.send(ClientMessage::AckPromoteToLeader);
            superseded.len()
        };
        tracing::info!(client = %self.client_id, superseded, "promoted to leader");
        self.notify(StoreUpdate::Promoted);
        if superseded > 0 {
            self.notify(StoreUpdate::StateChanged);
        }
    }

    fn on_rejected(&self, mutation_id: MutationId, reason: String) {
        tracing::warn!(%mutation_id, %reason, "leader rejected proposal");
        self.abandon(mutation_id);
    }

    /// Give up on one of our proposals: undo it and everything speculated
    /// after it, and resolve whatever is now definitely lost `false`.
    fn abandon(&self, mutation_id: MutationId) {
        {
            let mut peer = self.peer.lock();
            let superseded = match peer.replica.discard(&mutation_id) {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::error!(error = %e, "failed to rewind abandoned proposal");
                    vec![mutation_id]
                }
            };
            for id in superseded {
                if let Some(waiter) = peer.waiters.remove(&id) {
                    let _ = waiter.send(false);
                }
            }
        }
        self.notify(StoreUpdate::StateChanged);
    }

    fn disconnect(&self) {
        {
            let mut peer = self.peer.lock();
            if !peer.connected {
                return;
            }
            peer.connected = false;
            for (_, waiter) in peer.waiters.drain() {
                let _ = waiter.send(false);
            }
        }
        tracing::info!(client = %self.client_id, "disconnected from relay");
        self.notify(StoreUpdate::Disconnected);
    }

    fn send(&self, msg: ClientMessage) {
        if let Err(e) = self.sender.send(msg) {
            tracing::debug!(error = %e, "dropping outgoing message");
        }
    }

    fn notify(&self, update: StoreUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    fn dispatch(&self, events: Vec<Event>, state_changed: bool) {
        if state_changed {
            self.notify(StoreUpdate::StateChanged);
        }
        for event in events {
            self.notify(StoreUpdate::Event(event));
        }
    }
}

fn resolve(waiters: &mut HashMap<MutationId, oneshot::Sender<bool>>, reconciled: &Reconciled) {
    let outcomes = reconciled
        .committed
        .iter()
        .map(|id| (id, true))
        .chain(reconciled.superseded.iter().map(|id| (id, false)));
    for (id, accepted) in outcomes {
        if let Some(waiter) = waiters.remove(id) {
            let _ = waiter.send(accepted);
        }
    }
}
