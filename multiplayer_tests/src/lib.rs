// Test harness for end-to-end replication tests.
//
// `TestRelay` runs a real relay on an OS-assigned localhost port and joins
// real `ReplicatedStore` peers to its networks over WebSocket. Nothing here
// stubs the protocol: every test goes through the same relay routing,
// transport and reconciliation code a deployed peer would.
//
// The only test-specific code is `eventually`, a polling wait for
// conditions that settle asynchronously (a commit reaching every peer, an
// election finishing), tighter timeouts in `store_config`, and
// `ScriptedLeader`, a hand-driven leader for scenarios a real leader never
// produces on demand (a proposal lost in transit).
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::net::SocketAddr;
use std::sync::Once;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use lockstep_protocol::{
    ClientMessage, EncodedState, NetworkId, ServerMessage, Transaction, decode_message,
    encode_message,
};
use lockstep_relay::{RelayConfig, RelayHandle, start_relay};
use lockstep_store::{ReplicatedStore, StoreConfig};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Upper bound for any single `eventually` wait.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep between `eventually` checks.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

static TRACING: Once = Once::new();

/// Install a test-friendly subscriber once per process. Respects
/// `RUST_LOG`; silent by default.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "off".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Store settings for tests: long enough to never fire on a healthy
/// localhost relay, short enough that a bug fails fast.
pub fn store_config() -> StoreConfig {
    StoreConfig {
        confirmation_timeout: WAIT_TIMEOUT,
        handshake_timeout: WAIT_TIMEOUT,
        ..StoreConfig::default()
    }
}

/// A relay running inside the test process.
pub struct TestRelay {
    handle: RelayHandle,
    addr: SocketAddr,
}

impl TestRelay {
    pub async fn start() -> Self {
        init_tracing();
        let config = RelayConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..RelayConfig::default()
        };
        let (handle, addr) = start_relay(config).await.expect("relay failed to start");
        Self { handle, addr }
    }

    pub fn create_network(&self) -> NetworkId {
        self.handle.registry().create_network(Instant::now())
    }

    pub fn url(&self, network: &NetworkId) -> String {
        format!("ws://{}/networks/{}", self.addr, network)
    }

    /// Join `network` as a new peer, waiting for the handshake to finish.
    pub async fn join(&self, network: &NetworkId) -> ReplicatedStore {
        self.join_with(network, store_config()).await
    }

    pub async fn join_with(&self, network: &NetworkId, config: StoreConfig) -> ReplicatedStore {
        ReplicatedStore::connect(&self.url(network), config)
            .await
            .expect("peer failed to join")
    }

    pub async fn stop(self) {
        self.handle.stop().await;
    }
}

/// Poll `check` until it holds, panicking with `what` after `WAIT_TIMEOUT`.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let start = Instant::now();
    while !check() {
        assert!(start.elapsed() < WAIT_TIMEOUT, "timed out waiting for {what}");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Wait until every peer has no unconfirmed speculation left and all peers
/// hold the same committed state.
pub async fn converged(peers: &[&ReplicatedStore]) {
    eventually("peers to converge", || {
        let Some(first) = peers.first() else {
            return true;
        };
        let reference = first.lockstep_state();
        peers.iter().all(|p| {
            let lockstep = p.lockstep_state();
            lockstep == reference && p.rollback_state() == lockstep
        })
    })
    .await;
}

/// A leader played by the test over a raw socket. It answers state
/// requests with an empty document and commits only what the test tells it
/// to.
pub struct ScriptedLeader {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl ScriptedLeader {
    /// Join `network` as its first client, and therefore its leader.
    pub async fn join(relay: &TestRelay, network: &NetworkId) -> Self {
        let (socket, _) = connect_async(relay.url(network))
            .await
            .expect("scripted leader failed to connect");
        let mut leader = Self { socket };
        match leader.recv().await {
            ServerMessage::ClientConfig { is_leader: true, .. } => leader,
            other => panic!("expected leader config, got {other:?}"),
        }
    }

    /// Wait for the relay to ask for a snapshot and send `{}`.
    pub async fn answer_state_request(&mut self) {
        loop {
            if let ServerMessage::RequestState { for_client } = self.recv().await {
                self.send(ClientMessage::State {
                    for_client,
                    state: EncodedState::empty(),
                    last_mutation_index: None,
                })
                .await;
                return;
            }
        }
    }

    /// Next proposal routed to this leader.
    pub async fn next_proposal(&mut self) -> Transaction {
        loop {
            if let ServerMessage::Mutation {
                transaction,
                committed: false,
            } = self.recv().await
            {
                return transaction;
            }
        }
    }

    /// Broadcast `transaction` as committed at the index it carries.
    pub async fn commit(&mut self, transaction: Transaction) {
        self.send(ClientMessage::Mutation {
            transaction,
            committed: true,
        })
        .await;
    }

    async fn send(&mut self, msg: ClientMessage) {
        let text = encode_message(&msg).expect("unencodable message");
        self.socket
            .send(Message::Text(text.into()))
            .await
            .expect("relay closed the socket");
    }

    async fn recv(&mut self) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(WAIT_TIMEOUT, self.socket.next())
                .await
                .expect("timed out waiting for the relay");
            match frame {
                Some(Ok(Message::Text(text))) => {
                    return decode_message(text.as_str()).expect("malformed frame");
                }
                Some(Ok(_)) => {}
                other => panic!("relay closed the socket: {other:?}"),
            }
        }
    }
}
