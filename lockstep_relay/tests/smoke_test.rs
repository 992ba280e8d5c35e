// Integration smoke test for the relay server.
//
// Starts a relay on localhost and drives it with raw WebSocket clients that
// speak the protocol crate's message types directly, with no store
// involved. Covers the HTTP surface, the join handshake with a snapshot
// from the leader, proposal routing, commit fan-out, leader failover, and
// the idle timeout.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lockstep_protocol::{
    ClientId, ClientMessage, EncodedState, Mutation, MutationId, MutationIndex, ServerMessage,
    Transaction, decode_message, encode_message, path,
};
use lockstep_relay::{RelayConfig, RelayHandle, start_relay};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn start(idle_timeout: Duration) -> (RelayHandle, SocketAddr) {
    let config = RelayConfig {
        host: "127.0.0.1".into(),
        port: 0, // OS picks a free port
        idle_timeout,
        ..RelayConfig::default()
    };
    start_relay(config).await.unwrap()
}

async fn create_network(addr: SocketAddr) -> String {
    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("http://{addr}/networks"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["networkId"].as_str().unwrap().to_owned()
}

async fn connect(addr: SocketAddr, network: &str) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/networks/{network}"))
        .await
        .unwrap();
    socket
}

async fn send(socket: &mut Socket, msg: &ClientMessage) {
    let text = encode_message(msg).unwrap();
    socket.send(Message::Text(text.into())).await.unwrap();
}

/// Next protocol message, or `None` if the relay closed the socket.
async fn recv(socket: &mut Socket) -> Option<ServerMessage> {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for relay");
        match frame {
            Some(Ok(Message::Text(text))) => return Some(decode_message(text.as_str()).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => {}
        }
    }
}

async fn expect_config(socket: &mut Socket) -> (ClientId, bool) {
    match recv(socket).await {
        Some(ServerMessage::ClientConfig {
            client_id,
            is_leader,
            ..
        }) => (client_id, is_leader),
        other => panic!("expected ClientConfig, got {other:?}"),
    }
}

/// Join as a follower and answer the leader's snapshot request.
async fn join_follower(
    addr: SocketAddr,
    network: &str,
    leader: &mut Socket,
    state: serde_json::Value,
    last: Option<MutationIndex>,
) -> (Socket, ClientId) {
    let mut socket = connect(addr, network).await;
    let for_client = match recv(leader).await {
        Some(ServerMessage::RequestState { for_client }) => for_client,
        other => panic!("expected RequestState, got {other:?}"),
    };
    send(
        leader,
        &ClientMessage::State {
            for_client: for_client.clone(),
            state: EncodedState::encode(&state).unwrap(),
            last_mutation_index: last,
        },
    )
    .await;
    match recv(&mut socket).await {
        Some(ServerMessage::ClientConfig {
            client_id,
            is_leader,
            state: snapshot,
            last_mutation_index,
            ..
        }) => {
            assert_eq!(client_id, for_client);
            assert!(!is_leader);
            assert_eq!(snapshot.decode().unwrap(), state);
            assert_eq!(last_mutation_index, last);
        }
        other => panic!("expected ClientConfig, got {other:?}"),
    }
    (socket, for_client)
}

#[tokio::test]
async fn http_surface() {
    let (handle, addr) = start(Duration::from_secs(60)).await;
    let http = reqwest::Client::new();

    let pong = http
        .get(format!("http://{addr}/ping"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(pong, "pong");

    let network = create_network(addr).await;
    let found = http
        .head(format!("http://{addr}/networks/{network}"))
        .send()
        .await
        .unwrap();
    assert_eq!(found.status(), reqwest::StatusCode::OK);

    let missing = http
        .head(format!("http://{addr}/networks/no-such-network"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    // Upgrading against an unknown id is accepted and then closed.
    let mut socket = connect(addr, "no-such-network").await;
    assert!(recv(&mut socket).await.is_none());

    handle.stop().await;
}

#[tokio::test]
async fn full_network_lifecycle() {
    let (handle, addr) = start(Duration::from_secs(60)).await;
    let network = create_network(addr).await;

    // 1. First client leads with empty state.
    let mut leader = connect(addr, &network).await;
    let (leader_id, is_leader) = expect_config(&mut leader).await;
    assert!(is_leader);

    // 2. Two followers join with the leader's snapshot. The relay treats it
    //    as opaque, so any state and watermark will do.
    let snapshot = json!({"ayy": "lmao"});
    let (mut b, b_id) =
        join_follower(addr, &network, &mut leader, snapshot.clone(), Some(MutationIndex(0))).await;
    let (mut c, _c_id) =
        join_follower(addr, &network, &mut leader, snapshot, Some(MutationIndex(0))).await;

    // 3. b proposes; the relay routes it to the leader only.
    let proposal = Transaction {
        index: Some(MutationIndex(1)),
        mutations: vec![Mutation::set(path!["ayy"], "ayy")],
        events: vec![],
        mutation_id: MutationId::new(&b_id, 0),
    };
    send(
        &mut b,
        &ClientMessage::Mutation {
            transaction: proposal.clone(),
            committed: false,
        },
    )
    .await;
    assert_eq!(
        recv(&mut leader).await,
        Some(ServerMessage::Mutation {
            transaction: proposal.clone(),
            committed: false
        })
    );

    // 4. Leader commits it; both followers receive the commit.
    send(
        &mut leader,
        &ClientMessage::Mutation {
            transaction: proposal.clone(),
            committed: true,
        },
    )
    .await;
    let committed = Some(ServerMessage::Mutation {
        transaction: proposal,
        committed: true,
    });
    assert_eq!(recv(&mut b).await, committed);
    assert_eq!(recv(&mut c).await, committed);

    // 5. Leader drops; b (first follower) is asked to take over.
    let _ = leader.close(None).await;
    assert_eq!(recv(&mut b).await, Some(ServerMessage::PromoteToLeader));
    send(&mut b, &ClientMessage::AckPromoteToLeader).await;

    // Once b leads, the departure is announced.
    match recv(&mut c).await {
        Some(ServerMessage::ClientControlledStates { states, .. }) => {
            assert_eq!(states.get(&leader_id), Some(&None));
        }
        other => panic!("expected departure broadcast, got {other:?}"),
    }

    handle.stop().await;
}

#[tokio::test]
async fn idle_connection_is_timed_out() {
    let (handle, addr) = start(Duration::from_millis(200)).await;
    let network = create_network(addr).await;
    let mut socket = connect(addr, &network).await;
    expect_config(&mut socket).await;

    assert_eq!(
        recv(&mut socket).await,
        Some(ServerMessage::MessageTimeout { idle_ms: 200 })
    );
    assert!(recv(&mut socket).await.is_none());

    handle.stop().await;
}
