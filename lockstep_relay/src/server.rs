// HTTP/WebSocket front end for the relay.
//
// Architecture: one tokio task pair per connection around a shared
// `Registry`.
//
// - **HTTP routes** (axum): `POST /networks` creates a network,
//   `HEAD /networks/{id}` checks existence, `GET /ping` answers `pong`.
// - **WebSocket upgrade** on `GET /networks/{id}`: the reader loop runs in
//   the upgrade future. It decodes each text frame as a `ClientMessage` and
//   hands it to the network under that network's mutex. A `tokio::time`
//   timeout around every read implements the idle timer; when it fires the
//   client gets `MessageTimeout` and the socket is closed.
// - **Writer task** (one per connection): drains the client's `Outbox` onto
//   the socket. The network only ever pushes into the outbox, so routing
//   never waits on a slow socket.
// - **Sweeper task**: every `sweep_interval`, removes networks whose
//   empty-grace deadline has passed.
//
// Shutdown: `RelayHandle::stop` closes every connection, stops the sweeper,
// and signals axum's graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use futures::{SinkExt, StreamExt};
use lockstep_protocol::{ClientMessage, NetworkId, decode_message, encode_message};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::error::RelayError;
use crate::network::Outbound;
use crate::registry::{Registry, SharedNetwork};

/// Configuration for starting a relay server.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// How long an empty network survives before it is swept.
    pub empty_network_grace: Duration,
    /// A connection that sends nothing for this long is closed.
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            empty_network_grace: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(20 * 60),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    idle_timeout: Duration,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateNetworkResponse {
    network_id: NetworkId,
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    registry: Arc<Registry>,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl RelayHandle {
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Close every connection, stop accepting new ones, and wait for the
    /// server task to finish.
    pub async fn stop(mut self) {
        self.registry.close_all();
        self.sweeper.abort();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.server).await;
    }
}

/// Build the relay's router around `registry`.
pub fn router(registry: Arc<Registry>, idle_timeout: Duration) -> Router {
    let state = AppState {
        registry,
        idle_timeout,
    };
    Router::new()
        .route("/ping", get(ping))
        .route("/networks", post(create_network))
        .route("/networks/{id}", get(connect_network).head(network_exists))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind, spawn the server and the sweeper, and return a handle plus the
/// bound address (useful with port 0).
pub async fn start_relay(config: RelayConfig) -> Result<(RelayHandle, SocketAddr), RelayError> {
    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .map_err(RelayError::Bind)?;
    let addr = listener.local_addr().map_err(RelayError::Bind)?;

    let registry = Arc::new(Registry::new(config.empty_network_grace));
    let app = router(Arc::clone(&registry), config.idle_timeout);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "relay server failed");
        }
    });

    let sweeper = tokio::spawn(sweep_loop(Arc::clone(&registry), config.sweep_interval));

    tracing::info!(%addr, "relay listening");
    Ok((
        RelayHandle {
            registry,
            shutdown: Some(shutdown_tx),
            server,
            sweeper,
        },
        addr,
    ))
}

async fn sweep_loop(registry: Arc<Registry>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        registry.sweep(Instant::now());
    }
}

async fn ping() -> &'static str {
    "pong"
}

async fn create_network(State(state): State<AppState>) -> Json<CreateNetworkResponse> {
    let network_id = state.registry.create_network(Instant::now());
    Json(CreateNetworkResponse { network_id })
}

async fn network_exists(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    if state.registry.exists(&NetworkId(id)) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn connect_network(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let id = NetworkId(id);
    let network = state.registry.get(&id);
    let idle_timeout = state.idle_timeout;
    ws.on_upgrade(move |mut socket| async move {
        match network {
            Some(network) => handle_socket(socket, network, idle_timeout).await,
            None => {
                tracing::debug!(network = %id, "connection to unknown network");
                let _ = socket.send(Message::Close(None)).await;
            }
        }
    })
    .into_response()
}

/// Serve one peer until it disconnects, misbehaves or idles out.
async fn handle_socket(socket: WebSocket, network: SharedNetwork, idle_timeout: Duration) {
    let (mut sink, mut stream) = socket.split();
    let (outbox, mut outgoing) = mpsc::unbounded_channel::<Outbound>();

    let added = network.lock().add_client(outbox);
    let client_id = match added {
        Ok(id) => id,
        Err(e) => {
            tracing::debug!(error = %e, "refusing connection");
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    let writer = tokio::spawn(async move {
        while let Some(out) = outgoing.recv().await {
            match out {
                Outbound::Message(msg) => {
                    let text = match encode_message(&msg) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping unencodable message");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    loop {
        match tokio::time::timeout(idle_timeout, stream.next()).await {
            Err(_) => {
                network.lock().time_out(&client_id, idle_timeout);
                break;
            }
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(Message::Text(text)))) => {
                match decode_message::<ClientMessage>(text.as_str()) {
                    Ok(msg) => {
                        tracing::debug!(client = %client_id, ?msg, "received");
                        network.lock().handle_message(&client_id, msg);
                    }
                    Err(e) => {
                        tracing::warn!(client = %client_id, error = %e, "malformed frame; closing");
                        break;
                    }
                }
            }
            // Pings, pongs and binary frames still count as activity.
            Ok(Some(Ok(_))) => {}
        }
    }

    network.lock().remove_client(&client_id, Instant::now());
    // The outbox was dropped with the client, so the writer drains what is
    // queued and exits.
    let _ = writer.await;
}
