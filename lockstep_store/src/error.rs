// Error types for the replicated store.
//
// Ordering conflicts are *not* errors: a superseded proposal simply resolves
// `false`. What remains here is caller mistakes (`InvalidPath`), transport
// and protocol failures, and the one unrecoverable case where the leader's
// committed stream cannot be applied locally (`Diverged`).

use lockstep_protocol::{MutationIndex, ProtocolError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// A mutation's path does not fit the current document shape.
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// A committed transaction could not be applied to the lockstep state.
    #[error("committed transaction {index} does not apply locally: {reason}")]
    Diverged { index: MutationIndex, reason: String },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The relay did not complete the handshake in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The relay sent something other than the expected handshake reply.
    #[error("unexpected handshake message: {0}")]
    Handshake(String),

    /// The connection to the relay is gone.
    #[error("store is disconnected")]
    Disconnected,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The transport was disposed or the socket closed.
    #[error("transport closed")]
    Closed,
}
