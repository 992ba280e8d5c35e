// Errors raised while encoding or decoding protocol traffic.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON (de)serialization of a message or state tree failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A state snapshot was not valid base64.
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A frame exceeded `MAX_MESSAGE_SIZE`.
    #[error("message too large: {len} bytes (max {max})")]
    MessageTooLarge { len: usize, max: usize },

    /// A mutation id that is not `<client>:<counter>`.
    #[error("malformed mutation id: {0}")]
    MalformedMutationId(String),
}
