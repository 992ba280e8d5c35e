// Message framing over WebSocket text frames, and state snapshot encoding.
//
// Every protocol message travels as one JSON document in one text frame.
// `encode_message` and `decode_message` are generic over the message type so
// both directions share the same size checks.
//
// A `MAX_MESSAGE_SIZE` constant (16 MB) protects against unbounded allocation
// from oversized frames. Full-state snapshots for late joiners are the
// largest expected messages.
//
// `EncodedState` is the base64-of-JSON form in which full state trees cross
// the relay. The relay never decodes it.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Maximum allowed frame size (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Serialize a message to the JSON text of one frame.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<String> {
    let text = serde_json::to_string(msg)?;
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            len: text.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(text)
}

/// Parse the JSON text of one frame.
pub fn decode_message<T: DeserializeOwned>(text: &str) -> Result<T> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            len: text.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(serde_json::from_str(text)?)
}

/// A full state tree, base64-encoded JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedState(pub String);

impl EncodedState {
    pub fn encode(state: &Value) -> Result<Self> {
        let json = serde_json::to_vec(state)?;
        Ok(Self(STANDARD.encode(json)))
    }

    pub fn decode(&self) -> Result<Value> {
        let bytes = STANDARD.decode(&self.0)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The starting state of a brand-new network.
    pub fn empty() -> Self {
        // `{}` is always encodable.
        Self(STANDARD.encode(b"{}"))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::message::{ClientMessage, ServerMessage};

    #[test]
    fn roundtrip_simple_message() {
        let text = encode_message(&ClientMessage::RequestClientControlledStates).unwrap();
        let back: ClientMessage = decode_message(&text).unwrap();
        assert_eq!(back, ClientMessage::RequestClientControlledStates);
    }

    #[test]
    fn rejects_oversized_read() {
        let text = "x".repeat(MAX_MESSAGE_SIZE + 1);
        let err = decode_message::<ServerMessage>(&text).unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge { .. }));
    }

    #[test]
    fn rejects_garbage() {
        let err = decode_message::<ServerMessage>("{\"type\":\"nope\"}").unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn encoded_state_roundtrip() {
        let state = json!({"board": [1, 2, 3], "turn": "white"});
        let encoded = EncodedState::encode(&state).unwrap();
        assert_eq!(encoded.decode().unwrap(), state);
    }

    #[test]
    fn empty_state_is_empty_object() {
        assert_eq!(EncodedState::empty().decode().unwrap(), json!({}));
    }

    #[test]
    fn bad_base64_is_an_error() {
        let err = EncodedState("!!!".into()).decode().unwrap_err();
        assert!(matches!(err, ProtocolError::Base64(_)));
    }
}
