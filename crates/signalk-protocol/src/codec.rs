//! WebSocket message codec for SignalK protocol.
//!
//! SignalK uses JSON messages over WebSocket text frames. Mapped deltas use
//! the same JSON encoding on the inter-stage bus.

use crate::messages::{ClientMessage, ServerMessage};
use signalk_core::Delta;
use thiserror::Error;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to (de)serialize message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid delta: {0}")]
    InvalidDelta(#[from] signalk_core::ModelError),
}

/// Encode a server message to JSON string for WebSocket transmission.
pub fn encode_server_message(msg: &ServerMessage) -> Result<String, CodecError> {
    serde_json::to_string(msg).map_err(CodecError::from)
}

/// Decode a client message from JSON string received over WebSocket.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, CodecError> {
    serde_json::from_str(text).map_err(CodecError::from)
}

/// Encode a delta for the Mapped bus.
pub fn encode_delta(delta: &Delta) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(delta).map_err(CodecError::from)
}

/// Decode and validate a delta received from the Mapped bus.
pub fn decode_delta(bytes: &[u8]) -> Result<Delta, CodecError> {
    let delta: Delta = serde_json::from_slice(bytes)?;
    delta.validate()?;
    Ok(delta)
}
