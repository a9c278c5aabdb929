pub mod messages;

pub use messages::{CommandKind, CommandMessage, Envelope, MetricSnapshot, SessionSignal};

use crate::error::ChannelError;

/// Upper bound for a single payload; real messages are a few hundred bytes.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, ChannelError> {
    serde_json::to_vec(envelope).map_err(|err| ChannelError::Encoding(err.to_string()))
}

pub fn decode(payload: &[u8]) -> Result<Envelope, ChannelError> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(ChannelError::Encoding(format!(
            "payload of {} bytes exceeds {MAX_PAYLOAD_BYTES}",
            payload.len()
        )));
    }
    serde_json::from_slice(payload).map_err(|err| ChannelError::Encoding(err.to_string()))
}
