//! Message encoding for the simulated wire.
//!
//! Frames are postcard-encoded [`Envelope`]s. Going through real bytes keeps
//! the engines honest: a duplicated frame decodes to an equal value, and
//! nothing can smuggle shared state between nodes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::types::NodeId;
use crate::messages::Message;

/// One addressed frame on the wire.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: Message,
}

/// Encode an envelope into its wire frame.
///
/// # Errors
/// Only if postcard cannot serialize the value, which for these message
/// types means a bug rather than bad input.
pub fn encode(envelope: &Envelope) -> Result<Bytes, postcard::Error> {
    postcard::to_allocvec(envelope).map(Bytes::from)
}

/// Decode a wire frame back into an envelope.
///
/// # Errors
/// If the frame is truncated or malformed.
pub fn decode(frame: &Bytes) -> Result<Envelope, postcard::Error> {
    postcard::from_bytes(frame)
}
