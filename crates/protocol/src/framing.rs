//! Sentinel-delimited payload framing.
//!
//! # Payload Format
//!
//! A payload (a script body or an uploaded file) travels as any number of
//! WebSocket messages, text or binary, each carrying raw bytes. A message
//! whose content is exactly [`PAYLOAD_SENTINEL`] ends the payload.
//!
//! The sentinel is compared against whole messages only, so `"EOF"` inside a
//! larger chunk is ordinary data. A chunk that is exactly those three bytes
//! cannot be told apart from end-of-payload; senders must avoid producing
//! one, which [`chunk_payload`] enforces.

use crate::error::{ProtocolError, Result};

/// Message content marking end-of-payload.
pub const PAYLOAD_SENTINEL: &[u8] = b"EOF";

/// Default chunk size used by [`chunk_payload`] callers (32KB).
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// One received payload message, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadFrame {
    /// Payload bytes to append in arrival order.
    Data(Vec<u8>),
    /// The end-of-payload sentinel.
    End,
}

impl PayloadFrame {
    /// Classify the content of one inbound message.
    pub fn classify(message: Vec<u8>) -> Self {
        if is_sentinel(&message) {
            PayloadFrame::End
        } else {
            PayloadFrame::Data(message)
        }
    }
}

/// Returns true if the message content is exactly the sentinel.
#[inline]
pub fn is_sentinel(message: &[u8]) -> bool {
    message == PAYLOAD_SENTINEL
}

/// Split `data` into messages of at most `chunk_size` bytes, followed by the
/// sentinel.
///
/// Fails if any data chunk would equal the sentinel, since the receiver
/// would stop reading there. Empty input yields only the sentinel.
pub fn chunk_payload(data: &[u8], chunk_size: usize) -> Result<Vec<Vec<u8>>> {
    if chunk_size == 0 {
        return Err(ProtocolError::InvalidChunkSize);
    }

    let mut messages = Vec::with_capacity(data.len() / chunk_size + 2);
    for (index, chunk) in data.chunks(chunk_size).enumerate() {
        if is_sentinel(chunk) {
            return Err(ProtocolError::AmbiguousChunk { index });
        }
        messages.push(chunk.to_vec());
    }
    messages.push(PAYLOAD_SENTINEL.to_vec());

    Ok(messages)
}
