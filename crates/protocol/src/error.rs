//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering request validation and wire decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    // Request errors
    /// A required query parameter is absent or empty.
    #[error("No {0} specified")]
    MissingParameter(&'static str),

    /// The upload target is incomplete.
    #[error("Invalid file_name or file_path")]
    InvalidTransferTarget,

    /// A query parameter is present but unusable.
    #[error("invalid {name} {value:?}: {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// The rejected value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// No channel is served at the given path.
    #[error("unknown channel path: {0}")]
    UnknownChannel(String),

    // Framing errors
    /// A data chunk would be read back as the end-of-payload sentinel.
    #[error("payload chunk {index} is indistinguishable from the end-of-payload sentinel")]
    AmbiguousChunk {
        /// Position of the offending chunk.
        index: usize,
    },

    /// Chunk size of zero was requested.
    #[error("chunk size must be greater than 0")]
    InvalidChunkSize,

    // Status errors
    /// The close code does not map to a terminal status.
    #[error("unexpected close code {0}")]
    UnknownCloseCode(u16),

    /// A normal close carried a reason that is not an exit status.
    #[error("malformed exit status {0:?}")]
    MalformedExitStatus(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
