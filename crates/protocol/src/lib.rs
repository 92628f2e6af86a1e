//! # Node Agent Protocol Library
//!
//! Wire-level primitives shared by the node agent and its callers.
//!
//! ## Overview
//!
//! A caller opens one WebSocket per operation. The path selects the
//! operation, the query string carries its parameters, payloads travel as
//! sentinel-terminated message sequences, and the close frame reports the
//! outcome:
//!
//! ```text
//! caller                                  agent
//!   │  GET /upload?file_name=..&file_path=..  │
//!   │ ───────────────────────────────────────▶│  ChannelRequest::parse
//!   │  "chunk", "chunk", ..., "EOF"           │
//!   │ ───────────────────────────────────────▶│  PayloadFrame::classify
//!   │  Close(1000, "0")                       │
//!   │ ◀───────────────────────────────────────│  TerminalStatus
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ChannelKind, ChannelRequest, TerminalStatus};
//!
//! let request = ChannelRequest::parse(ChannelKind::PortProbe, Some("port=8080")).unwrap();
//! assert_eq!(request, ChannelRequest::PortProbe { port: 8080 });
//!
//! let status = TerminalStatus::from_close(1000, "0").unwrap();
//! assert!(status.is_success());
//! ```
//!
//! ## Modules
//!
//! - [`channel`]: channel kinds, paths and request parameters
//! - [`framing`]: end-of-payload sentinel framing
//! - [`status`]: terminal status and close-frame encoding
//! - [`error`]: error types

pub mod channel;
pub mod error;
pub mod framing;
pub mod status;

pub use channel::{ChannelKind, ChannelRequest, Interpreter};
pub use error::{ProtocolError, Result};
pub use framing::{
    chunk_payload, is_sentinel, PayloadFrame, DEFAULT_CHUNK_SIZE,
    PAYLOAD_SENTINEL,
};
pub use status::{
    TerminalStatus, CLOSE_INTERNAL_ERROR, CLOSE_INVALID_PAYLOAD, CLOSE_NORMAL,
    EXIT_NOT_EXECUTABLE, EXIT_NOT_FOUND, EXIT_SIGNAL_BASE, MAX_CLOSE_REASON_LEN,
};
