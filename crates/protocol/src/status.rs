//! Terminal status carried by the closing frame of every channel.
//!
//! # Encoding
//!
//! | status                 | close code | reason                |
//! |------------------------|------------|-----------------------|
//! | `Exited(n)`            | 1000       | decimal `n` (0..=255) |
//! | `InvalidParameters(r)` | 1007       | `r`                   |
//! | `InternalError(r)`     | 1011       | `r`                   |
//!
//! Reasons longer than [`MAX_CLOSE_REASON_LEN`] bytes are cut at the last
//! UTF-8 boundary that fits.

use std::fmt;

use crate::error::{ProtocolError, Result};

/// Close code for a channel that ran to completion.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code for a request rejected before any work started.
pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;

/// Close code for an agent-side failure.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Largest close reason a WebSocket close frame can carry.
pub const MAX_CLOSE_REASON_LEN: usize = 123;

/// Exit status for a command that could not be found.
pub const EXIT_NOT_FOUND: u8 = 127;

/// Exit status for a command that was found but could not be executed.
pub const EXIT_NOT_EXECUTABLE: u8 = 126;

/// Exit status offset for processes terminated by a signal.
pub const EXIT_SIGNAL_BASE: u8 = 128;

/// Final outcome of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStatus {
    /// The channel's work finished with this status; 0 is success.
    Exited(u8),
    /// The request was rejected before any side effect.
    InvalidParameters(String),
    /// The agent failed while doing the channel's work.
    InternalError(String),
}

impl TerminalStatus {
    /// Successful completion.
    pub const SUCCESS: TerminalStatus = TerminalStatus::Exited(0);

    /// Status for a process exit code as reported by the OS.
    ///
    /// Codes outside 0..=255 saturate to 255.
    pub fn from_exit_code(code: i32) -> Self {
        TerminalStatus::Exited(u8::try_from(code).unwrap_or(u8::MAX))
    }

    /// Status for a process terminated by `signal`.
    pub fn from_signal(signal: i32) -> Self {
        Self::from_exit_code(i32::from(EXIT_SIGNAL_BASE).saturating_add(signal))
    }

    /// The WebSocket close code for this status.
    pub fn close_code(&self) -> u16 {
        match self {
            TerminalStatus::Exited(_) => CLOSE_NORMAL,
            TerminalStatus::InvalidParameters(_) => CLOSE_INVALID_PAYLOAD,
            TerminalStatus::InternalError(_) => CLOSE_INTERNAL_ERROR,
        }
    }

    /// The close reason for this status, truncated to fit a close frame.
    pub fn reason(&self) -> String {
        match self {
            TerminalStatus::Exited(code) => code.to_string(),
            TerminalStatus::InvalidParameters(reason) | TerminalStatus::InternalError(reason) => {
                truncate_reason(reason).to_string()
            }
        }
    }

    /// The exit status, if the channel completed.
    pub fn exit_code(&self) -> Option<u8> {
        match self {
            TerminalStatus::Exited(code) => Some(*code),
            _ => None,
        }
    }

    /// Whether the channel completed with status 0.
    pub fn is_success(&self) -> bool {
        matches!(self, TerminalStatus::Exited(0))
    }

    /// Decode a status from a received close frame.
    pub fn from_close(code: u16, reason: &str) -> Result<Self> {
        match code {
            CLOSE_NORMAL => reason
                .trim()
                .parse::<u8>()
                .map(TerminalStatus::Exited)
                .map_err(|_| ProtocolError::MalformedExitStatus(reason.to_string())),
            CLOSE_INVALID_PAYLOAD => Ok(TerminalStatus::InvalidParameters(reason.to_string())),
            CLOSE_INTERNAL_ERROR => Ok(TerminalStatus::InternalError(reason.to_string())),
            other => Err(ProtocolError::UnknownCloseCode(other)),
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalStatus::Exited(code) => write!(f, "exited with status {}", code),
            TerminalStatus::InvalidParameters(reason) => write!(f, "invalid parameters: {}", reason),
            TerminalStatus::InternalError(reason) => write!(f, "internal error: {}", reason),
        }
    }
}

/// Cut `reason` to at most [`MAX_CLOSE_REASON_LEN`] bytes on a char boundary.
pub fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON_LEN {
        return reason;
    }

    let mut end = MAX_CLOSE_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
