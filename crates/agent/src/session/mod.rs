//! Channel sessions.
//!
//! A [`Session`] wraps one upgraded WebSocket. Handlers borrow it, possibly
//! as separate sender and receiver halves so a read side and a write side can
//! run concurrently. The dispatcher owns it and closes it exactly once with
//! the handler's [`TerminalStatus`]; [`Session::close`] consumes the session.

pub mod pty;

use std::borrow::Cow;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{PayloadFrame, TerminalStatus};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

pub use pty::{attach_interactive, PtyError};

/// Unique identifier for a session, used in log spans.
pub type SessionId = Uuid;

/// Errors on the channel transport.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The peer closed the channel or the connection ended.
    #[error("channel closed by peer")]
    Closed,

    /// The WebSocket transport failed.
    #[error("websocket error: {0}")]
    Transport(#[from] axum::Error),
}

/// Errors while receiving a sentinel-terminated payload.
#[derive(Error, Debug)]
pub enum PayloadError {
    /// Reading the next message failed before the sentinel arrived.
    #[error("failed to read message: {0}")]
    Receive(#[from] ChannelError),

    /// Writing received data to its destination failed.
    #[error("failed to write data to file: {0}")]
    Write(#[source] std::io::Error),
}

/// One upgraded channel.
pub struct Session {
    id: SessionId,
    sender: SessionSender,
    receiver: SessionReceiver,
}

impl Session {
    /// Wrap an upgraded WebSocket.
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            id: Uuid::new_v4(),
            sender: SessionSender { sink },
            receiver: SessionReceiver { stream },
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The outbound half.
    pub fn sender(&mut self) -> &mut SessionSender {
        &mut self.sender
    }

    /// The inbound half.
    pub fn receiver(&mut self) -> &mut SessionReceiver {
        &mut self.receiver
    }

    /// Both halves, borrowed independently.
    pub fn halves(&mut self) -> (&mut SessionSender, &mut SessionReceiver) {
        (&mut self.sender, &mut self.receiver)
    }

    /// Send the closing frame for `status` and shut the channel down.
    ///
    /// Failures are logged; the peer may already be gone.
    pub async fn close(mut self, status: TerminalStatus) {
        let frame = CloseFrame {
            code: status.close_code(),
            reason: Cow::Owned(status.reason()),
        };

        if let Err(e) = self.sender.sink.send(Message::Close(Some(frame))).await {
            tracing::debug!(error = %e, "Failed to send close frame");
            return;
        }
        if let Err(e) = self.sender.sink.close().await {
            tracing::debug!(error = %e, "Failed to close channel");
        }
    }
}

/// Outbound half of a session.
pub struct SessionSender {
    sink: SplitSink<WebSocket, Message>,
}

impl SessionSender {
    /// Send a text message.
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), ChannelError> {
        self.sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Send a binary message.
    pub async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), ChannelError> {
        self.sink.send(Message::Binary(data)).await?;
        Ok(())
    }

    /// Send one line of process output: as text when it is valid UTF-8,
    /// otherwise as binary.
    pub async fn send_line(&mut self, line: Vec<u8>) -> Result<(), ChannelError> {
        match String::from_utf8(line) {
            Ok(text) => self.send_text(text).await,
            Err(e) => self.send_binary(e.into_bytes()).await,
        }
    }
}

/// Inbound half of a session.
pub struct SessionReceiver {
    stream: SplitStream<WebSocket>,
}

impl SessionReceiver {
    /// Receive the content of the next data message.
    ///
    /// Text and binary messages are both returned as raw bytes; control
    /// frames are skipped. Returns `Ok(None)` once the peer has closed.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        while let Some(message) = self.stream.next().await {
            match message? {
                Message::Text(text) => return Ok(Some(text.into_bytes())),
                Message::Binary(data) => return Ok(Some(data)),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "Peer sent close frame");
                    return Ok(None);
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
        Ok(None)
    }

    /// Copy a sentinel-terminated payload into `writer`, in arrival order.
    ///
    /// Returns the number of payload bytes written. A peer that closes
    /// before the sentinel is a receive failure.
    pub async fn copy_payload_to<W>(&mut self, writer: &mut W) -> Result<u64, PayloadError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;
        loop {
            let message = self.recv().await?.ok_or(ChannelError::Closed)?;
            match PayloadFrame::classify(message) {
                PayloadFrame::Data(data) => {
                    writer.write_all(&data).await.map_err(PayloadError::Write)?;
                    written += data.len() as u64;
                }
                PayloadFrame::End => break,
            }
        }
        writer.flush().await.map_err(PayloadError::Write)?;
        Ok(written)
    }
}
