//! WebSocket connections accepted through axum.
//!
//! The HTTP layer performs the upgrade; this module adapts the upgraded
//! [`WebSocket`] to the [`Connection`] split halves.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use podium_protocol::ProtocolError;
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::traits::{Connection, ConnectionId, FrameSink, FrameStream, TransportError};

/// Default inbound message limit.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// An upgraded WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    max_message_size: usize,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(id: ConnectionId, socket: WebSocket) -> Self {
        Self {
            id,
            socket,
            remote_addr: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Record the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Set the inbound message limit in bytes.
    #[must_use]
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }
}

impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn peer(&self) -> Option<String> {
        self.remote_addr.map(|a| a.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        let (sink, stream) = self.socket.split();
        (
            Box::new(WebSocketSink {
                sink,
                closed: false,
            }),
            Box::new(WebSocketStream {
                id: self.id,
                stream,
                max_message_size: self.max_message_size,
            }),
        )
    }
}

/// Write half of a [`WebSocketConnection`].
pub struct WebSocketSink {
    sink: SplitSink<WebSocket, Message>,
    closed: bool,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        // Envelopes are JSON, so frames go out as text messages.
        let text = String::from_utf8(frame.to_vec())
            .map_err(|e| TransportError::SendFailed(format!("frame is not UTF-8: {e}")))?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Read half of a [`WebSocketConnection`].
pub struct WebSocketStream {
    id: ConnectionId,
    stream: SplitStream<WebSocket>,
    max_message_size: usize,
}

impl WebSocketStream {
    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_message_size {
            warn!(
                conn = %self.id,
                "Message too large: {} bytes (max: {})",
                len,
                self.max_message_size
            );
            return Err(TransportError::Protocol(ProtocolError::FrameTooLarge(len)));
        }
        Ok(())
    }
}

#[async_trait]
impl FrameStream for WebSocketStream {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    return Ok(Some(Bytes::from(text.into_bytes())));
                }
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    return Ok(Some(Bytes::from(data)));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // Control frames are answered by the socket itself.
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(conn = %self.id, "Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(conn = %self.id, "WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}
