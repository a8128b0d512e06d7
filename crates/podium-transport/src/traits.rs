//! Transport abstraction traits for Podium.
//!
//! A live connection is split into an outbound [`FrameSink`] and an inbound
//! [`FrameStream`] so that its write side and read side can run as separate
//! tasks.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Identifier of a live connection, also used as the hub's client id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(Arc<str>);

impl ConnectionId {
    /// `conn_{millis}_{n}` in hex, unique within the process.
    #[must_use]
    pub fn generate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{millis:x}_{n:x}").into())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

/// Why a connection stopped working.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A read or write did not complete in time.
    #[error("Timed out")]
    Timeout,

    /// A frame could not be written.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// A frame could not be read.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// A frame violated the wire format.
    #[error("Protocol error: {0}")]
    Protocol(#[from] podium_protocol::ProtocolError),

    /// Anything else ending the connection.
    #[error("{0}")]
    Other(String),
}

/// An accepted live connection.
///
/// Acceptance belongs to the HTTP layer; the session only receives the
/// connection once it is established.
pub trait Connection: Send {
    /// Connection id.
    fn id(&self) -> &ConnectionId;

    /// Printable peer address, for logs.
    fn peer(&self) -> Option<String> {
        None
    }

    /// Split into independently owned write and read halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>);
}

/// Outbound half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one encoded frame.
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the connection gracefully. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Inbound half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_distinct() {
        let ids: Vec<ConnectionId> = (0..64).map(|_| ConnectionId::generate()).collect();
        for (i, id) in ids.iter().enumerate() {
            assert!(id.as_str().starts_with("conn_"));
            assert!(!ids[i + 1..].contains(id));
        }
    }

    #[test]
    fn test_id_conversions() {
        let a: ConnectionId = "c1".into();
        let b: ConnectionId = String::from("c1").into();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "c1");
    }
}
