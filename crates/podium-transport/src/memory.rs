//! In-process connections backed by channels.
//!
//! [`pair`] returns the server side as a [`Connection`] and a [`MemoryPeer`]
//! that plays the client. Used by tests and benchmarks.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::traits::{Connection, ConnectionId, FrameSink, FrameStream, TransportError};

/// Create a connected pair. `capacity` bounds each direction.
#[must_use]
pub fn pair(id: impl Into<ConnectionId>, capacity: usize) -> (MemoryConnection, MemoryPeer) {
    let (to_server, from_peer) = mpsc::channel(capacity);
    let (to_peer, from_server) = mpsc::channel(capacity);
    (
        MemoryConnection {
            id: id.into(),
            outbound: to_peer,
            inbound: from_peer,
        },
        MemoryPeer {
            outbound: Some(to_server),
            inbound: from_server,
        },
    )
}

/// Server side of an in-memory connection.
pub struct MemoryConnection {
    id: ConnectionId,
    outbound: mpsc::Sender<Bytes>,
    inbound: mpsc::Receiver<Bytes>,
}

impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn peer(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        (
            Box::new(MemorySink {
                tx: Some(self.outbound),
            }),
            Box::new(MemoryStream { rx: self.inbound }),
        )
    }
}

struct MemorySink {
    tx: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// Client side of an in-memory connection.
pub struct MemoryPeer {
    outbound: Option<mpsc::Sender<Bytes>>,
    inbound: mpsc::Receiver<Bytes>,
}

impl MemoryPeer {
    /// Send a frame to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if either side has closed.
    pub async fn send(&self, frame: impl Into<Bytes>) -> Result<(), TransportError> {
        let tx = self
            .outbound
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame.into())
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive the next frame from the server. `None` once the server closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Take a frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.inbound.try_recv().ok()
    }

    /// Close the client-to-server direction.
    pub fn close(&mut self) {
        self.outbound = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_round_trip() {
        let (conn, mut peer) = pair("c1", 4);
        assert_eq!(conn.id().as_str(), "c1");
        let (mut sink, mut stream) = Box::new(conn).split();

        peer.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(stream.recv().await.unwrap().unwrap(), "hello");

        sink.send(Bytes::from_static(b"world")).await.unwrap();
        assert_eq!(peer.recv().await.unwrap(), "world");
    }

    #[tokio::test]
    async fn test_close_ends_both_directions() {
        let (conn, mut peer) = pair("c1", 4);
        let (mut sink, mut stream) = Box::new(conn).split();

        peer.close();
        assert!(stream.recv().await.unwrap().is_none());

        sink.close().await.unwrap();
        sink.close().await.unwrap();
        assert!(peer.recv().await.is_none());
        assert!(matches!(
            sink.send(Bytes::from_static(b"late")).await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
