//! # podium-transport
//!
//! Live-connection abstraction for Podium.
//!
//! The session layer talks to a [`Connection`] split into a [`FrameSink`]
//! and a [`FrameStream`], so it never depends on the concrete transport:
//!
//! - **WebSocket** - sockets upgraded by axum (feature `websocket`)
//! - **Memory** - channel-backed pairs for tests and benchmarks
//!
//! ```rust,ignore
//! use podium_transport::Connection;
//!
//! async fn handle(conn: Box<dyn Connection>) {
//!     let (mut sink, mut stream) = conn.split();
//!     while let Ok(Some(frame)) = stream.recv().await {
//!         let _ = sink.send(frame).await;
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Connection, ConnectionId, FrameSink, FrameStream, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
