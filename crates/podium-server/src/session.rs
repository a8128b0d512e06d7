//! Per-connection session.
//!
//! Each live connection runs two halves:
//!
//! - the **write side** drains the client's outbound queue into the transport
//!   and sends a `ping` every `ping_interval`
//! - the **read side** decodes control messages and forwards them to the hub;
//!   no `pong` within `pong_timeout` ends the session
//!
//! Whichever half stops first ends the session, after which the client is
//! unregistered.

use crate::metrics::{self, ConnectionMetricsGuard};
use bytes::Bytes;
use podium_core::{Client, ClientId, Hub};
use podium_protocol::codec::{decode_client_message, encode_envelope};
use podium_protocol::{error_codes, ClientMessage, Envelope, ProtocolError};
use podium_transport::{Connection, FrameSink, FrameStream, TransportError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

/// Liveness and write settings of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Time without a pong before the session ends.
    pub pong_timeout: Duration,
    /// Time allowed for a single write.
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(54),
            pong_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Serve one live connection until either side stops.
pub async fn run_session(
    hub: Hub,
    conn: Box<dyn Connection>,
    user_id: Option<String>,
    config: SessionConfig,
) {
    let id = ClientId::from(conn.id().as_str());
    let peer = conn.peer();
    let (client, queue) = Client::with_id(id.clone(), user_id, hub.config().client_queue_capacity);
    let (mut sink, stream) = conn.split();

    if hub.register(client, None).await.is_err() {
        debug!(client = %id, "Hub is shut down, refusing connection");
        let _ = sink.close().await;
        return;
    }
    let _metrics_guard = ConnectionMetricsGuard::new();
    debug!(client = %id, peer = ?peer, "Session started");

    let mut writer = tokio::spawn(write_side(id.clone(), sink, queue, config.clone()));

    tokio::select! {
        result = read_side(&id, stream, &hub, &config) => {
            match result {
                Ok(()) => debug!(client = %id, "Client closed the connection"),
                Err(e) => {
                    debug!(client = %id, error = %e, "Read side ended");
                    metrics::record_error("read");
                }
            }
        }
        _ = &mut writer => {
            debug!(client = %id, "Write side ended");
        }
    }

    // Closes the outbound queue, which lets the writer close the transport.
    hub.unregister(id.clone()).await;
    if !writer.is_finished() && time::timeout(config.write_timeout, writer).await.is_err() {
        warn!(client = %id, "Writer did not finish after unregister");
    }
    debug!(client = %id, "Session ended");
}

async fn write_side(
    id: ClientId,
    mut sink: Box<dyn FrameSink>,
    queue: mpsc::Receiver<Bytes>,
    config: SessionConfig,
) {
    if let Err(e) = write_frames(sink.as_mut(), queue, &config).await {
        debug!(client = %id, error = %e, "Write failed");
        metrics::record_error("write");
    }
    if let Err(e) = sink.close().await {
        debug!(client = %id, error = %e, "Close failed");
    }
}

async fn write_frames(
    sink: &mut dyn FrameSink,
    mut queue: mpsc::Receiver<Bytes>,
    config: &SessionConfig,
) -> Result<(), TransportError> {
    let mut ping = time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);

    loop {
        tokio::select! {
            frame = queue.recv() => match frame {
                Some(frame) => write(sink, frame, config.write_timeout).await?,
                // unregistered: the hub dropped the queue
                None => return Ok(()),
            },
            _ = ping.tick() => {
                let frame = encode_envelope(&Envelope::ping())?;
                write(sink, frame, config.write_timeout).await?;
            }
        }
    }
}

async fn write(
    sink: &mut dyn FrameSink,
    frame: Bytes,
    timeout: Duration,
) -> Result<(), TransportError> {
    let len = frame.len();
    time::timeout(timeout, sink.send(frame))
        .await
        .map_err(|_| TransportError::Timeout)??;
    metrics::record_message(len, "outbound");
    Ok(())
}

async fn read_side(
    id: &ClientId,
    mut stream: Box<dyn FrameStream>,
    hub: &Hub,
    config: &SessionConfig,
) -> Result<(), TransportError> {
    let mut deadline = Instant::now() + config.pong_timeout;

    loop {
        let Some(frame) = time::timeout_at(deadline, stream.recv())
            .await
            .map_err(|_| TransportError::Timeout)??
        else {
            return Ok(());
        };
        metrics::record_message(frame.len(), "inbound");

        let request = match decode_client_message(&frame) {
            Ok(request) => request,
            Err(e) => {
                debug!(client = %id, error = %e, "Rejected client message");
                let code = match e {
                    ProtocolError::Unsupported(_) => error_codes::UNSUPPORTED,
                    _ => error_codes::MALFORMED,
                };
                hub.send_to(id.clone(), &Envelope::error(None, code, e.to_string()))
                    .await;
                continue;
            }
        };

        let forwarded = match request {
            ClientMessage::Subscribe { topic } => {
                metrics::record_subscription();
                hub.subscribe(id.clone(), topic).await
            }
            ClientMessage::Unsubscribe { topic } => hub.unsubscribe(id.clone(), topic).await,
            ClientMessage::Pong => {
                deadline = Instant::now() + config.pong_timeout;
                Ok(())
            }
        };
        if forwarded.is_err() {
            return Err(TransportError::Other("hub is shut down".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podium_core::{Broadcaster, HubConfig};
    use podium_protocol::codec::decode_envelope;
    use podium_protocol::MessageType;
    use podium_transport::memory::{pair, MemoryPeer};
    use serde_json::json;
    use tokio::task::JoinHandle;

    fn test_config() -> SessionConfig {
        SessionConfig {
            ping_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(1),
        }
    }

    fn start(hub: &Hub, id: &str, capacity: usize) -> (MemoryPeer, JoinHandle<()>) {
        let (conn, peer) = pair(id, capacity);
        let task = tokio::spawn(run_session(
            hub.clone(),
            Box::new(conn),
            Some("u1".into()),
            test_config(),
        ));
        (peer, task)
    }

    async fn next(peer: &mut MemoryPeer) -> Envelope {
        let frame = peer.recv().await.expect("connection closed");
        decode_envelope(&frame).unwrap()
    }

    async fn settle(hub: &Hub, connections: usize) {
        for _ in 0..100 {
            if hub.stats().total_connections == connections {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("hub did not reach {connections} connections");
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_then_receive_broadcast() {
        let (hub, _loop) = Hub::spawn(HubConfig::default());
        let (mut peer, _task) = start(&hub, "c1", 16);
        settle(&hub, 1).await;

        peer.send(r#"{"type":"subscribe","topic":"leaderboard:42"}"#)
            .await
            .unwrap();
        let ack = next(&mut peer).await;
        assert_eq!(ack.kind, MessageType::Subscribe);
        assert_eq!(ack.topic.as_deref(), Some("leaderboard:42"));

        hub.broadcast("leaderboard:42", MessageType::EntryUpdate, json!({"score": 1}))
            .await;
        let update = next(&mut peer).await;
        assert_eq!(update.kind, MessageType::EntryUpdate);

        peer.send(r#"{"type":"unsubscribe","topic":"leaderboard:42"}"#)
            .await
            .unwrap();
        assert_eq!(next(&mut peer).await.kind, MessageType::Unsubscribe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_gets_error() {
        let (hub, _loop) = Hub::spawn(HubConfig::default());
        let (mut peer, _task) = start(&hub, "c1", 16);
        settle(&hub, 1).await;

        peer.send("not json").await.unwrap();
        let reply = next(&mut peer).await;
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(reply.data.unwrap()["code"], json!(error_codes::MALFORMED));

        peer.send(r#"{"type":"chat_message"}"#).await.unwrap();
        let reply = next(&mut peer).await;
        assert_eq!(reply.data.unwrap()["code"], json!(error_codes::UNSUPPORTED));
        assert_eq!(hub.stats().total_connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_and_pong_keep_session_alive() {
        let (hub, _loop) = Hub::spawn(HubConfig::default());
        let (mut peer, task) = start(&hub, "c1", 16);
        settle(&hub, 1).await;

        for _ in 0..4 {
            let ping = next(&mut peer).await;
            assert_eq!(ping.kind, MessageType::Ping);
            peer.send(r#"{"type":"pong"}"#).await.unwrap();
        }
        assert!(!task.is_finished());
        assert_eq!(hub.stats().total_connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_pong_ends_session() {
        let (hub, _loop) = Hub::spawn(HubConfig::default());
        let (mut peer, task) = start(&hub, "c1", 16);
        settle(&hub, 1).await;

        // Read pings but never answer.
        while let Some(frame) = peer.recv().await {
            assert_eq!(decode_envelope(&frame).unwrap().kind, MessageType::Ping);
        }
        task.await.unwrap();
        assert_eq!(hub.stats().total_connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_unregisters() {
        let (hub, _loop) = Hub::spawn(HubConfig::default());
        let (mut peer, task) = start(&hub, "c1", 16);
        settle(&hub, 1).await;

        peer.close();
        task.await.unwrap();
        assert_eq!(hub.stats().total_connections, 0);
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_times_out_writes() {
        let (hub, _loop) = Hub::spawn(HubConfig::default());
        // Transport buffers one frame; the peer never reads.
        let (_peer, task) = start(&hub, "c1", 1);
        settle(&hub, 1).await;

        hub.broadcast_to_user("u1", MessageType::Notification, json!(1))
            .await;
        hub.broadcast_to_user("u1", MessageType::Notification, json!(2))
            .await;

        task.await.unwrap();
        assert_eq!(hub.stats().total_connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hub_shutdown_closes_connection() {
        let (hub, hub_loop) = Hub::spawn(HubConfig::default());
        let (mut peer, task) = start(&hub, "c1", 16);
        settle(&hub, 1).await;

        hub.shutdown().await;
        hub_loop.await.unwrap();
        assert!(peer.recv().await.is_none());
        task.await.unwrap();
    }
}
