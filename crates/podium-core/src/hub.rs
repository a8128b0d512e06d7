//! Connection hub: live-client registry and topic fan-out.
//!
//! A single [`HubLoop`] task owns the registry. Everything else talks to it
//! through a cloneable [`Hub`] handle that sends commands over a bounded
//! channel, so registry mutations and broadcast iteration never interleave.
//!
//! Each registered [`Client`] has a bounded outbound queue. The hub only ever
//! uses `try_send` on it: a full queue marks the client as a slow consumer and
//! it is unregistered on the spot, which closes the queue and ends the
//! connection's write side.
//!
//! The two counters readable from outside the loop live in a [`HubStats`]
//! snapshot behind a read-write lock that only the loop writes.

use crate::topic::{self, validate_topic};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use podium_protocol::codec::encode_envelope;
use podium_protocol::{error_codes, Envelope, MessageType};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub loop has stopped.
    #[error("Hub is shut down")]
    Closed,
}

/// Unique identifier of a live client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(Arc<str>);

impl ClientId {
    /// Generate a new random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("client_{}", uuid::Uuid::new_v4().simple()).into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

/// A live client as seen by the hub.
///
/// The client owns the only sender of its outbound queue; once the hub drops
/// it the receiver observes the end of the queue.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    user_id: Option<String>,
    sender: mpsc::Sender<Bytes>,
}

impl Client {
    /// Create a client with a fresh id and an outbound queue of `capacity`
    /// frames. Returns the receiving end of the queue.
    #[must_use]
    pub fn new(user_id: Option<String>, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        Self::with_id(ClientId::generate(), user_id, capacity)
    }

    /// Create a client with a given id.
    #[must_use]
    pub fn with_id(
        id: ClientId,
        user_id: Option<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                id,
                user_id,
                sender,
            },
            receiver,
        )
    }

    /// Client id.
    #[must_use]
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// User the client belongs to, if known.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the command channel into the loop.
    pub command_capacity: usize,
    /// Capacity of each client's outbound queue.
    pub client_queue_capacity: usize,
    /// Maximum topics one client may subscribe to.
    pub max_subscriptions_per_client: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: 256,
            client_queue_capacity: 256,
            max_subscriptions_per_client: 100,
        }
    }
}

/// Point-in-time hub counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    /// Registered clients.
    pub total_connections: usize,
    /// Subscribers per topic.
    pub topics: HashMap<String, usize>,
    /// Distinct users with at least one connection.
    pub users: usize,
    /// Clients disconnected because their queue was full.
    pub slow_consumer_evictions: u64,
}

#[derive(Debug)]
enum Target {
    Topic(String),
    User(String),
    All,
}

#[derive(Debug)]
enum Command {
    Register {
        client: Client,
        topic: Option<String>,
    },
    Unregister {
        id: ClientId,
    },
    Subscribe {
        id: ClientId,
        topic: String,
    },
    Unsubscribe {
        id: ClientId,
        topic: String,
    },
    Broadcast {
        target: Target,
        frame: Bytes,
    },
    Send {
        id: ClientId,
        frame: Bytes,
    },
    Shutdown,
}

/// Handle to the hub loop.
#[derive(Debug, Clone)]
pub struct Hub {
    commands: mpsc::Sender<Command>,
    stats: Arc<RwLock<HubStats>>,
    config: Arc<HubConfig>,
}

impl Hub {
    /// Create a hub handle and the loop that serves it. The loop must be
    /// driven with [`HubLoop::run`].
    #[must_use]
    pub fn new(config: HubConfig) -> (Self, HubLoop) {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let stats = Arc::new(RwLock::new(HubStats::default()));
        let config = Arc::new(config);
        let hub = Self {
            commands: tx,
            stats: stats.clone(),
            config: config.clone(),
        };
        let event_loop = HubLoop {
            commands: rx,
            registry: Registry::default(),
            stats,
            config,
            evictions: 0,
        };
        (hub, event_loop)
    }

    /// Create a hub and spawn its loop on the current runtime.
    #[must_use]
    pub fn spawn(config: HubConfig) -> (Self, JoinHandle<()>) {
        let (hub, event_loop) = Self::new(config);
        let task = tokio::spawn(event_loop.run());
        (hub, task)
    }

    /// Hub configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    async fn command(&self, command: Command) -> Result<(), HubError> {
        self.commands.send(command).await.map_err(|_| HubError::Closed)
    }

    /// Register a client, optionally subscribing it to a first topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has shut down.
    pub async fn register(&self, client: Client, topic: Option<String>) -> Result<(), HubError> {
        self.command(Command::Register { client, topic }).await
    }

    /// Remove a client from every index and close its queue.
    pub async fn unregister(&self, id: ClientId) {
        if self.command(Command::Unregister { id }).await.is_err() {
            trace!("Unregister after hub shutdown");
        }
    }

    /// Subscribe a client to a topic. The client receives an acknowledgement
    /// or an `error` envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has shut down.
    pub async fn subscribe(&self, id: ClientId, topic: String) -> Result<(), HubError> {
        self.command(Command::Subscribe { id, topic }).await
    }

    /// Unsubscribe a client from a topic. The client receives an
    /// acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has shut down.
    pub async fn unsubscribe(&self, id: ClientId, topic: String) -> Result<(), HubError> {
        self.command(Command::Unsubscribe { id, topic }).await
    }

    /// Queue an envelope for a single client.
    pub async fn send_to(&self, id: ClientId, envelope: &Envelope) {
        let Some(frame) = encode(envelope) else {
            return;
        };
        if self.command(Command::Send { id, frame }).await.is_err() {
            trace!("Send after hub shutdown");
        }
    }

    /// Stop the loop and drop every client. Later requests fail.
    pub async fn shutdown(&self) {
        if self.command(Command::Shutdown).await.is_err() {
            debug!("Hub already shut down");
        }
    }

    /// Snapshot of the hub counters.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        self.stats.read().clone()
    }

    async fn fan_out(&self, target: Target, envelope: Envelope) {
        let Some(frame) = encode(&envelope) else {
            return;
        };
        if self
            .command(Command::Broadcast { target, frame })
            .await
            .is_err()
        {
            debug!(kind = %envelope.kind, "Broadcast dropped, hub is shut down");
        }
    }
}

fn encode(envelope: &Envelope) -> Option<Bytes> {
    match encode_envelope(envelope) {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!(kind = %envelope.kind, error = %e, "Failed to encode envelope");
            None
        }
    }
}

/// Best-effort topic-scoped notification of live clients.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Deliver to every client subscribed to `topic`.
    async fn broadcast(&self, topic: &str, kind: MessageType, data: serde_json::Value);

    /// Deliver to every connection of a user, regardless of topic.
    async fn broadcast_to_user(&self, user_id: &str, kind: MessageType, data: serde_json::Value);

    /// Deliver to every connection.
    async fn broadcast_to_all(&self, kind: MessageType, data: serde_json::Value);

    /// Clients currently subscribed to `topic`.
    fn connected_clients(&self, topic: &str) -> usize;

    /// Clients currently registered.
    fn total_connections(&self) -> usize;
}

#[async_trait]
impl Broadcaster for Hub {
    async fn broadcast(&self, topic: &str, kind: MessageType, data: serde_json::Value) {
        let envelope = Envelope::new(kind).with_topic(topic).with_data(data);
        self.fan_out(Target::Topic(topic.to_owned()), envelope)
            .await;
    }

    async fn broadcast_to_user(&self, user_id: &str, kind: MessageType, data: serde_json::Value) {
        let envelope = Envelope::new(kind)
            .with_topic(topic::user(user_id))
            .with_data(data);
        self.fan_out(Target::User(user_id.to_owned()), envelope)
            .await;
    }

    async fn broadcast_to_all(&self, kind: MessageType, data: serde_json::Value) {
        let envelope = Envelope::new(kind).with_topic(topic::GLOBAL).with_data(data);
        self.fan_out(Target::All, envelope).await;
    }

    fn connected_clients(&self, topic: &str) -> usize {
        self.stats.read().topics.get(topic).copied().unwrap_or(0)
    }

    fn total_connections(&self) -> usize {
        self.stats.read().total_connections
    }
}

#[derive(Debug)]
struct ClientEntry {
    client: Client,
    topics: HashSet<String>,
}

#[derive(Debug, Default)]
struct Registry {
    clients: HashMap<ClientId, ClientEntry>,
    topics: HashMap<String, HashSet<ClientId>>,
    users: HashMap<String, HashSet<ClientId>>,
}

fn remove_from_index(index: &mut HashMap<String, HashSet<ClientId>>, key: &str, id: &ClientId) {
    if let Some(set) = index.get_mut(key) {
        set.remove(id);
        if set.is_empty() {
            index.remove(key);
        }
    }
}

/// The task that owns the registry.
pub struct HubLoop {
    commands: mpsc::Receiver<Command>,
    registry: Registry,
    stats: Arc<RwLock<HubStats>>,
    config: Arc<HubConfig>,
    evictions: u64,
}

impl HubLoop {
    /// Serve commands until shutdown or until every [`Hub`] handle is dropped.
    pub async fn run(mut self) {
        info!("Hub started");

        while let Some(command) = self.commands.recv().await {
            if let Command::Shutdown = command {
                break;
            }
            self.handle(command);
        }

        self.commands.close();
        let dropped = self.registry.clients.len();
        self.registry = Registry::default();
        {
            let mut stats = self.stats.write();
            stats.total_connections = 0;
            stats.topics.clear();
            stats.users = 0;
        }
        info!(dropped, "Hub stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register { client, topic } => self.register(client, topic),
            Command::Unregister { id } => {
                self.unregister(&id);
            }
            Command::Subscribe { id, topic } => self.subscribe(&id, topic),
            Command::Unsubscribe { id, topic } => self.unsubscribe(&id, &topic),
            Command::Broadcast { target, frame } => {
                let recipients: Vec<ClientId> = match &target {
                    Target::Topic(topic) => self.members(&self.registry.topics, topic),
                    Target::User(user) => self.members(&self.registry.users, user),
                    Target::All => self.registry.clients.keys().cloned().collect(),
                };
                let delivered = self.deliver(recipients, &frame);
                trace!(to = ?target, delivered, "Broadcast");
            }
            Command::Send { id, frame } => {
                self.deliver(vec![id], &frame);
            }
            Command::Shutdown => {}
        }
    }

    fn members(&self, index: &HashMap<String, HashSet<ClientId>>, key: &str) -> Vec<ClientId> {
        index
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn register(&mut self, client: Client, topic: Option<String>) {
        let id = client.id.clone();
        if self.registry.clients.contains_key(&id) {
            warn!(client = %id, "Client registered twice, replacing");
            self.unregister(&id);
        }

        if let Some(user) = &client.user_id {
            self.registry
                .users
                .entry(user.clone())
                .or_default()
                .insert(id.clone());
        }
        debug!(client = %id, user = ?client.user_id, "Client registered");
        self.registry.clients.insert(
            id.clone(),
            ClientEntry {
                client,
                topics: HashSet::new(),
            },
        );

        let Some(topic) = topic else {
            self.refresh_stats(None);
            return;
        };
        match self.add_topic(&id, &topic) {
            Ok(()) => self.refresh_stats(Some(&topic)),
            Err((code, reason)) => {
                warn!(client = %id, topic = %topic, reason, "Initial topic rejected");
                self.refresh_stats(None);
                if let Some(frame) = encode(&Envelope::error(Some(topic), code, reason)) {
                    self.deliver(vec![id], &frame);
                }
            }
        }
    }

    fn unregister(&mut self, id: &ClientId) -> bool {
        let Some(entry) = self.registry.clients.remove(id) else {
            return false;
        };
        for topic in &entry.topics {
            remove_from_index(&mut self.registry.topics, topic, id);
        }
        if let Some(user) = &entry.client.user_id {
            remove_from_index(&mut self.registry.users, user, id);
        }
        // dropping the entry closes the outbound queue
        let topics = entry.topics;
        drop(entry.client);

        for topic in &topics {
            self.refresh_stats(Some(topic));
        }
        if topics.is_empty() {
            self.refresh_stats(None);
        }
        debug!(client = %id, "Client unregistered");
        true
    }

    fn add_topic(&mut self, id: &ClientId, topic: &str) -> Result<(), (u16, &'static str)> {
        validate_topic(topic).map_err(|reason| (error_codes::INVALID_TOPIC, reason))?;

        let Some(entry) = self.registry.clients.get_mut(id) else {
            return Ok(());
        };
        if entry.topics.contains(topic) {
            return Ok(());
        }
        if entry.topics.len() >= self.config.max_subscriptions_per_client {
            return Err((
                error_codes::TOO_MANY_SUBSCRIPTIONS,
                "Maximum subscriptions reached",
            ));
        }

        entry.topics.insert(topic.to_owned());
        self.registry
            .topics
            .entry(topic.to_owned())
            .or_default()
            .insert(id.clone());
        Ok(())
    }

    fn subscribe(&mut self, id: &ClientId, topic: String) {
        if !self.registry.clients.contains_key(id) {
            debug!(client = %id, "Subscribe from unknown client");
            return;
        }

        let reply = match self.add_topic(id, &topic) {
            Ok(()) => {
                debug!(client = %id, topic = %topic, "Subscribed");
                self.refresh_stats(Some(&topic));
                Envelope::subscribed(topic)
            }
            Err((code, reason)) => {
                debug!(client = %id, topic = %topic, reason, "Subscribe rejected");
                Envelope::error(Some(topic), code, reason)
            }
        };
        if let Some(frame) = encode(&reply) {
            self.deliver(vec![id.clone()], &frame);
        }
    }

    fn unsubscribe(&mut self, id: &ClientId, topic: &str) {
        let Some(entry) = self.registry.clients.get_mut(id) else {
            debug!(client = %id, "Unsubscribe from unknown client");
            return;
        };
        if entry.topics.remove(topic) {
            remove_from_index(&mut self.registry.topics, topic, id);
            self.refresh_stats(Some(topic));
            debug!(client = %id, topic = %topic, "Unsubscribed");
        }
        if let Some(frame) = encode(&Envelope::unsubscribed(topic)) {
            self.deliver(vec![id.clone()], &frame);
        }
    }

    /// Try to enqueue `frame` for each recipient. Returns how many accepted it.
    fn deliver(&mut self, recipients: Vec<ClientId>, frame: &Bytes) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();

        for id in recipients {
            let Some(entry) = self.registry.clients.get(&id) else {
                continue;
            };
            match entry.client.sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(client = %id, "Outbound queue full, disconnecting slow client");
                    self.evictions += 1;
                    dead.push(id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(client = %id, "Outbound queue closed");
                    dead.push(id);
                }
            }
        }

        for id in dead {
            self.unregister(&id);
        }
        delivered
    }

    fn refresh_stats(&self, topic: Option<&str>) {
        let mut stats = self.stats.write();
        stats.total_connections = self.registry.clients.len();
        stats.users = self.registry.users.len();
        stats.slow_consumer_evictions = self.evictions;
        if let Some(topic) = topic {
            match self.registry.topics.get(topic) {
                Some(set) => {
                    stats.topics.insert(topic.to_owned(), set.len());
                }
                None => {
                    stats.topics.remove(topic);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podium_protocol::codec::decode_envelope;
    use serde_json::json;

    fn client(id: &str, user: Option<&str>, capacity: usize) -> (Client, mpsc::Receiver<Bytes>) {
        Client::with_id(ClientId::from(id), user.map(str::to_string), capacity)
    }

    async fn next(rx: &mut mpsc::Receiver<Bytes>) -> Envelope {
        let frame = rx.recv().await.expect("queue closed");
        decode_envelope(&frame).unwrap()
    }

    #[test]
    fn test_generated_ids_unique() {
        let a = ClientId::generate();
        let b = ClientId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("client_"));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_only_topic_subscribers() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (c1, mut rx1) = client("c1", None, 8);
        let (c2, mut rx2) = client("c2", None, 8);
        hub.register(c1, Some("lb:42".into())).await.unwrap();
        hub.register(c2, Some("lb:7".into())).await.unwrap();

        hub.broadcast("lb:42", MessageType::EntryUpdate, json!({"score": 1}))
            .await;
        hub.broadcast("lb:7", MessageType::LeaderboardUpdate, json!({}))
            .await;

        let got = next(&mut rx1).await;
        assert_eq!(got.kind, MessageType::EntryUpdate);
        assert_eq!(got.topic.as_deref(), Some("lb:42"));
        assert_eq!(got.data, Some(json!({"score": 1})));

        // c2's first frame is the lb:7 broadcast
        let got = next(&mut rx2).await;
        assert_eq!(got.kind, MessageType::LeaderboardUpdate);
        assert_eq!(hub.connected_clients("lb:42"), 1);
        assert_eq!(hub.total_connections(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe_are_acknowledged() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (c1, mut rx1) = client("c1", None, 8);
        hub.register(c1, None).await.unwrap();

        hub.subscribe("c1".into(), "leaderboard:1".into())
            .await
            .unwrap();
        let ack = next(&mut rx1).await;
        assert_eq!(ack.kind, MessageType::Subscribe);
        assert_eq!(ack.topic.as_deref(), Some("leaderboard:1"));
        assert_eq!(ack.data, Some(json!({"status": "subscribed"})));
        assert_eq!(hub.connected_clients("leaderboard:1"), 1);

        hub.unsubscribe("c1".into(), "leaderboard:1".into())
            .await
            .unwrap();
        let ack = next(&mut rx1).await;
        assert_eq!(ack.kind, MessageType::Unsubscribe);
        assert_eq!(ack.data, Some(json!({"status": "unsubscribed"})));
        assert_eq!(hub.connected_clients("leaderboard:1"), 0);
    }

    #[tokio::test]
    async fn test_invalid_topic_gets_error_envelope() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (c1, mut rx1) = client("c1", None, 8);
        hub.register(c1, None).await.unwrap();

        hub.subscribe("c1".into(), String::new()).await.unwrap();
        let reply = next(&mut rx1).await;
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(
            reply.data.unwrap()["code"],
            json!(error_codes::INVALID_TOPIC)
        );
    }

    #[tokio::test]
    async fn test_subscription_limit() {
        let config = HubConfig {
            max_subscriptions_per_client: 1,
            ..HubConfig::default()
        };
        let (hub, _task) = Hub::spawn(config);
        let (c1, mut rx1) = client("c1", None, 8);
        hub.register(c1, Some("a".into())).await.unwrap();

        hub.subscribe("c1".into(), "b".into()).await.unwrap();
        let reply = next(&mut rx1).await;
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(
            reply.data.unwrap()["code"],
            json!(error_codes::TOO_MANY_SUBSCRIPTIONS)
        );

        // already subscribed topics are still acknowledged
        hub.subscribe("c1".into(), "a".into()).await.unwrap();
        assert_eq!(next(&mut rx1).await.kind, MessageType::Subscribe);
    }

    #[tokio::test]
    async fn test_invalid_initial_topic_gets_error_envelope() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (c1, mut rx1) = client("c1", None, 8);
        hub.register(c1, Some("bad\ntopic".into())).await.unwrap();

        let reply = next(&mut rx1).await;
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(reply.topic.as_deref(), Some("bad\ntopic"));
        assert_eq!(
            reply.data.unwrap()["code"],
            json!(error_codes::INVALID_TOPIC)
        );
        // still registered, just not subscribed
        assert_eq!(hub.total_connections(), 1);
        assert_eq!(hub.connected_clients("bad\ntopic"), 0);
    }

    #[tokio::test]
    async fn test_unregister_removes_from_every_index() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (c1, mut rx1) = client("c1", Some("u1"), 8);
        hub.register(c1, Some("lb:42".into())).await.unwrap();

        hub.unregister("c1".into()).await;
        hub.broadcast("lb:42", MessageType::EntryUpdate, json!({}))
            .await;
        hub.broadcast_to_user("u1", MessageType::Notification, json!({}))
            .await;

        assert!(rx1.recv().await.is_none());
        let stats = hub.stats();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.users, 0);
        assert!(stats.topics.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_to_user_and_all() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (a1, mut rx_a1) = client("a1", Some("alice"), 8);
        let (a2, mut rx_a2) = client("a2", Some("alice"), 8);
        let (b1, mut rx_b1) = client("b1", Some("bob"), 8);
        hub.register(a1, None).await.unwrap();
        hub.register(a2, Some("chat:lobby".into())).await.unwrap();
        hub.register(b1, None).await.unwrap();

        hub.broadcast_to_user("alice", MessageType::Notification, json!({"n": 1}))
            .await;
        hub.broadcast_to_all(MessageType::SystemMessage, json!({"m": "hi"}))
            .await;

        for rx in [&mut rx_a1, &mut rx_a2] {
            let got = next(rx).await;
            assert_eq!(got.kind, MessageType::Notification);
            assert_eq!(got.topic.as_deref(), Some("user:alice"));
            assert_eq!(next(rx).await.kind, MessageType::SystemMessage);
        }
        let got = next(&mut rx_b1).await;
        assert_eq!(got.kind, MessageType::SystemMessage);
        assert_eq!(got.topic.as_deref(), Some("global"));
    }

    #[tokio::test]
    async fn test_slow_client_is_evicted_without_blocking() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (slow, mut rx_slow) = client("slow", None, 2);
        let (fast, mut rx_fast) = client("fast", None, 64);
        hub.register(slow, Some("t".into())).await.unwrap();
        hub.register(fast, Some("t".into())).await.unwrap();

        for i in 0..10 {
            hub.broadcast("t", MessageType::EntryUpdate, json!({ "i": i }))
                .await;
        }
        for _ in 0..10 {
            next(&mut rx_fast).await;
        }

        let mut buffered = 0;
        while rx_slow.recv().await.is_some() {
            buffered += 1;
        }
        assert_eq!(buffered, 2);

        let stats = hub.stats();
        assert_eq!(stats.slow_consumer_evictions, 1);
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.topics.get("t"), Some(&1));
    }

    #[tokio::test]
    async fn test_send_to_single_client() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (c1, mut rx1) = client("c1", None, 8);
        hub.register(c1, None).await.unwrap();

        hub.send_to("c1".into(), &Envelope::ping()).await;
        assert_eq!(next(&mut rx1).await.kind, MessageType::Ping);
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients_and_rejects_requests() {
        let (hub, task) = Hub::spawn(HubConfig::default());
        let (c1, mut rx1) = client("c1", None, 8);
        hub.register(c1, Some("t".into())).await.unwrap();

        hub.shutdown().await;
        task.await.unwrap();

        assert!(rx1.recv().await.is_none());
        let (c2, _rx2) = client("c2", None, 8);
        assert!(matches!(hub.register(c2, None).await, Err(HubError::Closed)));
        assert_eq!(hub.total_connections(), 0);
    }

    #[tokio::test]
    async fn test_reregister_replaces_previous() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (first, mut rx_first) = client("c1", None, 8);
        let (second, mut rx_second) = client("c1", None, 8);
        hub.register(first, Some("t".into())).await.unwrap();
        hub.register(second, None).await.unwrap();

        assert!(rx_first.recv().await.is_none());
        hub.send_to("c1".into(), &Envelope::ping()).await;
        assert_eq!(next(&mut rx_second).await.kind, MessageType::Ping);
        assert_eq!(hub.connected_clients("t"), 0);
    }
}
