//! Envelope types for the Podium live-connection protocol.
//!
//! Every message exchanged over a live connection is a JSON envelope of the
//! shape `{type, topic?, data?, timestamp}`. The `type` tag is a closed set of
//! known message types; `data` stays an opaque JSON value until a consumer
//! decodes it into one of the typed payloads below.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec::ProtocolError;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A leaderboard's ranking changed as a whole.
    LeaderboardUpdate,
    /// A single entry's score changed.
    EntryUpdate,
    /// Subscribe request (inbound) or subscription acknowledgment (outbound).
    Subscribe,
    /// Unsubscribe request (inbound) or acknowledgment (outbound).
    Unsubscribe,
    /// Liveness check sent by the server.
    Ping,
    /// Liveness response sent by the client.
    Pong,
    /// User-scoped notification.
    Notification,
    /// User profile change.
    UserUpdate,
    /// Server-wide announcement.
    SystemMessage,
    /// Chat room message.
    ChatMessage,
    /// Error report.
    Error,
}

impl MessageType {
    /// The wire name of this type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::LeaderboardUpdate => "leaderboard_update",
            MessageType::EntryUpdate => "entry_update",
            MessageType::Subscribe => "subscribe",
            MessageType::Unsubscribe => "unsubscribe",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Notification => "notification",
            MessageType::UserUpdate => "user_update",
            MessageType::SystemMessage => "system_message",
            MessageType::ChatMessage => "chat_message",
            MessageType::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Topic the message is scoped to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Opaque payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Creation time in milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: u64,
}

impl Envelope {
    /// Create an envelope without topic or payload.
    #[must_use]
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            topic: None,
            data: None,
            timestamp: now_millis(),
        }
    }

    /// Set the topic.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set an already-built JSON payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Serialize a typed payload into the envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented as JSON.
    pub fn with_payload<T: Serialize>(self, payload: &T) -> Result<Self, ProtocolError> {
        let value = serde_json::to_value(payload)?;
        Ok(self.with_data(value))
    }

    /// Decode the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no payload or it has the wrong shape.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| ProtocolError::Invalid(format!("{} envelope has no data", self.kind)))?;
        Ok(serde_json::from_value(data)?)
    }

    /// Liveness check.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(MessageType::Ping)
    }

    /// Liveness response.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(MessageType::Pong)
    }

    /// Subscription acknowledgment for `topic`.
    #[must_use]
    pub fn subscribed(topic: impl Into<String>) -> Self {
        Self::status(MessageType::Subscribe, topic, SubscriptionStatus::SUBSCRIBED)
    }

    /// Unsubscription acknowledgment for `topic`.
    #[must_use]
    pub fn unsubscribed(topic: impl Into<String>) -> Self {
        Self::status(
            MessageType::Unsubscribe,
            topic,
            SubscriptionStatus::UNSUBSCRIBED,
        )
    }

    fn status(kind: MessageType, topic: impl Into<String>, status: &str) -> Self {
        Self::new(kind)
            .with_topic(topic)
            .with_data(serde_json::json!({ "status": status }))
    }

    /// Error report, optionally scoped to a topic.
    #[must_use]
    pub fn error(topic: Option<String>, code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Error,
            topic,
            data: Some(serde_json::json!({ "code": code, "message": message.into() })),
            timestamp: now_millis(),
        }
    }
}

/// Error codes carried in `error` envelopes.
pub mod error_codes {
    /// The inbound message could not be decoded.
    pub const MALFORMED: u16 = 4000;
    /// The topic name is invalid.
    pub const INVALID_TOPIC: u16 = 4001;
    /// The connection holds too many subscriptions.
    pub const TOO_MANY_SUBSCRIPTIONS: u16 = 4002;
    /// The message type is not accepted from clients.
    pub const UNSUPPORTED: u16 = 4003;
}

/// Inbound control message decoded from a client envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Subscribe to a topic.
    Subscribe {
        /// Topic name.
        topic: String,
    },
    /// Unsubscribe from a topic.
    Unsubscribe {
        /// Topic name.
        topic: String,
    },
    /// Liveness response.
    Pong,
}

impl TryFrom<Envelope> for ClientMessage {
    type Error = ProtocolError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let topic = || {
            envelope
                .topic
                .clone()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| ProtocolError::Invalid(format!("{} requires a topic", envelope.kind)))
        };

        match envelope.kind {
            MessageType::Subscribe => Ok(ClientMessage::Subscribe { topic: topic()? }),
            MessageType::Unsubscribe => Ok(ClientMessage::Unsubscribe { topic: topic()? }),
            MessageType::Pong => Ok(ClientMessage::Pong),
            other => Err(ProtocolError::Unsupported(other)),
        }
    }
}

/// Payload of subscription acknowledgments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    /// `subscribed` or `unsubscribed`.
    pub status: String,
}

impl SubscriptionStatus {
    pub const SUBSCRIBED: &'static str = "subscribed";
    pub const UNSUBSCRIBED: &'static str = "unsubscribed";
}

/// Payload of `error` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code.
    pub code: u16,
    /// Human-readable message.
    pub message: String,
}

/// Payload of `entry_update` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryUpdate {
    /// Leaderboard the entry belongs to.
    pub leaderboard_id: String,
    /// Entry (member) identifier.
    pub entry_id: String,
    /// New score.
    pub score: f64,
    /// Rank after the update, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u64>,
}
