//! # podium-protocol
//!
//! Wire formats for the Podium leaderboard engine.
//!
//! Two formats live here:
//!
//! - **Envelopes** - JSON `{type, topic?, data?, timestamp}` messages exchanged
//!   with live clients (`subscribe`, `unsubscribe`, `pong` inbound;
//!   `entry_update`, `leaderboard_update`, `ping`, ... outbound)
//! - **Records** - versioned MessagePack payloads appended to the event log
//!
//! ## Example
//!
//! ```rust
//! use podium_protocol::{codec, Envelope, EntryUpdate, MessageType};
//!
//! let update = EntryUpdate {
//!     leaderboard_id: "42".into(),
//!     entry_id: "p1".into(),
//!     score: 100.0,
//!     rank: Some(1),
//! };
//! let envelope = Envelope::new(MessageType::EntryUpdate)
//!     .with_topic("leaderboard:42")
//!     .with_payload(&update)
//!     .unwrap();
//!
//! let encoded = codec::encode_envelope(&envelope).unwrap();
//! let decoded = codec::decode_envelope(&encoded).unwrap();
//! assert_eq!(decoded.kind, MessageType::EntryUpdate);
//! ```

pub mod codec;
pub mod envelope;
pub mod event;
pub mod version;

pub use codec::{decode_record, encode_record, ProtocolError};
pub use envelope::{
    error_codes, now_millis, ClientMessage, EntryUpdate, Envelope, ErrorPayload, MessageType,
    SubscriptionStatus,
};
pub use event::{ScoreEvent, LEADERBOARD_UPDATES_STREAM};
pub use version::{Version, SCHEMA_VERSION};
