//! Codecs for Podium wire formats.
//!
//! Live-connection envelopes travel as JSON text. Event-log records are
//! MessagePack documents wrapped in a small header carrying the schema
//! version, so a consumer can refuse records written by an incompatible
//! publisher instead of misreading them.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::{ClientMessage, Envelope, MessageType};
use crate::version::{Version, SCHEMA_VERSION};

/// Maximum encoded size of a single envelope or record (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Record was written with an incompatible schema version.
    #[error("Incompatible record version {found} (expected {expected})")]
    IncompatibleVersion {
        /// Version found in the record header.
        found: Version,
        /// Version this build understands.
        expected: Version,
    },

    /// Message type not accepted in this direction.
    #[error("Unsupported message type: {0}")]
    Unsupported(MessageType),

    /// Invalid message data.
    #[error("Invalid message: {0}")]
    Invalid(String),
}

/// Encode an envelope to JSON bytes.
///
/// # Errors
///
/// Returns an error if the envelope is too large or cannot be serialized.
pub fn encode_envelope(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let data = serde_json::to_vec(envelope)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }
    Ok(Bytes::from(data))
}

/// Decode an envelope from JSON bytes.
///
/// # Errors
///
/// Returns an error if the data is too large or is not a valid envelope.
pub fn decode_envelope(data: &[u8]) -> Result<Envelope, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }
    Ok(serde_json::from_slice(data)?)
}

/// Decode an inbound control message.
///
/// # Errors
///
/// Returns an error if the data is not an envelope or carries a type clients
/// may not send.
pub fn decode_client_message(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
    ClientMessage::try_from(decode_envelope(data)?)
}

#[derive(Serialize)]
struct RecordRef<'a, T> {
    version: Version,
    body: &'a T,
}

#[derive(Deserialize)]
struct RecordHeader {
    version: Version,
}

#[derive(Deserialize)]
struct RecordOwned<T> {
    body: T,
}

/// Encode an event-log record.
///
/// # Errors
///
/// Returns an error if the record is too large or encoding fails.
pub fn encode_record<T: Serialize>(body: &T) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(&RecordRef {
        version: SCHEMA_VERSION,
        body,
    })?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Decode an event-log record written by [`encode_record`].
///
/// # Errors
///
/// Returns an error if the record is malformed or was written with an
/// incompatible schema version.
pub fn decode_record<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    let header: RecordHeader = rmp_serde::from_slice(data)?;
    if !SCHEMA_VERSION.reads(header.version) {
        return Err(ProtocolError::IncompatibleVersion {
            found: header.version,
            expected: SCHEMA_VERSION,
        });
    }

    let record: RecordOwned<T> = rmp_serde::from_slice(data)?;
    Ok(record.body)
}
