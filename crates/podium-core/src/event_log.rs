//! Append-only streams with consumer groups.
//!
//! The shape follows log brokers with consumer-group semantics:
//!
//! - every stream entry gets a strictly increasing [`EntryId`]
//! - a consumer group keeps one cursor (last delivered id) shared by its
//!   consumers, so consumers of one group receive disjoint entries
//! - every delivered entry stays in the group's pending list until acked
//! - pending entries idle for long enough can be claimed by another consumer
//!
//! Appending never waits on consumers.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use podium_protocol::{encode_record, now_millis, ProtocolError};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Event log errors.
#[derive(Debug, Error)]
pub enum LogError {
    /// The log backend could not be reached.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The message could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The consumer group does not exist.
    #[error("Consumer group {group} not found on {stream}")]
    GroupNotFound {
        /// Stream name.
        stream: String,
        /// Group name.
        group: String,
    },
}

impl LogError {
    /// Whether a retry may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}

/// Identifier of a stream entry: append time plus a sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    /// Milliseconds since the Unix epoch.
    pub millis: u64,
    /// Sequence within the millisecond.
    pub seq: u64,
}

impl EntryId {
    /// Smallest id.
    pub const ZERO: Self = Self { millis: 0, seq: 0 };

    /// Create an id.
    #[must_use]
    pub const fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Next id after `self` for an append at `now` millis. Never goes back.
    #[must_use]
    pub fn next_after(self, now: u64) -> Self {
        if now > self.millis {
            Self::new(now, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

/// Error parsing an [`EntryId`].
#[derive(Debug, Error)]
#[error("Invalid entry id: {0}")]
pub struct ParseEntryIdError(String);

impl FromStr for EntryId {
    type Err = ParseEntryIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseEntryIdError(s.to_owned());
        let (millis, seq) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// An entry handed to a consumer.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Entry id.
    pub id: EntryId,
    /// Stream the entry belongs to.
    pub stream: String,
    /// Opaque payload.
    pub payload: Bytes,
    /// How many times the entry has been delivered, including this time.
    pub delivery_count: u32,
}

/// Summary of a delivered but unacknowledged entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Entry id.
    pub id: EntryId,
    /// Consumer currently owning the entry.
    pub consumer: String,
    /// Time since last delivery.
    pub idle: Duration,
    /// Deliveries so far.
    pub delivery_count: u32,
}

/// Append-only log of opaque entries, read through consumer groups.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append a payload. Returns once appended.
    async fn append(&self, stream: &str, payload: Bytes) -> Result<EntryId, LogError>;

    /// Create a group positioned at the stream tail. An existing group is left
    /// untouched.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), LogError>;

    /// Deliver up to `count` never-delivered entries to `consumer`.
    ///
    /// Waits up to `block` for new entries (forever with `None`) and returns
    /// an empty batch on timeout.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, LogError>;

    /// Redeliver up to `count` of `consumer`'s own pending entries.
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, LogError>;

    /// Remove entries from the pending list. Returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<usize, LogError>;

    /// The group's pending list, oldest first.
    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, LogError>;

    /// Transfer up to `count` pending entries idle for at least `min_idle` to
    /// `consumer` and deliver them.
    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, LogError>;

    /// Drop the oldest entries so at most `max_len` remain. Returns how many
    /// were dropped.
    async fn trim(&self, stream: &str, max_len: usize) -> Result<usize, LogError>;

    /// Number of entries in a stream.
    async fn len(&self, stream: &str) -> Result<usize, LogError>;
}

/// Typed publishing on top of [`EventLog`].
#[async_trait]
pub trait EventLogExt: EventLog {
    /// Encode `message` as a versioned record and append it.
    async fn publish<T: Serialize + Sync>(
        &self,
        stream: &str,
        message: &T,
    ) -> Result<EntryId, LogError> {
        let payload = encode_record(message)?;
        self.append(stream, payload).await
    }
}

impl<L: EventLog + ?Sized> EventLogExt for L {}

#[derive(Debug)]
struct PendingInfo {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingInfo>,
}

impl GroupState {
    fn deliver(&mut self, id: EntryId, consumer: &str, now: Instant) -> u32 {
        let info = self.pending.entry(id).or_insert(PendingInfo {
            consumer: String::new(),
            delivered_at: now,
            delivery_count: 0,
        });
        info.consumer.clear();
        info.consumer.push_str(consumer);
        info.delivered_at = now;
        info.delivery_count += 1;
        info.delivery_count
    }
}

#[derive(Debug, Default)]
struct StreamInner {
    entries: BTreeMap<EntryId, Bytes>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

impl StreamInner {
    fn group_mut(&mut self, stream: &str, group: &str) -> Result<&mut GroupState, LogError> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| LogError::GroupNotFound {
                stream: stream.to_owned(),
                group: group.to_owned(),
            })
    }

    fn take_new(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, LogError> {
        let now = Instant::now();
        let Self {
            entries, groups, ..
        } = self;
        let state = groups.get_mut(group).ok_or_else(|| LogError::GroupNotFound {
            stream: stream.to_owned(),
            group: group.to_owned(),
        })?;

        let fresh: Vec<(EntryId, Bytes)> = entries
            .range((
                std::ops::Bound::Excluded(state.last_delivered),
                std::ops::Bound::Unbounded,
            ))
            .take(count)
            .map(|(id, payload)| (*id, payload.clone()))
            .collect();

        let mut batch = Vec::with_capacity(fresh.len());
        for (id, payload) in fresh {
            state.last_delivered = id;
            let delivery_count = state.deliver(id, consumer, now);
            batch.push(StreamEntry {
                id,
                stream: stream.to_owned(),
                payload,
                delivery_count,
            });
        }
        Ok(batch)
    }
}

#[derive(Debug, Default)]
struct StreamState {
    inner: Mutex<StreamInner>,
    appended: Notify,
}

/// In-process event log.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    streams: DashMap<String, Arc<StreamState>>,
}

impl MemoryEventLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&self, name: &str) -> Arc<StreamState> {
        self.streams
            .entry(name.to_owned())
            .or_insert_with(|| {
                debug!(stream = %name, "Creating stream");
                Arc::default()
            })
            .clone()
    }

    fn existing(&self, name: &str, group: &str) -> Result<Arc<StreamState>, LogError> {
        self.streams
            .get(name)
            .map(|s| s.clone())
            .ok_or_else(|| LogError::GroupNotFound {
                stream: name.to_owned(),
                group: group.to_owned(),
            })
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, stream: &str, payload: Bytes) -> Result<EntryId, LogError> {
        let state = self.stream(stream);
        let id = {
            let mut inner = state.inner.lock();
            let id = inner.last_id.next_after(now_millis());
            inner.last_id = id;
            inner.entries.insert(id, payload);
            id
        };
        state.appended.notify_waiters();
        trace!(stream = %stream, id = %id, "Appended");
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), LogError> {
        let state = self.stream(stream);
        let mut inner = state.inner.lock();
        let tail = inner.last_id;
        if !inner.groups.contains_key(group) {
            inner.groups.insert(
                group.to_owned(),
                GroupState {
                    last_delivered: tail,
                    pending: BTreeMap::new(),
                },
            );
            debug!(stream = %stream, group = %group, tail = %tail, "Created consumer group");
        }
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, LogError> {
        let state = self.existing(stream, group)?;
        let deadline = block.map(|b| Instant::now() + b);

        loop {
            // register interest before checking so an append in between is not missed
            let notified = state.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = state.inner.lock().take_new(stream, group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(Vec::new());
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, LogError> {
        let state = self.existing(stream, group)?;
        let mut inner = state.inner.lock();
        let now = Instant::now();
        let StreamInner {
            entries, groups, ..
        } = &mut *inner;
        let group_state = groups.get_mut(group).ok_or_else(|| LogError::GroupNotFound {
            stream: stream.to_owned(),
            group: group.to_owned(),
        })?;

        let mut batch = Vec::new();
        for (id, info) in group_state.pending.iter_mut() {
            if batch.len() >= count {
                break;
            }
            if info.consumer != consumer {
                continue;
            }
            let Some(payload) = entries.get(id) else {
                continue;
            };
            info.delivered_at = now;
            info.delivery_count += 1;
            batch.push(StreamEntry {
                id: *id,
                stream: stream.to_owned(),
                payload: payload.clone(),
                delivery_count: info.delivery_count,
            });
        }
        Ok(batch)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<usize, LogError> {
        let state = self.existing(stream, group)?;
        let mut inner = state.inner.lock();
        let group_state = inner.group_mut(stream, group)?;
        let acked = ids
            .iter()
            .filter(|id| group_state.pending.remove(*id).is_some())
            .count();
        trace!(stream = %stream, group = %group, acked, "Acknowledged");
        Ok(acked)
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, LogError> {
        let state = self.existing(stream, group)?;
        let mut inner = state.inner.lock();
        let group_state = inner.group_mut(stream, group)?;
        let now = Instant::now();
        Ok(group_state
            .pending
            .iter()
            .map(|(id, info)| PendingEntry {
                id: *id,
                consumer: info.consumer.clone(),
                idle: now.saturating_duration_since(info.delivered_at),
                delivery_count: info.delivery_count,
            })
            .collect())
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, LogError> {
        let state = self.existing(stream, group)?;
        let mut inner = state.inner.lock();
        let now = Instant::now();
        let StreamInner {
            entries, groups, ..
        } = &mut *inner;
        let group_state = groups.get_mut(group).ok_or_else(|| LogError::GroupNotFound {
            stream: stream.to_owned(),
            group: group.to_owned(),
        })?;

        let idle: Vec<EntryId> = group_state
            .pending
            .iter()
            .filter(|(_, info)| now.saturating_duration_since(info.delivered_at) >= min_idle)
            .map(|(id, _)| *id)
            .take(count)
            .collect();

        let mut claimed = Vec::with_capacity(idle.len());
        for id in idle {
            let Some(payload) = entries.get(&id) else {
                group_state.pending.remove(&id);
                continue;
            };
            let delivery_count = group_state.deliver(id, consumer, now);
            claimed.push(StreamEntry {
                id,
                stream: stream.to_owned(),
                payload: payload.clone(),
                delivery_count,
            });
        }

        if !claimed.is_empty() {
            debug!(
                stream = %stream,
                group = %group,
                consumer = %consumer,
                claimed = claimed.len(),
                "Claimed idle entries"
            );
        }
        Ok(claimed)
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<usize, LogError> {
        let Some(state) = self.streams.get(stream).map(|s| s.clone()) else {
            return Ok(0);
        };
        let mut inner = state.inner.lock();
        let excess = inner.entries.len().saturating_sub(max_len);
        if excess == 0 {
            return Ok(0);
        }

        let dropped: Vec<EntryId> = inner.entries.keys().take(excess).copied().collect();
        for id in &dropped {
            inner.entries.remove(id);
        }
        for group in inner.groups.values_mut() {
            for id in &dropped {
                group.pending.remove(id);
            }
        }
        debug!(stream = %stream, dropped = excess, "Trimmed stream");
        Ok(excess)
    }

    async fn len(&self, stream: &str) -> Result<usize, LogError> {
        Ok(self
            .streams
            .get(stream)
            .map(|s| s.inner.lock().entries.len())
            .unwrap_or(0))
    }
}
