//! Leaderboard use cases.
//!
//! A score submission runs in three steps:
//!
//! 1. assign the score in the ranked store (failure fails the request)
//! 2. append a [`ScoreEvent`] to the updates stream
//! 3. notify live subscribers of `leaderboard:{id}`
//!
//! Steps 1 and 2 are not transactional. If the append fails the encoded event
//! goes to the [`Outbox`] and the caller gets
//! [`ServiceError::EventNotPublished`] even though the score is applied.
//! While events are parked, new ones queue behind them.

use crate::event_log::{EventLog, LogError};
use crate::hub::Broadcaster;
use crate::model::{Leaderboard, LeaderboardDetail, LeaderboardPatch, NewLeaderboard};
use crate::outbox::Outbox;
use crate::ranked::{LeaderboardEntry, RankedSetStore, StoreError};
use crate::repository::{LeaderboardRepository, RepositoryError};
use crate::topic;
use bytes::Bytes;
use podium_protocol::{encode_record, now_millis, EntryUpdate, MessageType, ScoreEvent};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Service errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No leaderboard with this id.
    #[error("Leaderboard not found: {0}")]
    LeaderboardNotFound(String),

    /// The entry has no score on the leaderboard.
    #[error("Entry {entry} not found in leaderboard {leaderboard}")]
    EntryNotFound {
        /// Leaderboard id.
        leaderboard: String,
        /// Entry id.
        entry: String,
    },

    /// The request is malformed or not allowed.
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// Ranked store failure.
    #[error("Ranked store error: {0}")]
    Store(StoreError),

    /// Metadata repository failure.
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// The score was applied but its event is parked in the outbox.
    #[error("Score applied but event not yet published: {source}")]
    EventNotPublished {
        /// The applied update.
        update: ScoreUpdate,
        /// Append failure.
        source: LogError,
    },
}

impl ServiceError {
    /// Whether a retry may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Repository(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { board, member } => Self::EntryNotFound {
                leaderboard: board,
                entry: member,
            },
            StoreError::InvalidScore(score) => Self::Invalid(format!("invalid score {score}")),
            other => Self::Store(other),
        }
    }
}

/// Result of a score submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreUpdate {
    /// Leaderboard id.
    pub leaderboard_id: String,
    /// Entry id.
    pub entry_id: String,
    /// Assigned score.
    pub score: f64,
    /// Rank right after the write.
    pub rank: Option<u64>,
}

/// An entry with its position.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedEntry {
    /// 1-based rank.
    pub rank: u64,
    /// Entry id.
    pub entry_id: String,
    /// Current score.
    pub score: f64,
}

/// Service settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Stream score events are appended to.
    pub updates_stream: String,
    /// Entries returned with a leaderboard's detail.
    pub top_entries: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            updates_stream: podium_protocol::LEADERBOARD_UPDATES_STREAM.to_string(),
            top_entries: 100,
        }
    }
}

/// Leaderboard use cases over the store, the log, the hub, and the metadata
/// repository.
pub struct LeaderboardService {
    store: Arc<dyn RankedSetStore>,
    log: Arc<dyn EventLog>,
    broadcaster: Arc<dyn Broadcaster>,
    boards: Arc<dyn LeaderboardRepository>,
    outbox: Arc<Outbox>,
    config: ServiceConfig,
}

impl LeaderboardService {
    /// Create the service.
    #[must_use]
    pub fn new(
        store: Arc<dyn RankedSetStore>,
        log: Arc<dyn EventLog>,
        broadcaster: Arc<dyn Broadcaster>,
        boards: Arc<dyn LeaderboardRepository>,
        outbox: Arc<Outbox>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            log,
            broadcaster,
            boards,
            outbox,
            config,
        }
    }

    async fn find(&self, id: &str) -> Result<Leaderboard, ServiceError> {
        self.boards
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::LeaderboardNotFound(id.to_owned()))
    }

    /// Assign a score and propagate it.
    ///
    /// # Errors
    ///
    /// Fails without side effects if the leaderboard is unknown or expired,
    /// or if the store rejects the write. Returns
    /// [`ServiceError::EventNotPublished`] if only the event append failed.
    pub async fn update_entry_score(
        &self,
        leaderboard_id: &str,
        entry_id: &str,
        score: f64,
        metadata: Option<serde_json::Value>,
    ) -> Result<ScoreUpdate, ServiceError> {
        if entry_id.is_empty() {
            return Err(ServiceError::Invalid("entryId is required".to_string()));
        }
        let board = self.find(leaderboard_id).await?;
        if board.is_expired(now_millis()) {
            return Err(ServiceError::Invalid(format!(
                "leaderboard {leaderboard_id} has expired"
            )));
        }

        self.store.add_score(leaderboard_id, entry_id, score).await?;
        let rank = match self.store.get_rank(leaderboard_id, entry_id).await {
            Ok(r) => Some(r.rank),
            Err(e) => {
                warn!(board = %leaderboard_id, entry = %entry_id, error = %e, "Rank lookup after write failed");
                None
            }
        };
        let update = ScoreUpdate {
            leaderboard_id: leaderboard_id.to_owned(),
            entry_id: entry_id.to_owned(),
            score,
            rank,
        };

        let mut event = ScoreEvent::new(leaderboard_id, entry_id, score);
        event.metadata = metadata;
        let published = self.publish(&event).await;

        self.notify_entry(&update).await;

        match published {
            Ok(()) => {
                debug!(board = %leaderboard_id, entry = %entry_id, score, "Score updated");
                Ok(update)
            }
            Err(source) => Err(ServiceError::EventNotPublished { update, source }),
        }
    }

    async fn publish(&self, event: &ScoreEvent) -> Result<(), LogError> {
        let payload = encode_record(event)?;
        let stream = &self.config.updates_stream;
        match self.append_after_parked(stream, payload.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(
                    stream = %stream,
                    board = %event.leaderboard_id,
                    entry = %event.entry_id,
                    error = %e,
                    "Event publish failed, parking in outbox"
                );
                self.outbox.push(stream, payload);
                Err(e)
            }
        }
    }

    /// Parked events are appended first so the stream keeps submission order.
    async fn append_after_parked(&self, stream: &str, payload: Bytes) -> Result<(), LogError> {
        if !self.outbox.is_empty() {
            self.outbox.flush(self.log.as_ref()).await?;
        }
        self.log.append(stream, payload).await?;
        Ok(())
    }

    async fn notify_entry(&self, update: &ScoreUpdate) {
        let payload = EntryUpdate {
            leaderboard_id: update.leaderboard_id.clone(),
            entry_id: update.entry_id.clone(),
            score: update.score,
            rank: update.rank,
        };
        match serde_json::to_value(&payload) {
            Ok(data) => {
                self.broadcaster
                    .broadcast(
                        &topic::leaderboard(&update.leaderboard_id),
                        MessageType::EntryUpdate,
                        data,
                    )
                    .await;
            }
            Err(e) => error!(error = %e, "Failed to encode entry update"),
        }
    }

    /// Metadata plus the best entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the leaderboard is unknown or a backend fails.
    pub async fn get_leaderboard_detail(
        &self,
        leaderboard_id: &str,
    ) -> Result<LeaderboardDetail, ServiceError> {
        let leaderboard = self.find(leaderboard_id).await?;
        let entries = self
            .store
            .get_top_n(leaderboard_id, self.config.top_entries)
            .await?;
        let total_entries = self.store.cardinality(leaderboard_id).await?;
        Ok(LeaderboardDetail {
            leaderboard,
            entries,
            total_entries,
        })
    }

    /// Rank and score of one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the leaderboard or entry is unknown.
    pub async fn get_entry_rank(
        &self,
        leaderboard_id: &str,
        entry_id: &str,
    ) -> Result<RankedEntry, ServiceError> {
        self.find(leaderboard_id).await?;
        let rank = self.store.get_rank(leaderboard_id, entry_id).await?;
        Ok(RankedEntry {
            rank: rank.rank,
            entry_id: entry_id.to_owned(),
            score: rank.score,
        })
    }

    /// Entries within `radius` ranks of one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the leaderboard or entry is unknown.
    pub async fn get_around_entry(
        &self,
        leaderboard_id: &str,
        entry_id: &str,
        radius: usize,
    ) -> Result<Vec<RankedEntry>, ServiceError> {
        self.find(leaderboard_id).await?;
        let window = self
            .store
            .get_around_member(leaderboard_id, entry_id, radius)
            .await?;

        Ok(window
            .entries
            .into_iter()
            .zip(window.start_rank..)
            .map(|(LeaderboardEntry { member, score }, rank)| RankedEntry {
                rank,
                entry_id: member,
                score,
            })
            .collect())
    }

    /// Remove an entry and tell subscribers the ranking changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the leaderboard is unknown or the store fails.
    pub async fn remove_entry(
        &self,
        leaderboard_id: &str,
        entry_id: &str,
    ) -> Result<(), ServiceError> {
        self.find(leaderboard_id).await?;
        self.store.remove_member(leaderboard_id, entry_id).await?;
        self.broadcaster
            .broadcast(
                &topic::leaderboard(leaderboard_id),
                MessageType::LeaderboardUpdate,
                json!({ "leaderboardId": leaderboard_id, "removedEntryId": entry_id }),
            )
            .await;
        info!(board = %leaderboard_id, entry = %entry_id, "Entry removed");
        Ok(())
    }

    /// Drop every entry of a leaderboard.
    ///
    /// # Errors
    ///
    /// Returns an error if the leaderboard is unknown or the store fails.
    pub async fn reset_leaderboard(&self, leaderboard_id: &str) -> Result<(), ServiceError> {
        self.find(leaderboard_id).await?;
        self.store.clear(leaderboard_id).await?;
        self.broadcaster
            .broadcast(
                &topic::leaderboard(leaderboard_id),
                MessageType::LeaderboardUpdate,
                json!({ "leaderboardId": leaderboard_id, "reset": true }),
            )
            .await;
        info!(board = %leaderboard_id, "Leaderboard reset");
        Ok(())
    }

    /// Create a leaderboard.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or the repository fails.
    pub async fn create_leaderboard(
        &self,
        spec: NewLeaderboard,
    ) -> Result<Leaderboard, ServiceError> {
        if spec.name.trim().is_empty() {
            return Err(ServiceError::Invalid("name is required".to_string()));
        }
        let board = self.boards.create(spec).await?;
        info!(board = %board.id, name = %board.name, "Leaderboard created");
        Ok(board)
    }

    /// Apply a partial update. An empty patch changes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the leaderboard is unknown or the repository fails.
    pub async fn update_leaderboard(
        &self,
        leaderboard_id: &str,
        patch: LeaderboardPatch,
    ) -> Result<Leaderboard, ServiceError> {
        if patch.is_empty() {
            return self.find(leaderboard_id).await;
        }
        if patch.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(ServiceError::Invalid("name cannot be empty".to_string()));
        }
        self.boards
            .update(leaderboard_id, patch)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound(id) => ServiceError::LeaderboardNotFound(id),
                other => other.into(),
            })
    }

    /// Every leaderboard.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository fails.
    pub async fn list_leaderboards(&self) -> Result<Vec<Leaderboard>, ServiceError> {
        Ok(self.boards.find_all().await?)
    }
}
