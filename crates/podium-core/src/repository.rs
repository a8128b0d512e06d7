//! Persistence collaborators for leaderboard metadata and score history.
//!
//! The traits are the seam to whatever database backs a deployment. The
//! in-memory implementations serve single-node setups and tests.

use crate::model::{
    HistoryFilter, HistoryRecord, Leaderboard, LeaderboardPatch, NewLeaderboard, PageRequest,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use podium_protocol::now_millis;
use thiserror::Error;
use tracing::debug;

/// Repository errors.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The write conflicts with existing data.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The database could not be reached.
    #[error("Repository unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    /// Whether a retry may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Leaderboard metadata storage.
#[async_trait]
pub trait LeaderboardRepository: Send + Sync {
    /// Look up a leaderboard.
    async fn find_by_id(&self, id: &str) -> Result<Option<Leaderboard>, RepositoryError>;

    /// Every leaderboard, oldest first.
    async fn find_all(&self) -> Result<Vec<Leaderboard>, RepositoryError>;

    /// Create a leaderboard with a new id.
    async fn create(&self, spec: NewLeaderboard) -> Result<Leaderboard, RepositoryError>;

    /// Apply a partial update and return the result.
    async fn update(
        &self,
        id: &str,
        patch: LeaderboardPatch,
    ) -> Result<Leaderboard, RepositoryError>;
}

/// Score history storage.
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    /// Store one record.
    async fn record(&self, record: HistoryRecord) -> Result<(), RepositoryError>;

    /// Matching records of one leaderboard, newest first, with the total
    /// number of matches.
    async fn list(
        &self,
        leaderboard_id: &str,
        filter: &HistoryFilter,
        page: PageRequest,
    ) -> Result<(Vec<HistoryRecord>, u64), RepositoryError>;
}

/// In-memory leaderboard metadata.
#[derive(Debug, Default)]
pub struct MemoryLeaderboardRepository {
    boards: DashMap<String, Leaderboard>,
}

impl MemoryLeaderboardRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a leaderboard with a chosen id, replacing any existing one.
    pub fn insert(&self, board: Leaderboard) {
        self.boards.insert(board.id.clone(), board);
    }
}

#[async_trait]
impl LeaderboardRepository for MemoryLeaderboardRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<Leaderboard>, RepositoryError> {
        Ok(self.boards.get(id).map(|b| b.clone()))
    }

    async fn find_all(&self) -> Result<Vec<Leaderboard>, RepositoryError> {
        let mut all: Vec<Leaderboard> = self.boards.iter().map(|b| b.clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn create(&self, spec: NewLeaderboard) -> Result<Leaderboard, RepositoryError> {
        let now = now_millis();
        let board = Leaderboard {
            id: uuid::Uuid::new_v4().to_string(),
            name: spec.name,
            description: spec.description,
            expired_at: spec.expired_at,
            metadata: spec.metadata,
            created_at: now,
            updated_at: now,
        };

        match self.boards.entry(board.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RepositoryError::Conflict(board.id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(board.clone());
                debug!(board = %board.id, "Leaderboard created");
                Ok(board)
            }
        }
    }

    async fn update(
        &self,
        id: &str,
        patch: LeaderboardPatch,
    ) -> Result<Leaderboard, RepositoryError> {
        let mut board = self
            .boards
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_owned()))?;
        if patch.apply(&mut board) {
            board.updated_at = now_millis();
        }
        Ok(board.clone())
    }
}

/// In-memory score history.
#[derive(Debug, Default)]
pub struct MemoryHistoryRepository {
    records: RwLock<Vec<HistoryRecord>>,
}

impl MemoryHistoryRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl HistoryRepository for MemoryHistoryRepository {
    async fn record(&self, record: HistoryRecord) -> Result<(), RepositoryError> {
        self.records.write().push(record);
        Ok(())
    }

    async fn list(
        &self,
        leaderboard_id: &str,
        filter: &HistoryFilter,
        page: PageRequest,
    ) -> Result<(Vec<HistoryRecord>, u64), RepositoryError> {
        let records = self.records.read();
        let matching: Vec<&HistoryRecord> = records
            .iter()
            .rev()
            .filter(|r| r.leaderboard_id == leaderboard_id && filter.matches(r))
            .collect();

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.offset())
            .take(page.page_size as usize)
            .cloned()
            .collect();
        Ok((items, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_find_update() {
        let repo = MemoryLeaderboardRepository::new();
        let board = repo
            .create(NewLeaderboard {
                name: "Weekly".into(),
                ..NewLeaderboard::default()
            })
            .await
            .unwrap();

        let found = repo.find_by_id(&board.id).await.unwrap().unwrap();
        assert_eq!(found, board);
        assert!(repo.find_by_id("missing").await.unwrap().is_none());

        let updated = repo
            .update(
                &board.id,
                LeaderboardPatch {
                    description: Some("d".into()),
                    ..LeaderboardPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.description, "d");
        assert_eq!(updated.name, "Weekly");

        assert!(matches!(
            repo.update("missing", LeaderboardPatch::default()).await,
            Err(RepositoryError::NotFound(_))
        ));
        assert_eq!(repo.find_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_history_list_newest_first_with_paging() {
        let repo = MemoryHistoryRepository::new();
        for i in 0..5u64 {
            repo.record(HistoryRecord {
                leaderboard_id: "b1".into(),
                entry_id: "p1".into(),
                score: i as f64,
                metadata: None,
                created_at: i,
            })
            .await
            .unwrap();
        }
        repo.record(HistoryRecord {
            leaderboard_id: "b2".into(),
            entry_id: "p1".into(),
            score: 0.0,
            metadata: None,
            created_at: 0,
        })
        .await
        .unwrap();

        let (items, total) = repo
            .list(
                "b1",
                &HistoryFilter::default(),
                PageRequest {
                    page: 2,
                    page_size: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(total, 5);
        let scores: Vec<f64> = items.iter().map(|r| r.score).collect();
        assert_eq!(scores, vec![2.0, 1.0]);
        assert_eq!(repo.len(), 6);
    }
}
