//! Ranked sets: one ordered member→score mapping per leaderboard.
//!
//! The store is shared by every request handler with no caller-side locking.
//! [`MemoryRankedStore`] keeps each board in its own shard slot so that
//! writes to different boards never contend, and runs every operation under a
//! single short critical section with no `.await` inside it.

use crate::skiplist::SkipList;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, trace};

/// Ranked store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The member is not in the board.
    #[error("Member {member} not found in {board}")]
    NotFound {
        /// Board id.
        board: String,
        /// Member id.
        member: String,
    },

    /// The score cannot be ordered.
    #[error("Invalid score: {0}")]
    InvalidScore(f64),

    /// The backing store could not be reached.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl StoreError {
    /// Whether a retry may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}

/// A member with its score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// Member id.
    pub member: String,
    /// Current score.
    pub score: f64,
}

impl LeaderboardEntry {
    fn from_pair((member, score): (&str, f64)) -> Self {
        Self {
            member: member.to_owned(),
            score,
        }
    }
}

/// A member's position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemberRank {
    /// 1-based rank.
    pub rank: u64,
    /// Current score.
    pub score: f64,
}

/// A contiguous slice of the ranking.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RankWindow {
    /// Rank of the first entry. Meaningless when `entries` is empty.
    pub start_rank: u64,
    /// Entries in rank order.
    pub entries: Vec<LeaderboardEntry>,
}

/// Ordered member→score sets, keyed by board id.
///
/// Order is descending by score, then ascending by member id.
#[async_trait]
pub trait RankedSetStore: Send + Sync {
    /// Set a member's score, replacing any previous one.
    async fn add_score(&self, board: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Up to `n` best entries.
    async fn get_top_n(&self, board: &str, n: usize) -> Result<Vec<LeaderboardEntry>, StoreError>;

    /// Rank and score of a member.
    async fn get_rank(&self, board: &str, member: &str) -> Result<MemberRank, StoreError>;

    /// Remove a member. Removing an absent member is not an error.
    async fn remove_member(&self, board: &str, member: &str) -> Result<(), StoreError>;

    /// The inclusive window `[rank - radius, rank + radius]` around a member,
    /// clamped to the set. The window and its start rank come from the same
    /// snapshot.
    async fn get_around_member(
        &self,
        board: &str,
        member: &str,
        radius: usize,
    ) -> Result<RankWindow, StoreError>;

    /// Entries with 1-based ranks in `[start, stop]`.
    async fn get_range(
        &self,
        board: &str,
        start: usize,
        stop: usize,
    ) -> Result<Vec<LeaderboardEntry>, StoreError>;

    /// A member's score, if present.
    async fn get_score(&self, board: &str, member: &str) -> Result<Option<f64>, StoreError>;

    /// Number of members.
    async fn cardinality(&self, board: &str) -> Result<usize, StoreError>;

    /// Drop every member of a board.
    async fn clear(&self, board: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct Board {
    scores: HashMap<String, f64>,
    index: SkipList,
}

impl Board {
    fn upsert(&mut self, member: &str, score: f64) {
        if let Some(old) = self.scores.get(member).copied() {
            if old.total_cmp(&score).is_eq() {
                return;
            }
            self.index.remove(member, old);
        }
        self.index.insert(member, score);
        self.scores.insert(member.to_owned(), score);
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => self.index.remove(member, score),
            None => false,
        }
    }

    fn rank(&self, member: &str) -> Option<MemberRank> {
        let score = *self.scores.get(member)?;
        let rank = self.index.rank(member, score)?;
        Some(MemberRank {
            rank: rank as u64,
            score,
        })
    }

    fn range(&self, start: usize, stop: usize) -> Vec<LeaderboardEntry> {
        self.index
            .range(start, stop)
            .map(LeaderboardEntry::from_pair)
            .collect()
    }
}

/// In-process ranked store.
#[derive(Debug, Default)]
pub struct MemoryRankedStore {
    boards: DashMap<String, Board>,
}

impl MemoryRankedStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of non-empty boards.
    #[must_use]
    pub fn board_count(&self) -> usize {
        self.boards.len()
    }

    fn not_found(board: &str, member: &str) -> StoreError {
        StoreError::NotFound {
            board: board.to_owned(),
            member: member.to_owned(),
        }
    }
}

#[async_trait]
impl RankedSetStore for MemoryRankedStore {
    async fn add_score(&self, board: &str, member: &str, score: f64) -> Result<(), StoreError> {
        if score.is_nan() {
            return Err(StoreError::InvalidScore(score));
        }
        // fold -0.0 into 0.0 so both order identically
        let score = score + 0.0;

        let mut entry = self.boards.entry(board.to_owned()).or_insert_with(|| {
            debug!(board = %board, "Creating ranked set");
            Board::default()
        });
        entry.upsert(member, score);
        trace!(board = %board, member = %member, score, "Score set");
        Ok(())
    }

    async fn get_top_n(&self, board: &str, n: usize) -> Result<Vec<LeaderboardEntry>, StoreError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        self.get_range(board, 1, n).await
    }

    async fn get_rank(&self, board: &str, member: &str) -> Result<MemberRank, StoreError> {
        self.boards
            .get(board)
            .and_then(|b| b.rank(member))
            .ok_or_else(|| Self::not_found(board, member))
    }

    async fn remove_member(&self, board: &str, member: &str) -> Result<(), StoreError> {
        let removed = self
            .boards
            .get_mut(board)
            .map(|mut b| b.remove(member))
            .unwrap_or(false);

        if removed {
            self.boards.remove_if(board, |_, b| b.scores.is_empty());
            debug!(board = %board, member = %member, "Member removed");
        }
        Ok(())
    }

    async fn get_around_member(
        &self,
        board: &str,
        member: &str,
        radius: usize,
    ) -> Result<RankWindow, StoreError> {
        let guard = self
            .boards
            .get(board)
            .ok_or_else(|| Self::not_found(board, member))?;
        let rank = guard
            .rank(member)
            .ok_or_else(|| Self::not_found(board, member))?
            .rank as usize;

        let start = rank.saturating_sub(radius).max(1);
        let stop = rank.saturating_add(radius);
        Ok(RankWindow {
            start_rank: start as u64,
            entries: guard.range(start, stop),
        })
    }

    async fn get_range(
        &self,
        board: &str,
        start: usize,
        stop: usize,
    ) -> Result<Vec<LeaderboardEntry>, StoreError> {
        Ok(self
            .boards
            .get(board)
            .map(|b| b.range(start, stop))
            .unwrap_or_default())
    }

    async fn get_score(&self, board: &str, member: &str) -> Result<Option<f64>, StoreError> {
        Ok(self
            .boards
            .get(board)
            .and_then(|b| b.scores.get(member).copied()))
    }

    async fn cardinality(&self, board: &str) -> Result<usize, StoreError> {
        Ok(self.boards.get(board).map(|b| b.scores.len()).unwrap_or(0))
    }

    async fn clear(&self, board: &str) -> Result<(), StoreError> {
        if self.boards.remove(board).is_some() {
            debug!(board = %board, "Ranked set cleared");
        }
        Ok(())
    }
}
