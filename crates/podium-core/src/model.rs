//! Leaderboard metadata, history records, and pagination.

use crate::ranked::LeaderboardEntry;
use serde::{Deserialize, Serialize};

/// Largest accepted page size.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Leaderboard metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leaderboard {
    /// Leaderboard id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// After this time (ms since epoch) the board no longer accepts scores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<u64>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Creation time, ms since epoch.
    pub created_at: u64,
    /// Last update time, ms since epoch.
    pub updated_at: u64,
}

impl Leaderboard {
    /// Whether the board has expired at `now` (ms since epoch).
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.expired_at.is_some_and(|at| at <= now)
    }
}

/// Fields for creating a leaderboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLeaderboard {
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Expiry time, ms since epoch.
    #[serde(default)]
    pub expired_at: Option<u64>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Partial leaderboard update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardPatch {
    /// New display name.
    #[serde(default)]
    pub name: Option<String>,
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
    /// New expiry time.
    #[serde(default)]
    pub expired_at: Option<u64>,
    /// New metadata.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl LeaderboardPatch {
    /// Whether the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.expired_at.is_none()
            && self.metadata.is_none()
    }

    /// Apply the patch. Returns whether anything was set.
    pub fn apply(self, board: &mut Leaderboard) -> bool {
        let changed = !self.is_empty();
        if let Some(name) = self.name {
            board.name = name;
        }
        if let Some(description) = self.description {
            board.description = description;
        }
        if let Some(expired_at) = self.expired_at {
            board.expired_at = Some(expired_at);
        }
        if let Some(metadata) = self.metadata {
            board.metadata = Some(metadata);
        }
        changed
    }
}

/// A leaderboard with its best entries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardDetail {
    /// Metadata.
    #[serde(flatten)]
    pub leaderboard: Leaderboard,
    /// Best entries, best first.
    pub entries: Vec<LeaderboardEntry>,
    /// Number of ranked entries.
    pub total_entries: usize,
}

/// A recorded score assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    /// Leaderboard id.
    pub leaderboard_id: String,
    /// Entry id.
    pub entry_id: String,
    /// Assigned score.
    pub score: f64,
    /// Metadata supplied with the score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// When the score was applied, ms since epoch.
    pub created_at: u64,
}

/// History query filter. Bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryFilter {
    /// Only this entry.
    #[serde(default)]
    pub entry_id: Option<String>,
    /// Lowest score.
    #[serde(default)]
    pub from_score: Option<f64>,
    /// Highest score.
    #[serde(default)]
    pub to_score: Option<f64>,
    /// Earliest time, ms since epoch.
    #[serde(default)]
    pub from_date: Option<u64>,
    /// Latest time, ms since epoch.
    #[serde(default)]
    pub to_date: Option<u64>,
}

impl HistoryFilter {
    /// Whether a record passes the filter.
    #[must_use]
    pub fn matches(&self, record: &HistoryRecord) -> bool {
        self.entry_id
            .as_deref()
            .map_or(true, |id| id == record.entry_id)
            && self.from_score.map_or(true, |s| record.score >= s)
            && self.to_score.map_or(true, |s| record.score <= s)
            && self.from_date.map_or(true, |d| record.created_at >= d)
            && self.to_date.map_or(true, |d| record.created_at <= d)
    }
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    /// Page number, from 1.
    pub page: u32,
    /// Items per page, 1 to [`MAX_PAGE_SIZE`].
    pub page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
        }
    }
}

impl PageRequest {
    /// Check the bounds.
    ///
    /// # Errors
    ///
    /// Returns a message naming the offending field.
    pub fn validate(&self) -> Result<(), String> {
        if self.page < 1 {
            return Err("page must be at least 1".to_string());
        }
        if self.page_size < 1 || self.page_size > MAX_PAGE_SIZE {
            return Err(format!("pageSize must be between 1 and {MAX_PAGE_SIZE}"));
        }
        Ok(())
    }

    /// Number of items before this page.
    #[must_use]
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.page_size as usize
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Matching items across all pages.
    pub total: u64,
    /// Page number.
    pub page: u32,
    /// Page size.
    pub page_size: u32,
    /// Whether a later page exists.
    pub has_next: bool,
}

impl<T> Page<T> {
    /// Build a page from a slice of results and the overall total.
    #[must_use]
    pub fn new(items: Vec<T>, total: u64, request: PageRequest) -> Self {
        let seen = request.offset() as u64 + items.len() as u64;
        Self {
            items,
            total,
            page: request.page,
            page_size: request.page_size,
            has_next: seen < total,
        }
    }
}
