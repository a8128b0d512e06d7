//! Records published on the event log.

use serde::{Deserialize, Serialize};

use crate::envelope::now_millis;

/// Stream carrying score changes.
pub const LEADERBOARD_UPDATES_STREAM: &str = "leaderboard-updates";

/// A score assignment, published after the ranked store accepted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEvent {
    /// Leaderboard the score belongs to.
    pub leaderboard_id: String,
    /// Entry (member) identifier.
    pub entry_id: String,
    /// Assigned score.
    pub score: f64,
    /// Free-form metadata supplied with the submission.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// When the score was applied, in milliseconds since the Unix epoch.
    pub occurred_at: u64,
}

impl ScoreEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(leaderboard_id: impl Into<String>, entry_id: impl Into<String>, score: f64) -> Self {
        Self {
            leaderboard_id: leaderboard_id.into(),
            entry_id: entry_id.into(),
            score,
            metadata: None,
            occurred_at: now_millis(),
        }
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
