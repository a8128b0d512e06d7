//! Score history: recording from the updates stream and querying.

use crate::consumer::{BoxError, StreamHandler};
use crate::model::{HistoryFilter, HistoryRecord, Page, PageRequest};
use crate::repository::HistoryRepository;
use crate::service::ServiceError;
use async_trait::async_trait;
use podium_protocol::ScoreEvent;
use std::sync::Arc;
use tracing::debug;

/// History use cases.
#[derive(Clone)]
pub struct HistoryService {
    repository: Arc<dyn HistoryRepository>,
}

impl HistoryService {
    /// Create the service.
    #[must_use]
    pub fn new(repository: Arc<dyn HistoryRepository>) -> Self {
        Self { repository }
    }

    /// Store the history record for a score event.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository fails.
    pub async fn record(&self, event: ScoreEvent) -> Result<(), ServiceError> {
        let record = HistoryRecord {
            leaderboard_id: event.leaderboard_id,
            entry_id: event.entry_id,
            score: event.score,
            metadata: event.metadata,
            created_at: event.occurred_at,
        };
        debug!(
            board = %record.leaderboard_id,
            entry = %record.entry_id,
            score = record.score,
            "Recording history"
        );
        self.repository.record(record).await?;
        Ok(())
    }

    /// One page of a leaderboard's history, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Invalid`] for bad paging or an inverted range.
    pub async fn list(
        &self,
        leaderboard_id: &str,
        filter: HistoryFilter,
        page: PageRequest,
    ) -> Result<Page<HistoryRecord>, ServiceError> {
        page.validate().map_err(ServiceError::Invalid)?;
        if let (Some(from), Some(to)) = (filter.from_score, filter.to_score) {
            if from > to {
                return Err(ServiceError::Invalid(
                    "fromScore must not exceed toScore".to_string(),
                ));
            }
        }
        if let (Some(from), Some(to)) = (filter.from_date, filter.to_date) {
            if from > to {
                return Err(ServiceError::Invalid(
                    "fromDate must not exceed toDate".to_string(),
                ));
            }
        }

        let (items, total) = self.repository.list(leaderboard_id, &filter, page).await?;
        Ok(Page::new(items, total, page))
    }
}

/// Log handler that turns score events into history records.
pub struct HistoryRecorder {
    history: HistoryService,
}

impl HistoryRecorder {
    /// Create the handler.
    #[must_use]
    pub fn new(history: HistoryService) -> Self {
        Self { history }
    }
}

#[async_trait]
impl StreamHandler for HistoryRecorder {
    type Message = ScoreEvent;

    async fn handle(&self, event: ScoreEvent) -> Result<(), BoxError> {
        self.history.record(event).await.map_err(Into::into)
    }
}
