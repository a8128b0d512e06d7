//! JSON API under `/api/v1`.
//!
//! Every response body has the shape `{code, message, data?}` where `code`
//! repeats the HTTP status.

use crate::handlers::AppState;
use crate::metrics;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use podium_core::{
    HistoryFilter, LeaderboardPatch, NewLeaderboard, PageRequest, RepositoryError, ServiceError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

/// Default window radius of the around query.
pub const DEFAULT_AROUND_RADIUS: usize = 5;

/// Largest accepted window radius.
pub const MAX_AROUND_RADIUS: usize = 50;

/// Uniform response body.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// HTTP status code.
    pub code: u16,
    /// Human-readable outcome.
    pub message: String,
    /// Payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

type ApiResult = Result<Response, ApiError>;

fn respond<T: Serialize>(status: StatusCode, message: &str, data: T) -> ApiResult {
    let body = ApiResponse {
        code: status.as_u16(),
        message: message.to_string(),
        data: Some(data),
    };
    Ok((status, Json(body)).into_response())
}

fn ok<T: Serialize>(data: T) -> ApiResult {
    respond(StatusCode::OK, "success", data)
}

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request could not be parsed.
    #[error("{0}")]
    BadRequest(String),

    /// A use case failed.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Service(e) => match e {
                ServiceError::LeaderboardNotFound(_) | ServiceError::EntryNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                ServiceError::Invalid(_) => StatusCode::BAD_REQUEST,
                ServiceError::Repository(RepositoryError::NotFound(_)) => StatusCode::NOT_FOUND,
                ServiceError::Repository(RepositoryError::Conflict(_)) => StatusCode::CONFLICT,
                ServiceError::EventNotPublished { .. } => StatusCode::ACCEPTED,
                e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        let data = match &self {
            // The score is applied; hand the update back with the warning.
            Self::Service(ServiceError::EventNotPublished { update, .. }) => {
                serde_json::to_value(update).ok()
            }
            _ => None,
        };

        if status.is_server_error() {
            error!(status = status.as_u16(), error = %message, "Request failed");
            metrics::record_error("api");
        } else if status == StatusCode::ACCEPTED {
            warn!(error = %message, "Request partially applied");
        }

        let body = ApiResponse {
            code: status.as_u16(),
            message,
            data,
        };
        (status, Json(body)).into_response()
    }
}

/// `GET /leaderboards`
pub async fn list_leaderboards(State(state): State<Arc<AppState>>) -> ApiResult {
    ok(state.leaderboards.list_leaderboards().await?)
}

/// `POST /leaderboards`
pub async fn create_leaderboard(
    State(state): State<Arc<AppState>>,
    body: Result<Json<NewLeaderboard>, JsonRejection>,
) -> ApiResult {
    let Json(spec) = body?;
    let board = state.leaderboards.create_leaderboard(spec).await?;
    respond(StatusCode::CREATED, "created", board)
}

/// `GET /leaderboards/:id`
pub async fn get_leaderboard(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    ok(state.leaderboards.get_leaderboard_detail(&id).await?)
}

/// `PATCH /leaderboards/:id`
pub async fn update_leaderboard(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<LeaderboardPatch>, JsonRejection>,
) -> ApiResult {
    let Json(patch) = body?;
    ok(state.leaderboards.update_leaderboard(&id, patch).await?)
}

/// Body of a score submission.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRequest {
    /// Entry id.
    pub entry_id: String,
    /// New score.
    pub score: f64,
    /// Metadata stored with the history record.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// `POST /leaderboards/:id/score`
pub async fn submit_score(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<ScoreRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    let result = state
        .leaderboards
        .update_entry_score(&id, &request.entry_id, request.score, request.metadata)
        .await;

    match result {
        Ok(update) => {
            metrics::record_score_update();
            ok(update)
        }
        Err(e @ ServiceError::EventNotPublished { .. }) => {
            metrics::record_score_update();
            metrics::record_publish_failure();
            metrics::set_outbox_pending(state.outbox.len());
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// `DELETE /leaderboards/:id/entries`
pub async fn reset_leaderboard(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    state.leaderboards.reset_leaderboard(&id).await?;
    ok(json!({ "leaderboardId": id }))
}

/// `DELETE /leaderboards/:id/entries/:entry`
pub async fn remove_entry(
    State(state): State<Arc<AppState>>,
    Path((id, entry)): Path<(String, String)>,
) -> ApiResult {
    state.leaderboards.remove_entry(&id, &entry).await?;
    ok(json!({ "leaderboardId": id, "entryId": entry }))
}

/// `GET /leaderboards/:id/entries/:entry/rank`
pub async fn entry_rank(
    State(state): State<Arc<AppState>>,
    Path((id, entry)): Path<(String, String)>,
) -> ApiResult {
    ok(state.leaderboards.get_entry_rank(&id, &entry).await?)
}

/// Query of the around endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AroundQuery {
    /// Ranks on each side of the entry.
    pub radius: Option<usize>,
}

/// `GET /leaderboards/:id/entries/:entry/around`
pub async fn around_entry(
    State(state): State<Arc<AppState>>,
    Path((id, entry)): Path<(String, String)>,
    query: Result<Query<AroundQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let radius = query.radius.unwrap_or(DEFAULT_AROUND_RADIUS);
    if radius > MAX_AROUND_RADIUS {
        return Err(ApiError::BadRequest(format!(
            "radius must not exceed {MAX_AROUND_RADIUS}"
        )));
    }
    ok(state
        .leaderboards
        .get_around_entry(&id, &entry, radius)
        .await?)
}

/// Query of the history endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    /// Only this entry.
    pub entry_id: Option<String>,
    /// Lowest score.
    pub from_score: Option<f64>,
    /// Highest score.
    pub to_score: Option<f64>,
    /// Earliest time, ms since epoch.
    pub from_date: Option<u64>,
    /// Latest time, ms since epoch.
    pub to_date: Option<u64>,
    /// Page number, from 1.
    pub page: Option<u32>,
    /// Items per page.
    pub page_size: Option<u32>,
}

impl HistoryQuery {
    fn split(self) -> (HistoryFilter, PageRequest) {
        let defaults = PageRequest::default();
        (
            HistoryFilter {
                entry_id: self.entry_id,
                from_score: self.from_score,
                to_score: self.to_score,
                from_date: self.from_date,
                to_date: self.to_date,
            },
            PageRequest {
                page: self.page.unwrap_or(defaults.page),
                page_size: self.page_size.unwrap_or(defaults.page_size),
            },
        )
    }
}

/// `GET /leaderboards/:id/history`
pub async fn history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let (filter, page) = query.split();
    ok(state.history.list(&id, filter, page).await?)
}

/// `GET /stats`
pub async fn stats(State(state): State<Arc<AppState>>) -> ApiResult {
    let hub = state.hub.stats();
    metrics::set_hub_stats(&hub);
    ok(json!({
        "hub": hub,
        "outbox": {
            "pending": state.outbox.len(),
            "discarded": state.outbox.discarded(),
        },
    }))
}
