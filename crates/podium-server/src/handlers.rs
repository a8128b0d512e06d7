//! HTTP and WebSocket handlers for the Podium server.
//!
//! This module owns the shared state, the route table, live-connection
//! upgrades, and the serve loop. The JSON API lives in [`crate::api`].

use crate::api;
use crate::config::Config;
use crate::metrics;
use crate::session::run_session;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, MatchedPath, Query, Request, State,
    },
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use podium_core::{HistoryService, Hub, LeaderboardService, Outbox};
use podium_transport::{Connection, ConnectionId, WebSocketConnection};
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Header carrying the caller's user id on live-connection upgrades.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Live-connection hub.
    pub hub: Hub,
    /// Leaderboard use cases.
    pub leaderboards: LeaderboardService,
    /// History use cases.
    pub history: HistoryService,
    /// Events waiting for a successful append.
    pub outbox: Arc<Outbox>,
}

/// Build the route table.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route(
            "/leaderboards",
            get(api::list_leaderboards).post(api::create_leaderboard),
        )
        .route(
            "/leaderboards/:id",
            get(api::get_leaderboard).patch(api::update_leaderboard),
        )
        .route("/leaderboards/:id/score", post(api::submit_score))
        .route("/leaderboards/:id/entries", delete(api::reset_leaderboard))
        .route(
            "/leaderboards/:id/entries/:entry",
            delete(api::remove_entry),
        )
        .route("/leaderboards/:id/entries/:entry/rank", get(api::entry_rank))
        .route(
            "/leaderboards/:id/entries/:entry/around",
            get(api::around_entry),
        )
        .route("/leaderboards/:id/history", get(api::history))
        .route("/stats", get(api::stats))
        .route_layer(middleware::from_fn(track_latency));

    Router::new()
        .nest("/api/v1", api)
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/ping", get(|| async { "pong" }))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn run_server(
    state: Arc<AppState>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let path = state.config.transport.websocket_path.clone();
    let app = router(state);

    let addr = listener.local_addr().context("Listener has no local address")?;
    info!("Podium server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, path);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("HTTP server failed")?;

    info!("HTTP server stopped");
    Ok(())
}

async fn track_latency(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_string());
    let start = Instant::now();
    let response = next.run(request).await;
    metrics::record_http_latency(route, start.elapsed().as_secs_f64());
    response
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

/// The query parameter wins over the header. Blank values count as absent.
fn user_id(params: WsParams, headers: &HeaderMap) -> Option<String> {
    params
        .user_id
        .or_else(|| {
            headers
                .get(USER_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let limit = state.config.limits.max_connections;
    if state.hub.stats().total_connections >= limit {
        warn!(%addr, limit, "Connection limit reached");
        metrics::record_error("connection_limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    let user_id = user_id(params, &headers);
    let max_message_size = state.config.limits.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, addr, user_id, state))
}

/// Hand an upgraded socket to a session.
async fn handle_websocket(
    socket: WebSocket,
    addr: SocketAddr,
    user_id: Option<String>,
    state: Arc<AppState>,
) {
    let conn = WebSocketConnection::new(ConnectionId::generate(), socket)
        .with_remote_addr(addr)
        .with_max_message_size(state.config.limits.max_message_size);
    debug!(connection = %conn.id(), %addr, user = ?user_id, "WebSocket connected");

    run_session(
        state.hub.clone(),
        Box::new(conn),
        user_id,
        state.config.session(),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_user_id_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(user_id(WsParams::default(), &headers), None);

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("from-header"));
        assert_eq!(
            user_id(WsParams::default(), &headers).as_deref(),
            Some("from-header")
        );

        let params = WsParams {
            user_id: Some("from-query".into()),
        };
        assert_eq!(user_id(params, &headers).as_deref(), Some("from-query"));

        let blank = WsParams {
            user_id: Some("  ".into()),
        };
        assert_eq!(user_id(blank, &HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn test_health() {
        let response = health_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
