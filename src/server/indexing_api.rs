//! Indexing control and search endpoints.
//!
//! Kicks background indexing runs, serves semantic search over the
//! indexed history, and reports per-workspace progress.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

use crate::error::GatewayError;
use crate::server::{bearer_token, ApiError, ApiResult, AppState};

/// Resolves the caller's workspace: bearer claims win, then the body.
fn resolve_workspace(
    state: &AppState,
    headers: &HeaderMap,
    body_workspace: Option<i64>,
) -> Result<i64, ApiError> {
    if let Some(token) = bearer_token(headers) {
        let claims = state.jwt.verify(&token).map_err(ApiError)?;
        return Ok(claims.workspace_id);
    }
    body_workspace.ok_or_else(|| {
        ApiError(GatewayError::auth(
            "provide a bearer token or an explicit workspace_id",
        ))
    })
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    #[allow(dead_code)]
    pub user_id: Option<i64>,
    pub workspace_id: Option<i64>,
    #[serde(default)]
    pub force_full: bool,
}

/// `POST /api/indexing/run`: kicks a background run.
pub async fn run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RunRequest>,
) -> ApiResult<impl IntoResponse> {
    let workspace_id = resolve_workspace(&state, &headers, request.workspace_id)?;
    let indexer = state
        .indexer
        .clone()
        .ok_or_else(|| ApiError(GatewayError::config("indexer is not configured")))?;

    tokio::spawn(async move {
        // Background failures are logged, never surfaced to callers.
        if let Err(e) = indexer.process_workspace(workspace_id, request.force_full).await {
            error!("background indexing for workspace {} failed: {}", workspace_id, e);
        }
    });

    Ok(Json(json!({
        "status": "started",
        "workspace_id": workspace_id,
        "force_full": request.force_full,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub workspace_id: Option<i64>,
    pub channels: Option<Vec<String>>,
    pub users: Option<Vec<String>>,
    pub date_from: Option<f64>,
    pub date_to: Option<f64>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

/// `POST /api/indexing/search`: ranked message list.
pub async fn search(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SearchRequest>,
) -> ApiResult<impl IntoResponse> {
    let workspace_id = resolve_workspace(&state, &headers, request.workspace_id)?;
    let indexer = state
        .indexer
        .clone()
        .ok_or_else(|| ApiError(GatewayError::config("indexer is not configured")))?;

    let started = Instant::now();
    let results = indexer
        .search_workspace(
            workspace_id,
            &request.query,
            request.limit,
            request.channels,
            request.users,
            request.date_from,
            request.date_to,
        )
        .await
        .map_err(ApiError)?;

    Ok(Json(json!({
        "results": results,
        "query_time_ms": started.elapsed().as_millis() as u64,
    })))
}

/// `GET /api/indexing/status/:workspace_id`: watermark and progress.
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let indexer = state
        .indexer
        .clone()
        .ok_or_else(|| ApiError(GatewayError::config("indexer is not configured")))?;

    let status = indexer
        .store()
        .get_index_status(workspace_id)
        .await
        .map_err(ApiError)?
        .ok_or_else(|| {
            ApiError(GatewayError::config(format!(
                "workspace {workspace_id} has no index status"
            )))
        })?;

    let channels = indexer
        .store()
        .list_channels(workspace_id)
        .await
        .map_err(ApiError)?;

    let progress_percent = if status.total_messages > 0 {
        (status.indexed_messages as f64 / status.total_messages as f64 * 100.0).min(100.0)
    } else {
        0.0
    };

    Ok(Json(json!({
        "workspace_id": workspace_id,
        "collection_name": status.collection_name,
        "is_indexing": status.is_indexing,
        "last_indexed_at": status.last_indexed_at,
        "last_completed_at": status.last_completed_at,
        "total_messages": status.total_messages,
        "indexed_messages": status.indexed_messages,
        "oldest_ts": status.oldest_ts,
        "newest_ts": status.newest_ts,
        "history_days": status.history_days,
        "progress_percent": progress_percent,
        "channels": channels
            .iter()
            .map(|channel| json!({
                "channel_id": channel.channel_id,
                "channel_name": channel.channel_name,
                "last_indexed_ts": channel.last_indexed_ts,
                "message_count": channel.message_count,
            }))
            .collect::<Vec<_>>(),
    })))
}
