//! HTTP surfaces.
//!
//! One axum process serves the three documented surfaces: the MCP
//! gateway (tool invocation, Slack OAuth, indexing control), the
//! operator query endpoint, and Shopify webhook intake. Errors map to
//! status codes with kind + cause + remediation; stack traces stay in
//! the logs.

pub mod auth_api;
pub mod indexing_api;
pub mod query_api;
pub mod slack_api;
pub mod tools_api;
pub mod webhooks;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::error;

use crate::auth::{JwtIssuer, SessionTable, TokenCipher};
use crate::config::Config;
use crate::db::Orchestrator;
use crate::error::GatewayError;
use crate::indexer::{SlackIndexer, WorkspaceStore};
use crate::llm::LlmService;
use crate::monitor::AvailabilityMonitor;
use crate::schema::SchemaSearcher;
use crate::tools::{ExecutionNode, ToolRegistry};

/// Shared state for all handlers.
pub struct AppState {
    pub config: Config,
    pub llm: LlmService,
    pub registry: Arc<ToolRegistry>,
    pub node: Arc<ExecutionNode>,
    pub searcher: Arc<SchemaSearcher>,
    pub indexer: Option<Arc<SlackIndexer>>,
    pub workspaces: Option<Arc<WorkspaceStore>>,
    pub jwt: JwtIssuer,
    pub cipher: TokenCipher,
    pub sessions: Arc<SessionTable>,
    pub monitor: Arc<AvailabilityMonitor>,
    /// Orchestrators cached per backend tag for the query endpoint.
    pub orchestrators: RwLock<HashMap<String, Arc<Orchestrator>>>,
}

/// Error wrapper implementing axum's response conversion.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            GatewayError::QueryInvalid { .. } | GatewayError::LlmParseError { .. } => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::AuthExpired(_) | GatewayError::AuthTimeout(_) => StatusCode::UNAUTHORIZED,
            GatewayError::AdapterSelectionAmbiguous(_) | GatewayError::ConfigInvalid(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // The full error goes to the log; the response carries kind,
        // cause, and remediation only.
        error!("request failed: {} ({})", err, err.kind());
        let body = json!({
            "error": {
                "kind": err.kind(),
                "message": err.to_string(),
                "remediation": err.remediation(),
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Result alias for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Builds the full router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // MCP gateway surface
        .route("/api/tools/invoke", post(tools_api::invoke))
        .route("/api/tools/token", post(tools_api::token))
        .route("/api/auth/slack/authorize", get(auth_api::authorize))
        .route("/api/auth/slack/callback", get(auth_api::callback))
        .route(
            "/api/auth/slack/check_session/:session_id",
            get(auth_api::check_session),
        )
        .route("/api/indexing/run", post(indexing_api::run))
        .route("/api/indexing/search", post(indexing_api::search))
        .route(
            "/api/indexing/status/:workspace_id",
            get(indexing_api::status),
        )
        // Operator surface
        .route("/api/query", post(query_api::query))
        .route("/api/availability", get(availability))
        .route("/api/health", get(health))
        // Webhook intake
        .route("/webhooks/shopify", post(webhooks::shopify))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn availability(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Json<serde_json::Value> {
    Json(json!({
        "summary": state.monitor.summary(),
        "backends": state.monitor.statuses(),
    }))
}

/// Extracts a bearer token from the Authorization header.
pub fn bearer_token(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(String::from)
}
