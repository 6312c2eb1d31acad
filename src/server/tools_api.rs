//! MCP tool invocation and token minting.
//!
//! `POST /api/tools/invoke` dispatches a wire-format tool against the
//! caller's workspace; `POST /api/tools/token` mints a short-lived
//! bearer for a known user/workspace association.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::db::slack::MCP_TOOLS;
use crate::error::GatewayError;
use crate::server::slack_api::SlackWebApi;
use crate::server::{bearer_token, ApiError, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct InvokeRequest {
    pub tool: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// `POST /api/tools/invoke`: bearer JWT required.
pub async fn invoke(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<InvokeRequest>,
) -> ApiResult<impl IntoResponse> {
    let token = bearer_token(&headers)
        .ok_or_else(|| ApiError(GatewayError::auth("missing bearer token")))?;
    let claims = state.jwt.verify(&token).map_err(ApiError)?;

    if !MCP_TOOLS.contains(&request.tool.as_str()) {
        return Err(ApiError(GatewayError::query_invalid(
            format!("unknown tool '{}'", request.tool),
            request.tool,
        )));
    }

    let workspaces = state
        .workspaces
        .as_ref()
        .ok_or_else(|| ApiError(GatewayError::config("workspace store not configured")))?;
    let workspace = workspaces
        .get_workspace(claims.workspace_id)
        .await
        .map_err(ApiError)?
        .ok_or_else(|| {
            ApiError(GatewayError::auth(format!(
                "workspace {} is not registered",
                claims.workspace_id
            )))
        })?;

    // Decrypt per-operation; the plaintext token stays on this stack.
    let bot_token = state.cipher.decrypt(&workspace.bot_token_enc).map_err(ApiError)?;
    let api = SlackWebApi::new(bot_token).map_err(ApiError)?;
    let result = api
        .invoke_tool(&request.tool, &request.parameters)
        .await
        .map_err(ApiError)?;

    Ok(Json(json!({ "result": result })))
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub user_id: i64,
    pub workspace_id: i64,
}

/// `POST /api/tools/token`: 403 when the association is unknown.
pub async fn token(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TokenRequest>,
) -> ApiResult<impl IntoResponse> {
    let workspaces = state
        .workspaces
        .as_ref()
        .ok_or_else(|| ApiError(GatewayError::config("workspace store not configured")))?;

    let known = workspaces
        .get_workspace(request.workspace_id)
        .await
        .map_err(ApiError)?
        .is_some();
    if !known {
        return Ok((
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": {
                    "kind": "AuthExpired",
                    "message": format!(
                        "no association for user {} and workspace {}",
                        request.user_id, request.workspace_id
                    ),
                    "remediation": "Authorize the workspace first.",
                }
            })),
        )
            .into_response());
    }

    let (token, expires_at) = state
        .jwt
        .mint_bearer(request.user_id, request.workspace_id)
        .map_err(ApiError)?;
    Ok(Json(json!({ "token": token, "expires_at": expires_at })).into_response())
}
