//! Slack OAuth flow endpoints.
//!
//! The CLI opens `/api/auth/slack/authorize?session=<id>`; the provider
//! calls back with a code and the CSRF state. A callback whose state
//! matches no live session performs NO workspace upsert. The CLI polls
//! `/check_session/<id>` until the handshake completes.

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Redirect};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::server::{ApiError, ApiResult, AppState};

/// Scopes requested from Slack.
const OAUTH_SCOPES: &str = "channels:history,channels:read,users:read,chat:write";

#[derive(Debug, Deserialize)]
pub struct AuthorizeParams {
    pub session: Option<String>,
    pub user_id: Option<i64>,
}

/// `GET /api/auth/slack/authorize`: 302 to the provider.
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuthorizeParams>,
) -> ApiResult<impl IntoResponse> {
    let client_id = state
        .config
        .slack
        .as_ref()
        .and_then(|s| s.client_id.clone())
        .ok_or_else(|| ApiError(GatewayError::config("slack.client_id is not configured")))?;

    // A CLI-initiated flow carries a session id; a direct flow gets a
    // fresh session so the callback still has a CSRF nonce to check.
    let session = match &params.session {
        Some(id) => state
            .sessions
            .get(id)
            .ok_or_else(|| ApiError(GatewayError::auth("unknown or expired session")))?,
        None => {
            info!("starting direct OAuth flow for user {:?}", params.user_id);
            state.sessions.create()
        }
    };

    let url = format!(
        "https://slack.com/oauth/v2/authorize?client_id={}&scope={}&state={}",
        client_id, OAUTH_SCOPES, session.state
    );
    Ok(Redirect::temporary(&url))
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// `GET /api/auth/slack/callback`: completes the exchange and upserts
/// the workspace.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> ApiResult<impl IntoResponse> {
    if let Some(error) = params.error {
        return Err(ApiError(GatewayError::auth(format!(
            "provider returned an error: {error}"
        ))));
    }
    let code = params
        .code
        .ok_or_else(|| ApiError(GatewayError::auth("callback is missing 'code'")))?;
    let callback_state = params
        .state
        .ok_or_else(|| ApiError(GatewayError::auth("callback is missing 'state'")))?;

    // CSRF check first: no live session with this state, no upsert.
    let Some(session) = state.sessions.find_by_state(&callback_state) else {
        warn!("OAuth callback with unknown state; refusing upsert");
        return Err(ApiError(GatewayError::auth(
            "state does not match any pending authorization",
        )));
    };

    let exchange = exchange_code(&state, &code).await.map_err(ApiError)?;

    let team_id = exchange
        .pointer("/team/id")
        .and_then(|t| t.as_str())
        .unwrap_or("unknown")
        .to_string();
    let team_name = exchange
        .pointer("/team/name")
        .and_then(|t| t.as_str())
        .unwrap_or("unknown")
        .to_string();
    let bot_token = exchange
        .get("access_token")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ApiError(GatewayError::auth("exchange response has no access_token")))?;
    let user_token = exchange
        .pointer("/authed_user/access_token")
        .and_then(|t| t.as_str());
    let scopes: Vec<String> = exchange
        .get("scope")
        .and_then(|s| s.as_str())
        .map(|s| s.split(',').map(String::from).collect())
        .unwrap_or_default();

    let workspaces = state
        .workspaces
        .as_ref()
        .ok_or_else(|| ApiError(GatewayError::config("workspace store not configured")))?;

    let bot_token_enc = state.cipher.encrypt(bot_token).map_err(ApiError)?;
    let user_token_enc = match user_token {
        Some(token) => Some(state.cipher.encrypt(token).map_err(ApiError)?),
        None => None,
    };

    let workspace_id = workspaces
        .upsert_workspace(
            &team_id,
            &team_name,
            &bot_token_enc,
            user_token_enc.as_deref(),
            &scopes,
        )
        .await
        .map_err(ApiError)?;
    info!("workspace '{}' upserted as id {}", team_name, workspace_id);

    state.sessions.complete(
        &session.session_id,
        &callback_state,
        json!({
            "workspace_id": workspace_id,
            "team_id": team_id,
            "team_name": team_name,
        }),
    );

    Ok(Redirect::temporary("/auth/success"))
}

/// Exchanges the authorization code for tokens.
async fn exchange_code(
    state: &AppState,
    code: &str,
) -> crate::error::Result<serde_json::Value> {
    let slack = state
        .config
        .slack
        .as_ref()
        .ok_or_else(|| GatewayError::config("slack section is not configured"))?;
    let client_id = slack
        .client_id
        .as_deref()
        .ok_or_else(|| GatewayError::config("slack.client_id is not configured"))?;
    let client_secret = slack
        .client_secret
        .as_deref()
        .ok_or_else(|| GatewayError::config("slack.client_secret is not configured"))?;

    let response = reqwest::Client::new()
        .post("https://slack.com/api/oauth.v2.access")
        .form(&[
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("code", code),
        ])
        .send()
        .await
        .map_err(|e| GatewayError::backend(format!("token exchange unreachable: {e}")))?;

    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| GatewayError::backend(format!("token exchange unreadable: {e}")))?;

    if body.get("ok").and_then(|v| v.as_bool()) != Some(true) {
        let code = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("unknown_error");
        return Err(GatewayError::auth(format!("token exchange failed: {code}")));
    }
    Ok(body)
}

/// `GET /api/auth/slack/check_session/:session_id`: CLI polling.
pub async fn check_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| ApiError(GatewayError::auth("unknown or expired session")))?;

    match session.auth_result {
        Some(result) => Ok(Json(json!({"status": "complete", "result": result}))),
        None => Ok(Json(json!({"status": "pending"}))),
    }
}
