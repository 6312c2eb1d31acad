//! Shopify webhook intake.
//!
//! The HMAC signature is verified over the raw payload bytes before any
//! parsing; an invalid or missing signature is rejected with 401 and no
//! processing happens.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::db::ShopifyAdapter;
use crate::error::GatewayError;
use crate::server::{ApiError, ApiResult, AppState};

/// `POST /webhooks/shopify`.
pub async fn shopify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let shopify = state
        .config
        .shopify
        .as_ref()
        .ok_or_else(|| ApiError(GatewayError::config("shopify section is not configured")))?;
    let app_url = shopify
        .app_url
        .as_deref()
        .ok_or_else(|| ApiError(GatewayError::config("shopify.app_url is not configured")))?;
    let secret = shopify
        .webhook_secret
        .clone()
        .ok_or_else(|| ApiError(GatewayError::config("shopify.webhook_secret is not configured")))?;

    let signature = headers
        .get("X-Shopify-Hmac-Sha256")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError(GatewayError::auth("missing webhook signature header")))?;
    let topic = headers
        .get("X-Shopify-Topic")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    let adapter = ShopifyAdapter::new(app_url, shopify.api_version.clone(), state.llm.clone())
        .map_err(ApiError)?
        .with_webhook_secret(secret);

    let valid = adapter.verify_webhook(&body, signature).map_err(ApiError)?;
    if !valid {
        return Ok((
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": {
                    "kind": "AuthExpired",
                    "message": "webhook signature verification failed",
                    "remediation": "Check the configured webhook secret.",
                }
            })),
        )
            .into_response());
    }

    let payload: serde_json::Value = serde_json::from_slice(&body).map_err(|e| {
        ApiError(GatewayError::query_invalid(
            format!("webhook body is not JSON: {e}"),
            String::from_utf8_lossy(&body),
        ))
    })?;

    let event = adapter.process_webhook(topic, &payload);
    info!("accepted shopify webhook: {} (id {:?})", event.event_type, event.id);

    Ok(Json(json!({ "status": "accepted", "event": event })).into_response())
}
