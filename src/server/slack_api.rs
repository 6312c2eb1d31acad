//! Thin Slack Web API client used by the gateway's tool surface.
//!
//! Each call takes the workspace's decrypted bot token; nothing here
//! caches plaintext tokens between calls.

use serde_json::{json, Value};
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Slack Web API base.
const SLACK_API_BASE: &str = "https://slack.com/api";

/// Request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// One-shot Slack Web API caller.
pub struct SlackWebApi {
    client: reqwest::Client,
    token: String,
}

impl SlackWebApi {
    /// Creates a caller bound to one decrypted bot token.
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| GatewayError::backend(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            token: token.into(),
        })
    }

    async fn call(&self, method: &str, arguments: Value) -> Result<Value> {
        let response = self
            .client
            .post(format!("{SLACK_API_BASE}/{method}"))
            .bearer_auth(&self.token)
            .json(&arguments)
            .send()
            .await
            .map_err(|e| GatewayError::backend(format!("slack API unreachable: {e}")))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::backend(format!("slack response unreadable: {e}")))?;

        if body.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            let code = body
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown_error");
            return match code {
                "token_revoked" | "invalid_auth" | "token_expired" => {
                    Err(GatewayError::auth(format!("slack rejected the token: {code}")))
                }
                "ratelimited" => Err(GatewayError::quota("slack rate limited")),
                _ => Err(GatewayError::backend(format!("slack API error: {code}"))),
            };
        }
        Ok(body)
    }

    /// Dispatches one MCP wire-format tool to the Web API.
    pub async fn invoke_tool(&self, tool: &str, parameters: &Value) -> Result<Value> {
        match tool {
            "slack_list_channels" => {
                let body = self
                    .call("conversations.list", json!({"limit": 1000, "exclude_archived": true}))
                    .await?;
                Ok(json!({"channels": body.get("channels").cloned().unwrap_or(json!([]))}))
            }
            "slack_get_channel_history" => {
                let mut arguments = json!({
                    "channel": parameters.get("channel_id").cloned().unwrap_or(Value::Null),
                    "limit": parameters.get("limit").cloned().unwrap_or(json!(100)),
                });
                for key in ["oldest", "cursor"] {
                    if let Some(value) = parameters.get(key) {
                        arguments[key] = value.clone();
                    }
                }
                let body = self.call("conversations.history", arguments).await?;
                Ok(json!({
                    "messages": body.get("messages").cloned().unwrap_or(json!([])),
                    "next_cursor": body.pointer("/response_metadata/next_cursor").cloned().unwrap_or(Value::Null),
                }))
            }
            "slack_get_thread_replies" => {
                let body = self
                    .call(
                        "conversations.replies",
                        json!({
                            "channel": parameters.get("channel_id").cloned().unwrap_or(Value::Null),
                            "ts": parameters.get("thread_ts").cloned().unwrap_or(Value::Null),
                        }),
                    )
                    .await?;
                Ok(json!({"replies": body.get("messages").cloned().unwrap_or(json!([]))}))
            }
            "slack_user_info" => {
                let body = self
                    .call(
                        "users.info",
                        json!({"user": parameters.get("user_id").cloned().unwrap_or(Value::Null)}),
                    )
                    .await?;
                Ok(body.get("user").cloned().unwrap_or(json!({})))
            }
            "slack_bot_info" => {
                let body = self.call("auth.test", json!({})).await?;
                Ok(json!({
                    "bot_id": body.get("bot_id").cloned().unwrap_or(Value::Null),
                    "user_id": body.get("user_id").cloned().unwrap_or(Value::Null),
                    "team": body.get("team").cloned().unwrap_or(Value::Null),
                }))
            }
            "slack_post_message" => {
                let mut arguments = json!({
                    "channel": parameters.get("channel_id").cloned().unwrap_or(Value::Null),
                    "text": parameters.get("text").cloned().unwrap_or(Value::Null),
                });
                if let Some(thread_ts) = parameters.get("thread_ts") {
                    arguments["thread_ts"] = thread_ts.clone();
                }
                let body = self.call("chat.postMessage", arguments).await?;
                Ok(json!({
                    "ts": body.get("ts").cloned().unwrap_or(Value::Null),
                    "channel": body.get("channel").cloned().unwrap_or(Value::Null),
                }))
            }
            other => Err(GatewayError::query_invalid(
                format!("unknown tool '{other}'"),
                other,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_tool_rejected_without_network() {
        let api = SlackWebApi::new("xoxb-test").unwrap();
        let err = api
            .invoke_tool("slack_wipe_workspace", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "QueryInvalid");
    }
}
