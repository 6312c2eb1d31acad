//! Slack adapter, speaking to the MCP gateway.
//!
//! The adapter never talks to Slack directly: read tools are invoked over
//! the gateway's `/api/tools/invoke` wire format, and semantic search is
//! routed through the vector store owned by the message indexer.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::db::{wrong_variant, Adapter, BackendKind, Query, QueryOptions, Row};
use crate::error::{GatewayError, Result};
use crate::llm::LlmService;
use crate::schema::SchemaDocument;

/// Timeout for gateway calls.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default ceiling for semantic search results.
const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Tools exposed over the MCP wire format.
pub const MCP_TOOLS: &[&str] = &[
    "slack_list_channels",
    "slack_get_channel_history",
    "slack_get_thread_replies",
    "slack_user_info",
    "slack_bot_info",
    "slack_post_message",
];

/// Read path into the indexed message store.
///
/// Implemented by the Slack indexer; the adapter depends only on this
/// trait so the two subsystems stay decoupled.
#[async_trait]
pub trait MessageSearch: Send + Sync {
    async fn semantic_search(
        &self,
        query: &str,
        limit: usize,
        channels: Option<Vec<String>>,
        users: Option<Vec<String>>,
        date_from: Option<f64>,
        date_to: Option<f64>,
    ) -> Result<Vec<Row>>;
}

/// HTTP client for the MCP gateway's tool-invocation surface.
#[derive(Debug, Clone)]
pub struct McpClient {
    base_url: String,
    bearer_token: Option<String>,
    client: reqwest::Client,
}

impl McpClient {
    /// Creates a client for the gateway at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| GatewayError::backend(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
            client,
        })
    }

    /// Attaches a bearer token for authenticated invocations.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Invokes a tool: `POST /api/tools/invoke {tool, parameters}`.
    pub async fn invoke(
        &self,
        tool: &str,
        parameters: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut request = self
            .client
            .post(format!("{}/api/tools/invoke", self.base_url))
            .json(&json!({"tool": tool, "parameters": parameters}));
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::backend(format!("MCP gateway unreachable: {e}")))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::backend(format!("MCP response unreadable: {e}")))?;

        match status.as_u16() {
            200 => Ok(body.get("result").cloned().unwrap_or(body)),
            400 => Err(GatewayError::query_invalid(
                format!("unknown tool or bad parameters: {body}"),
                tool,
            )),
            401 | 403 => Err(GatewayError::auth(format!("MCP gateway rejected token: {body}"))),
            429 => Err(GatewayError::quota("MCP gateway rate limited".to_string())),
            _ => Err(GatewayError::backend(format!(
                "MCP gateway error ({status}): {body}"
            ))),
        }
    }
}

/// Slack adapter over the MCP gateway.
pub struct SlackAdapter {
    uri: String,
    mcp: McpClient,
    search: Option<Arc<dyn MessageSearch>>,
    #[allow(dead_code)]
    llm: LlmService,
}

impl SlackAdapter {
    /// Creates an adapter speaking to the gateway at `uri`.
    pub fn new(uri: &str, llm: LlmService) -> Result<Self> {
        Ok(Self {
            uri: uri.to_string(),
            mcp: McpClient::new(uri)?,
            search: None,
            llm,
        })
    }

    /// Wires the semantic-search read path.
    pub fn with_message_search(mut self, search: Arc<dyn MessageSearch>) -> Self {
        self.search = Some(search);
        self
    }

    /// Attaches a bearer token for gateway calls.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.mcp = self.mcp.clone().with_token(token);
        self
    }

    /// Maps a question to the tool most likely to answer it.
    ///
    /// Anything that is not clearly a channel/thread/user lookup falls
    /// through to semantic search over the indexed history.
    fn classify_question(nl_prompt: &str, opts: &QueryOptions) -> Query {
        let lowered = nl_prompt.to_lowercase();

        let (tool_id, parameters) = if lowered.contains("list channels")
            || lowered.contains("what channels")
            || lowered.contains("which channels")
        {
            ("slack_list_channels", json!({}))
        } else if lowered.contains("thread") {
            ("slack_get_thread_replies", json!({}))
        } else if lowered.contains("history") || lowered.contains("latest messages") {
            ("slack_get_channel_history", json!({"limit": 50}))
        } else if lowered.contains("who is") || lowered.contains("user info") {
            ("slack_user_info", json!({}))
        } else if lowered.contains("bot") {
            ("slack_bot_info", json!({}))
        } else {
            (
                "semantic_search",
                json!({
                    "query": nl_prompt,
                    "limit": opts.top_k.unwrap_or(DEFAULT_SEARCH_LIMIT),
                }),
            )
        };

        Query::SlackTool {
            tool_id: tool_id.to_string(),
            parameters,
        }
    }

    async fn run_semantic_search(&self, parameters: &serde_json::Value) -> Result<Vec<Row>> {
        let search = self.search.as_ref().ok_or_else(|| {
            GatewayError::backend("semantic search requested but no message index is wired")
        })?;

        let query = parameters
            .get("query")
            .and_then(|q| q.as_str())
            .unwrap_or_default();
        let limit = parameters
            .get("limit")
            .and_then(|l| l.as_u64())
            .unwrap_or(DEFAULT_SEARCH_LIMIT as u64) as usize;
        let channels = parameters
            .get("channels")
            .and_then(|c| c.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(String::from))
                    .collect()
            });
        let users = parameters.get("users").and_then(|u| u.as_array()).map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(String::from))
                .collect()
        });
        let date_from = parameters.get("date_from").and_then(|d| d.as_f64());
        let date_to = parameters.get("date_to").and_then(|d| d.as_f64());

        search
            .semantic_search(query, limit, channels, users, date_from, date_to)
            .await
    }
}

/// Flattens a tool result into rows: known list shapes become one row per
/// element, anything else a single row.
fn result_to_rows(result: serde_json::Value) -> Vec<Row> {
    for key in ["channels", "messages", "replies", "results"] {
        if let Some(items) = result.get(key).and_then(|v| v.as_array()) {
            return items
                .iter()
                .filter_map(|item| item.as_object().cloned())
                .collect();
        }
    }
    match result {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| item.as_object().cloned())
            .collect(),
        serde_json::Value::Object(map) => vec![map],
        other => {
            let mut row = Row::new();
            row.insert("result".to_string(), other);
            vec![row]
        }
    }
}

#[async_trait]
impl Adapter for SlackAdapter {
    fn db_type(&self) -> BackendKind {
        BackendKind::Slack
    }

    fn connection_uri(&self) -> &str {
        &self.uri
    }

    async fn llm_to_query(&self, nl_prompt: &str, opts: &QueryOptions) -> Result<Query> {
        Ok(Self::classify_question(nl_prompt, opts))
    }

    async fn execute(&self, query: &Query) -> Result<Vec<Row>> {
        let Query::SlackTool {
            tool_id,
            parameters,
        } = query
        else {
            return Err(wrong_variant(BackendKind::Slack, query));
        };

        if tool_id == "semantic_search" {
            return self.run_semantic_search(parameters).await;
        }

        if !MCP_TOOLS.contains(&tool_id.as_str()) {
            return Err(GatewayError::query_invalid(
                format!("unknown slack tool '{tool_id}'"),
                query.display(),
            ));
        }

        let result = self.mcp.invoke(tool_id, parameters).await?;
        Ok(result_to_rows(result))
    }

    async fn introspect_schema(&self) -> Result<Vec<SchemaDocument>> {
        let result = self.mcp.invoke("slack_list_channels", &json!({})).await?;
        let channels = result
            .get("channels")
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();

        let mut documents = Vec::with_capacity(channels.len() + 1);
        let mut names = Vec::new();
        for channel in &channels {
            let id = channel.get("id").and_then(|i| i.as_str()).unwrap_or("?");
            let name = channel.get("name").and_then(|n| n.as_str()).unwrap_or("?");
            names.push(format!("#{name}"));
            documents.push(SchemaDocument::new(
                format!("channel:{id}"),
                format!("Slack channel #{name} (id {id}). Searchable message history with per-message user, timestamp, and attachments."),
                "slack",
            ));
        }
        documents.push(SchemaDocument::new(
            "workspace:overview",
            format!(
                "Slack workspace with {} channels: {}. Supports channel history, thread replies, user lookup, and semantic search over indexed messages.",
                channels.len(),
                names.join(", ")
            ),
            "slack",
        ));
        Ok(documents)
    }

    async fn test_connection(&self) -> bool {
        match self.mcp.invoke("slack_bot_info", &json!({})).await {
            Ok(_) => true,
            Err(e) => {
                warn!("slack connection test failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmService, MockLlmClient};

    fn llm() -> LlmService {
        LlmService::new(Arc::new(MockLlmClient::new()))
    }

    fn adapter() -> SlackAdapter {
        SlackAdapter::new("http://gateway.internal:8500", llm()).unwrap()
    }

    #[tokio::test]
    async fn test_classify_list_channels() {
        let query = adapter()
            .llm_to_query("what channels do we have?", &QueryOptions::default())
            .await
            .unwrap();
        match query {
            Query::SlackTool { tool_id, .. } => assert_eq!(tool_id, "slack_list_channels"),
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn test_classify_defaults_to_semantic_search() {
        let query = adapter()
            .llm_to_query("what did we decide about the Q3 budget?", &QueryOptions::default())
            .await
            .unwrap();
        match query {
            Query::SlackTool {
                tool_id,
                parameters,
            } => {
                assert_eq!(tool_id, "semantic_search");
                assert_eq!(parameters["limit"], serde_json::json!(10));
                assert!(parameters["query"].as_str().unwrap().contains("Q3 budget"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn test_semantic_search_without_index_fails() {
        let err = adapter()
            .execute(&Query::SlackTool {
                tool_id: "semantic_search".to_string(),
                parameters: serde_json::json!({"query": "budget"}),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BackendUnreachable");
    }

    #[tokio::test]
    async fn test_unknown_tool_rejected() {
        let err = adapter()
            .execute(&Query::SlackTool {
                tool_id: "slack_delete_everything".to_string(),
                parameters: serde_json::json!({}),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "QueryInvalid");
    }

    #[test]
    fn test_result_to_rows_channels() {
        let result = serde_json::json!({
            "channels": [
                {"id": "C01", "name": "general"},
                {"id": "C02", "name": "random"}
            ]
        });
        let rows = result_to_rows(result);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], serde_json::json!("general"));
    }

    #[test]
    fn test_result_to_rows_single_object() {
        let result = serde_json::json!({"id": "U01", "real_name": "Dana"});
        let rows = result_to_rows(result);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["real_name"], serde_json::json!("Dana"));
    }

    #[test]
    fn test_result_to_rows_scalar() {
        let rows = result_to_rows(serde_json::json!("ok"));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["result"], serde_json::json!("ok"));
    }
}
