//! Slack message indexer.
//!
//! A background pipeline that paginates Slack history through the MCP
//! gateway, embeds messages, and upserts them into a vector store with
//! incremental per-channel watermarks. Single-writer per workspace,
//! enforced by the store's indexing lease; the scheduler bounds
//! cross-workspace concurrency.

pub mod processor;
pub mod store;

pub use processor::{IndexerConfig, RunSummary, SlackIndexer, WorkspaceSearcher};
pub use store::{IndexStatus, IndexedChannel, Workspace, WorkspaceStore};

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::db::qdrant::{Point, QdrantRest, ScoredPoint};
use crate::db::slack::McpClient;
use crate::error::{GatewayError, Result};

/// Workspaces indexed concurrently by one scheduler tick.
pub const MAX_CONCURRENT_WORKSPACES: usize = 5;

/// Vector-store operations the indexer needs.
///
/// `QdrantRest` is the production implementation; tests substitute an
/// in-memory double.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()>;
    async fn upsert_points(&self, collection: &str, points: &[Point]) -> Result<usize>;
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&serde_json::Value>,
    ) -> Result<Vec<ScoredPoint>>;
    async fn delete_by_filter(&self, collection: &str, filter: &serde_json::Value) -> Result<()>;
    async fn count(&self, collection: &str, filter: Option<&serde_json::Value>) -> Result<u64>;
}

#[async_trait]
impl VectorStore for QdrantRest {
    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()> {
        QdrantRest::ensure_collection(self, name, dimension).await
    }

    async fn upsert_points(&self, collection: &str, points: &[Point]) -> Result<usize> {
        QdrantRest::upsert_points(self, collection, points).await
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&serde_json::Value>,
    ) -> Result<Vec<ScoredPoint>> {
        QdrantRest::search(self, collection, vector, limit, filter).await
    }

    async fn delete_by_filter(&self, collection: &str, filter: &serde_json::Value) -> Result<()> {
        QdrantRest::delete_by_filter(self, collection, filter).await
    }

    async fn count(&self, collection: &str, filter: Option<&serde_json::Value>) -> Result<u64> {
        QdrantRest::count(self, collection, filter).await
    }
}

/// A channel as listed by the history source.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
}

/// One message from channel history.
#[derive(Debug, Clone, Default)]
pub struct SlackMessage {
    /// Slack timestamp string, e.g. "1700000000.000100".
    pub ts: String,
    pub text: String,
    pub user: Option<String>,
    pub thread_ts: Option<String>,
    pub attachments: Vec<serde_json::Value>,
    pub files: Vec<serde_json::Value>,
}

impl SlackMessage {
    /// The timestamp as a float, or None when unparseable.
    pub fn ts_f64(&self) -> Option<f64> {
        self.ts.parse::<f64>().ok()
    }
}

/// One page of channel history.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub messages: Vec<SlackMessage>,
    pub next_cursor: Option<String>,
}

/// Paginated access to workspace history.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn list_channels(&self) -> Result<Vec<ChannelInfo>>;

    /// Fetches one page. `oldest` is exclusive: only strictly newer
    /// messages are returned, matching the upstream API.
    async fn fetch_history(
        &self,
        channel_id: &str,
        oldest: Option<f64>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<HistoryPage>;
}

/// History source backed by the MCP gateway.
pub struct McpHistorySource {
    client: McpClient,
}

impl McpHistorySource {
    pub fn new(client: McpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HistorySource for McpHistorySource {
    async fn list_channels(&self) -> Result<Vec<ChannelInfo>> {
        let result = self.client.invoke("slack_list_channels", &json!({})).await?;
        let channels = result
            .get("channels")
            .and_then(|c| c.as_array())
            .ok_or_else(|| GatewayError::backend("channel list has no 'channels' array"))?;
        Ok(channels
            .iter()
            .filter_map(|channel| {
                Some(ChannelInfo {
                    id: channel.get("id")?.as_str()?.to_string(),
                    name: channel
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or("unknown")
                        .to_string(),
                })
            })
            .collect())
    }

    async fn fetch_history(
        &self,
        channel_id: &str,
        oldest: Option<f64>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<HistoryPage> {
        let mut parameters = json!({
            "channel_id": channel_id,
            "limit": limit,
        });
        if let Some(oldest) = oldest {
            parameters["oldest"] = json!(format!("{oldest:.6}"));
        }
        if let Some(cursor) = cursor {
            parameters["cursor"] = json!(cursor);
        }

        let result = self
            .client
            .invoke("slack_get_channel_history", &parameters)
            .await?;

        let messages = result
            .get("messages")
            .and_then(|m| m.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|msg| {
                        Some(SlackMessage {
                            ts: msg.get("ts")?.as_str()?.to_string(),
                            text: msg
                                .get("text")
                                .and_then(|t| t.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            user: msg.get("user").and_then(|u| u.as_str()).map(String::from),
                            thread_ts: msg
                                .get("thread_ts")
                                .and_then(|t| t.as_str())
                                .map(String::from),
                            attachments: msg
                                .get("attachments")
                                .and_then(|a| a.as_array())
                                .cloned()
                                .unwrap_or_default(),
                            files: msg
                                .get("files")
                                .and_then(|f| f.as_array())
                                .cloned()
                                .unwrap_or_default(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(HistoryPage {
            messages,
            next_cursor: result
                .pointer("/response_metadata/next_cursor")
                .or_else(|| result.get("next_cursor"))
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .map(String::from),
        })
    }
}

/// Background scheduler: wakes periodically and indexes due workspaces,
/// at most [`MAX_CONCURRENT_WORKSPACES`] in flight.
pub async fn run_scheduler(indexer: Arc<SlackIndexer>, tick: Duration) {
    let semaphore = Arc::new(tokio::sync::Semaphore::new(MAX_CONCURRENT_WORKSPACES));
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let workspace_ids = match indexer.due_workspaces().await {
            Ok(ids) => ids,
            Err(e) => {
                error!("scheduler could not list due workspaces: {}", e);
                continue;
            }
        };
        if workspace_ids.is_empty() {
            continue;
        }
        info!("scheduler: {} workspaces due for indexing", workspace_ids.len());

        let mut handles = Vec::new();
        for workspace_id in workspace_ids {
            let permit = Arc::clone(&semaphore).acquire_owned().await;
            let Ok(permit) = permit else { break };
            let indexer = Arc::clone(&indexer);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                // Background failures are logged, never propagated.
                if let Err(e) = indexer.process_workspace(workspace_id, false).await {
                    error!("indexing workspace {} failed: {}", workspace_id, e);
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}
