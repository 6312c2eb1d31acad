//! Per-workspace indexing runs.
//!
//! One run takes the workspace lease, walks each channel's history from
//! its watermark, embeds message batches, upserts points keyed by
//! timestamp-derived ids, advances watermarks only after a successful
//! upsert, and finally prunes points older than the retention cutoff.
//! Interruption at any point is safe to resume.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::db::qdrant::Point;
use crate::db::slack::MessageSearch;
use crate::db::Row;
use crate::error::{GatewayError, Result};
use crate::indexer::store::WorkspaceStore;
use crate::indexer::{ChannelInfo, HistorySource, VectorStore};
use crate::llm::LlmService;

/// Tunables for one indexer instance.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Days of history to keep.
    pub history_days: u32,
    /// Ceiling on messages fetched per channel per run.
    pub max_messages_per_channel: usize,
    /// Messages requested per page.
    pub page_limit: usize,
    /// Pause between pages, for rate limits.
    pub page_delay: Duration,
    /// Messages embedded per model call.
    pub embed_batch_size: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            history_days: 30,
            max_messages_per_channel: 1000,
            page_limit: 100,
            page_delay: Duration::from_millis(500),
            embed_batch_size: 50,
        }
    }
}

/// Outcome of one workspace run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub workspace_id: i64,
    /// True when another worker held the lease and this run did nothing.
    pub skipped: bool,
    pub channels_processed: usize,
    pub indexed_messages: i64,
    pub newest_ts: Option<f64>,
}

/// The indexing engine.
pub struct SlackIndexer {
    store: Arc<WorkspaceStore>,
    source: Arc<dyn HistorySource>,
    vectors: Arc<dyn VectorStore>,
    llm: LlmService,
    config: IndexerConfig,
}

impl SlackIndexer {
    pub fn new(
        store: Arc<WorkspaceStore>,
        source: Arc<dyn HistorySource>,
        vectors: Arc<dyn VectorStore>,
        llm: LlmService,
        config: IndexerConfig,
    ) -> Self {
        Self {
            store,
            source,
            vectors,
            llm,
            config,
        }
    }

    /// The store backing this indexer.
    pub fn store(&self) -> Arc<WorkspaceStore> {
        Arc::clone(&self.store)
    }

    /// Collection name for a workspace's messages.
    pub fn collection_name(workspace_id: i64) -> String {
        format!("slack_messages_{workspace_id}")
    }

    /// Workspaces whose next scheduled run is due.
    pub async fn due_workspaces(&self) -> Result<Vec<i64>> {
        let mut due = Vec::new();
        for workspace_id in self.store.list_workspace_ids().await? {
            let Some(status) = self.store.get_index_status(workspace_id).await? else {
                due.push(workspace_id);
                continue;
            };
            if status.is_indexing {
                continue;
            }
            match status.last_completed_at {
                None => due.push(workspace_id),
                Some(completed) => {
                    let next = completed + chrono::Duration::hours(status.update_frequency_hours);
                    if Utc::now() >= next {
                        due.push(workspace_id);
                    }
                }
            }
        }
        Ok(due)
    }

    /// Runs one indexing pass over a workspace.
    ///
    /// `force_full` ignores channel watermarks and re-walks the whole
    /// retention window (ids are timestamp-derived, so re-runs overwrite
    /// rather than duplicate).
    pub async fn process_workspace(&self, workspace_id: i64, force_full: bool) -> Result<RunSummary> {
        let collection = Self::collection_name(workspace_id);
        self.store
            .ensure_index_status(
                workspace_id,
                &collection,
                self.config.history_days as i64,
                1,
                "configured",
            )
            .await?;

        if !self.store.try_acquire_lease(workspace_id).await? {
            debug!("workspace {} lease held elsewhere, skipping", workspace_id);
            return Ok(RunSummary {
                workspace_id,
                skipped: true,
                ..Default::default()
            });
        }

        let run = self.run_locked(workspace_id, &collection, force_full).await;
        match run {
            Ok(summary) => {
                let cutoff = self.cutoff_ts(workspace_id).await?;
                self.store
                    .finish_run(
                        workspace_id,
                        summary.indexed_messages,
                        Some(cutoff),
                        summary.newest_ts,
                        true,
                    )
                    .await?;
                info!(
                    "workspace {}: indexed {} messages across {} channels",
                    workspace_id, summary.indexed_messages, summary.channels_processed
                );
                Ok(summary)
            }
            Err(e) => {
                // Release the lease so the next tick can retry.
                self.store.finish_run(workspace_id, 0, None, None, false).await?;
                Err(e)
            }
        }
    }

    async fn cutoff_ts(&self, workspace_id: i64) -> Result<f64> {
        let history_days = self
            .store
            .get_index_status(workspace_id)
            .await?
            .map(|status| status.history_days)
            .unwrap_or(self.config.history_days as i64);
        Ok((Utc::now() - chrono::Duration::days(history_days)).timestamp() as f64)
    }

    async fn run_locked(
        &self,
        workspace_id: i64,
        collection: &str,
        force_full: bool,
    ) -> Result<RunSummary> {
        self.vectors
            .ensure_collection(collection, self.llm.embedding_dimension())
            .await?;

        let cutoff = self.cutoff_ts(workspace_id).await?;
        let channels = self.source.list_channels().await?;
        debug!(
            "workspace {}: {} channels, cutoff ts {}",
            workspace_id,
            channels.len(),
            cutoff
        );

        let mut summary = RunSummary {
            workspace_id,
            ..Default::default()
        };

        for channel in &channels {
            match self
                .process_channel(workspace_id, collection, channel, cutoff, force_full)
                .await
            {
                Ok((indexed, newest)) => {
                    summary.channels_processed += 1;
                    summary.indexed_messages += indexed;
                    if let Some(newest) = newest {
                        summary.newest_ts = Some(summary.newest_ts.map_or(newest, |n: f64| n.max(newest)));
                    }
                }
                Err(e) => {
                    // One channel failing does not abort the workspace run.
                    warn!(
                        "workspace {}: channel {} failed: {}",
                        workspace_id, channel.id, e
                    );
                }
            }
            self.store.touch_lease(workspace_id).await?;
        }

        // Retention: drop everything older than the cutoff.
        self.vectors
            .delete_by_filter(
                collection,
                &json!({"must": [{"key": "ts", "range": {"lt": cutoff}}]}),
            )
            .await?;

        Ok(summary)
    }

    /// Walks one channel from its lower bound and indexes new messages.
    ///
    /// Returns (indexed count, newest ts observed).
    async fn process_channel(
        &self,
        workspace_id: i64,
        collection: &str,
        channel: &ChannelInfo,
        cutoff: f64,
        force_full: bool,
    ) -> Result<(i64, Option<f64>)> {
        let watermark = if force_full {
            None
        } else {
            self.store
                .get_channel(workspace_id, &channel.id)
                .await?
                .and_then(|c| c.last_indexed_ts)
        };
        let oldest = match watermark {
            Some(wm) => wm.max(cutoff),
            None => cutoff,
        };

        // Page until the cursor runs out or the per-channel ceiling hits.
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .source
                .fetch_history(
                    &channel.id,
                    Some(oldest),
                    cursor.as_deref(),
                    self.config.page_limit,
                )
                .await?;
            messages.extend(page.messages);

            if messages.len() >= self.config.max_messages_per_channel {
                info!(
                    "channel {} hit the {}-message ceiling",
                    channel.id, self.config.max_messages_per_channel
                );
                messages.truncate(self.config.max_messages_per_channel);
                break;
            }
            match page.next_cursor {
                Some(next) => {
                    cursor = Some(next);
                    tokio::time::sleep(self.config.page_delay).await;
                }
                None => break,
            }
        }

        // Keep messages inside the retention window with usable text.
        let mut kept: Vec<(f64, &crate::indexer::SlackMessage)> = messages
            .iter()
            .filter_map(|message| message.ts_f64().map(|ts| (ts, message)))
            .filter(|(ts, message)| *ts >= cutoff && *ts > oldest - f64::EPSILON && !message.text.is_empty())
            .collect();
        kept.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        if kept.is_empty() {
            return Ok((0, watermark));
        }

        let mut indexed = 0i64;
        let mut newest = watermark.unwrap_or(0.0);

        for (batch_index, batch) in kept.chunks(self.config.embed_batch_size).enumerate() {
            let texts: Vec<String> = batch
                .iter()
                .map(|(_, message)| embedding_input(message))
                .collect();
            let vectors = self.llm.embed(&texts).await?;

            let points: Vec<Point> = batch
                .iter()
                .zip(vectors)
                .enumerate()
                .map(|(i, ((ts, message), vector))| Point {
                    // Timestamp-derived id: re-runs of the same window
                    // overwrite instead of duplicating.
                    id: (*ts * 1e6) as u64 + i as u64,
                    vector,
                    payload: message_payload(message, *ts, channel),
                })
                .collect();

            self.vectors.upsert_points(collection, &points).await?;

            // Watermark moves only after the upsert landed.
            let batch_newest = batch.last().map(|(ts, _)| *ts).unwrap_or(newest);
            newest = newest.max(batch_newest);
            self.store
                .advance_channel_watermark(
                    workspace_id,
                    &channel.id,
                    &channel.name,
                    newest,
                    batch.len() as i64,
                )
                .await?;
            indexed += batch.len() as i64;
            debug!(
                "channel {}: batch {} upserted {} points",
                channel.id,
                batch_index,
                batch.len()
            );
        }

        Ok((indexed, Some(newest)))
    }

    /// Read path: embed a query and search the workspace's messages with
    /// a filter conjunction.
    pub async fn search_workspace(
        &self,
        workspace_id: i64,
        query: &str,
        limit: usize,
        channels: Option<Vec<String>>,
        users: Option<Vec<String>>,
        date_from: Option<f64>,
        date_to: Option<f64>,
    ) -> Result<Vec<Row>> {
        let vector = self
            .llm
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::internal("embedding returned no vector"))?;

        let mut must = Vec::new();
        if let Some(channels) = channels.filter(|c| !c.is_empty()) {
            must.push(json!({"key": "channel_id", "match": {"any": channels}}));
        }
        if let Some(users) = users.filter(|u| !u.is_empty()) {
            must.push(json!({"key": "user_id", "match": {"any": users}}));
        }
        if date_from.is_some() || date_to.is_some() {
            let mut range = serde_json::Map::new();
            if let Some(from) = date_from {
                range.insert("gte".to_string(), json!(from));
            }
            if let Some(to) = date_to {
                range.insert("lte".to_string(), json!(to));
            }
            must.push(json!({"key": "ts", "range": range}));
        }
        let filter = if must.is_empty() {
            None
        } else {
            Some(json!({"must": must}))
        };

        let collection = Self::collection_name(workspace_id);
        let points = self
            .vectors
            .search(&collection, &vector, limit, filter.as_ref())
            .await?;

        Ok(points
            .into_iter()
            .map(|point| {
                let mut row = Row::new();
                row.insert("score".to_string(), json!(point.score));
                if let serde_json::Value::Object(payload) = point.payload {
                    for (key, value) in payload {
                        row.insert(key, value);
                    }
                }
                row
            })
            .collect())
    }
}

/// Text embedded for one message: body plus attachment texts.
fn embedding_input(message: &crate::indexer::SlackMessage) -> String {
    let mut input = message.text.clone();
    for attachment in &message.attachments {
        if let Some(text) = attachment.get("text").and_then(|t| t.as_str()) {
            input.push('\n');
            input.push_str(text);
        }
    }
    input
}

/// Payload stored with each point.
fn message_payload(
    message: &crate::indexer::SlackMessage,
    ts: f64,
    channel: &ChannelInfo,
) -> serde_json::Value {
    let datetime = chrono::DateTime::from_timestamp(ts as i64, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default();
    json!({
        "ts": ts,
        "text": message.text,
        "user_id": message.user,
        "channel_id": channel.id,
        "channel_name": channel.name,
        "has_attachments": !message.attachments.is_empty(),
        "has_files": !message.files.is_empty(),
        "datetime": datetime,
        "original_msg": {
            "ts": message.ts,
            "user": message.user,
            "thread_ts": message.thread_ts,
        },
    })
}

/// Per-workspace handle implementing the adapter's search contract.
pub struct WorkspaceSearcher {
    indexer: Arc<SlackIndexer>,
    workspace_id: i64,
}

impl WorkspaceSearcher {
    pub fn new(indexer: Arc<SlackIndexer>, workspace_id: i64) -> Self {
        Self {
            indexer,
            workspace_id,
        }
    }
}

#[async_trait]
impl MessageSearch for WorkspaceSearcher {
    async fn semantic_search(
        &self,
        query: &str,
        limit: usize,
        channels: Option<Vec<String>>,
        users: Option<Vec<String>>,
        date_from: Option<f64>,
        date_to: Option<f64>,
    ) -> Result<Vec<Row>> {
        self.indexer
            .search_workspace(self.workspace_id, query, limit, channels, users, date_from, date_to)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::qdrant::ScoredPoint;
    use crate::indexer::{HistoryPage, SlackMessage};
    use crate::llm::{LlmService, MockLlmClient};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory stand-in for the vector store.
    #[derive(Default)]
    struct FakeVectors {
        points: Mutex<HashMap<String, HashMap<u64, serde_json::Value>>>,
    }

    #[async_trait]
    impl VectorStore for FakeVectors {
        async fn ensure_collection(&self, name: &str, _dimension: usize) -> Result<()> {
            self.points
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default();
            Ok(())
        }

        async fn upsert_points(&self, collection: &str, points: &[Point]) -> Result<usize> {
            let mut store = self.points.lock().unwrap();
            let bucket = store.entry(collection.to_string()).or_default();
            for point in points {
                bucket.insert(point.id, point.payload.clone());
            }
            Ok(points.len())
        }

        async fn search(
            &self,
            collection: &str,
            _vector: &[f32],
            limit: usize,
            _filter: Option<&serde_json::Value>,
        ) -> Result<Vec<ScoredPoint>> {
            let store = self.points.lock().unwrap();
            Ok(store
                .get(collection)
                .map(|bucket| {
                    bucket
                        .iter()
                        .take(limit)
                        .map(|(id, payload)| ScoredPoint {
                            id: json!(id),
                            score: 0.9,
                            payload: payload.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn delete_by_filter(
            &self,
            collection: &str,
            filter: &serde_json::Value,
        ) -> Result<()> {
            // Supports only the pruning filter shape used by the indexer.
            let cutoff = filter
                .pointer("/must/0/range/lt")
                .and_then(|v| v.as_f64())
                .unwrap_or(f64::NEG_INFINITY);
            let mut store = self.points.lock().unwrap();
            if let Some(bucket) = store.get_mut(collection) {
                bucket.retain(|_, payload| {
                    payload.get("ts").and_then(|t| t.as_f64()).unwrap_or(0.0) >= cutoff
                });
            }
            Ok(())
        }

        async fn count(
            &self,
            collection: &str,
            _filter: Option<&serde_json::Value>,
        ) -> Result<u64> {
            Ok(self
                .points
                .lock()
                .unwrap()
                .get(collection)
                .map(|bucket| bucket.len() as u64)
                .unwrap_or(0))
        }
    }

    /// Scripted history source honoring the exclusive `oldest` bound.
    struct FakeHistory {
        channels: Vec<ChannelInfo>,
        messages: Vec<SlackMessage>,
    }

    #[async_trait]
    impl HistorySource for FakeHistory {
        async fn list_channels(&self) -> Result<Vec<ChannelInfo>> {
            Ok(self.channels.clone())
        }

        async fn fetch_history(
            &self,
            _channel_id: &str,
            oldest: Option<f64>,
            _cursor: Option<&str>,
            limit: usize,
        ) -> Result<HistoryPage> {
            let oldest = oldest.unwrap_or(f64::NEG_INFINITY);
            let messages: Vec<SlackMessage> = self
                .messages
                .iter()
                .filter(|message| message.ts_f64().map(|ts| ts > oldest).unwrap_or(false))
                .take(limit)
                .cloned()
                .collect();
            Ok(HistoryPage {
                messages,
                next_cursor: None,
            })
        }
    }

    fn message(ts: f64, text: &str) -> SlackMessage {
        SlackMessage {
            ts: format!("{ts:.6}"),
            text: text.to_string(),
            user: Some("U01".to_string()),
            ..Default::default()
        }
    }

    fn recent_ts(seconds_ago: i64) -> f64 {
        (Utc::now().timestamp() - seconds_ago) as f64
    }

    async fn indexer_with(
        messages: Vec<SlackMessage>,
        config: IndexerConfig,
    ) -> (Arc<SlackIndexer>, i64, Arc<FakeVectors>) {
        let store = Arc::new(WorkspaceStore::open_in_memory().await.unwrap());
        let workspace_id = store
            .upsert_workspace("T01", "acme", "enc", None, &[])
            .await
            .unwrap();
        let vectors = Arc::new(FakeVectors::default());
        let source = Arc::new(FakeHistory {
            channels: vec![ChannelInfo {
                id: "C01".to_string(),
                name: "general".to_string(),
            }],
            messages,
        });
        let llm = LlmService::new(Arc::new(MockLlmClient::new().with_dimension(8)));
        let indexer = Arc::new(SlackIndexer::new(
            store,
            source,
            Arc::clone(&vectors) as Arc<dyn VectorStore>,
            llm,
            config,
        ));
        (indexer, workspace_id, vectors)
    }

    #[tokio::test]
    async fn test_initial_run_indexes_recent_messages() {
        let messages = vec![
            message(recent_ts(3600), "deploy finished"),
            message(recent_ts(1800), "budget review at 3pm"),
        ];
        let (indexer, workspace_id, vectors) =
            indexer_with(messages, IndexerConfig::default()).await;

        let summary = indexer.process_workspace(workspace_id, false).await.unwrap();
        assert!(!summary.skipped);
        assert_eq!(summary.indexed_messages, 2);
        assert_eq!(summary.channels_processed, 1);

        let collection = SlackIndexer::collection_name(workspace_id);
        assert_eq!(vectors.count(&collection, None).await.unwrap(), 2);

        let status = indexer.store().get_index_status(workspace_id).await.unwrap().unwrap();
        assert!(!status.is_indexing);
        assert_eq!(status.indexed_messages, 2);
    }

    #[tokio::test]
    async fn test_rerun_with_no_new_messages_is_idempotent() {
        let newest = recent_ts(600);
        let messages = vec![message(recent_ts(1200), "first"), message(newest, "second")];
        let (indexer, workspace_id, vectors) =
            indexer_with(messages, IndexerConfig::default()).await;

        let first = indexer.process_workspace(workspace_id, false).await.unwrap();
        assert_eq!(first.indexed_messages, 2);

        let second = indexer.process_workspace(workspace_id, false).await.unwrap();
        assert_eq!(second.indexed_messages, 0);

        let channel = indexer
            .store()
            .get_channel(workspace_id, "C01")
            .await
            .unwrap()
            .unwrap();
        assert!((channel.last_indexed_ts.unwrap() - newest).abs() < 1.0);
        assert_eq!(channel.message_count, 2);

        let collection = SlackIndexer::collection_name(workspace_id);
        assert_eq!(vectors.count(&collection, None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_watermark_never_regresses() {
        let messages = vec![message(recent_ts(600), "hello")];
        let (indexer, workspace_id, _vectors) =
            indexer_with(messages, IndexerConfig::default()).await;

        indexer.process_workspace(workspace_id, false).await.unwrap();
        let before = indexer
            .store()
            .get_channel(workspace_id, "C01")
            .await
            .unwrap()
            .unwrap()
            .last_indexed_ts
            .unwrap();

        // force_full re-walks the window but must not move the mark back.
        indexer.process_workspace(workspace_id, true).await.unwrap();
        let after = indexer
            .store()
            .get_channel(workspace_id, "C01")
            .await
            .unwrap()
            .unwrap()
            .last_indexed_ts
            .unwrap();
        assert!(after >= before);
    }

    #[tokio::test]
    async fn test_zero_day_retention_prunes_everything() {
        let messages = vec![message(recent_ts(3600), "old news")];
        let config = IndexerConfig {
            history_days: 0,
            ..Default::default()
        };
        let (indexer, workspace_id, vectors) = indexer_with(messages, config).await;

        let summary = indexer.process_workspace(workspace_id, false).await.unwrap();
        assert_eq!(summary.indexed_messages, 0);

        let collection = SlackIndexer::collection_name(workspace_id);
        assert_eq!(vectors.count(&collection, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_message_ceiling_respected() {
        let messages: Vec<SlackMessage> = (0..20)
            .map(|i| message(recent_ts(2000 - i * 10), &format!("msg {i}")))
            .collect();
        let config = IndexerConfig {
            max_messages_per_channel: 5,
            page_limit: 100,
            page_delay: Duration::from_millis(0),
            ..Default::default()
        };
        let (indexer, workspace_id, _vectors) = indexer_with(messages, config).await;

        let summary = indexer.process_workspace(workspace_id, false).await.unwrap();
        assert_eq!(summary.indexed_messages, 5);
    }

    #[tokio::test]
    async fn test_empty_text_messages_skipped() {
        let messages = vec![message(recent_ts(600), ""), message(recent_ts(500), "real")];
        let (indexer, workspace_id, _vectors) =
            indexer_with(messages, IndexerConfig::default()).await;
        let summary = indexer.process_workspace(workspace_id, false).await.unwrap();
        assert_eq!(summary.indexed_messages, 1);
    }

    #[tokio::test]
    async fn test_semantic_search_returns_payload_rows() {
        let messages = vec![message(recent_ts(600), "quarterly budget numbers")];
        let (indexer, workspace_id, _vectors) =
            indexer_with(messages, IndexerConfig::default()).await;
        indexer.process_workspace(workspace_id, false).await.unwrap();

        let rows = indexer
            .search_workspace(workspace_id, "budget", 5, None, None, None, None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["text"], json!("quarterly budget numbers"));
        assert!(rows[0]["score"].as_f64().unwrap() > 0.0);
        assert_eq!(rows[0]["channel_name"], json!("general"));
    }

    #[tokio::test]
    async fn test_lease_blocks_second_worker() {
        let messages = vec![message(recent_ts(600), "hello")];
        let (indexer, workspace_id, _vectors) =
            indexer_with(messages, IndexerConfig::default()).await;

        let store = indexer.store();
        store
            .ensure_index_status(
                workspace_id,
                &SlackIndexer::collection_name(workspace_id),
                30,
                1,
                "configured",
            )
            .await
            .unwrap();
        assert!(store.try_acquire_lease(workspace_id).await.unwrap());

        let summary = indexer.process_workspace(workspace_id, false).await.unwrap();
        assert!(summary.skipped);
    }

    #[test]
    fn test_embedding_input_includes_attachments() {
        let mut msg = message(1.0, "body");
        msg.attachments = vec![json!({"text": "attachment text"})];
        let input = embedding_input(&msg);
        assert!(input.contains("body"));
        assert!(input.contains("attachment text"));
    }

    #[test]
    fn test_payload_fields() {
        let msg = message(1700000000.5, "hello");
        let channel = ChannelInfo {
            id: "C01".to_string(),
            name: "general".to_string(),
        };
        let payload = message_payload(&msg, 1700000000.5, &channel);
        assert_eq!(payload["channel_id"], json!("C01"));
        assert_eq!(payload["has_attachments"], json!(false));
        assert!(payload["datetime"].as_str().unwrap().starts_with("2023-11-14"));
        assert_eq!(payload["original_msg"]["user"], json!("U01"));
    }
}
