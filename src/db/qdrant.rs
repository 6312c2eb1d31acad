//! Qdrant adapter and REST client.
//!
//! `QdrantRest` is the thin HTTP client shared by this adapter and the
//! Slack message indexer (collection management, upsert, search, delete).
//! The adapter layers query translation on top: the question is embedded
//! and searched with a default top_k of 10.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::db::{wrong_variant, Adapter, BackendKind, Query, QueryOptions, Row};
use crate::error::{GatewayError, Result};
use crate::llm::LlmService;
use crate::schema::SchemaDocument;

/// Default result ceiling for vector search.
const DEFAULT_TOP_K: usize = 10;

/// Timeout for REST calls.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// A point to upsert into a collection.
#[derive(Debug, Clone, Serialize)]
pub struct Point {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

/// A scored point returned by search.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoredPoint {
    pub id: serde_json::Value,
    pub score: f32,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Minimal Qdrant REST client.
#[derive(Debug, Clone)]
pub struct QdrantRest {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl QdrantRest {
    /// Creates a client for the given REST base URL.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| GatewayError::backend(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.header("api-key", key);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<serde_json::Value> {
        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::backend(format!("qdrant request failed: {e}")))?;
        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::backend(format!("qdrant response unreadable: {e}")))?;

        if !status.is_success() {
            return Err(GatewayError::backend(format!(
                "qdrant error ({status}): {body}"
            )));
        }
        Ok(body.get("result").cloned().unwrap_or(body))
    }

    /// Creates the collection if it does not already exist.
    pub async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()> {
        let exists = self
            .send(self.request(reqwest::Method::GET, &format!("/collections/{name}")))
            .await
            .is_ok();
        if exists {
            return Ok(());
        }

        debug!("creating qdrant collection '{}' (dim {})", name, dimension);
        self.send(
            self.request(reqwest::Method::PUT, &format!("/collections/{name}"))
                .json(&json!({
                    "vectors": {"size": dimension, "distance": "Cosine"}
                })),
        )
        .await?;
        Ok(())
    }

    /// Upserts points, waiting for the write to be applied.
    pub async fn upsert_points(&self, collection: &str, points: &[Point]) -> Result<usize> {
        if points.is_empty() {
            return Ok(0);
        }
        self.send(
            self.request(
                reqwest::Method::PUT,
                &format!("/collections/{collection}/points?wait=true"),
            )
            .json(&json!({ "points": points })),
        )
        .await?;
        Ok(points.len())
    }

    /// Runs a cosine search, returning scored points with payloads.
    pub async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&serde_json::Value>,
    ) -> Result<Vec<ScoredPoint>> {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(filter) = filter {
            body["filter"] = filter.clone();
        }

        let result = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    &format!("/collections/{collection}/points/search"),
                )
                .json(&body),
            )
            .await?;

        serde_json::from_value(result)
            .map_err(|e| GatewayError::backend(format!("bad search result shape: {e}")))
    }

    /// Deletes all points matching the filter.
    pub async fn delete_by_filter(
        &self,
        collection: &str,
        filter: &serde_json::Value,
    ) -> Result<()> {
        self.send(
            self.request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points/delete?wait=true"),
            )
            .json(&json!({ "filter": filter })),
        )
        .await?;
        Ok(())
    }

    /// Exact point count, optionally filtered.
    pub async fn count(
        &self,
        collection: &str,
        filter: Option<&serde_json::Value>,
    ) -> Result<u64> {
        let mut body = json!({"exact": true});
        if let Some(filter) = filter {
            body["filter"] = filter.clone();
        }
        let result = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    &format!("/collections/{collection}/points/count"),
                )
                .json(&body),
            )
            .await?;
        Ok(result.get("count").and_then(|c| c.as_u64()).unwrap_or(0))
    }

    /// Lists collection names.
    pub async fn list_collections(&self) -> Result<Vec<String>> {
        let result = self
            .send(self.request(reqwest::Method::GET, "/collections"))
            .await?;
        Ok(result
            .get("collections")
            .and_then(|c| c.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.get("name").and_then(|n| n.as_str()).map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Returns (points_count, vector_size) for a collection.
    pub async fn collection_info(&self, name: &str) -> Result<(u64, usize)> {
        let result = self
            .send(self.request(reqwest::Method::GET, &format!("/collections/{name}")))
            .await?;
        let points = result
            .get("points_count")
            .and_then(|c| c.as_u64())
            .unwrap_or(0);
        let size = result
            .pointer("/config/params/vectors/size")
            .and_then(|s| s.as_u64())
            .unwrap_or(0) as usize;
        Ok((points, size))
    }
}

/// Qdrant adapter.
pub struct QdrantAdapter {
    uri: String,
    rest: QdrantRest,
    collection: String,
    llm: LlmService,
}

impl QdrantAdapter {
    /// Creates an adapter over a `qdrant://host:port` or http(s) URI.
    pub fn new(
        uri: &str,
        collection: Option<String>,
        api_key: Option<String>,
        llm: LlmService,
    ) -> Result<Self> {
        let rest_url = rest_url_from_uri(uri)?;
        Ok(Self {
            uri: uri.to_string(),
            rest: QdrantRest::new(rest_url, api_key)?,
            collection: collection.unwrap_or_else(|| "corporate_knowledge".to_string()),
            llm,
        })
    }

    /// The underlying REST client.
    pub fn rest(&self) -> &QdrantRest {
        &self.rest
    }
}

/// Converts a `qdrant://` URI to the REST base URL.
fn rest_url_from_uri(uri: &str) -> Result<String> {
    let parsed = url::Url::parse(uri)
        .map_err(|e| GatewayError::config(format!("invalid qdrant URI: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| GatewayError::config("qdrant URI missing host"))?;
    let port = parsed.port().unwrap_or(6333);
    match parsed.scheme() {
        "qdrant" | "http" => Ok(format!("http://{host}:{port}")),
        "https" => Ok(format!("https://{host}:{port}")),
        other => Err(GatewayError::config(format!(
            "unsupported qdrant scheme: {other}"
        ))),
    }
}

/// Normalizes the supported filter shapes to Qdrant's native form.
///
/// `{"exact_match": {"field": f, "value": v}}` maps to an equality
/// predicate; anything already in backend form passes through.
pub fn normalize_filter(filter: &serde_json::Value) -> serde_json::Value {
    if let Some(exact) = filter.get("exact_match") {
        let field = exact.get("field").and_then(|f| f.as_str()).unwrap_or("");
        let value = exact.get("value").cloned().unwrap_or(serde_json::Value::Null);
        return json!({
            "must": [{"key": field, "match": {"value": value}}]
        });
    }
    filter.clone()
}

#[async_trait]
impl Adapter for QdrantAdapter {
    fn db_type(&self) -> BackendKind {
        BackendKind::Qdrant
    }

    fn connection_uri(&self) -> &str {
        &self.uri
    }

    async fn llm_to_query(&self, nl_prompt: &str, opts: &QueryOptions) -> Result<Query> {
        let vector = self
            .llm
            .embed(&[nl_prompt.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::internal("embedding returned no vector"))?;

        Ok(Query::VectorSearch {
            vector,
            top_k: opts.top_k.unwrap_or(DEFAULT_TOP_K),
            collection: opts
                .collection
                .clone()
                .unwrap_or_else(|| self.collection.clone()),
            filter: None,
        })
    }

    async fn execute(&self, query: &Query) -> Result<Vec<Row>> {
        let Query::VectorSearch {
            vector,
            top_k,
            collection,
            filter,
        } = query
        else {
            return Err(wrong_variant(BackendKind::Qdrant, query));
        };

        let normalized = filter.as_ref().map(normalize_filter);
        let points = self
            .rest
            .search(collection, vector, *top_k, normalized.as_ref())
            .await?;

        Ok(points
            .into_iter()
            .map(|point| {
                let mut row = Row::new();
                row.insert("id".to_string(), point.id);
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

    async fn introspect_schema(&self) -> Result<Vec<SchemaDocument>> {
        let names = self.rest.list_collections().await?;
        let mut documents = Vec::new();
        for name in names {
            match self.rest.collection_info(&name).await {
                Ok((points, size)) => {
                    let content = format!(
                        "Collection: {name}\nPoints: {points}\nVector dimension: {size}\nDistance: cosine\n"
                    );
                    documents.push(SchemaDocument::new(
                        format!("collection:{name}"),
                        content,
                        "qdrant",
                    ));
                }
                Err(e) => warn!("collection info for '{}' failed: {}", name, e),
            }
        }
        if documents.is_empty() {
            return Err(GatewayError::PartialIntrospection(
                "no qdrant collections visible".to_string(),
            ));
        }
        Ok(documents)
    }

    async fn test_connection(&self) -> bool {
        self.rest.list_collections().await.is_ok()
    }
}
