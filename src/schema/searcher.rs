//! Semantic retrieval over cached schema fragments.
//!
//! Embeds schema documents once per build and answers queries by cosine
//! similarity. The index is append-only within a session; mutating
//! updates go through a full (idempotent) rebuild.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::llm::LlmClient;
use crate::schema::SchemaDocument;

/// A schema document with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: SchemaDocument,
    pub score: f32,
}

/// Supplies the documents for a backend's schema index.
///
/// Implemented by the orchestrator so the searcher can trigger a build
/// when a query arrives before any index exists.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn fetch_schema(&self) -> Result<Vec<SchemaDocument>>;
}

struct SchemaIndex {
    dimension: usize,
    entries: Vec<(SchemaDocument, Vec<f32>)>,
}

/// Semantic searcher over per-backend schema indexes.
pub struct SchemaSearcher {
    llm: Arc<dyn LlmClient>,
    indexes: RwLock<HashMap<String, SchemaIndex>>,
    sources: RwLock<HashMap<String, Arc<dyn SchemaSource>>>,
}

impl SchemaSearcher {
    /// Creates a searcher that embeds with the given client.
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            indexes: RwLock::new(HashMap::new()),
            sources: RwLock::new(HashMap::new()),
        }
    }

    /// Registers the document source for a backend.
    pub async fn register_source(&self, db_type: &str, source: Arc<dyn SchemaSource>) {
        self.sources
            .write()
            .await
            .insert(db_type.to_string(), source);
    }

    /// Builds (or rebuilds) the index for a backend from its source.
    ///
    /// Rebuilds are idempotent: the previous index is replaced wholesale.
    pub async fn rebuild_index(&self, db_type: &str) -> Result<usize> {
        let source = {
            let sources = self.sources.read().await;
            sources.get(db_type).cloned()
        }
        .ok_or_else(|| {
            GatewayError::SchemaIndexUnavailable(format!(
                "no schema source registered for '{db_type}'"
            ))
        })?;

        let documents = source.fetch_schema().await.map_err(|e| {
            GatewayError::SchemaIndexUnavailable(format!("index build failed for '{db_type}': {e}"))
        })?;

        self.build_from_documents(db_type, documents).await
    }

    /// Builds the index directly from documents, embedding their contents.
    pub async fn build_from_documents(
        &self,
        db_type: &str,
        documents: Vec<SchemaDocument>,
    ) -> Result<usize> {
        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let vectors = self.llm.embed(&texts).await.map_err(|e| {
            GatewayError::SchemaIndexUnavailable(format!(
                "embedding failed for '{db_type}' index: {e}"
            ))
        })?;

        let dimension = vectors.first().map(|v| v.len()).unwrap_or(0);
        let entries: Vec<_> = documents.into_iter().zip(vectors).collect();
        let count = entries.len();

        info!("Built schema index for '{}' with {} documents", db_type, count);
        self.indexes
            .write()
            .await
            .insert(db_type.to_string(), SchemaIndex { dimension, entries });
        Ok(count)
    }

    /// Searches cached schema fragments by embedding similarity.
    ///
    /// Returns at most `top_k` documents ordered by descending score, ties
    /// broken by id. When `db_type` is given and its index is missing, a
    /// build is attempted first.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        db_type: Option<&str>,
    ) -> Result<Vec<ScoredDocument>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        if let Some(db_type) = db_type {
            let missing = !self.indexes.read().await.contains_key(db_type);
            if missing {
                debug!("schema index for '{}' missing, building", db_type);
                self.rebuild_index(db_type).await?;
            }
        }

        let query_vector = self
            .llm
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::internal("embedding returned no vector"))?;

        let indexes = self.indexes.read().await;
        let mut scored = Vec::new();

        for (name, index) in indexes.iter() {
            if let Some(wanted) = db_type {
                if name != wanted {
                    continue;
                }
            }
            if index.entries.is_empty() {
                continue;
            }
            if index.dimension != query_vector.len() {
                return Err(GatewayError::EmbeddingDimensionMismatch {
                    query_dim: query_vector.len(),
                    index_dim: index.dimension,
                });
            }
            for (document, vector) in &index.entries {
                scored.push(ScoredDocument {
                    document: document.clone(),
                    score: cosine_similarity(&query_vector, vector),
                });
            }
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    /// Returns true if an index exists for the backend.
    pub async fn has_index(&self, db_type: &str) -> bool {
        self.indexes.read().await.contains_key(db_type)
    }
}

/// Cosine similarity of two equal-length vectors.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
