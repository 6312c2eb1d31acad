//! Backend abstraction layer.
//!
//! Provides a trait-based interface over seven heterogeneous backends.
//! Scheme resolution is a pure function from connection URI to backend
//! kind; each adapter owns its connection pool and its own translation,
//! execution, and introspection logic.

pub mod ga4;
pub mod mongo;
pub mod orchestrator;
pub mod postgres;
pub mod qdrant;
pub mod shopify;
pub mod slack;

pub use ga4::{DateRange, Ga4Adapter, Ga4Report, OrderBy};
pub use orchestrator::{ConnectOptions, Orchestrator};
pub use qdrant::{QdrantAdapter, QdrantRest};
pub use shopify::{ShopifyAdapter, WebhookEvent};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::schema::SchemaDocument;

/// A single result row: column/field name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Postgres,
    MongoDb,
    Qdrant,
    Slack,
    Shopify,
    Ga4,
}

impl BackendKind {
    /// Returns the backend tag used in schema documents, tool ids, and
    /// config sections.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MongoDb => "mongodb",
            Self::Qdrant => "qdrant",
            Self::Slack => "slack",
            Self::Shopify => "shopify",
            Self::Ga4 => "ga4",
        }
    }

    /// Parses a backend tag, accepting the documented synonyms.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "mongo" | "mongodb" => Some(Self::MongoDb),
            "qdrant" => Some(Self::Qdrant),
            "slack" => Some(Self::Slack),
            "shopify" => Some(Self::Shopify),
            "ga4" => Some(Self::Ga4),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resolves the backend kind for a connection URI.
///
/// Pure function: an explicit `db_type` (normalized, synonyms accepted)
/// always wins; otherwise the URI scheme decides. HTTP-family URIs
/// require an explicit `db_type` unless the host is a recognizable
/// Shopify app domain.
pub fn resolve_backend(uri: &str, explicit_db_type: Option<&str>) -> Result<BackendKind> {
    if let Some(explicit) = explicit_db_type {
        return BackendKind::parse(explicit).ok_or_else(|| {
            GatewayError::config(format!("unsupported database type: {explicit}"))
        });
    }

    let parsed = url::Url::parse(uri)
        .map_err(|e| GatewayError::config(format!("invalid connection URI: {e}")))?;

    match parsed.scheme() {
        "postgres" | "postgresql" => Ok(BackendKind::Postgres),
        "mongodb" | "mongodb+srv" => Ok(BackendKind::MongoDb),
        "qdrant" => Ok(BackendKind::Qdrant),
        "ga4" => Ok(BackendKind::Ga4),
        "http" | "https" => {
            let host = parsed.host_str().unwrap_or_default();
            if host.ends_with(".myshopify.com") {
                Ok(BackendKind::Shopify)
            } else {
                Err(GatewayError::AdapterSelectionAmbiguous(format!(
                    "http(s) URI '{}' requires an explicit db_type",
                    crate::config::redact_uri(uri)
                )))
            }
        }
        other => Err(GatewayError::config(format!(
            "unsupported URI scheme: {other}"
        ))),
    }
}

/// HTTP method for API-shaped queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// Backend-native query, one variant per backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Query {
    Sql {
        text: String,
    },
    MongoPipeline {
        collection: String,
        pipeline: Vec<serde_json::Value>,
    },
    VectorSearch {
        vector: Vec<f32>,
        top_k: usize,
        collection: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<serde_json::Value>,
    },
    ShopifyApi {
        endpoint: String,
        method: HttpMethod,
        params: serde_json::Map<String, serde_json::Value>,
    },
    Ga4Report(Ga4Report),
    SlackTool {
        tool_id: String,
        parameters: serde_json::Value,
    },
}

impl Query {
    /// Returns a compact display form for logging and error reporting.
    pub fn display(&self) -> String {
        match self {
            Self::Sql { text } => text.clone(),
            other => serde_json::to_string(other).unwrap_or_else(|_| "<query>".to_string()),
        }
    }
}

/// Optional parameters threaded into query translation.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Pre-retrieved schema context to include in the prompt.
    pub schema_chunks: Option<String>,
    /// Default collection for document/vector backends.
    pub collection: Option<String>,
    /// Result ceiling for vector search.
    pub top_k: Option<usize>,
}

/// Trait defining the uniform interface over every backend.
///
/// All operations are async and return Results with GatewayError, except
/// `test_connection`, which never raises.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Backend tag for this adapter.
    fn db_type(&self) -> BackendKind;

    /// The connection URI this adapter was constructed with.
    fn connection_uri(&self) -> &str;

    /// Translates a natural-language prompt into a backend-native query.
    async fn llm_to_query(&self, nl_prompt: &str, opts: &QueryOptions) -> Result<Query>;

    /// Executes a backend-native query, returning an ordered sequence of
    /// row maps.
    async fn execute(&self, query: &Query) -> Result<Vec<Row>>;

    /// Introspects the backend schema into canonical documents.
    async fn introspect_schema(&self) -> Result<Vec<SchemaDocument>>;

    /// Probes the connection. Returns false on any error; never raises.
    async fn test_connection(&self) -> bool;
}

/// Rejects a query variant that does not belong to the adapter.
pub(crate) fn wrong_variant(expected: BackendKind, query: &Query) -> GatewayError {
    GatewayError::query_invalid(
        format!("query variant does not match {expected} adapter"),
        query.display(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse_synonyms() {
        assert_eq!(BackendKind::parse("postgres"), Some(BackendKind::Postgres));
        assert_eq!(
            BackendKind::parse("PostgreSQL"),
            Some(BackendKind::Postgres)
        );
        assert_eq!(BackendKind::parse("mongo"), Some(BackendKind::MongoDb));
        assert_eq!(BackendKind::parse("mongodb"), Some(BackendKind::MongoDb));
        assert_eq!(BackendKind::parse("nope"), None);
    }

    #[test]
    fn test_resolve_backend_from_scheme() {
        assert_eq!(
            resolve_backend("postgresql://u:p@h:5432/db", None).unwrap(),
            BackendKind::Postgres
        );
        assert_eq!(
            resolve_backend("mongodb://h:27017/db", None).unwrap(),
            BackendKind::MongoDb
        );
        assert_eq!(
            resolve_backend("qdrant://h:6333", None).unwrap(),
            BackendKind::Qdrant
        );
        assert_eq!(
            resolve_backend("ga4://123456789", None).unwrap(),
            BackendKind::Ga4
        );
    }

    #[test]
    fn test_resolve_backend_shopify_domain() {
        assert_eq!(
            resolve_backend("https://acme.myshopify.com", None).unwrap(),
            BackendKind::Shopify
        );
    }

    #[test]
    fn test_http_without_db_type_is_ambiguous() {
        let err = resolve_backend("http://gateway.internal:8500", None).unwrap_err();
        assert_eq!(err.kind(), "AdapterSelectionAmbiguous");
    }

    #[test]
    fn test_explicit_db_type_wins() {
        assert_eq!(
            resolve_backend("http://gateway.internal:8500", Some("slack")).unwrap(),
            BackendKind::Slack
        );
        assert_eq!(
            resolve_backend("https://whatever", Some("postgres")).unwrap(),
            BackendKind::Postgres
        );
    }

    #[test]
    fn test_unknown_explicit_db_type_fails() {
        let err = resolve_backend("http://x", Some("oracle")).unwrap_err();
        assert_eq!(err.kind(), "ConfigInvalid");
    }

    #[test]
    fn test_unknown_scheme_fails() {
        let err = resolve_backend("redis://h:6379", None).unwrap_err();
        assert_eq!(err.kind(), "ConfigInvalid");
    }

    #[test]
    fn test_query_display_sql_is_plain() {
        let query = Query::Sql {
            text: "SELECT 1".to_string(),
        };
        assert_eq!(query.display(), "SELECT 1");
    }

    #[test]
    fn test_query_serde_roundtrip() {
        let query = Query::MongoPipeline {
            collection: "orders".to_string(),
            pipeline: vec![serde_json::json!({"$limit": 5})],
        };
        let text = serde_json::to_string(&query).unwrap();
        let back: Query = serde_json::from_str(&text).unwrap();
        match back {
            Query::MongoPipeline { collection, .. } => assert_eq!(collection, "orders"),
            _ => panic!("wrong variant"),
        }
    }
}
