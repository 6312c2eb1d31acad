//! Backend orchestrator.
//!
//! Routes natural-language queries to the appropriate adapter based on
//! the connection URI scheme and provides a unified interface for all
//! backend operations. Passwords are redacted from every log line.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::config::{redact_uri, Config};
use crate::db::{
    ga4::Ga4Adapter, mongo::MongoAdapter, postgres::PostgresAdapter, qdrant::QdrantAdapter,
    shopify::ShopifyAdapter, slack::SlackAdapter, Adapter, BackendKind, Query, QueryOptions,
    resolve_backend, Row,
};
use crate::error::{GatewayError, Result};
use crate::llm::LlmService;
use crate::schema::{SchemaDocument, SchemaSource};

/// Connection options threaded into adapter construction.
#[derive(Clone, Default)]
pub struct ConnectOptions {
    /// Explicit backend tag, required for HTTP-family URIs.
    pub db_type: Option<String>,
    /// Qdrant: default collection.
    pub collection: Option<String>,
    /// Qdrant: API key.
    pub api_key: Option<String>,
    /// Shopify: API version.
    pub api_version: Option<String>,
    /// GA4: service-account key file.
    pub key_file: Option<std::path::PathBuf>,
    /// Slack: read path into the indexed message store.
    pub message_search: Option<Arc<dyn crate::db::slack::MessageSearch>>,
    /// Shopify: decrypted access token for API calls.
    pub shopify_access_token: Option<String>,
    /// Shopify: scopes the shop granted.
    pub shopify_granted_scopes: Vec<String>,
}

impl ConnectOptions {
    /// Builds options from the relevant config sections.
    pub fn from_config(config: &Config) -> Self {
        Self {
            db_type: None,
            collection: config
                .qdrant
                .as_ref()
                .and_then(|q| q.collection.clone()),
            api_key: config.qdrant.as_ref().and_then(|q| q.api_key.clone()),
            api_version: config.shopify.as_ref().map(|s| s.api_version.clone()),
            key_file: config.ga4.as_ref().and_then(|g| g.key_file.clone()),
            message_search: None,
            shopify_access_token: None,
            shopify_granted_scopes: Vec::new(),
        }
    }
}

/// Unified interface over one backend, selected by URI.
pub struct Orchestrator {
    adapter: Arc<dyn Adapter>,
    db_type: BackendKind,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("db_type", &self.db_type)
            .finish()
    }
}

impl Orchestrator {
    /// Parses the URI, instantiates the matching adapter, and wraps it.
    pub async fn connect(uri: &str, opts: ConnectOptions, llm: LlmService) -> Result<Self> {
        let db_type = resolve_backend(uri, opts.db_type.as_deref())?;
        info!(
            "Initializing orchestrator for {} with URI: {}",
            db_type,
            redact_uri(uri)
        );

        let adapter: Arc<dyn Adapter> = match db_type {
            BackendKind::Postgres => Arc::new(PostgresAdapter::connect(uri, llm).await?),
            BackendKind::MongoDb => Arc::new(MongoAdapter::connect(uri, llm).await?),
            BackendKind::Qdrant => {
                Arc::new(QdrantAdapter::new(uri, opts.collection, opts.api_key, llm)?)
            }
            BackendKind::Slack => {
                let mut adapter = SlackAdapter::new(uri, llm)?;
                if let Some(search) = opts.message_search {
                    adapter = adapter.with_message_search(search);
                }
                Arc::new(adapter)
            }
            BackendKind::Shopify => {
                let mut adapter = ShopifyAdapter::new(
                    uri,
                    opts.api_version.unwrap_or_else(|| "2024-01".to_string()),
                    llm,
                )?;
                if let Some(token) = opts.shopify_access_token {
                    adapter = adapter.with_access_token(token);
                }
                if !opts.shopify_granted_scopes.is_empty() {
                    adapter = adapter.with_granted_scopes(opts.shopify_granted_scopes);
                }
                Arc::new(adapter)
            }
            BackendKind::Ga4 => {
                let key_file = opts.key_file.ok_or_else(|| {
                    GatewayError::config("ga4 backend requires a key_file option")
                })?;
                Arc::new(Ga4Adapter::new(uri, &key_file, llm)?)
            }
        };

        Ok(Self { adapter, db_type })
    }

    /// Wraps an already-constructed adapter. Primarily for testing.
    pub fn from_adapter(adapter: Arc<dyn Adapter>) -> Self {
        let db_type = adapter.db_type();
        Self { adapter, db_type }
    }

    /// The backend this orchestrator routes to.
    pub fn db_type(&self) -> BackendKind {
        self.db_type
    }

    /// The underlying adapter.
    pub fn adapter(&self) -> Arc<dyn Adapter> {
        Arc::clone(&self.adapter)
    }

    /// Translates natural language into a backend-native query.
    pub async fn llm_to_query(&self, nl_prompt: &str, opts: &QueryOptions) -> Result<Query> {
        info!(
            "Translating question for {} ({})",
            self.db_type,
            redact_uri(self.adapter.connection_uri())
        );
        self.adapter.llm_to_query(nl_prompt, opts).await
    }

    /// Executes a backend-native query.
    pub async fn execute(&self, query: &Query) -> Result<Vec<Row>> {
        info!(
            "Executing query on {} ({})",
            self.db_type,
            redact_uri(self.adapter.connection_uri())
        );
        self.adapter.execute(query).await
    }

    /// Complete pipeline: translate then execute.
    pub async fn run(&self, nl_prompt: &str, opts: &QueryOptions) -> Result<(Query, Vec<Row>)> {
        let query = self.llm_to_query(nl_prompt, opts).await?;
        let rows = self.execute(&query).await?;
        Ok((query, rows))
    }

    /// Introspects the backend schema.
    pub async fn introspect_schema(&self) -> Result<Vec<SchemaDocument>> {
        self.adapter.introspect_schema().await
    }

    /// Probes the backend. Never raises.
    pub async fn test_connection(&self) -> bool {
        self.adapter.test_connection().await
    }
}

#[async_trait]
impl SchemaSource for Orchestrator {
    async fn fetch_schema(&self) -> Result<Vec<SchemaDocument>> {
        self.introspect_schema().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmService, MockLlmClient};

    fn llm() -> LlmService {
        LlmService::new(Arc::new(MockLlmClient::new()))
    }

    #[tokio::test]
    async fn test_connect_http_without_db_type_fails() {
        let err = Orchestrator::connect(
            "http://gateway.internal:8500",
            ConnectOptions::default(),
            llm(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "AdapterSelectionAmbiguous");
    }

    #[tokio::test]
    async fn test_connect_slack_via_db_type() {
        let orchestrator = Orchestrator::connect(
            "http://gateway.internal:8500",
            ConnectOptions {
                db_type: Some("slack".to_string()),
                ..Default::default()
            },
            llm(),
        )
        .await
        .unwrap();
        assert_eq!(orchestrator.db_type(), BackendKind::Slack);
    }

    #[tokio::test]
    async fn test_connect_qdrant() {
        let orchestrator = Orchestrator::connect(
            "qdrant://localhost:6333",
            ConnectOptions::default(),
            llm(),
        )
        .await
        .unwrap();
        assert_eq!(orchestrator.db_type(), BackendKind::Qdrant);
    }

    #[tokio::test]
    async fn test_scheme_roundtrip_through_adapter_uri() {
        // R1: parsing the adapter's own connection URI recovers the
        // scheme that selected it.
        let orchestrator = Orchestrator::connect(
            "qdrant://localhost:6333",
            ConnectOptions::default(),
            llm(),
        )
        .await
        .unwrap();
        let uri = orchestrator.adapter().connection_uri().to_string();
        let kind = resolve_backend(&uri, None).unwrap();
        assert_eq!(kind, orchestrator.db_type());
    }

    #[tokio::test]
    async fn test_ga4_requires_key_file() {
        let err = Orchestrator::connect("ga4://123456", ConnectOptions::default(), llm())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ConfigInvalid");
    }

    #[tokio::test]
    async fn test_db_type_synonym_normalization() {
        let orchestrator = Orchestrator::connect(
            "http://pg-proxy.internal:5432",
            ConnectOptions {
                db_type: Some("qdrant".to_string()),
                ..Default::default()
            },
            llm(),
        )
        .await
        .unwrap();
        assert_eq!(orchestrator.db_type(), BackendKind::Qdrant);
    }
}
