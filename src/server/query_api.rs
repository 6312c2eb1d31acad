//! Operator-facing query endpoint.
//!
//! Accepts a question plus an optional backend, translates and executes
//! it through the orchestrator, and optionally runs the multi-step
//! execution node or a result narrative. The per-query hard ceiling
//! comes from `server.max_query_timeout_secs`.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::db::{BackendKind, ConnectOptions, Orchestrator, QueryOptions};
use crate::error::GatewayError;
use crate::server::{ApiError, ApiResult, AppState};

/// Schema fragments retrieved per question.
const SCHEMA_TOP_K: usize = 5;

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    pub db_type: Option<String>,
    pub uri: Option<String>,
    #[serde(default)]
    pub orchestrate: bool,
    #[serde(default)]
    pub analyze: bool,
}

/// `POST /api/query`.
pub async fn query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.orchestrate {
        let outcome = state.node.execute(&request.question).await.map_err(ApiError)?;
        return Ok(Json(json!({
            "orchestrated": true,
            "success": outcome.success,
            "selected_tools": outcome.selected_tools,
            "plan": outcome.plan,
            "results": outcome.results,
            "analysis": outcome.synthesis,
            "errors": outcome.errors,
        })));
    }

    let db_type = request
        .db_type
        .clone()
        .or_else(|| state.config.default_database.clone())
        .ok_or_else(|| {
            ApiError(GatewayError::config(
                "no db_type given and no default_database configured",
            ))
        })?;
    let kind = BackendKind::parse(&db_type)
        .ok_or_else(|| ApiError(GatewayError::config(format!("unsupported database type: {db_type}"))))?;

    let orchestrator = resolve_orchestrator(&state, kind, request.uri.as_deref()).await?;

    // Top-k schema context feeds the translation prompt.
    let schema_chunks = match state
        .searcher
        .search(&request.question, SCHEMA_TOP_K, Some(kind.as_str()))
        .await
    {
        Ok(documents) => Some(
            documents
                .iter()
                .map(|d| d.document.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        Err(_) => None,
    };

    let opts = QueryOptions {
        schema_chunks,
        ..Default::default()
    };

    let query = orchestrator
        .llm_to_query(&request.question, &opts)
        .await
        .map_err(ApiError)?;

    let ceiling = Duration::from_secs(state.config.server.max_query_timeout_secs);
    let rows = tokio::time::timeout(ceiling, orchestrator.execute(&query))
        .await
        .map_err(|_| {
            ApiError(GatewayError::timeout(format!(
                "query exceeded the {}s ceiling",
                ceiling.as_secs()
            )))
        })?
        .map_err(ApiError)?;

    let analysis = if request.analyze {
        let row_values: Vec<serde_json::Value> = rows
            .iter()
            .map(|row| serde_json::Value::Object(row.clone()))
            .collect();
        Some(
            state
                .llm
                .analyze_results(&request.question, &row_values)
                .await
                .map_err(ApiError)?,
        )
    } else {
        None
    };

    let row_count = rows.len();
    Ok(Json(json!({
        "db_type": kind.as_str(),
        "query": query,
        "rows": rows,
        "row_count": row_count,
        "analysis": analysis,
    })))
}

/// Returns the cached orchestrator for a backend, building it on first
/// use. An explicit `uri` always builds a fresh (uncached) one.
async fn resolve_orchestrator(
    state: &AppState,
    kind: BackendKind,
    uri_override: Option<&str>,
) -> Result<Arc<Orchestrator>, ApiError> {
    if let Some(uri) = uri_override {
        let mut opts = ConnectOptions::from_config(&state.config);
        opts.db_type = Some(kind.as_str().to_string());
        let orchestrator = Orchestrator::connect(uri, opts, state.llm.clone())
            .await
            .map_err(ApiError)?;
        return Ok(Arc::new(orchestrator));
    }

    {
        let cache = state.orchestrators.read().await;
        if let Some(orchestrator) = cache.get(kind.as_str()) {
            return Ok(Arc::clone(orchestrator));
        }
    }

    let uri = backend_uri(&state.config, kind).map_err(ApiError)?;
    let mut opts = ConnectOptions::from_config(&state.config);
    opts.db_type = Some(kind.as_str().to_string());
    let orchestrator = Arc::new(
        Orchestrator::connect(&uri, opts, state.llm.clone())
            .await
            .map_err(ApiError)?,
    );

    // Register as a schema source so the searcher can build indexes on
    // demand.
    state
        .searcher
        .register_source(kind.as_str(), Arc::clone(&orchestrator) as _)
        .await;

    let mut cache = state.orchestrators.write().await;
    cache.insert(kind.as_str().to_string(), Arc::clone(&orchestrator));
    Ok(orchestrator)
}

/// Composes the connection URI for a configured backend.
pub fn backend_uri(config: &Config, kind: BackendKind) -> crate::error::Result<String> {
    match kind {
        BackendKind::Postgres => config
            .postgres
            .as_ref()
            .ok_or_else(|| GatewayError::config("postgres section is not configured"))?
            .connection_uri("postgresql", 5432),
        BackendKind::MongoDb => config
            .mongodb
            .as_ref()
            .ok_or_else(|| GatewayError::config("mongodb section is not configured"))?
            .connection_uri("mongodb", 27017),
        BackendKind::Qdrant => {
            let section = config
                .qdrant
                .as_ref()
                .ok_or_else(|| GatewayError::config("qdrant section is not configured"))?;
            if let Some(uri) = &section.uri {
                Ok(uri.clone())
            } else {
                let host = section.host.as_deref().unwrap_or("localhost");
                Ok(format!("qdrant://{}:{}", host, section.port.unwrap_or(6333)))
            }
        }
        BackendKind::Slack => config
            .slack
            .as_ref()
            .and_then(|s| s.mcp_url.clone())
            .ok_or_else(|| GatewayError::config("slack.mcp_url is not configured")),
        BackendKind::Shopify => config
            .shopify
            .as_ref()
            .and_then(|s| s.app_url.clone())
            .ok_or_else(|| GatewayError::config("shopify.app_url is not configured")),
        BackendKind::Ga4 => {
            let property = config
                .ga4
                .as_ref()
                .and_then(|g| g.property_id.clone())
                .ok_or_else(|| GatewayError::config("ga4.property_id is not configured"))?;
            Ok(format!("ga4://{property}"))
        }
    }
}
