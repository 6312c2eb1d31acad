//! Dynamic tool registry.
//!
//! Catalogues callable operations with metadata and analytics. Adapter
//! discovery registers the four core methods per configured backend plus
//! backend-specific helpers; general utilities are registered alongside.
//! Failures are recorded and re-raised, never silently swallowed.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::db::{Adapter, BackendKind, Query, QueryOptions};
use crate::error::{GatewayError, Result};
use crate::llm::LlmService;
use crate::tools::general;
use crate::tools::metrics::{PerformanceMonitor, ToolStats};
use crate::tools::selector::{
    KeywordToolSelector, LlmToolSelector, SelectionContext, ToolSelector,
};
use crate::tools::{sync_handler, ToolCategory, ToolComplexity, ToolHandler, ToolMetadata};

/// Result envelope for one registry execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub result: Value,
    pub execution_id: String,
    pub duration_ms: u64,
    pub tool_name: String,
    pub timestamp: chrono::DateTime<Utc>,
}

struct RegisteredTool {
    metadata: ToolMetadata,
    handler: ToolHandler,
}

/// Catalogue of callable operations with performance tracking.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    monitor: Arc<PerformanceMonitor>,
    llm: Option<LlmService>,
}

impl ToolRegistry {
    /// Creates an empty registry. Pass the LLM service to enable
    /// model-driven tool selection.
    pub fn new(llm: Option<LlmService>) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            monitor: Arc::new(PerformanceMonitor::new()),
            llm,
        }
    }

    /// The shared performance monitor.
    pub fn monitor(&self) -> Arc<PerformanceMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Registers a tool. Registering an existing name overwrites the
    /// previous entry with a warning.
    pub async fn register_tool(&self, handler: ToolHandler, metadata: ToolMetadata) {
        let name = metadata.name.clone();
        let mut tools = self.tools.write().await;
        if tools.contains_key(&name) {
            warn!("tool '{}' re-registered, overwriting previous entry", name);
        }
        tools.insert(name, RegisteredTool { metadata, handler });
    }

    /// Number of registered tools.
    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }

    /// Metadata for every registered tool, sorted by name.
    pub async fn list_metadata(&self) -> Vec<ToolMetadata> {
        let tools = self.tools.read().await;
        let mut list: Vec<_> = tools.values().map(|tool| tool.metadata.clone()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Metadata for one tool.
    pub async fn get_metadata(&self, name: &str) -> Option<ToolMetadata> {
        self.tools
            .read()
            .await
            .get(name)
            .map(|tool| tool.metadata.clone())
    }

    /// Executes a tool by name.
    ///
    /// Each call gets a fresh execution id; duration is measured around
    /// the handler call only. On failure the metrics record the error and
    /// the call surfaces `ToolExecutionFailed`.
    pub async fn execute_tool(
        &self,
        name: &str,
        parameters: Value,
        _context: Option<Value>,
    ) -> Result<ExecutionOutcome> {
        let handler = {
            let tools = self.tools.read().await;
            let tool = tools.get(name).ok_or_else(|| {
                GatewayError::tool(name, "tool is not registered")
            })?;
            Arc::clone(&tool.handler)
        };

        let execution_id = uuid::Uuid::new_v4().to_string();
        debug!("executing tool '{}' ({})", name, execution_id);

        let start = Instant::now();
        let outcome = handler(parameters).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                // Result size metric is best-effort and guarded.
                let result_size = serde_json::to_vec(&result).ok().map(|b| b.len() as u64);
                self.monitor
                    .record(name, duration_ms, true, None, result_size);
                Ok(ExecutionOutcome {
                    success: true,
                    result,
                    execution_id,
                    duration_ms,
                    tool_name: name.to_string(),
                    timestamp: Utc::now(),
                })
            }
            Err(e) => {
                self.monitor
                    .record(name, duration_ms, false, Some(e.to_string()), None);
                Err(GatewayError::tool(name, e.to_string()))
            }
        }
    }

    /// Selects up to five tools for the given outcome.
    ///
    /// Uses the LLM when configured and functional, otherwise the
    /// keyword heuristic. LLM failures downgrade with a warning.
    pub async fn select_optimal_tools(
        &self,
        context: &str,
        available_data: Vec<String>,
        target_outcome: &str,
        db_types: Option<Vec<String>>,
    ) -> Vec<String> {
        let ctx = SelectionContext {
            context: context.to_string(),
            available_data,
            target_outcome: target_outcome.to_string(),
            db_types,
        };
        let tools = self.list_metadata().await;
        let stats = self.monitor.all_stats();

        if let Some(llm) = &self.llm {
            let selector = LlmToolSelector::new(llm.clone());
            match selector.select(&ctx, &tools, &stats).await {
                Ok(selected) => return selected,
                Err(e) => {
                    warn!("LLM tool selection unavailable ({}), using heuristic", e);
                }
            }
        }

        KeywordToolSelector::new()
            .select(&ctx, &tools, &stats)
            .await
            .unwrap_or_default()
    }

    /// Aggregate or per-tool analytics.
    pub async fn get_tool_analytics(&self, name: Option<&str>) -> Value {
        match name {
            Some(name) => {
                let stats = self.monitor.tool_stats(name);
                json!({
                    "tool": name,
                    "stats": stats,
                })
            }
            None => {
                let all = self.monitor.all_stats();
                let total: u64 = all.values().map(|s| s.total_executions).sum();
                let failed: u64 = all.values().map(|s| s.failed).sum();
                json!({
                    "tools": all,
                    "overall": {
                        "total_executions": total,
                        "failed": failed,
                        "error_rate": if total > 0 { failed as f64 / total as f64 } else { 0.0 },
                    }
                })
            }
        }
    }

    /// Registers the four core operations for a backend adapter, plus
    /// its specialized helpers.
    pub async fn register_adapter_tools(&self, adapter: Arc<dyn Adapter>) {
        let db = adapter.db_type();
        let tag = db.as_str();

        // <db>.llm_to_query
        {
            let adapter = Arc::clone(&adapter);
            let handler: ToolHandler = Arc::new(move |params| {
                let adapter = Arc::clone(&adapter);
                Box::pin(async move {
                    let question = params
                        .get("question")
                        .and_then(|q| q.as_str())
                        .ok_or_else(|| GatewayError::internal("missing 'question' parameter"))?;
                    let query = adapter
                        .llm_to_query(question, &QueryOptions::default())
                        .await?;
                    serde_json::to_value(&query)
                        .map_err(|e| GatewayError::internal(format!("query serialization: {e}")))
                })
            });
            self.register_tool(
                handler,
                ToolMetadata::new(
                    format!("{tag}.llm_to_query"),
                    format!("Translate a natural-language question into a {tag} query"),
                    ToolCategory::DatabaseQuery,
                )
                .with_compatibility(&[tag])
                .requires_llm(),
            )
            .await;
        }

        // <db>.execute_query
        {
            let adapter = Arc::clone(&adapter);
            let handler: ToolHandler = Arc::new(move |params| {
                let adapter = Arc::clone(&adapter);
                Box::pin(async move {
                    let raw = params
                        .get("query")
                        .cloned()
                        .ok_or_else(|| GatewayError::internal("missing 'query' parameter"))?;
                    let query = query_from_param(adapter.db_type(), &raw)?;
                    let rows = adapter.execute(&query).await?;
                    let row_count = rows.len();
                    Ok(json!({ "rows": rows, "row_count": row_count }))
                })
            });
            self.register_tool(
                handler,
                ToolMetadata::new(
                    format!("{tag}.execute_query"),
                    format!("Execute a query against the {tag} backend and return rows"),
                    ToolCategory::DatabaseQuery,
                )
                .with_compatibility(&[tag]),
            )
            .await;
        }

        // <db>.introspect_schema
        {
            let adapter = Arc::clone(&adapter);
            let handler: ToolHandler = Arc::new(move |_params| {
                let adapter = Arc::clone(&adapter);
                Box::pin(async move {
                    let documents = adapter.introspect_schema().await?;
                    serde_json::to_value(&documents)
                        .map_err(|e| GatewayError::internal(format!("schema serialization: {e}")))
                })
            });
            self.register_tool(
                handler,
                ToolMetadata::new(
                    format!("{tag}.introspect_schema"),
                    format!("Introspect the {tag} schema into canonical documents"),
                    ToolCategory::SchemaIntrospection,
                )
                .with_compatibility(&[tag]),
            )
            .await;
        }

        // <db>.test_connection
        {
            let adapter = Arc::clone(&adapter);
            let handler: ToolHandler = Arc::new(move |_params| {
                let adapter = Arc::clone(&adapter);
                Box::pin(async move {
                    let connected = adapter.test_connection().await;
                    Ok(json!({ "connected": connected }))
                })
            });
            self.register_tool(
                handler,
                ToolMetadata::new(
                    format!("{tag}.test_connection"),
                    format!("Probe connectivity to the {tag} backend"),
                    ToolCategory::Utility,
                )
                .with_complexity(ToolComplexity::Simple)
                .with_compatibility(&[tag]),
            )
            .await;
        }

        self.register_specialized_tools(db, adapter).await;
    }

    /// Backend-specific helper tools.
    async fn register_specialized_tools(&self, db: BackendKind, adapter: Arc<dyn Adapter>) {
        match db {
            BackendKind::MongoDb => {
                let handler = sync_handler(|params| {
                    let pipeline = params
                        .get("pipeline")
                        .and_then(|p| p.as_array())
                        .ok_or_else(|| GatewayError::internal("missing 'pipeline' array"))?;
                    let mut issues = Vec::new();
                    for (i, stage) in pipeline.iter().enumerate() {
                        match stage.as_object() {
                            Some(map) if map.len() == 1 => {
                                let op = map.keys().next().expect("len checked");
                                if !op.starts_with('$') {
                                    issues.push(format!("stage {i}: operator '{op}' missing '$'"));
                                }
                            }
                            Some(_) => issues.push(format!("stage {i}: must have exactly one operator")),
                            None => issues.push(format!("stage {i}: not an object")),
                        }
                    }
                    Ok(json!({ "valid": issues.is_empty(), "issues": issues }))
                });
                self.register_tool(
                    handler,
                    ToolMetadata::new(
                        "mongodb.validate_pipeline",
                        "Validate the shape of an aggregation pipeline without executing it",
                        ToolCategory::DatabaseAnalysis,
                    )
                    .with_complexity(ToolComplexity::Simple)
                    .with_compatibility(&["mongodb"]),
                )
                .await;
            }
            BackendKind::Shopify => {
                let adapter = Arc::clone(&adapter);
                let handler: ToolHandler = Arc::new(move |params| {
                    let adapter = Arc::clone(&adapter);
                    Box::pin(async move {
                        let limit = params.get("limit").and_then(|l| l.as_u64()).unwrap_or(50);
                        let mut query_params = serde_json::Map::new();
                        query_params.insert("limit".to_string(), json!(limit));
                        query_params.insert("status".to_string(), json!("any"));
                        let rows = adapter
                            .execute(&Query::ShopifyApi {
                                endpoint: "orders".to_string(),
                                method: crate::db::HttpMethod::Get,
                                params: query_params,
                            })
                            .await?;

                        let total: f64 = rows
                            .iter()
                            .filter_map(|row| {
                                row.get("total_price")
                                    .and_then(|p| p.as_str())
                                    .and_then(|p| p.parse::<f64>().ok())
                            })
                            .sum();
                        Ok(json!({
                            "order_count": rows.len(),
                            "total_revenue": total,
                        }))
                    })
                });
                self.register_tool(
                    handler,
                    ToolMetadata::new(
                        "shopify.order_statistics",
                        "Summarize recent Shopify orders: count and total revenue",
                        ToolCategory::DatabaseAnalysis,
                    )
                    .with_compatibility(&["shopify"]),
                )
                .await;
            }
            BackendKind::Ga4 => {
                let adapter = Arc::clone(&adapter);
                let handler: ToolHandler = Arc::new(move |params| {
                    let adapter = Arc::clone(&adapter);
                    Box::pin(async move {
                        let days = params.get("days").and_then(|d| d.as_u64()).unwrap_or(7);
                        let today = Utc::now().date_naive();
                        let report = crate::db::Ga4Report {
                            dimensions: vec!["country".to_string()],
                            metrics: vec!["activeUsers".to_string(), "sessions".to_string()],
                            date_ranges: vec![crate::db::DateRange {
                                start: (today - chrono::Duration::days(days as i64))
                                    .format("%Y-%m-%d")
                                    .to_string(),
                                end: today.format("%Y-%m-%d").to_string(),
                            }],
                            order_bys: vec![crate::db::OrderBy {
                                dimension: None,
                                metric: Some("activeUsers".to_string()),
                                desc: true,
                            }],
                            limit: Some(20),
                        };
                        let rows = adapter.execute(&Query::Ga4Report(report)).await?;
                        let row_count = rows.len();
                        Ok(json!({ "rows": rows, "row_count": row_count }))
                    })
                });
                self.register_tool(
                    handler,
                    ToolMetadata::new(
                        "ga4.audience_performance",
                        "Report active users and sessions by country over recent days",
                        ToolCategory::DatabaseAnalysis,
                    )
                    .with_compatibility(&["ga4"]),
                )
                .await;
            }
            _ => {}
        }
    }

    /// Registers the general utility tools.
    pub async fn register_general_tools(&self) {
        self.register_tool(
            sync_handler(general::export_data_to_csv),
            ToolMetadata::new(
                "file_system.export_data_to_csv",
                "Export rows of data to a CSV file on disk",
                ToolCategory::DataTransformation,
            )
            .with_complexity(ToolComplexity::Simple),
        )
        .await;

        self.register_tool(
            sync_handler(general::summarize_rows),
            ToolMetadata::new(
                "data.summarize_rows",
                "Summarize rows: count, columns, numeric ranges",
                ToolCategory::DataTransformation,
            )
            .with_complexity(ToolComplexity::Simple),
        )
        .await;
    }
}

/// Interprets the `query` parameter for a backend's execute tool.
///
/// Accepts the serialized `Query` form (tagged), or the idiomatic
/// shorthand for the backend: a raw SQL string, a bare
/// `{collection, pipeline}` object, or a Shopify input (including the
/// documented SQL-ish subset).
fn query_from_param(db: BackendKind, raw: &Value) -> Result<Query> {
    if raw.get("type").is_some() {
        if let Ok(query) = serde_json::from_value::<Query>(raw.clone()) {
            return Ok(query);
        }
    }

    match db {
        BackendKind::Postgres => raw
            .as_str()
            .map(|text| Query::Sql {
                text: text.to_string(),
            })
            .ok_or_else(|| {
                GatewayError::query_invalid("postgres query must be a SQL string", raw.to_string())
            }),
        BackendKind::MongoDb => {
            let collection = raw
                .get("collection")
                .and_then(|c| c.as_str())
                .unwrap_or("sample_orders")
                .to_string();
            let pipeline = raw
                .get("pipeline")
                .and_then(|p| p.as_array())
                .cloned()
                .ok_or_else(|| {
                    GatewayError::query_invalid("mongodb query needs a 'pipeline'", raw.to_string())
                })?;
            Ok(Query::MongoPipeline {
                collection,
                pipeline,
            })
        }
        BackendKind::Shopify => crate::db::ShopifyAdapter::normalize_input(raw),
        BackendKind::Slack => {
            let tool_id = raw
                .get("tool_id")
                .or_else(|| raw.get("tool"))
                .and_then(|t| t.as_str())
                .ok_or_else(|| {
                    GatewayError::query_invalid("slack query needs a 'tool_id'", raw.to_string())
                })?
                .to_string();
            Ok(Query::SlackTool {
                tool_id,
                parameters: raw.get("parameters").cloned().unwrap_or(json!({})),
            })
        }
        BackendKind::Ga4 => {
            let report = crate::db::ga4::parse_report_json(raw, Utc::now().date_naive())?;
            Ok(Query::Ga4Report(report))
        }
        BackendKind::Qdrant => serde_json::from_value(raw.clone()).map_err(|e| {
            GatewayError::query_invalid(format!("bad vector query: {e}"), raw.to_string())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn echo_tool(name: &str) -> (ToolHandler, ToolMetadata) {
        (
            sync_handler(|params| Ok(json!({"echo": params}))),
            ToolMetadata::new(name, "echoes its parameters", ToolCategory::Utility),
        )
    }

    #[tokio::test]
    async fn test_register_and_execute() {
        let registry = ToolRegistry::new(None);
        let (handler, metadata) = echo_tool("test.echo");
        registry.register_tool(handler, metadata).await;

        let outcome = registry
            .execute_tool("test.echo", json!({"x": 1}), None)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result["echo"]["x"], json!(1));
        assert_eq!(outcome.tool_name, "test.echo");
    }

    #[tokio::test]
    async fn test_execution_ids_are_fresh() {
        let registry = ToolRegistry::new(None);
        let (handler, metadata) = echo_tool("test.echo");
        registry.register_tool(handler, metadata).await;

        let a = registry.execute_tool("test.echo", json!({}), None).await.unwrap();
        let b = registry.execute_tool("test.echo", json!({}), None).await.unwrap();
        assert_ne!(a.execution_id, b.execution_id);
    }

    #[tokio::test]
    async fn test_reregistration_overwrites() {
        let registry = ToolRegistry::new(None);
        let (handler, metadata) = echo_tool("test.echo");
        registry.register_tool(handler, metadata).await;

        let replacement = sync_handler(|_| Ok(json!("replaced")));
        let metadata = ToolMetadata::new("test.echo", "second registration", ToolCategory::Utility);
        registry.register_tool(replacement, metadata).await;

        assert_eq!(registry.len().await, 1);
        let outcome = registry.execute_tool("test.echo", json!({}), None).await.unwrap();
        assert_eq!(outcome.result, json!("replaced"));
        let meta = registry.get_metadata("test.echo").await.unwrap();
        assert_eq!(meta.description, "second registration");
    }

    #[tokio::test]
    async fn test_failure_recorded_and_raised() {
        let registry = ToolRegistry::new(None);
        let failing = sync_handler(|_| Err(GatewayError::internal("deliberate failure")));
        registry
            .register_tool(
                failing,
                ToolMetadata::new("test.fail", "always fails", ToolCategory::Utility),
            )
            .await;

        let err = registry.execute_tool("test.fail", json!({}), None).await.unwrap_err();
        assert_eq!(err.kind(), "ToolExecutionFailed");

        let stats = registry.monitor().tool_stats("test.fail");
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.error_rate, 1.0);
    }

    #[tokio::test]
    async fn test_unknown_tool_fails() {
        let registry = ToolRegistry::new(None);
        let err = registry.execute_tool("missing", json!({}), None).await.unwrap_err();
        assert_eq!(err.kind(), "ToolExecutionFailed");
    }

    #[tokio::test]
    async fn test_analytics_invariant() {
        let registry = ToolRegistry::new(None);
        let (handler, metadata) = echo_tool("test.echo");
        registry.register_tool(handler, metadata).await;
        registry.execute_tool("test.echo", json!({}), None).await.unwrap();
        registry.execute_tool("test.echo", json!({}), None).await.unwrap();

        let analytics = registry.get_tool_analytics(Some("test.echo")).await;
        let stats = &analytics["stats"];
        assert_eq!(
            stats["total_executions"].as_u64().unwrap(),
            stats["successful"].as_u64().unwrap() + stats["failed"].as_u64().unwrap()
        );
    }

    #[tokio::test]
    async fn test_general_tools_registered() {
        let registry = ToolRegistry::new(None);
        registry.register_general_tools().await;
        assert!(registry
            .get_metadata("file_system.export_data_to_csv")
            .await
            .is_some());
        assert!(registry.get_metadata("data.summarize_rows").await.is_some());
    }

    #[tokio::test]
    async fn test_heuristic_selection_without_llm() {
        let registry = ToolRegistry::new(None);
        registry.register_general_tools().await;
        let selected = registry
            .select_optimal_tools("export data", Vec::new(), "export rows to csv file", None)
            .await;
        assert!(!selected.is_empty());
        assert!(selected.len() <= 5);
        assert_eq!(selected[0], "file_system.export_data_to_csv");
    }

    #[test]
    fn test_query_from_param_sql_string() {
        let query = query_from_param(BackendKind::Postgres, &json!("SELECT 1")).unwrap();
        match query {
            Query::Sql { text } => assert_eq!(text, "SELECT 1"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_query_from_param_mongo_shorthand() {
        let query = query_from_param(
            BackendKind::MongoDb,
            &json!({"collection": "orders", "pipeline": [{"$count": "n"}]}),
        )
        .unwrap();
        match query {
            Query::MongoPipeline { collection, .. } => assert_eq!(collection, "orders"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_query_from_param_tagged_form() {
        let tagged = serde_json::to_value(Query::Sql {
            text: "SELECT 2".to_string(),
        })
        .unwrap();
        let query = query_from_param(BackendKind::Postgres, &tagged).unwrap();
        match query {
            Query::Sql { text } => assert_eq!(text, "SELECT 2"),
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn test_mongo_pipeline_validator() {
        let registry = ToolRegistry::new(None);
        // The validator is shape-only, so a mock-free registration works.
        let handler = sync_handler(|params| {
            let pipeline = params.get("pipeline").and_then(|p| p.as_array()).unwrap().clone();
            let bad = pipeline.iter().any(|s| {
                s.as_object()
                    .map(|m| m.keys().any(|k| !k.starts_with('$')))
                    .unwrap_or(true)
            });
            Ok(json!({"valid": !bad}))
        });
        registry
            .register_tool(
                handler,
                ToolMetadata::new("mongodb.validate_pipeline", "validate", ToolCategory::DatabaseAnalysis),
            )
            .await;

        let good = registry
            .execute_tool(
                "mongodb.validate_pipeline",
                json!({"pipeline": [{"$match": {}}]}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(good.result["valid"], json!(true));
    }
}
