//! Tool registry and execution engine.
//!
//! A dynamic catalogue of callable operations (per-adapter cores plus
//! general utilities), LLM-driven selection with a heuristic fallback,
//! dependency-resolved multi-step execution, and synthesis of results.

pub mod aggregator;
pub mod executor;
pub mod general;
pub mod metrics;
pub mod plan;
pub mod registry;
pub mod selector;

pub use aggregator::{Event, EventKind, MemorySink, OutputSink};
pub use executor::{ExecutionNode, NodeOutcome};
pub use metrics::PerformanceMonitor;
pub use plan::{ExecutionPlan, ParamValue, PlanStep};
pub use registry::{ExecutionOutcome, ToolRegistry};
pub use selector::{KeywordToolSelector, LlmToolSelector, SelectionContext, ToolSelector};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;

/// Functional category of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    DatabaseQuery,
    DatabaseAnalysis,
    DataTransformation,
    SchemaIntrospection,
    PerformanceOptimization,
    CrossDatabase,
    Visualization,
    Utility,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DatabaseQuery => "database_query",
            Self::DatabaseAnalysis => "database_analysis",
            Self::DataTransformation => "data_transformation",
            Self::SchemaIntrospection => "schema_introspection",
            Self::PerformanceOptimization => "performance_optimization",
            Self::CrossDatabase => "cross_database",
            Self::Visualization => "visualization",
            Self::Utility => "utility",
        }
    }
}

/// Complexity tier, 1 (trivial) through 4 (advanced).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ToolComplexity {
    Simple = 1,
    Moderate = 2,
    Complex = 3,
    Advanced = 4,
}

/// Descriptive metadata for a registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    pub complexity: ToolComplexity,
    #[serde(default)]
    pub input_types: Vec<String>,
    #[serde(default)]
    pub output_types: Vec<String>,
    /// Backends this tool can run against; empty means any.
    #[serde(default)]
    pub database_compatibility: Vec<String>,
    pub estimated_duration_ms: u64,
    pub memory_estimate_mb: u64,
    #[serde(default)]
    pub requires_llm: bool,
    #[serde(default)]
    pub streaming_capable: bool,
    #[serde(default)]
    pub parallelizable: bool,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl ToolMetadata {
    /// Creates metadata with the common defaults.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: ToolCategory,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            category,
            complexity: ToolComplexity::Moderate,
            input_types: Vec::new(),
            output_types: Vec::new(),
            database_compatibility: Vec::new(),
            estimated_duration_ms: 2000,
            memory_estimate_mb: 64,
            requires_llm: false,
            streaming_capable: false,
            parallelizable: false,
            dependencies: Vec::new(),
        }
    }

    pub fn with_complexity(mut self, complexity: ToolComplexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_compatibility(mut self, backends: &[&str]) -> Self {
        self.database_compatibility = backends.iter().map(|b| b.to_string()).collect();
        self
    }

    pub fn requires_llm(mut self) -> Self {
        self.requires_llm = true;
        self
    }
}

/// A request to execute one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_id: String,
    pub parameters: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl ToolCall {
    /// Creates a call with a fresh id.
    pub fn new(tool_id: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            call_id: uuid::Uuid::new_v4().to_string(),
            tool_id: tool_id.into(),
            parameters,
            context: None,
        }
    }
}

/// Result of executing one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub tool_id: String,
    pub call_id: String,
    pub success: bool,
    pub result: serde_json::Value,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// The uniform awaitable tool contract.
///
/// Synchronous implementations are wrapped into a ready future at
/// registration time, so the registry awaits everything the same way.
pub type ToolHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// Wraps a synchronous function into the awaitable tool contract.
pub fn sync_handler<F>(f: F) -> ToolHandler
where
    F: Fn(serde_json::Value) -> Result<serde_json::Value> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |params| {
        let f = Arc::clone(&f);
        Box::pin(async move { f(params) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_defaults() {
        let metadata = ToolMetadata::new("postgres.execute_query", "Run SQL", ToolCategory::DatabaseQuery);
        assert_eq!(metadata.estimated_duration_ms, 2000);
        assert!(!metadata.requires_llm);
        assert!(metadata.database_compatibility.is_empty());
    }

    #[test]
    fn test_metadata_builders() {
        let metadata = ToolMetadata::new("t", "d", ToolCategory::Utility)
            .with_complexity(ToolComplexity::Advanced)
            .with_compatibility(&["postgres", "mongodb"])
            .requires_llm();
        assert_eq!(metadata.complexity, ToolComplexity::Advanced);
        assert_eq!(metadata.database_compatibility.len(), 2);
        assert!(metadata.requires_llm);
    }

    #[test]
    fn test_tool_call_ids_unique() {
        let a = ToolCall::new("t", serde_json::json!({}));
        let b = ToolCall::new("t", serde_json::json!({}));
        assert_ne!(a.call_id, b.call_id);
    }

    #[tokio::test]
    async fn test_sync_handler_wraps() {
        let handler = sync_handler(|params| Ok(serde_json::json!({"echo": params})));
        let out = handler(serde_json::json!(1)).await.unwrap();
        assert_eq!(out["echo"], serde_json::json!(1));
    }

    #[test]
    fn test_category_strings() {
        assert_eq!(ToolCategory::DatabaseQuery.as_str(), "database_query");
        assert_eq!(ToolCategory::CrossDatabase.as_str(), "cross_database");
    }
}
