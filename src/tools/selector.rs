//! Tool selection.
//!
//! Two implementations behind one interface: the LLM selector asks the
//! model for 2-5 tools with reasons, and the keyword selector is the
//! deterministic fallback. Unavailability of the LLM produces a warning
//! upstream, never a failure.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::llm::{extract_json, LlmService};
use crate::tools::metrics::ToolStats;
use crate::tools::ToolMetadata;

/// Most tools a selection may return.
pub const MAX_SELECTED_TOOLS: usize = 5;

/// Inputs to a selection round.
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    /// The user's question or surrounding context.
    pub context: String,
    /// Descriptions of data already in hand.
    pub available_data: Vec<String>,
    /// What the caller wants to end up with.
    pub target_outcome: String,
    /// Restrict to tools compatible with these backends.
    pub db_types: Option<Vec<String>>,
}

/// Chooses tools for a task.
#[async_trait]
pub trait ToolSelector: Send + Sync {
    async fn select(
        &self,
        ctx: &SelectionContext,
        tools: &[ToolMetadata],
        stats: &HashMap<String, ToolStats>,
    ) -> Result<Vec<String>>;
}

/// Derives backend hints from keyword spotting in the query.
pub fn database_hints(query: &str) -> Vec<&'static str> {
    let lowered = query.to_lowercase();
    let mut hints = Vec::new();

    let groups: [(&[&str], &str); 6] = [
        (&["shopify", "product", "inventory", "shop"], "shopify"),
        (&["postgres", "sql", "table", "relational"], "postgres"),
        (&["mongo", "document", "collection", "pipeline"], "mongodb"),
        (&["slack", "channel", "thread", "workspace"], "slack"),
        (&["analytics", "traffic", "pageview", "ga4", "sessions"], "ga4"),
        (&["vector", "semantic", "similar", "embedding"], "qdrant"),
    ];

    for (keywords, backend) in groups {
        if keywords.iter().any(|k| lowered.contains(k)) {
            hints.push(backend);
        }
    }
    hints
}

/// Deterministic keyword-overlap selector.
///
/// Filters by backend compatibility, scores by keyword overlap between
/// the outcome and each description, and breaks ties by lowest error
/// rate, then lowest complexity, then highest historical success count.
#[derive(Debug, Default)]
pub struct KeywordToolSelector;

impl KeywordToolSelector {
    pub fn new() -> Self {
        Self
    }

    fn compatible(tool: &ToolMetadata, db_types: &Option<Vec<String>>) -> bool {
        match db_types {
            Some(wanted) if !wanted.is_empty() => {
                tool.database_compatibility.is_empty()
                    || tool
                        .database_compatibility
                        .iter()
                        .any(|backend| wanted.contains(backend))
            }
            _ => true,
        }
    }

    fn overlap_score(outcome: &str, description: &str) -> usize {
        let description = description.to_lowercase();
        outcome
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| word.len() > 2)
            .filter(|word| description.contains(word))
            .count()
    }

    /// Rule-based fallback: 3 platform-appropriate tools plus a
    /// data-export helper.
    pub fn fallback_selection(
        &self,
        query: &str,
        tools: &[ToolMetadata],
        stats: &HashMap<String, ToolStats>,
    ) -> Vec<String> {
        let hints: Vec<String> = database_hints(query)
            .into_iter()
            .map(String::from)
            .collect();
        let ctx = SelectionContext {
            context: query.to_string(),
            target_outcome: query.to_string(),
            db_types: if hints.is_empty() { None } else { Some(hints) },
            ..Default::default()
        };

        let mut selected = self.rank(&ctx, tools, stats);
        selected.truncate(3);

        if let Some(export) = tools
            .iter()
            .find(|tool| tool.name.contains("export"))
            .map(|tool| tool.name.clone())
        {
            if !selected.contains(&export) {
                selected.push(export);
            }
        }
        selected
    }

    fn rank(
        &self,
        ctx: &SelectionContext,
        tools: &[ToolMetadata],
        stats: &HashMap<String, ToolStats>,
    ) -> Vec<String> {
        let mut candidates: Vec<&ToolMetadata> = tools
            .iter()
            .filter(|tool| Self::compatible(tool, &ctx.db_types))
            .collect();

        candidates.sort_by(|a, b| {
            let score_a = Self::overlap_score(&ctx.target_outcome, &a.description);
            let score_b = Self::overlap_score(&ctx.target_outcome, &b.description);
            score_b
                .cmp(&score_a)
                .then_with(|| {
                    let err_a = stats.get(&a.name).map(|s| s.error_rate).unwrap_or(0.0);
                    let err_b = stats.get(&b.name).map(|s| s.error_rate).unwrap_or(0.0);
                    err_a.partial_cmp(&err_b).unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.complexity.cmp(&b.complexity))
                .then_with(|| {
                    let ok_a = stats.get(&a.name).map(|s| s.successful).unwrap_or(0);
                    let ok_b = stats.get(&b.name).map(|s| s.successful).unwrap_or(0);
                    ok_b.cmp(&ok_a)
                })
                .then_with(|| a.name.cmp(&b.name))
        });

        candidates.into_iter().map(|tool| tool.name.clone()).collect()
    }
}

#[async_trait]
impl ToolSelector for KeywordToolSelector {
    async fn select(
        &self,
        ctx: &SelectionContext,
        tools: &[ToolMetadata],
        stats: &HashMap<String, ToolStats>,
    ) -> Result<Vec<String>> {
        let mut ranked = self.rank(ctx, tools, stats);
        ranked.truncate(MAX_SELECTED_TOOLS);
        Ok(ranked)
    }
}

/// LLM-backed selector.
pub struct LlmToolSelector {
    llm: LlmService,
}

impl LlmToolSelector {
    pub fn new(llm: LlmService) -> Self {
        Self { llm }
    }

    fn selection_prompt(
        ctx: &SelectionContext,
        tools: &[ToolMetadata],
        stats: &HashMap<String, ToolStats>,
    ) -> String {
        let mut listing = String::new();
        for tool in tools {
            let stat = stats.get(&tool.name);
            let success_rate = stat
                .map(|s| {
                    if s.total_executions > 0 {
                        1.0 - s.error_rate
                    } else {
                        1.0
                    }
                })
                .unwrap_or(1.0);
            listing.push_str(&format!(
                "- {} [{}] (success rate {:.0}%): {}\n",
                tool.name,
                tool.category.as_str(),
                success_rate * 100.0,
                tool.description
            ));
        }

        let hints = database_hints(&ctx.context);
        let hint_line = if hints.is_empty() {
            String::new()
        } else {
            format!(
                "The question suggests these backends: {}. Prefer their tools.\n",
                hints.join(", ")
            )
        };

        format!(
            "You are selecting tools to answer a question.\n\nQUESTION:\n{}\n\nTARGET OUTCOME:\n{}\n\nAVAILABLE TOOLS:\n{}\n{}Respond with ONLY a JSON array of 2 to 5 tool names, best first.",
            ctx.context, ctx.target_outcome, listing, hint_line
        )
    }
}

#[async_trait]
impl ToolSelector for LlmToolSelector {
    async fn select(
        &self,
        ctx: &SelectionContext,
        tools: &[ToolMetadata],
        stats: &HashMap<String, ToolStats>,
    ) -> Result<Vec<String>> {
        let prompt = Self::selection_prompt(ctx, tools, stats);
        let response = self.llm.generate_completion(&prompt).await?;
        let value = extract_json(&response)?;

        let names: Vec<String> = value
            .as_array()
            .ok_or_else(|| GatewayError::llm_parse("tool selection is not an array", response.clone()))?
            .iter()
            .filter_map(|item| {
                item.as_str()
                    .map(String::from)
                    .or_else(|| item.get("name").and_then(|n| n.as_str()).map(String::from))
            })
            .filter(|name| tools.iter().any(|tool| &tool.name == name))
            .collect();

        if names.is_empty() {
            return Err(GatewayError::llm_parse(
                "tool selection named no known tools",
                response,
            ));
        }

        debug!("LLM selected tools: {:?}", names);
        Ok(names.into_iter().take(MAX_SELECTED_TOOLS).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::tools::{ToolCategory, ToolComplexity};
    use std::sync::Arc;

    fn tool(name: &str, description: &str, backends: &[&str]) -> ToolMetadata {
        ToolMetadata::new(name, description, ToolCategory::DatabaseQuery)
            .with_compatibility(backends)
    }

    fn catalogue() -> Vec<ToolMetadata> {
        vec![
            tool(
                "postgres.execute_query",
                "Execute a SQL query against PostgreSQL tables",
                &["postgres"],
            ),
            tool(
                "mongodb.execute_query",
                "Run an aggregation pipeline over MongoDB collections",
                &["mongodb"],
            ),
            tool(
                "shopify.execute_query",
                "Fetch products, orders and inventory from Shopify",
                &["shopify"],
            ),
            ToolMetadata::new(
                "file_system.export_data_to_csv",
                "Export rows of data to a CSV file",
                ToolCategory::DataTransformation,
            ),
        ]
    }

    #[test]
    fn test_database_hints() {
        assert_eq!(database_hints("count shopify products"), vec!["shopify"]);
        assert_eq!(
            database_hints("sql table of slack channels"),
            vec!["postgres", "slack"]
        );
        assert!(database_hints("hello world").is_empty());
    }

    #[tokio::test]
    async fn test_keyword_selector_filters_by_backend() {
        let selector = KeywordToolSelector::new();
        let ctx = SelectionContext {
            target_outcome: "execute query".to_string(),
            db_types: Some(vec!["postgres".to_string()]),
            ..Default::default()
        };
        let selected = selector.select(&ctx, &catalogue(), &HashMap::new()).await.unwrap();
        assert!(selected.contains(&"postgres.execute_query".to_string()));
        assert!(!selected.contains(&"mongodb.execute_query".to_string()));
        // Universal tools (empty compatibility) survive the filter.
        assert!(selected.contains(&"file_system.export_data_to_csv".to_string()));
    }

    #[tokio::test]
    async fn test_keyword_selector_caps_at_five() {
        let selector = KeywordToolSelector::new();
        let mut tools = catalogue();
        for i in 0..10 {
            tools.push(tool(&format!("extra.tool_{i}"), "generic data tool", &[]));
        }
        let ctx = SelectionContext::default();
        let selected = selector.select(&ctx, &tools, &HashMap::new()).await.unwrap();
        assert_eq!(selected.len(), MAX_SELECTED_TOOLS);
    }

    #[tokio::test]
    async fn test_tie_break_prefers_lower_error_rate() {
        let selector = KeywordToolSelector::new();
        let tools = vec![
            tool("a.query", "identical description", &[]),
            tool("b.query", "identical description", &[]),
        ];
        let mut stats = HashMap::new();
        stats.insert(
            "a.query".to_string(),
            ToolStats {
                total_executions: 10,
                successful: 5,
                failed: 5,
                error_rate: 0.5,
                average_duration_ms: 1.0,
            },
        );
        stats.insert(
            "b.query".to_string(),
            ToolStats {
                total_executions: 10,
                successful: 10,
                failed: 0,
                error_rate: 0.0,
                average_duration_ms: 1.0,
            },
        );
        let ctx = SelectionContext {
            target_outcome: "anything".to_string(),
            ..Default::default()
        };
        let selected = selector.select(&ctx, &tools, &stats).await.unwrap();
        assert_eq!(selected[0], "b.query");
    }

    #[tokio::test]
    async fn test_tie_break_prefers_lower_complexity() {
        let selector = KeywordToolSelector::new();
        let tools = vec![
            tool("a.query", "same words", &[]).with_complexity(ToolComplexity::Advanced),
            tool("b.query", "same words", &[]).with_complexity(ToolComplexity::Simple),
        ];
        let ctx = SelectionContext {
            target_outcome: "irrelevant".to_string(),
            ..Default::default()
        };
        let selected = selector.select(&ctx, &tools, &HashMap::new()).await.unwrap();
        assert_eq!(selected[0], "b.query");
    }

    #[test]
    fn test_fallback_includes_export_helper() {
        let selector = KeywordToolSelector::new();
        let selected =
            selector.fallback_selection("count shopify products", &catalogue(), &HashMap::new());
        assert!(selected.len() <= 4);
        assert!(selected.contains(&"file_system.export_data_to_csv".to_string()));
        assert!(selected.contains(&"shopify.execute_query".to_string()));
    }

    #[tokio::test]
    async fn test_llm_selector_parses_names() {
        let llm = LlmService::new(Arc::new(MockLlmClient::new().with_response(
            "selecting tools",
            r#"["postgres.execute_query", "file_system.export_data_to_csv"]"#,
        )));
        let selector = LlmToolSelector::new(llm);
        let ctx = SelectionContext {
            context: "You are selecting tools".to_string(),
            target_outcome: "count rows".to_string(),
            ..Default::default()
        };
        let selected = selector.select(&ctx, &catalogue(), &HashMap::new()).await.unwrap();
        assert_eq!(
            selected,
            vec![
                "postgres.execute_query".to_string(),
                "file_system.export_data_to_csv".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_llm_selector_rejects_unknown_names() {
        let llm = LlmService::new(Arc::new(
            MockLlmClient::new().with_response("selecting tools", r#"["made.up_tool"]"#),
        ));
        let selector = LlmToolSelector::new(llm);
        let ctx = SelectionContext {
            context: "You are selecting tools".to_string(),
            ..Default::default()
        };
        let err = selector
            .select(&ctx, &catalogue(), &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "LLMParseError");
    }
}
