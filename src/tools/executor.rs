//! Tool execution node.
//!
//! Four phases over one mutable state: analyze & select, plan, execute,
//! synthesize. Per-step failures are local (recorded, plan continues);
//! the LLM being down degrades selection, planning, and synthesis to
//! deterministic fallbacks with a warning, never a failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use serde_json::{json, Value};

use crate::error::Result;
use crate::llm::{extract_json, LlmService};
use crate::tools::aggregator::{Event, EventKind, OutputSink};
use crate::tools::plan::{fill_default_parameters, resolve_parameters, ExecutionPlan, PlanStep};
use crate::tools::registry::ToolRegistry;
use crate::tools::selector::{
    database_hints, KeywordToolSelector, LlmToolSelector, SelectionContext, ToolSelector,
};
use crate::tools::{ExecutionResult, ToolMetadata};

/// Minimum share of steps that must succeed for an overall success.
const SUCCESS_RATE_THRESHOLD: f64 = 0.5;

/// Result of one node run.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub session_id: String,
    pub success: bool,
    pub selected_tools: Vec<String>,
    pub plan: ExecutionPlan,
    pub results: Vec<ExecutionResult>,
    pub synthesis: String,
    pub errors: Vec<String>,
}

impl NodeOutcome {
    /// Successful steps / executed steps, in [0, 1].
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.results.iter().filter(|r| r.success).count() as f64 / self.results.len() as f64
    }
}

/// LLM-driven multi-step execution over the registry.
pub struct ExecutionNode {
    registry: Arc<ToolRegistry>,
    llm: Option<LlmService>,
    sink: Arc<dyn OutputSink>,
}

impl ExecutionNode {
    pub fn new(
        registry: Arc<ToolRegistry>,
        llm: Option<LlmService>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        Self {
            registry,
            llm,
            sink,
        }
    }

    /// Runs the full pipeline for one question.
    pub async fn execute(&self, user_query: &str) -> Result<NodeOutcome> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut errors = Vec::new();

        // Phase 1: analyze and select.
        let selected_tools = self.select_tools(user_query, &mut errors).await;
        info!("selected tools: {:?}", selected_tools);

        // Phase 2: plan.
        let mut plan = self.build_plan(user_query, &selected_tools, &mut errors).await;
        for step in &mut plan.steps {
            fill_default_parameters(&step.tool_id, &mut step.parameters);
        }
        self.sink.publish(Event::new(
            &session_id,
            EventKind::PlanCaptured,
            json!({
                "user_query": user_query,
                "plan": plan,
            }),
        ));

        // Phase 3: execute.
        let results = self.run_plan(&session_id, &plan, &mut errors).await;

        // Phase 4: synthesize.
        let successful = results.iter().filter(|r| r.success).count();
        let synthesis_body = self
            .synthesize(user_query, &plan, &results, &mut errors)
            .await;
        let elapsed = started.elapsed().as_secs_f64();
        let synthesis = format!(
            "{}\n\n{}/{} tools executed in {:.1}s",
            synthesis_body,
            successful,
            results.len(),
            elapsed
        );

        self.sink.publish(Event::new(
            &session_id,
            EventKind::FinalSynthesis,
            json!({ "synthesis": synthesis }),
        ));

        let success_rate = if results.is_empty() {
            0.0
        } else {
            successful as f64 / results.len() as f64
        };
        let success = successful >= 1 && success_rate >= SUCCESS_RATE_THRESHOLD;

        self.sink.publish(Event::new(
            &session_id,
            EventKind::PerformanceMetrics,
            json!({
                "step_count": results.len(),
                "successful": successful,
                "success_rate": success_rate,
                "elapsed_secs": elapsed,
            }),
        ));

        Ok(NodeOutcome {
            session_id,
            success,
            selected_tools,
            plan,
            results,
            synthesis,
            errors,
        })
    }

    /// Phase 1: LLM selection with a rule-based fallback of three
    /// platform-appropriate tools plus the data-export helper.
    async fn select_tools(&self, user_query: &str, errors: &mut Vec<String>) -> Vec<String> {
        let tools = self.registry.list_metadata().await;
        let stats = self.registry.monitor().all_stats();

        let hints: Vec<String> = database_hints(user_query)
            .into_iter()
            .map(String::from)
            .collect();
        let ctx = SelectionContext {
            context: user_query.to_string(),
            available_data: Vec::new(),
            target_outcome: user_query.to_string(),
            db_types: if hints.is_empty() { None } else { Some(hints) },
        };

        if let Some(llm) = &self.llm {
            match LlmToolSelector::new(llm.clone()).select(&ctx, &tools, &stats).await {
                Ok(selected) if !selected.is_empty() => return selected,
                Ok(_) => {}
                Err(e) => {
                    warn!("LLM tool selection failed ({}), falling back", e);
                    errors.push(format!("tool selection fell back to heuristic: {e}"));
                }
            }
        }

        KeywordToolSelector::new().fallback_selection(user_query, &tools, &stats)
    }

    /// Phase 2: LLM planning with a sequential fallback plan.
    async fn build_plan(
        &self,
        user_query: &str,
        selected: &[String],
        errors: &mut Vec<String>,
    ) -> ExecutionPlan {
        let mut details = Vec::new();
        for name in selected {
            if let Some(metadata) = self.registry.get_metadata(name).await {
                details.push(metadata);
            } else {
                warn!("selected tool '{}' is not registered, dropping", name);
            }
        }

        if let Some(llm) = &self.llm {
            match self.llm_plan(llm, user_query, &details).await {
                Ok(plan) if !plan.steps.is_empty() => {
                    let known: Vec<PlanStep> = plan
                        .steps
                        .into_iter()
                        .filter(|step| details.iter().any(|d| d.name == step.tool_id))
                        .collect();
                    if !known.is_empty() {
                        let mut renumbered = ExecutionPlan { steps: known };
                        for (i, step) in renumbered.steps.iter_mut().enumerate() {
                            step.step_number = i + 1;
                        }
                        return renumbered;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("LLM planning failed ({}), using fallback plan", e);
                    errors.push(format!("planning fell back to sequential: {e}"));
                }
            }
        }

        Self::fallback_plan(&details)
    }

    async fn llm_plan(
        &self,
        llm: &LlmService,
        user_query: &str,
        details: &[ToolMetadata],
    ) -> Result<ExecutionPlan> {
        let mut listing = String::new();
        for tool in details {
            listing.push_str(&format!("- {}: {}\n", tool.name, tool.description));
        }

        let prompt = format!(
            "Create an execution plan answering:\n{user_query}\n\nTOOLS:\n{listing}\nRules:\n1. Respond with ONLY JSON: {{\"steps\": [{{\"step_number\": 1, \"tool_id\": \"...\", \"parameters\": {{...}}, \"description\": \"...\", \"depends_on\": []}}]}}\n2. Every parameter value must be concrete, or exactly \"output_from_step_X\" to reference step X's output.\n3. For file exports use realistic paths like \"/tmp/analysis_results.csv\".\n4. Use 1-4 steps."
        );

        let response = llm.generate_completion(&prompt).await?;
        let value = extract_json(&response)?;
        ExecutionPlan::parse(&value)
    }

    /// Sequential fallback: each selected tool becomes one step; a step
    /// that consumes data is fed the previous step's output.
    fn fallback_plan(details: &[ToolMetadata]) -> ExecutionPlan {
        let mut steps = Vec::with_capacity(details.len());
        for (i, tool) in details.iter().enumerate() {
            let mut parameters = std::collections::BTreeMap::new();
            if i > 0 && (tool.name.contains("export") || tool.name.contains("summarize")) {
                parameters.insert("data".to_string(), json!(format!("output_from_step_{i}")));
            }
            fill_default_parameters(&tool.name, &mut parameters);
            steps.push(PlanStep {
                step_number: i + 1,
                tool_id: tool.name.clone(),
                parameters,
                description: tool.description.clone(),
                depends_on: if i > 0 && (tool.name.contains("export") || tool.name.contains("summarize"))
                {
                    vec![i]
                } else {
                    Vec::new()
                },
            });
        }
        ExecutionPlan { steps }
    }

    /// Phase 3: strict sequential execution, continuing past failures.
    async fn run_plan(
        &self,
        session_id: &str,
        plan: &ExecutionPlan,
        errors: &mut Vec<String>,
    ) -> Vec<ExecutionResult> {
        let mut results = Vec::with_capacity(plan.steps.len());
        let mut step_outputs: HashMap<usize, Value> = HashMap::new();

        for step in &plan.steps {
            let resolved = match resolve_parameters(&step.parameters, &step_outputs) {
                Ok(mut resolved) => {
                    fill_default_parameters(&step.tool_id, &mut resolved);
                    resolved
                }
                Err(e) => {
                    // Unsatisfied dependency: record the failure, keep going.
                    errors.push(format!("step {}: {}", step.step_number, e));
                    results.push(ExecutionResult {
                        tool_id: step.tool_id.clone(),
                        call_id: uuid::Uuid::new_v4().to_string(),
                        success: false,
                        result: Value::Null,
                        error: Some(e.to_string()),
                        duration_ms: 0,
                    });
                    continue;
                }
            };

            let parameters = Value::Object(resolved.into_iter().collect());
            let execution = self
                .registry
                .execute_tool(&step.tool_id, parameters.clone(), None)
                .await;

            let result = match execution {
                Ok(outcome) => {
                    step_outputs.insert(step.step_number, outcome.result.clone());

                    ExecutionResult {
                        tool_id: step.tool_id.clone(),
                        call_id: outcome.execution_id,
                        success: true,
                        result: outcome.result,
                        error: None,
                        duration_ms: outcome.duration_ms,
                    }
                }
                Err(e) => {
                    errors.push(format!("step {}: {}", step.step_number, e));
                    ExecutionResult {
                        tool_id: step.tool_id.clone(),
                        call_id: uuid::Uuid::new_v4().to_string(),
                        success: false,
                        result: Value::Null,
                        error: Some(e.to_string()),
                        duration_ms: 0,
                    }
                }
            };

            self.sink.publish(Event::new(
                session_id,
                EventKind::ToolExecution,
                json!({
                    "step_number": step.step_number,
                    "tool_id": step.tool_id,
                    "parameters": parameters,
                    "success": result.success,
                    "result": result.result,
                    "error": result.error,
                    "duration_ms": result.duration_ms,
                }),
            ));

            if result.success {
                if let Some(rows) = result.result.get("rows") {
                    self.sink.publish(Event::new(
                        session_id,
                        EventKind::RawData,
                        json!({
                            "source": source_tag(&step.tool_id),
                            "rows": rows,
                        }),
                    ));
                }
            }

            results.push(result);
        }

        results
    }

    /// Phase 4: LLM synthesis with a deterministic fallback.
    async fn synthesize(
        &self,
        user_query: &str,
        plan: &ExecutionPlan,
        results: &[ExecutionResult],
        errors: &mut Vec<String>,
    ) -> String {
        let mut summary = String::new();
        for (step, result) in plan.steps.iter().zip(results) {
            let outcome_text = if result.success {
                let rendered = result.result.to_string();
                if rendered.len() > 500 {
                    let mut cut = 500;
                    while !rendered.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    format!("{}...", &rendered[..cut])
                } else {
                    rendered
                }
            } else {
                format!("FAILED: {}", result.error.clone().unwrap_or_default())
            };
            summary.push_str(&format!(
                "Step {} ({}): {}\n",
                step.step_number, step.tool_id, outcome_text
            ));
        }

        if let Some(llm) = &self.llm {
            let prompt = format!(
                "The user asked:\n{user_query}\n\nAn execution plan ran with these outcomes:\n{summary}\nWrite an executive summary answering the question, citing concrete numbers and file paths from the outcomes."
            );
            match llm.generate_completion(&prompt).await {
                Ok(text) => return text,
                Err(e) => {
                    warn!("synthesis LLM failed ({}), using deterministic summary", e);
                    errors.push(format!("synthesis fell back: {e}"));
                }
            }
        }

        format!("Executed plan for: {user_query}\n{summary}")
    }
}

/// Backend tag derived from a tool id, for raw-data events.
fn source_tag(tool_id: &str) -> &str {
    for tag in ["postgres", "mongodb", "shopify", "ga4", "qdrant", "slack"] {
        if tool_id.starts_with(tag) {
            return tag;
        }
    }
    "general"
}
