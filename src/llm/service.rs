//! High-level LLM service wrappers.
//!
//! Wraps an `LlmClient` with the query-generation conveniences the
//! adapters call: fence-stripped SQL, JSON-coerced Mongo and GA4 queries,
//! result narration, and the bounded multi-turn analysis loop.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::error::{GatewayError, Result};
use crate::llm::parser::{extract_json, strip_code_fences};
use crate::llm::prompt::{
    render_template, ANALYZE_RESULTS_TEMPLATE, GA4_QUERY_TEMPLATE, MONGO_QUERY_TEMPLATE,
    NL2SQL_TEMPLATE, ORCHESTRATE_STEP_TEMPLATE,
};
use crate::llm::{LlmClient, Message, MAX_ANALYSIS_STEPS};

/// Outcome of the multi-turn analysis loop.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    /// Final narrative answer.
    pub analysis: String,
    /// Terminal state: "complete" or "step_limit".
    pub state: String,
    /// Number of loop iterations consumed.
    pub steps_taken: usize,
}

/// Service wrapper over an LLM client.
#[derive(Clone)]
pub struct LlmService {
    client: Arc<dyn LlmClient>,
}

impl LlmService {
    /// Creates a service over the given client.
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    /// Returns the underlying client.
    pub fn client(&self) -> Arc<dyn LlmClient> {
        Arc::clone(&self.client)
    }

    /// Generates a plain completion for a single prompt.
    pub async fn generate_completion(&self, prompt: &str) -> Result<String> {
        self.client.complete(&[Message::user(prompt)]).await
    }

    /// Embeds texts with the client's embedding model.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.client.embed(texts).await
    }

    /// Dimensionality of the embedding model.
    pub fn embedding_dimension(&self) -> usize {
        self.client.embedding_dimension()
    }

    /// Translates a question into SQL using the nl2sql template.
    ///
    /// The returned string has code fences stripped but is NOT yet
    /// sanitized; callers must pass it through the safety module before
    /// execution.
    pub async fn generate_sql(&self, question: &str, schema_context: &str) -> Result<String> {
        let prompt = render_template(
            NL2SQL_TEMPLATE,
            &context(&[("schema", schema_context), ("question", question)]),
        );
        let completion = self.generate_completion(&prompt).await?;
        Ok(strip_code_fences(&completion, "sql"))
    }

    /// Translates a question into a MongoDB aggregation request.
    pub async fn generate_mongodb_query(
        &self,
        question: &str,
        schema_context: &str,
        default_collection: &str,
    ) -> Result<serde_json::Value> {
        let prompt = render_template(
            MONGO_QUERY_TEMPLATE,
            &context(&[
                ("schema", schema_context),
                ("question", question),
                ("default_collection", default_collection),
            ]),
        );
        self.structured_json(&prompt).await
    }

    /// Translates a question into a GA4 report request.
    pub async fn generate_ga4_query(
        &self,
        question: &str,
        schema_context: &str,
    ) -> Result<serde_json::Value> {
        let prompt = render_template(
            GA4_QUERY_TEMPLATE,
            &context(&[("schema", schema_context), ("question", question)]),
        );
        self.structured_json(&prompt).await
    }

    /// Produces a narrative over a query result set.
    pub async fn analyze_results(
        &self,
        question: &str,
        rows: &[serde_json::Value],
    ) -> Result<String> {
        let rows_json = serde_json::to_string_pretty(rows)
            .map_err(|e| GatewayError::internal(format!("failed to serialize rows: {e}")))?;
        let prompt = render_template(
            ANALYZE_RESULTS_TEMPLATE,
            &context(&[("question", question), ("rows", rows_json.as_str())]),
        );
        self.generate_completion(&prompt).await
    }

    /// Multi-turn analysis loop, gated by [`MAX_ANALYSIS_STEPS`].
    ///
    /// Each iteration asks the model to either finalize (`FINAL:`) or pose
    /// a focused follow-up (`NEXT:`); follow-ups are resolved by the
    /// supplied callback, which typically runs a query against the
    /// backend.
    pub async fn orchestrate_analysis<F, Fut>(
        &self,
        question: &str,
        db_type: &str,
        mut run_followup: F,
    ) -> Result<AnalysisOutcome>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = Result<String>>,
    {
        let mut findings = String::from("(none yet)");

        for step in 1..=MAX_ANALYSIS_STEPS {
            let prompt = render_template(
                ORCHESTRATE_STEP_TEMPLATE,
                &context(&[
                    ("question", question),
                    ("db_type", db_type),
                    ("findings", findings.as_str()),
                ]),
            );
            let response = self.generate_completion(&prompt).await?;
            let trimmed = response.trim();

            if let Some(answer) = trimmed.strip_prefix("FINAL:") {
                return Ok(AnalysisOutcome {
                    analysis: answer.trim().to_string(),
                    state: "complete".to_string(),
                    steps_taken: step,
                });
            }

            let followup = trimmed
                .strip_prefix("NEXT:")
                .map(str::trim)
                .unwrap_or(trimmed)
                .to_string();

            match run_followup(followup.clone()).await {
                Ok(result) => {
                    findings.push_str(&format!("\n- {followup}: {result}"));
                }
                Err(e) => {
                    warn!("analysis follow-up failed: {}", e);
                    findings.push_str(&format!("\n- {followup}: (failed: {e})"));
                }
            }
        }

        Ok(AnalysisOutcome {
            analysis: format!("Analysis incomplete after {MAX_ANALYSIS_STEPS} steps. Findings:{findings}"),
            state: "step_limit".to_string(),
            steps_taken: MAX_ANALYSIS_STEPS,
        })
    }

    /// Completes a prompt and coerces the output to JSON.
    ///
    /// Malformed JSON is retried once with a "return only JSON" reminder;
    /// a second failure surfaces the parse error with the raw text.
    pub async fn structured_json(&self, prompt: &str) -> Result<serde_json::Value> {
        let first = self.generate_completion(prompt).await?;
        match extract_json(&first) {
            Ok(value) => Ok(value),
            Err(_) => {
                warn!("LLM returned non-JSON output, retrying with reminder");
                let retry_prompt = format!(
                    "{prompt}\n\nYour previous answer was not valid JSON. Return ONLY the JSON value, with no commentary."
                );
                let second = self.generate_completion(&retry_prompt).await?;
                extract_json(&second)
            }
        }
    }
}

fn context<'a>(pairs: &[(&'a str, &str)]) -> HashMap<&'a str, String> {
    pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use serde_json::json;

    fn service(mock: MockLlmClient) -> LlmService {
        LlmService::new(Arc::new(mock))
    }

    #[tokio::test]
    async fn test_generate_sql_strips_fences() {
        let svc = service(MockLlmClient::new());
        let sql = svc
            .generate_sql("how many orders do we have?", "Table: sample_orders")
            .await
            .unwrap();
        assert!(sql.starts_with("SELECT"));
        assert!(!sql.contains("```"));
    }

    #[tokio::test]
    async fn test_generate_mongodb_query_returns_json() {
        let svc = service(MockLlmClient::new());
        let value = svc
            .generate_mongodb_query("top 5 users by order count", "", "sample_orders")
            .await
            .unwrap();
        assert_eq!(value["collection"], json!("sample_orders"));
        assert!(value["pipeline"].is_array());
    }

    #[tokio::test]
    async fn test_structured_json_retries_once() {
        let svc = service(
            MockLlmClient::new()
                .with_response("not valid json", r#"{"fixed": true}"#)
                .with_response("give me json", "certainly! here it is, malformed"),
        );
        let value = svc.structured_json("give me json").await.unwrap();
        assert_eq!(value["fixed"], json!(true));
    }

    #[tokio::test]
    async fn test_structured_json_fails_after_second_attempt() {
        let svc = service(MockLlmClient::new().with_response("hopeless", "never json"));
        let err = svc.structured_json("hopeless prompt").await.unwrap_err();
        assert_eq!(err.kind(), "LLMParseError");
    }

    #[tokio::test]
    async fn test_orchestrate_analysis_finalizes() {
        let svc = service(
            MockLlmClient::new().with_response("iteratively analyzing", "FINAL: 42 orders total"),
        );
        let outcome = svc
            .orchestrate_analysis("how many orders?", "postgres", |_q| async {
                Ok("unused".to_string())
            })
            .await
            .unwrap();
        assert_eq!(outcome.analysis, "42 orders total");
        assert_eq!(outcome.state, "complete");
        assert_eq!(outcome.steps_taken, 1);
    }

    #[tokio::test]
    async fn test_orchestrate_analysis_hits_step_limit() {
        let svc = service(
            MockLlmClient::new().with_response("iteratively analyzing", "NEXT: count the rows"),
        );
        let outcome = svc
            .orchestrate_analysis("unanswerable", "postgres", |_q| async {
                Ok("rows: 1".to_string())
            })
            .await
            .unwrap();
        assert_eq!(outcome.state, "step_limit");
        assert_eq!(outcome.steps_taken, MAX_ANALYSIS_STEPS);
    }
}
