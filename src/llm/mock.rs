//! Mock LLM client for testing.
//!
//! Provides deterministic responses based on input patterns and
//! hash-derived embeddings, so adapter and executor tests run without a
//! network.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::{GatewayError, Result};
use crate::llm::{LlmClient, Message};

/// Mock LLM client that returns canned responses based on input patterns.
#[derive(Debug, Clone)]
pub struct MockLlmClient {
    /// Custom response mappings (pattern -> response), checked first.
    custom_responses: Vec<(String, String)>,
    /// Dimensionality of mock embeddings.
    dimension: usize,
    /// When set, every call fails; exercises fallback paths.
    unavailable: bool,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self {
            custom_responses: Vec::new(),
            dimension: 8,
            unavailable: false,
        }
    }
}

impl MockLlmClient {
    /// Creates a new mock client with default responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the embedding dimensionality.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    /// Makes every call fail with `LlmUnavailable`.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Adds a custom response mapping.
    ///
    /// When the input contains `pattern`, the mock returns `response`.
    pub fn with_response(
        mut self,
        pattern: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        self.custom_responses
            .push((pattern.into(), response.into()));
        self
    }

    /// Generates a mock response based on the input.
    fn mock_response(&self, input: &str) -> String {
        let input_lower = input.to_lowercase();

        for (pattern, response) in &self.custom_responses {
            if input_lower.contains(&pattern.to_lowercase()) {
                return response.clone();
            }
        }

        // Structured-output prompts first: they name their format.
        if input_lower.contains("aggregation pipeline") {
            return r#"```json
{"collection": "sample_orders", "pipeline": [{"$group": {"_id": "$user_id", "n": {"$sum": 1}}}, {"$sort": {"n": -1}}, {"$limit": 5}]}
```"#
                .to_string();
        }

        if input_lower.contains("google analytics") {
            return r#"{"dimensions": ["country"], "metrics": ["activeUsers"], "date_ranges": [{"relative": "last 7 days"}], "limit": 10}"#
                .to_string();
        }

        // SQL questions.
        if input_lower.contains("how many orders") {
            return "```sql\nSELECT COUNT(*) AS count FROM sample_orders;\n```".to_string();
        }

        if input_lower.contains("count") && input_lower.contains("users") {
            return "```sql\nSELECT COUNT(*) FROM users;\n```".to_string();
        }

        if input_lower.contains("all users") || input_lower.contains("show users") {
            return "```sql\nSELECT * FROM users;\n```".to_string();
        }

        if input_lower.contains("generate a sql query") || input_lower.contains("sql assistant") {
            return "```sql\nSELECT * FROM sample_orders LIMIT 100;\n```".to_string();
        }

        "I don't understand that question. Could you please rephrase it?".to_string()
    }

    /// Extracts the last user message content from a message list.
    fn extract_user_input(messages: &[Message]) -> String {
        messages
            .iter()
            .rev()
            .find(|m| m.role == crate::llm::Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        if self.unavailable {
            return Err(GatewayError::llm("mock client configured as unavailable"));
        }
        let input = Self::extract_user_input(messages);
        Ok(self.mock_response(&input))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.unavailable {
            return Err(GatewayError::llm("mock client configured as unavailable"));
        }
        Ok(texts
            .iter()
            .map(|text| deterministic_vector(text, self.dimension))
            .collect())
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }
}

/// Derives a unit-length vector from the text hash. Identical inputs get
/// identical vectors, so similarity comparisons are stable across runs.
fn deterministic_vector(text: &str, dimension: usize) -> Vec<f32> {
    let mut values = Vec::with_capacity(dimension);
    for i in 0..dimension {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        i.hash(&mut hasher);
        let h = hasher.finish();
        // Map to [-1, 1]
        values.push((h as f64 / u64::MAX as f64 * 2.0 - 1.0) as f32);
    }
    let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut values {
            *v /= norm;
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_custom_response_wins() {
        let client = MockLlmClient::new().with_response("weird question", "custom answer");
        let response = client
            .complete(&[Message::user("a weird question indeed")])
            .await
            .unwrap();
        assert_eq!(response, "custom answer");
    }

    #[tokio::test]
    async fn test_order_count_sql() {
        let client = MockLlmClient::new();
        let response = client
            .complete(&[Message::user("how many orders do we have?")])
            .await
            .unwrap();
        assert!(response.contains("COUNT(*)"));
        assert!(response.contains("sample_orders"));
    }

    #[tokio::test]
    async fn test_embeddings_are_deterministic() {
        let client = MockLlmClient::new().with_dimension(16);
        let a = client.embed(&["budget report".to_string()]).await.unwrap();
        let b = client.embed(&["budget report".to_string()]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 16);
    }

    #[tokio::test]
    async fn test_embeddings_are_unit_length() {
        let client = MockLlmClient::new();
        let vectors = client.embed(&["hello".to_string()]).await.unwrap();
        let norm: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_unavailable_client_errors() {
        let client = MockLlmClient::unavailable();
        let err = client.complete(&[Message::user("anything")]).await;
        assert!(err.is_err());
        let err = client.embed(&["anything".to_string()]).await;
        assert!(err.is_err());
    }
}
