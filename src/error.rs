//! Error types for the gateway.
//!
//! One enum covers the whole error taxonomy. Every user-surfaced variant
//! carries a short cause; `remediation()` supplies the concrete next step
//! shown to the caller. Stack traces are logged, never returned.

use thiserror::Error;

/// Main error type for gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Missing required field, unparseable YAML, bad URI.
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    /// Connection/DNS/timeout talking to a data source.
    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    /// Expired OAuth token or JWT.
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// Provider rate-limit signal, surfaced after one Retry-After retry.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The LLM produced an unsafe or malformed query, or the sanitizer
    /// rejected it. Carries the offending query text.
    #[error("Invalid query: {reason} (query: {query})")]
    QueryInvalid { reason: String, query: String },

    /// LLM transport failed after retries.
    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),

    /// LLM returned an unparseable structure after one retry. Carries the
    /// raw model output.
    #[error("LLM response unparseable: {reason}")]
    LlmParseError { reason: String, raw: String },

    /// Schema index build failed or does not exist.
    #[error("Schema index unavailable: {0}")]
    SchemaIndexUnavailable(String),

    /// Query/index embedding dimensionalities differ.
    #[error("Embedding dimension mismatch: query has {query_dim}, index has {index_dim}")]
    EmbeddingDimensionMismatch { query_dim: usize, index_dim: usize },

    /// Introspection returned partial results (warning-level).
    #[error("Partial schema introspection: {0}")]
    PartialIntrospection(String),

    /// Registry-level tool failure. Recorded, does not abort the plan.
    #[error("Tool execution failed: {tool}: {cause}")]
    ToolExecutionFailed { tool: String, cause: String },

    /// HTTP-family URI without an explicit db_type.
    #[error("Ambiguous adapter selection: {0}")]
    AdapterSelectionAmbiguous(String),

    /// OAuth flow not completed within the polling window.
    #[error("Authentication timed out: {0}")]
    AuthTimeout(String),

    /// A query or probe exceeded its hard time ceiling.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Internal application errors (unexpected states, bugs).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    /// Creates a backend-unreachable error with the given message.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::BackendUnreachable(msg.into())
    }

    /// Creates an auth-expired error with the given message.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::AuthExpired(msg.into())
    }

    /// Creates a quota error with the given message.
    pub fn quota(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    /// Creates an invalid-query error, attaching the offending query text.
    pub fn query_invalid(reason: impl Into<String>, query: impl Into<String>) -> Self {
        Self::QueryInvalid {
            reason: reason.into(),
            query: query.into(),
        }
    }

    /// Creates an LLM-unavailable error with the given message.
    pub fn llm(msg: impl Into<String>) -> Self {
        Self::LlmUnavailable(msg.into())
    }

    /// Creates an LLM parse error, attaching the raw model output.
    pub fn llm_parse(reason: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::LlmParseError {
            reason: reason.into(),
            raw: raw.into(),
        }
    }

    /// Creates a tool-execution error for the named tool.
    pub fn tool(tool: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::ToolExecutionFailed {
            tool: tool.into(),
            cause: cause.into(),
        }
    }

    /// Creates a timeout error with the given message.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error kind as a stable string for display and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "ConfigInvalid",
            Self::BackendUnreachable(_) => "BackendUnreachable",
            Self::AuthExpired(_) => "AuthExpired",
            Self::QuotaExceeded(_) => "QuotaExceeded",
            Self::QueryInvalid { .. } => "QueryInvalid",
            Self::LlmUnavailable(_) => "LLMUnavailable",
            Self::LlmParseError { .. } => "LLMParseError",
            Self::SchemaIndexUnavailable(_) => "SchemaIndexUnavailable",
            Self::EmbeddingDimensionMismatch { .. } => "EmbeddingDimensionMismatch",
            Self::PartialIntrospection(_) => "PartialIntrospection",
            Self::ToolExecutionFailed { .. } => "ToolExecutionFailed",
            Self::AdapterSelectionAmbiguous(_) => "AdapterSelectionAmbiguous",
            Self::AuthTimeout(_) => "AuthTimeout",
            Self::Timeout(_) => "Timeout",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Returns a concrete remediation hint for user-surfaced errors.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "Check config.yaml and environment variables.",
            Self::BackendUnreachable(_) => {
                "Verify the backend is running and the connection URI is correct."
            }
            Self::AuthExpired(_) | Self::AuthTimeout(_) => {
                "Re-authenticate (e.g. `datagate authenticate shopify --shop <domain>`)."
            }
            Self::QuotaExceeded(_) => "Wait for the provider rate limit to reset and retry.",
            Self::QueryInvalid { .. } => "Rephrase the question or supply the query explicitly.",
            Self::LlmUnavailable(_) => "Check the LLM endpoint and API key, then retry.",
            Self::LlmParseError { .. } => "Retry; if it persists, simplify the question.",
            Self::SchemaIndexUnavailable(_) => "Rebuild the schema index for this backend.",
            Self::EmbeddingDimensionMismatch { .. } => {
                "Rebuild the index with the currently configured embedding model."
            }
            Self::PartialIntrospection(_) => "Grant broader introspection privileges if needed.",
            Self::ToolExecutionFailed { .. } => "Inspect the tool's recorded error and retry.",
            Self::AdapterSelectionAmbiguous(_) => {
                "Pass an explicit db_type for http(s) connection URIs."
            }
            Self::Timeout(_) => "Narrow the query or raise the timeout, then retry.",
            Self::Internal(_) => "This is a bug; check the server logs.",
        }
    }

    /// Maps the error to a CLI process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AuthExpired(_) | Self::AuthTimeout(_) => 1,
            Self::ConfigInvalid(_) | Self::AdapterSelectionAmbiguous(_) => 2,
            Self::BackendUnreachable(_) | Self::QuotaExceeded(_) => 3,
            Self::QueryInvalid { .. }
            | Self::LlmParseError { .. }
            | Self::SchemaIndexUnavailable(_)
            | Self::EmbeddingDimensionMismatch { .. } => 4,
            Self::Timeout(_) => 5,
            _ => 1,
        }
    }
}

/// Result type alias using GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_backend() {
        let err = GatewayError::backend("cannot reach localhost:5432");
        assert_eq!(
            err.to_string(),
            "Backend unreachable: cannot reach localhost:5432"
        );
        assert_eq!(err.kind(), "BackendUnreachable");
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_query_invalid_carries_query() {
        let err = GatewayError::query_invalid("multiple statements", "SELECT 1; DROP TABLE t");
        assert!(err.to_string().contains("DROP TABLE t"));
        assert_eq!(err.kind(), "QueryInvalid");
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_llm_parse_error_carries_raw() {
        let err = GatewayError::llm_parse("not json", "here is your query: SELECT 1");
        match err {
            GatewayError::LlmParseError { raw, .. } => {
                assert!(raw.contains("SELECT 1"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(GatewayError::auth("expired").exit_code(), 1);
        assert_eq!(GatewayError::config("bad yaml").exit_code(), 2);
        assert_eq!(
            GatewayError::AdapterSelectionAmbiguous("http uri".into()).exit_code(),
            2
        );
        assert_eq!(GatewayError::quota("rate limited").exit_code(), 3);
        assert_eq!(GatewayError::timeout("query ceiling").exit_code(), 5);
    }

    #[test]
    fn test_remediation_is_nonempty() {
        let errors = vec![
            GatewayError::config("x"),
            GatewayError::backend("x"),
            GatewayError::auth("x"),
            GatewayError::llm("x"),
            GatewayError::internal("x"),
        ];
        for err in errors {
            assert!(!err.remediation().is_empty());
        }
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GatewayError>();
    }
}
