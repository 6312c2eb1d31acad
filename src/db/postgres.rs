//! PostgreSQL adapter.
//!
//! Translates questions to SQL through the nl2sql template, gates every
//! generated statement behind the sanitizer, and executes over a sqlx
//! pool. Introspection serializes one schema document per table.

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column as SqlxColumn, Row as SqlxRow, TypeInfo};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::db::{wrong_variant, Adapter, BackendKind, Query, QueryOptions, Row};
use crate::error::{GatewayError, Result};
use crate::llm::LlmService;
use crate::safety::sanitize_sql;
use crate::schema::SchemaDocument;

/// Query timeout in seconds.
const QUERY_TIMEOUT_SECS: u64 = 30;

/// Maximum rows to return from a query.
const MAX_ROWS: usize = 1000;

/// Maximum number of connection retry attempts.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay between retry attempts (doubles each retry).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// PostgreSQL adapter.
pub struct PostgresAdapter {
    uri: String,
    pool: PgPool,
    llm: LlmService,
}

impl PostgresAdapter {
    /// Connects to the database, retrying transient failures with
    /// exponential backoff.
    pub async fn connect(uri: &str, llm: LlmService) -> Result<Self> {
        let mut last_error = None;
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            debug!("Connection attempt {} of {}", attempt, MAX_RETRY_ATTEMPTS);

            let result = PgPoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(10))
                .connect(uri)
                .await;

            match result {
                Ok(pool) => {
                    debug!("Successfully connected to database");
                    return Ok(Self {
                        uri: uri.to_string(),
                        pool,
                        llm,
                    });
                }
                Err(e) => {
                    let is_transient = is_transient_error(&e);
                    last_error = Some(e);

                    if attempt < MAX_RETRY_ATTEMPTS && is_transient {
                        warn!(
                            "Connection attempt {} failed (transient error), retrying in {:?}",
                            attempt, delay
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(map_connection_error(
            last_error.expect("at least one attempt was made"),
        ))
    }

    /// Creates an adapter from an existing pool. Primarily for testing.
    pub fn from_pool(uri: &str, pool: PgPool, llm: LlmService) -> Self {
        Self {
            uri: uri.to_string(),
            pool,
            llm,
        }
    }

    async fn execute_sql(&self, sql: &str) -> Result<Vec<Row>> {
        let mut stream = sqlx::query(sql).fetch(&self.pool);
        let mut rows: Vec<Row> = Vec::new();

        let timeout_result = tokio::time::timeout(Duration::from_secs(QUERY_TIMEOUT_SECS), async {
            while let Some(row_result) = stream.next().await {
                let pg_row = row_result
                    .map_err(|e| GatewayError::query_invalid(format_query_error(e), sql))?;
                if rows.len() < MAX_ROWS {
                    rows.push(convert_row(&pg_row));
                } else {
                    warn!("Query exceeded {} rows, result truncated", MAX_ROWS);
                    break;
                }
            }
            Ok::<_, GatewayError>(())
        })
        .await;

        timeout_result
            .map_err(|_| GatewayError::timeout(format!("query exceeded {QUERY_TIMEOUT_SECS}s")))??;

        Ok(rows)
    }

    /// Fetches table names, column listings, primary keys, foreign keys,
    /// and row estimates, then assembles one document per table.
    async fn introspect_tables(&self) -> Result<Vec<SchemaDocument>> {
        let (columns_result, pks_result, fks_result, estimates_result) = tokio::join!(
            self.fetch_all_columns(),
            self.fetch_all_primary_keys(),
            self.fetch_foreign_keys(),
            self.fetch_row_estimates(),
        );

        let columns_by_table = columns_result?;
        let pks_by_table = pks_result.unwrap_or_default();
        let fks = fks_result.unwrap_or_default();
        let estimates = estimates_result.unwrap_or_default();

        if columns_by_table.is_empty() {
            return Err(GatewayError::PartialIntrospection(
                "no user tables visible".to_string(),
            ));
        }

        let mut table_names: Vec<_> = columns_by_table.keys().cloned().collect();
        table_names.sort();

        let documents = table_names
            .into_iter()
            .map(|table| {
                let mut content = format!("Table: {table}\n");
                if let Some(estimate) = estimates.get(&table) {
                    content.push_str(&format!("Estimated rows: {estimate}\n"));
                }
                content.push_str("Columns:\n");
                for (name, data_type, nullable) in
                    columns_by_table.get(&table).cloned().unwrap_or_default()
                {
                    let mut annotations = Vec::new();
                    if pks_by_table
                        .get(&table)
                        .map(|pk| pk.contains(&name))
                        .unwrap_or(false)
                    {
                        annotations.push("PK");
                    }
                    if !nullable {
                        annotations.push("NOT NULL");
                    }
                    if annotations.is_empty() {
                        content.push_str(&format!("  - {name}: {data_type}\n"));
                    } else {
                        content
                            .push_str(&format!("  - {name}: {data_type} ({})\n", annotations.join(", ")));
                    }
                }
                let table_fks: Vec<_> = fks
                    .iter()
                    .filter(|(from, _, _, _)| from == &table)
                    .collect();
                if !table_fks.is_empty() {
                    content.push_str("Foreign keys:\n");
                    for (_, from_col, to_table, to_col) in table_fks {
                        content.push_str(&format!("  - {from_col} -> {to_table}.{to_col}\n"));
                    }
                }
                SchemaDocument::new(format!("table:{table}"), content, "postgres")
            })
            .collect();

        Ok(documents)
    }

    async fn fetch_all_columns(&self) -> Result<HashMap<String, Vec<(String, String, bool)>>> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT
                table_name::text,
                column_name::text,
                data_type::text,
                is_nullable::text
            FROM information_schema.columns
            WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
            ORDER BY table_name, ordinal_position
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GatewayError::backend(format!("Failed to fetch columns: {e}")))?;

        let mut columns_by_table: HashMap<String, Vec<(String, String, bool)>> = HashMap::new();
        for (table, column, data_type, is_nullable) in rows {
            columns_by_table
                .entry(table)
                .or_default()
                .push((column, data_type, is_nullable == "YES"));
        }
        Ok(columns_by_table)
    }

    async fn fetch_all_primary_keys(&self) -> Result<HashMap<String, Vec<String>>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT
                tc.table_name::text,
                kcu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            WHERE tc.constraint_type = 'PRIMARY KEY'
                AND tc.table_schema NOT IN ('pg_catalog', 'information_schema')
            ORDER BY tc.table_name, kcu.ordinal_position
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GatewayError::backend(format!("Failed to fetch primary keys: {e}")))?;

        let mut pks_by_table: HashMap<String, Vec<String>> = HashMap::new();
        for (table, column) in rows {
            pks_by_table.entry(table).or_default().push(column);
        }
        Ok(pks_by_table)
    }

    async fn fetch_foreign_keys(&self) -> Result<Vec<(String, String, String, String)>> {
        sqlx::query_as(
            r#"
            SELECT
                kcu.table_name::text AS from_table,
                kcu.column_name::text AS from_column,
                ccu.table_name::text AS to_table,
                ccu.column_name::text AS to_column
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
                ON tc.constraint_name = ccu.constraint_name
                AND tc.table_schema = ccu.table_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
                AND tc.table_schema NOT IN ('pg_catalog', 'information_schema')
            ORDER BY kcu.table_name, kcu.ordinal_position
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GatewayError::backend(format!("Failed to fetch foreign keys: {e}")))
    }

    async fn fetch_row_estimates(&self) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT relname::text, reltuples::bigint
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relkind = 'r'
                AND n.nspname NOT IN ('pg_catalog', 'information_schema')
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GatewayError::backend(format!("Failed to fetch row estimates: {e}")))?;

        Ok(rows.into_iter().collect())
    }
}

#[async_trait]
impl Adapter for PostgresAdapter {
    fn db_type(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn connection_uri(&self) -> &str {
        &self.uri
    }

    async fn llm_to_query(&self, nl_prompt: &str, opts: &QueryOptions) -> Result<Query> {
        let schema_context = match &opts.schema_chunks {
            Some(chunks) => chunks.clone(),
            None => {
                // Best effort: a missing schema still yields a usable prompt.
                match self.introspect_schema().await {
                    Ok(documents) => documents
                        .iter()
                        .map(|d| d.content.as_str())
                        .collect::<Vec<_>>()
                        .join("\n"),
                    Err(e) => {
                        warn!("schema unavailable for prompt context: {}", e);
                        String::from("(schema unavailable)")
                    }
                }
            }
        };

        let sql = self.llm.generate_sql(nl_prompt, &schema_context).await?;
        let sanitized = sanitize_sql(&sql)?;
        Ok(Query::Sql { text: sanitized })
    }

    async fn execute(&self, query: &Query) -> Result<Vec<Row>> {
        let Query::Sql { text } = query else {
            return Err(wrong_variant(BackendKind::Postgres, query));
        };
        // Defense in depth: sanitize again at the execution boundary so
        // hand-constructed queries obey the same contract.
        let sql = sanitize_sql(text)?;
        self.execute_sql(&sql).await
    }

    async fn introspect_schema(&self) -> Result<Vec<SchemaDocument>> {
        self.introspect_tables().await
    }

    async fn test_connection(&self) -> bool {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

/// Converts a sqlx PgRow to a JSON row map.
fn convert_row(row: &PgRow) -> Row {
    let mut map = Row::new();
    for (i, col) in row.columns().iter().enumerate() {
        map.insert(
            col.name().to_string(),
            convert_value(row, i, col.type_info().name()),
        );
    }
    map
}

/// Converts a single column value from a PgRow to JSON.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> serde_json::Value {
    use serde_json::Value;

    match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "INT2" | "SMALLINT" => int_value(row.try_get::<Option<i16>, _>(index).ok().flatten().map(i64::from)),
        "INT4" | "INT" | "INTEGER" => {
            int_value(row.try_get::<Option<i32>, _>(index).ok().flatten().map(i64::from))
        }
        "INT8" | "BIGINT" => int_value(row.try_get::<Option<i64>, _>(index).ok().flatten()),

        "FLOAT4" | "REAL" => float_value(
            row.try_get::<Option<f32>, _>(index)
                .ok()
                .flatten()
                .map(f64::from),
        ),
        "FLOAT8" | "DOUBLE PRECISION" => {
            float_value(row.try_get::<Option<f64>, _>(index).ok().flatten())
        }

        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(index)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),

        // Everything else renders as text.
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

fn int_value(v: Option<i64>) -> serde_json::Value {
    v.map(serde_json::Value::from)
        .unwrap_or(serde_json::Value::Null)
}

fn float_value(v: Option<f64>) -> serde_json::Value {
    v.and_then(|f| serde_json::Number::from_f64(f).map(serde_json::Value::Number))
        .unwrap_or(serde_json::Value::Null)
}

/// Determines if an error is transient and worth retrying.
fn is_transient_error(error: &sqlx::Error) -> bool {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused")
        || error_str.contains("timed out")
        || error_str.contains("timeout")
        || error_str.contains("temporarily unavailable")
        || error_str.contains("connection reset")
        || error_str.contains("broken pipe")
    {
        return true;
    }

    false
}

/// Maps sqlx connection errors to the gateway taxonomy.
fn map_connection_error(error: sqlx::Error) -> GatewayError {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
    {
        GatewayError::auth("database authentication failed; check credentials")
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        GatewayError::backend("connection timed out; the server may be overloaded or unreachable")
    } else {
        GatewayError::backend(error.to_string())
    }
}

/// Formats a query error with detail and hints when available.
fn format_query_error(error: sqlx::Error) -> String {
    if let Some(db_error) = error.as_database_error() {
        let mut result = format!("ERROR: {}", db_error.message());
        if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
            if let Some(detail) = pg_error.detail() {
                result.push_str("\n  DETAIL: ");
                result.push_str(detail);
            }
            if let Some(hint) = pg_error.hint() {
                result.push_str("\n  HINT: ");
                result.push_str(hint);
            }
        }
        result
    } else {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmService, MockLlmClient};
    use std::sync::Arc;

    // Connection-bound tests require a running PostgreSQL instance; they
    // are skipped unless DATABASE_URL is set.

    fn llm() -> LlmService {
        LlmService::new(Arc::new(MockLlmClient::new()))
    }

    async fn get_test_adapter() -> Option<PostgresAdapter> {
        let url = std::env::var("DATABASE_URL").ok()?;
        PostgresAdapter::connect(&url, llm()).await.ok()
    }

    #[tokio::test]
    async fn test_execute_select() {
        let Some(adapter) = get_test_adapter().await else {
            eprintln!("Skipping test: DATABASE_URL not set");
            return;
        };

        let rows = adapter
            .execute(&Query::Sql {
                text: "SELECT 1 AS num, 'hello' AS greeting".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["num"], serde_json::json!(1));
        assert_eq!(rows[0]["greeting"], serde_json::json!("hello"));
    }

    #[tokio::test]
    async fn test_introspect_schema_ids_unique() {
        let Some(adapter) = get_test_adapter().await else {
            eprintln!("Skipping test: DATABASE_URL not set");
            return;
        };

        let documents = adapter.introspect_schema().await.unwrap();
        let mut ids: Vec<_> = documents.iter().map(|d| d.id.clone()).collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(before, ids.len(), "schema document ids must be unique");
        assert!(documents.iter().all(|d| !d.content.is_empty()));
    }

    #[tokio::test]
    async fn test_execute_rejects_mutations() {
        let Some(adapter) = get_test_adapter().await else {
            eprintln!("Skipping test: DATABASE_URL not set");
            return;
        };

        let err = adapter
            .execute(&Query::Sql {
                text: "DELETE FROM users".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "QueryInvalid");
    }

    #[tokio::test]
    async fn test_execute_rejects_wrong_variant() {
        let Some(adapter) = get_test_adapter().await else {
            eprintln!("Skipping test: DATABASE_URL not set");
            return;
        };

        let err = adapter
            .execute(&Query::SlackTool {
                tool_id: "slack_list_channels".to_string(),
                parameters: serde_json::json!({}),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "QueryInvalid");
    }

    #[test]
    fn test_transient_classification() {
        // String-shape checks only; constructing sqlx errors directly is
        // not part of the public API.
        assert!(!is_transient_error(&sqlx::Error::RowNotFound));
    }
}
