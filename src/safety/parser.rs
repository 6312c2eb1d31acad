//! SQL parsing and rejection logic.
//!
//! Uses sqlparser-rs with the PostgreSQL dialect. The walk mirrors the
//! statement tree: CTEs, set operations, derived tables, and joins are
//! all descended so a data-modifying clause cannot hide inside an
//! otherwise read-only query.

use sqlparser::ast::{Query, Select, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::error::{GatewayError, Result};

/// Server-side functions that must not appear in generated SQL.
const DENIED_FUNCTIONS: &[&str] = &[
    "pg_sleep",
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_reload_conf",
    "lo_import",
    "lo_export",
    "dblink",
    "copy",
];

/// SQL sanitizer that admits only single read-only statements.
#[derive(Debug)]
pub struct SqlSanitizer {
    dialect: PostgreSqlDialect,
}

impl Default for SqlSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlSanitizer {
    /// Creates a new sanitizer.
    pub fn new() -> Self {
        Self {
            dialect: PostgreSqlDialect {},
        }
    }

    /// Sanitizes a SQL string, returning the normalized statement.
    ///
    /// Rejections carry the offending SQL so the caller can surface it.
    pub fn sanitize(&self, sql: &str) -> Result<String> {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return Err(GatewayError::query_invalid("empty SQL statement", sql));
        }

        let statements = Parser::parse_sql(&self.dialect, trimmed)
            .map_err(|e| GatewayError::query_invalid(format!("SQL parse error: {e}"), sql))?;

        if statements.is_empty() {
            return Err(GatewayError::query_invalid("empty SQL statement", sql));
        }
        if statements.len() > 1 {
            return Err(GatewayError::query_invalid(
                format!("{} statements found, only one is allowed", statements.len()),
                sql,
            ));
        }

        match &statements[0] {
            Statement::Query(query) => check_query(query, sql)?,
            other => {
                return Err(GatewayError::query_invalid(
                    format!("only SELECT is permitted, found {}", statement_name(other)),
                    sql,
                ));
            }
        }

        check_denied_functions(trimmed, sql)?;

        Ok(trimmed.trim_end_matches(';').trim_end().to_string())
    }
}

/// Returns a short display name for a rejected statement.
fn statement_name(statement: &Statement) -> &'static str {
    match statement {
        Statement::Insert(_) => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete(_) => "DELETE",
        Statement::Drop { .. } => "DROP",
        Statement::Truncate { .. } => "TRUNCATE",
        Statement::AlterTable { .. } => "ALTER",
        Statement::CreateTable { .. } | Statement::CreateIndex { .. } | Statement::CreateView { .. } => {
            "CREATE"
        }
        Statement::Grant { .. } => "GRANT",
        Statement::Revoke { .. } => "REVOKE",
        Statement::Merge { .. } => "MERGE",
        Statement::Copy { .. } => "COPY",
        _ => "a non-SELECT statement",
    }
}

/// Scans for denied server-side functions, skipping quoted literals.
fn check_denied_functions(trimmed: &str, original: &str) -> Result<()> {
    let lowered = strip_string_literals(trimmed).to_lowercase();
    for denied in DENIED_FUNCTIONS {
        // Match as an identifier boundary so e.g. column "copy_count" passes.
        let mut search_from = 0;
        while let Some(pos) = lowered[search_from..].find(denied) {
            let start = search_from + pos;
            let end = start + denied.len();
            let before_ok = start == 0
                || (!lowered.as_bytes()[start - 1].is_ascii_alphanumeric()
                    && lowered.as_bytes()[start - 1] != b'_');
            let after_ok = end >= lowered.len()
                || (!lowered.as_bytes()[end].is_ascii_alphanumeric()
                    && lowered.as_bytes()[end] != b'_');
            if before_ok && after_ok {
                return Err(GatewayError::query_invalid(
                    format!("use of '{denied}' is not permitted"),
                    original,
                ));
            }
            search_from = end;
        }
    }
    Ok(())
}

/// Blanks out single-quoted literals so identifier scanning ignores them.
fn strip_string_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_string = false;
    for c in sql.chars() {
        if c == '\'' {
            in_string = !in_string;
            out.push(c);
        } else if in_string {
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    out
}

/// Checks a Query, recursing into CTEs and the body.
fn check_query(query: &Query, original: &str) -> Result<()> {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            check_query(&cte.query, original)?;
        }
    }
    check_set_expr(&query.body, original)
}

/// Checks a SetExpr, rejecting embedded mutations.
fn check_set_expr(set_expr: &SetExpr, original: &str) -> Result<()> {
    match set_expr {
        SetExpr::Update(_) | SetExpr::Insert(_) => {
            Err(GatewayError::query_invalid(
                "data-modifying clause inside query",
                original,
            ))
        }
        SetExpr::Query(query) => check_query(query, original),
        SetExpr::Select(select) => check_select(select, original),
        SetExpr::SetOperation { left, right, .. } => {
            check_set_expr(left, original)?;
            check_set_expr(right, original)
        }
        SetExpr::Values(_) | SetExpr::Table(_) => Ok(()),
    }
}

/// Checks a Select's FROM clause for hidden subquery mutations.
fn check_select(select: &Select, original: &str) -> Result<()> {
    for table_with_joins in &select.from {
        check_table_with_joins(table_with_joins, original)?;
    }
    Ok(())
}

fn check_table_with_joins(twj: &TableWithJoins, original: &str) -> Result<()> {
    check_table_factor(&twj.relation, original)?;
    for join in &twj.joins {
        check_table_factor(&join.relation, original)?;
    }
    Ok(())
}

fn check_table_factor(factor: &TableFactor, original: &str) -> Result<()> {
    match factor {
        TableFactor::Derived { subquery, .. } => check_query(subquery, original),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => check_table_with_joins(table_with_joins, original),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitize(sql: &str) -> Result<String> {
        SqlSanitizer::new().sanitize(sql)
    }

    #[test]
    fn test_plain_select() {
        assert!(sanitize("SELECT id, name FROM users WHERE active = true").is_ok());
    }

    #[test]
    fn test_select_with_join() {
        assert!(
            sanitize("SELECT u.name, o.total FROM users u JOIN orders o ON u.id = o.user_id")
                .is_ok()
        );
    }

    #[test]
    fn test_select_with_subquery() {
        assert!(sanitize("SELECT * FROM users WHERE id IN (SELECT user_id FROM orders)").is_ok());
    }

    #[test]
    fn test_insert_rejected() {
        let err = sanitize("INSERT INTO users (name) VALUES ('x')").unwrap_err();
        assert!(err.to_string().contains("INSERT"));
    }

    #[test]
    fn test_update_rejected() {
        assert!(sanitize("UPDATE users SET name = 'x'").is_err());
    }

    #[test]
    fn test_delete_rejected() {
        assert!(sanitize("DELETE FROM users").is_err());
    }

    #[test]
    fn test_drop_rejected() {
        assert!(sanitize("DROP TABLE users").is_err());
    }

    #[test]
    fn test_create_rejected() {
        assert!(sanitize("CREATE TABLE t (id INT)").is_err());
    }

    #[test]
    fn test_grant_rejected() {
        assert!(sanitize("GRANT SELECT ON users TO intruder").is_err());
    }

    #[test]
    fn test_cte_with_delete_rejected() {
        let err =
            sanitize("WITH gone AS (DELETE FROM users RETURNING *) SELECT * FROM gone").unwrap_err();
        assert_eq!(err.kind(), "QueryInvalid");
    }

    #[test]
    fn test_nested_subquery_mutation_rejected() {
        assert!(sanitize(
            "SELECT * FROM (WITH d AS (DELETE FROM users RETURNING *) SELECT * FROM d) sub"
        )
        .is_err());
    }

    #[test]
    fn test_union_of_selects_allowed() {
        assert!(sanitize("SELECT id FROM users UNION SELECT id FROM admins").is_ok());
    }

    #[test]
    fn test_unparseable_rejected() {
        let err = sanitize("THIS IS NOT SQL").unwrap_err();
        assert_eq!(err.kind(), "QueryInvalid");
    }

    #[test]
    fn test_pg_sleep_rejected() {
        let err = sanitize("SELECT pg_sleep(10)").unwrap_err();
        assert!(err.to_string().contains("pg_sleep"));
    }

    #[test]
    fn test_denied_name_in_literal_allowed() {
        assert!(sanitize("SELECT * FROM notes WHERE body = 'call pg_sleep later'").is_ok());
    }

    #[test]
    fn test_denied_name_as_substring_allowed() {
        // copy_count is an ordinary identifier, not the COPY command.
        assert!(sanitize("SELECT copy_count FROM stats").is_ok());
    }

    #[test]
    fn test_explain_rejected() {
        // EXPLAIN is not in the permitted subset for generated queries.
        assert!(sanitize("EXPLAIN SELECT * FROM users").is_err());
    }
}
