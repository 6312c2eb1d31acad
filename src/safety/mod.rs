//! SQL sanitization for LLM-generated queries.
//!
//! Parses candidate SQL with the PostgreSQL dialect and admits only a
//! single read-only statement: `SELECT` or `WITH ... SELECT`. DDL, DML,
//! multi-statement bodies, data-modifying CTEs, and dangerous server-side
//! functions are all rejected as `QueryInvalid`.

mod parser;

pub use parser::SqlSanitizer;

use crate::error::Result;

/// Convenience function: sanitizes SQL without constructing an instance.
///
/// Returns the normalized statement (trailing semicolon stripped) on
/// success.
pub fn sanitize_sql(sql: &str) -> Result<String> {
    SqlSanitizer::new().sanitize(sql)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_passes() {
        let sql = sanitize_sql("SELECT * FROM users").unwrap();
        assert_eq!(sql, "SELECT * FROM users");
    }

    #[test]
    fn test_with_select_passes() {
        let sql = "WITH active AS (SELECT * FROM users WHERE active) SELECT * FROM active";
        assert!(sanitize_sql(sql).is_ok());
    }

    #[test]
    fn test_trailing_semicolon_stripped() {
        let sql = sanitize_sql("SELECT 1;").unwrap();
        assert_eq!(sql, "SELECT 1");
    }

    #[test]
    fn test_multi_statement_rejected() {
        let err = sanitize_sql("SELECT 1; DROP TABLE users").unwrap_err();
        assert_eq!(err.kind(), "QueryInvalid");
        assert!(err.to_string().contains("DROP TABLE users"));
    }

    #[test]
    fn test_semicolon_inside_literal_allowed() {
        let sql = sanitize_sql("SELECT * FROM notes WHERE body = 'a; b'").unwrap();
        assert!(sql.contains("'a; b'"));
    }

    #[test]
    fn test_information_schema_allowed() {
        let sql = "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public'";
        assert!(sanitize_sql(sql).is_ok());
    }

    #[test]
    fn test_sanitized_sql_shape_invariant() {
        // Anything that survives sanitization starts with SELECT or WITH.
        let candidates = [
            "SELECT 1",
            "  select count(*) from orders  ",
            "WITH t AS (SELECT 1) SELECT * FROM t",
        ];
        for candidate in candidates {
            let sql = sanitize_sql(candidate).unwrap();
            let upper = sql.trim().to_uppercase();
            assert!(
                upper.starts_with("SELECT") || upper.starts_with("WITH"),
                "unexpected shape: {sql}"
            );
            assert!(!sql.trim_end().ends_with(';'));
        }
    }
}
