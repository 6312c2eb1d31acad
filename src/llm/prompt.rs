//! Prompt construction for LLM requests.
//!
//! Holds the query-translation templates and a pure `render_template`
//! that substitutes `{placeholder}` slots. Rendering never performs I/O.

use std::collections::HashMap;

/// Template for translating natural language to PostgreSQL.
pub const NL2SQL_TEMPLATE: &str = r#"You are a SQL assistant for a PostgreSQL database. Generate a SQL query answering the user's question.

DATABASE SCHEMA:
{schema}

QUESTION:
{question}

INSTRUCTIONS:
- Generate only valid PostgreSQL SQL
- Use a single SELECT statement (WITH ... SELECT is allowed)
- Never generate INSERT, UPDATE, DELETE, or DDL
- Use appropriate JOINs based on foreign keys
- Limit results to 100 rows unless the question specifies otherwise

OUTPUT FORMAT:
Return the SQL query wrapped in ```sql code blocks."#;

/// Template for translating natural language to a MongoDB aggregation.
pub const MONGO_QUERY_TEMPLATE: &str = r#"You are a MongoDB assistant. Translate the user's question into an aggregation pipeline.

COLLECTIONS:
{schema}

QUESTION:
{question}

OUTPUT FORMAT:
Return ONLY a JSON object of the form:
{"collection": "<name>", "pipeline": [ ...aggregation stages... ]}
Use {default_collection} as the collection when the question does not name one."#;

/// Template for translating natural language to a GA4 report request.
pub const GA4_QUERY_TEMPLATE: &str = r#"You are a Google Analytics 4 assistant. Translate the user's question into a report request.

AVAILABLE DIMENSIONS AND METRICS:
{schema}

QUESTION:
{question}

OUTPUT FORMAT:
Return ONLY a JSON object of the form:
{"dimensions": [...], "metrics": [...], "date_ranges": [{"start": "YYYY-MM-DD", "end": "YYYY-MM-DD"} or {"relative": "last 7 days"}], "order_bys": [...], "limit": <n>}"#;

/// Template for narrating a query result set.
pub const ANALYZE_RESULTS_TEMPLATE: &str = r#"You are a data analyst. The user asked:

{question}

The query returned these rows (JSON):
{rows}

Write a concise narrative answer grounded in the rows. Mention concrete numbers. Do not speculate beyond the data."#;

/// Template for one step of the multi-turn analysis loop.
pub const ORCHESTRATE_STEP_TEMPLATE: &str = r#"You are iteratively analyzing data from a {db_type} backend to answer:

{question}

Findings so far:
{findings}

Either respond with FINAL: <answer> when the findings are sufficient, or NEXT: <a focused follow-up question to run against the backend>."#;

/// Renders a template by substituting `{key}` placeholders from the
/// context. Unknown placeholders are left intact; rendering is pure.
pub fn render_template(template: &str, context: &HashMap<&str, String>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in context {
        rendered = rendered.replace(&format!("{{{key}}}"), value);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let rendered = render_template(
            NL2SQL_TEMPLATE,
            &ctx(&[
                ("schema", "Table: orders (id, total)"),
                ("question", "how many orders?"),
            ]),
        );
        assert!(rendered.contains("Table: orders"));
        assert!(rendered.contains("how many orders?"));
        assert!(!rendered.contains("{schema}"));
        assert!(!rendered.contains("{question}"));
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let rendered = render_template("a {known} and {unknown}", &ctx(&[("known", "value")]));
        assert_eq!(rendered, "a value and {unknown}");
    }

    #[test]
    fn test_render_is_pure() {
        let context = ctx(&[("question", "q"), ("schema", "s"), ("default_collection", "c")]);
        let first = render_template(MONGO_QUERY_TEMPLATE, &context);
        let second = render_template(MONGO_QUERY_TEMPLATE, &context);
        assert_eq!(first, second);
    }

    #[test]
    fn test_mongo_template_keeps_literal_json_braces() {
        let rendered = render_template(
            MONGO_QUERY_TEMPLATE,
            &ctx(&[("schema", "s"), ("question", "q"), ("default_collection", "orders")]),
        );
        // The JSON shape example survives rendering untouched.
        assert!(rendered.contains(r#"{"collection": "<name>""#));
        assert!(rendered.contains("Use orders as the collection"));
    }
}
