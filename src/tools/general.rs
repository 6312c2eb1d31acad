//! General-purpose tools registered alongside the adapter cores.
//!
//! File export and row summarization helpers that the planner can chain
//! after any database tool.

use serde_json::{json, Value};
use std::io::Write;
use std::path::Path;

use crate::error::{GatewayError, Result};

/// Exports an array of row objects to a CSV file.
///
/// Parameters: `data` (array of objects, or an object wrapping one under
/// `rows`/`result`) and `filepath`. Returns the path and row count.
pub fn export_data_to_csv(params: Value) -> Result<Value> {
    let filepath = params
        .get("filepath")
        .and_then(|f| f.as_str())
        .ok_or_else(|| GatewayError::tool("file_system.export_data_to_csv", "missing 'filepath'"))?
        .to_string();

    let rows = extract_rows(params.get("data").cloned().unwrap_or(Value::Null));

    let mut header: Vec<String> = Vec::new();
    for row in &rows {
        if let Some(object) = row.as_object() {
            for key in object.keys() {
                if !header.contains(key) {
                    header.push(key.clone());
                }
            }
        }
    }

    if let Some(parent) = Path::new(&filepath).parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            GatewayError::tool(
                "file_system.export_data_to_csv",
                format!("cannot create directory: {e}"),
            )
        })?;
    }

    let mut file = std::fs::File::create(&filepath).map_err(|e| {
        GatewayError::tool(
            "file_system.export_data_to_csv",
            format!("cannot create {filepath}: {e}"),
        )
    })?;

    let write_error = |e: std::io::Error| {
        GatewayError::tool("file_system.export_data_to_csv", format!("write failed: {e}"))
    };

    writeln!(file, "{}", header.join(",")).map_err(write_error)?;
    for row in &rows {
        let record: Vec<String> = header
            .iter()
            .map(|key| {
                row.get(key)
                    .map(csv_field)
                    .unwrap_or_default()
            })
            .collect();
        writeln!(file, "{}", record.join(",")).map_err(write_error)?;
    }

    Ok(json!({
        "filepath": filepath,
        "rows_written": rows.len(),
        "columns": header,
    }))
}

/// Summarizes an array of rows: count, column names, numeric ranges.
pub fn summarize_rows(params: Value) -> Result<Value> {
    let rows = extract_rows(params.get("data").cloned().unwrap_or(Value::Null));

    let mut columns: Vec<String> = Vec::new();
    for row in &rows {
        if let Some(object) = row.as_object() {
            for key in object.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
    }

    let mut numeric_ranges = serde_json::Map::new();
    for column in &columns {
        let values: Vec<f64> = rows
            .iter()
            .filter_map(|row| row.get(column).and_then(|v| v.as_f64()))
            .collect();
        if !values.is_empty() {
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            numeric_ranges.insert(column.clone(), json!({"min": min, "max": max}));
        }
    }

    Ok(json!({
        "row_count": rows.len(),
        "columns": columns,
        "numeric_ranges": numeric_ranges,
    }))
}

/// Pulls a row array out of the shapes tools hand each other.
fn extract_rows(data: Value) -> Vec<Value> {
    match data {
        Value::Array(rows) => rows,
        Value::Object(map) => {
            for key in ["rows", "result", "data"] {
                if let Some(Value::Array(rows)) = map.get(key) {
                    return rows.clone();
                }
            }
            vec![Value::Object(map)]
        }
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Quotes a CSV field when needed.
fn csv_field(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    if text.contains(',') || text.contains('"') || text.contains('\n') {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_csv_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let result = export_data_to_csv(json!({
            "data": [
                {"count": 42, "name": "alpha"},
                {"count": 7, "name": "beta, with comma"}
            ],
            "filepath": path.to_str().unwrap(),
        }))
        .unwrap();

        assert_eq!(result["rows_written"], json!(2));
        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("count,name"));
        assert_eq!(lines.next(), Some("42,alpha"));
        assert_eq!(lines.next(), Some("7,\"beta, with comma\""));
    }

    #[test]
    fn test_export_csv_missing_filepath_fails() {
        let err = export_data_to_csv(json!({"data": []})).unwrap_err();
        assert_eq!(err.kind(), "ToolExecutionFailed");
    }

    #[test]
    fn test_export_csv_accepts_wrapped_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wrapped.csv");
        let result = export_data_to_csv(json!({
            "data": {"rows": [{"a": 1}]},
            "filepath": path.to_str().unwrap(),
        }))
        .unwrap();
        assert_eq!(result["rows_written"], json!(1));
    }

    #[test]
    fn test_summarize_rows() {
        let result = summarize_rows(json!({
            "data": [
                {"count": 10, "label": "x"},
                {"count": 30, "label": "y"}
            ]
        }))
        .unwrap();
        assert_eq!(result["row_count"], json!(2));
        assert_eq!(result["numeric_ranges"]["count"]["min"], json!(10.0));
        assert_eq!(result["numeric_ranges"]["count"]["max"], json!(30.0));
    }

    #[test]
    fn test_extract_rows_shapes() {
        assert_eq!(extract_rows(json!([1, 2])).len(), 2);
        assert_eq!(extract_rows(json!({"rows": [1]})).len(), 1);
        assert_eq!(extract_rows(json!({"other": true})).len(), 1);
        assert_eq!(extract_rows(Value::Null).len(), 0);
    }
}
