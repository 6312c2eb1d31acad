//! Execution plans with late-bound parameters.
//!
//! A parameter is either a literal or a typed reference to a previous
//! step's output, parsed from the `output_from_step_<n>` wire form the
//! planner emits. Resolution is a fixed point: resolving an
//! already-resolved map returns it unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::error::{GatewayError, Result};

/// Wire prefix for late-bound references.
const STEP_REF_PREFIX: &str = "output_from_step_";

/// A plan parameter: a literal value or a reference to a step's output.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Literal(Value),
    StepRef(usize),
}

impl ParamValue {
    /// Parses a JSON value, recognizing the step-reference token.
    pub fn parse(value: &Value) -> Self {
        if let Some(text) = value.as_str() {
            if let Some(n) = text.strip_prefix(STEP_REF_PREFIX) {
                if let Ok(step) = n.parse::<usize>() {
                    return Self::StepRef(step);
                }
            }
        }
        Self::Literal(value.clone())
    }
}

/// One step of an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_number: usize,
    pub tool_id: String,
    /// Parameters in wire form; step refs stay as their token until
    /// resolution.
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

/// An ordered multi-step plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    /// Parses the planner's JSON into a plan.
    ///
    /// Accepts `{"steps": [...]}` or a bare array. Dependencies implied
    /// by step references are merged into each step's `depends_on`.
    pub fn parse(value: &Value) -> Result<Self> {
        let steps_value = value
            .get("steps")
            .cloned()
            .or_else(|| value.as_array().map(|_| value.clone()))
            .ok_or_else(|| {
                GatewayError::llm_parse("plan JSON has no 'steps' array", value.to_string())
            })?;

        let raw_steps = steps_value.as_array().ok_or_else(|| {
            GatewayError::llm_parse("'steps' is not an array", value.to_string())
        })?;

        let mut steps = Vec::with_capacity(raw_steps.len());
        for (index, raw) in raw_steps.iter().enumerate() {
            let tool_id = raw
                .get("tool_id")
                .or_else(|| raw.get("tool"))
                .and_then(|t| t.as_str())
                .ok_or_else(|| {
                    GatewayError::llm_parse(
                        format!("step {} has no tool_id", index + 1),
                        value.to_string(),
                    )
                })?
                .to_string();

            let parameters: BTreeMap<String, Value> = raw
                .get("parameters")
                .and_then(|p| p.as_object())
                .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();

            let mut depends_on: Vec<usize> = raw
                .get("depends_on")
                .and_then(|d| d.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|i| i.as_u64().map(|n| n as usize))
                        .collect()
                })
                .unwrap_or_default();

            // Step refs imply dependencies even when the planner omits them.
            for param in parameters.values() {
                if let ParamValue::StepRef(n) = ParamValue::parse(param) {
                    if !depends_on.contains(&n) {
                        depends_on.push(n);
                    }
                }
            }
            depends_on.sort_unstable();

            steps.push(PlanStep {
                step_number: raw
                    .get("step_number")
                    .and_then(|n| n.as_u64())
                    .map(|n| n as usize)
                    .unwrap_or(index + 1),
                tool_id,
                parameters,
                description: raw
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default()
                    .to_string(),
                depends_on,
            });
        }

        Ok(Self { steps })
    }
}

/// Resolves step-reference tokens against recorded step outputs.
///
/// Literals pass through untouched, so applying this to an
/// already-resolved map is the identity. A reference to a step with no
/// recorded output is an error.
pub fn resolve_parameters(
    parameters: &BTreeMap<String, Value>,
    step_outputs: &HashMap<usize, Value>,
) -> Result<BTreeMap<String, Value>> {
    let mut resolved = BTreeMap::new();
    for (key, value) in parameters {
        match ParamValue::parse(value) {
            ParamValue::Literal(literal) => {
                resolved.insert(key.clone(), literal);
            }
            ParamValue::StepRef(n) => {
                let output = step_outputs.get(&n).ok_or_else(|| {
                    GatewayError::internal(format!(
                        "parameter '{key}' references step {n}, which has no recorded output"
                    ))
                })?;
                resolved.insert(key.clone(), output.clone());
            }
        }
    }
    Ok(resolved)
}

/// Fills missing required parameters with defaults keyed on tool type.
///
/// Idempotent: present keys are never overwritten, so the executor can
/// run this both at planning and at execution time.
pub fn fill_default_parameters(tool_id: &str, parameters: &mut BTreeMap<String, Value>) {
    let tool = tool_id.to_lowercase();

    if tool.starts_with("postgres.") && tool.contains("quer") {
        parameters.entry("query".to_string()).or_insert_with(|| {
            Value::String(
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'public'"
                    .to_string(),
            )
        });
    }

    if tool.starts_with("mongodb.") && tool.contains("quer") {
        parameters.entry("query".to_string()).or_insert_with(|| {
            serde_json::json!({
                "collection": "sample_orders",
                "pipeline": [{"$count": "count"}]
            })
        });
    }

    if tool.contains("export") || tool.contains("csv") {
        parameters.entry("filepath".to_string()).or_insert_with(|| {
            Value::String(format!("/tmp/tool_output_{}.csv", tool.replace('.', "_")))
        });
    }

    if tool.contains("search") {
        parameters
            .entry("limit".to_string())
            .or_insert_with(|| Value::from(10));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_step_ref_token() {
        assert_eq!(
            ParamValue::parse(&json!("output_from_step_3")),
            ParamValue::StepRef(3)
        );
        assert_eq!(
            ParamValue::parse(&json!("output_from_step_x")),
            ParamValue::Literal(json!("output_from_step_x"))
        );
        assert_eq!(ParamValue::parse(&json!(42)), ParamValue::Literal(json!(42)));
    }

    #[test]
    fn test_parse_plan_with_steps_key() {
        let value = json!({
            "steps": [
                {
                    "step_number": 1,
                    "tool_id": "postgres.execute_query",
                    "parameters": {"query": "SELECT COUNT(*) FROM sample_orders"},
                    "description": "count rows"
                },
                {
                    "step_number": 2,
                    "tool_id": "file_system.export_data_to_csv",
                    "parameters": {"data": "output_from_step_1", "filepath": "/tmp/out.csv"}
                }
            ]
        });
        let plan = ExecutionPlan::parse(&value).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].depends_on, vec![1]);
    }

    #[test]
    fn test_parse_plan_merges_explicit_depends_on() {
        let value = json!({
            "steps": [
                {"step_number": 1, "tool_id": "a", "parameters": {}},
                {
                    "step_number": 2,
                    "tool_id": "b",
                    "parameters": {"data": "output_from_step_1"},
                    "depends_on": [1]
                }
            ]
        });
        let plan = ExecutionPlan::parse(&value).unwrap();
        assert_eq!(plan.steps[1].depends_on, vec![1]);
    }

    #[test]
    fn test_parse_plan_missing_tool_fails() {
        let err = ExecutionPlan::parse(&json!({"steps": [{"parameters": {}}]})).unwrap_err();
        assert_eq!(err.kind(), "LLMParseError");
    }

    #[test]
    fn test_resolution_substitutes_outputs() {
        let mut parameters = BTreeMap::new();
        parameters.insert("data".to_string(), json!("output_from_step_1"));
        parameters.insert("filepath".to_string(), json!("/tmp/out.csv"));

        let mut outputs = HashMap::new();
        outputs.insert(1, json!([{"count": 42}]));

        let resolved = resolve_parameters(&parameters, &outputs).unwrap();
        assert_eq!(resolved["data"], json!([{"count": 42}]));
        assert_eq!(resolved["filepath"], json!("/tmp/out.csv"));
    }

    #[test]
    fn test_resolution_is_fixed_point() {
        let mut parameters = BTreeMap::new();
        parameters.insert("data".to_string(), json!("output_from_step_1"));

        let mut outputs = HashMap::new();
        outputs.insert(1, json!({"rows": 3}));

        let once = resolve_parameters(&parameters, &outputs).unwrap();
        let twice = resolve_parameters(&once, &outputs).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_dangling_reference_errors() {
        let mut parameters = BTreeMap::new();
        parameters.insert("data".to_string(), json!("output_from_step_9"));
        let err = resolve_parameters(&parameters, &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("step 9"));
    }

    #[test]
    fn test_defaults_for_postgres_query() {
        let mut parameters = BTreeMap::new();
        fill_default_parameters("postgres.execute_query", &mut parameters);
        assert!(parameters["query"]
            .as_str()
            .unwrap()
            .contains("information_schema.tables"));
    }

    #[test]
    fn test_defaults_for_mongo_query() {
        let mut parameters = BTreeMap::new();
        fill_default_parameters("mongodb.execute_query", &mut parameters);
        assert_eq!(parameters["query"]["collection"], json!("sample_orders"));
    }

    #[test]
    fn test_defaults_for_export() {
        let mut parameters = BTreeMap::new();
        fill_default_parameters("file_system.export_data_to_csv", &mut parameters);
        assert_eq!(
            parameters["filepath"],
            json!("/tmp/tool_output_file_system_export_data_to_csv.csv")
        );
    }

    #[test]
    fn test_defaults_are_idempotent_and_preserve_existing() {
        let mut parameters = BTreeMap::new();
        parameters.insert("query".to_string(), json!("SELECT 1"));
        fill_default_parameters("postgres.execute_query", &mut parameters);
        assert_eq!(parameters["query"], json!("SELECT 1"));

        let snapshot = parameters.clone();
        fill_default_parameters("postgres.execute_query", &mut parameters);
        assert_eq!(parameters, snapshot);
    }
}
