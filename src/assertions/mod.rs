//! Declarative assertion evaluation.
//!
//! An assertion document is a tree keyed by `status_code`, `response_time`,
//! `headers`, `body`, or arbitrary field paths over the combined response
//! object. Leaf values are either a primitive (equality shorthand) or an
//! operator map. Every operator evaluation emits exactly one result, pass
//! or fail, so the report always shows what was checked.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::errors::ErrorCode;
use crate::expr;
use crate::http::ResponseSnapshot;

/// Outcome of a single operator evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionResult {
    /// Dotted path of the evaluation, e.g. `body.items.length.greater_than`.
    pub assertion: String,
    pub expected: Value,
    pub actual: Value,
    pub passed: bool,
    pub message: String,
}

impl AssertionResult {
    fn passed(assertion: String, expected: Value, actual: Value) -> Self {
        let message = format!("{assertion} check passed");
        Self {
            assertion,
            expected,
            actual,
            passed: true,
            message,
        }
    }

    fn failed(assertion: String, expected: Value, actual: Value, detail: String) -> Self {
        Self {
            assertion,
            expected,
            actual,
            passed: false,
            message: detail,
        }
    }
}

/// Evaluates an assertion document against a response. One result per
/// operator; a step fails validation iff any result has `passed == false`.
pub fn evaluate(assertions: &Value, response: &ResponseSnapshot) -> Vec<AssertionResult> {
    let mut results = Vec::new();

    let doc = match assertions.as_object() {
        Some(map) => map,
        None => {
            results.push(AssertionResult::failed(
                "assertions".to_string(),
                assertions.clone(),
                Value::Null,
                "assertions document must be a map".to_string(),
            ));
            return results;
        }
    };

    for (key, spec) in doc {
        match key.as_str() {
            "status_code" => {
                apply(&mut results, "status_code", json!(response.status_code), spec);
            }
            "response_time" => {
                apply(
                    &mut results,
                    "response_time",
                    json!(response.response_time_ms),
                    spec,
                );
            }
            "headers" => evaluate_headers(&mut results, spec, response),
            "body" => evaluate_body(&mut results, spec, &response.body),
            other => {
                let combined = combined_object(response);
                match expr::query_path(&combined, other) {
                    Ok(actual) => apply(&mut results, other, actual, spec),
                    Err(e) => results.push(AssertionResult::failed(
                        other.to_string(),
                        spec.clone(),
                        Value::Null,
                        format!("Assertion failed: {e}"),
                    )),
                }
            }
        }
    }

    results
}

/// Count of failing results, for log lines and combined error messages.
pub fn failing(results: &[AssertionResult]) -> Vec<&AssertionResult> {
    results.iter().filter(|r| !r.passed).collect()
}

fn evaluate_headers(results: &mut Vec<AssertionResult>, spec: &Value, response: &ResponseSnapshot) {
    let map = match spec.as_object() {
        Some(map) => map,
        None => {
            results.push(AssertionResult::failed(
                "headers".to_string(),
                spec.clone(),
                Value::Null,
                "headers assertion must be a map of header name to check".to_string(),
            ));
            return;
        }
    };

    for (name, header_spec) in map {
        let actual = response
            .header(name)
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null);
        apply(results, &format!("headers.{name}"), actual, header_spec);
    }
}

fn evaluate_body(results: &mut Vec<AssertionResult>, spec: &Value, body: &Value) {
    let map = match spec.as_object() {
        Some(map) => map,
        None => {
            // A bare value asserts equality on the whole body.
            apply(results, "body", body.clone(), spec);
            return;
        }
    };

    // Operator map applied to the body itself, not a set of field paths.
    if map.keys().all(|k| is_operator(k)) && !map.is_empty() {
        apply(results, "body", body.clone(), spec);
        return;
    }

    for (path, field_spec) in map {
        match expr::query_path(body, path) {
            Ok(actual) => apply(results, &format!("body.{path}"), actual, field_spec),
            Err(e) => {
                warn!(path = %path, code = %ErrorCode::ASSERTION_EXTRACTION, error = %e, "body path extraction failed");
                results.push(AssertionResult::failed(
                    format!("body.{path}"),
                    field_spec.clone(),
                    Value::Null,
                    format!("Assertion failed: {e}"),
                ));
            }
        }
    }
}

const OPERATORS: &[&str] = &[
    "equals",
    "not_equals",
    "contains",
    "greater_than",
    "less_than",
    "regex",
    "not_null",
    "type",
    "length",
];

fn is_operator(key: &str) -> bool {
    OPERATORS.contains(&key)
}

/// Applies either the equality shorthand or each entry of an operator map.
/// `length` recurses here rather than in `eval_operator` so that an
/// operator map over the length still emits one result per operator.
fn apply(results: &mut Vec<AssertionResult>, path: &str, actual: Value, spec: &Value) {
    match spec.as_object() {
        Some(ops) => {
            for (op, expected) in ops {
                if op == "length" {
                    match length_of(&actual) {
                        Some(len) => {
                            apply(results, &format!("{path}.length"), json!(len), expected);
                        }
                        None => results.push(AssertionResult::failed(
                            format!("{path}.length"),
                            expected.clone(),
                            actual.clone(),
                            format!(
                                "Assertion failed: cannot take length of {}",
                                type_name(&actual)
                            ),
                        )),
                    }
                    continue;
                }
                results.push(eval_operator(path, op, expected, &actual));
            }
        }
        None => {
            results.push(eval_operator(path, "equals", spec, &actual));
        }
    }
}

fn eval_operator(path: &str, op: &str, expected: &Value, actual: &Value) -> AssertionResult {
    let assertion = format!("{path}.{op}");

    match op {
        "equals" => verdict(assertion, expected, actual, json_eq(actual, expected)),
        "not_equals" => verdict(assertion, expected, actual, !json_eq(actual, expected)),
        "contains" => verdict(assertion, expected, actual, contains(actual, expected)),
        "greater_than" | "less_than" => match (as_number(actual), as_number(expected)) {
            (Some(a), Some(b)) => {
                let passed = if op == "greater_than" { a > b } else { a < b };
                verdict(assertion, expected, actual, passed)
            }
            _ => AssertionResult::failed(
                assertion.clone(),
                expected.clone(),
                actual.clone(),
                format!("Assertion failed: {assertion} requires numeric operands"),
            ),
        },
        "regex" => {
            let pattern = match expected.as_str() {
                Some(p) => p,
                None => {
                    return AssertionResult::failed(
                        assertion.clone(),
                        expected.clone(),
                        actual.clone(),
                        format!("Assertion failed: {assertion} pattern must be a string"),
                    );
                }
            };
            match Regex::new(pattern) {
                Ok(re) => {
                    let text = text_of(actual);
                    verdict(assertion, expected, actual, re.is_match(&text))
                }
                Err(e) => AssertionResult::failed(
                    assertion.clone(),
                    expected.clone(),
                    actual.clone(),
                    format!("Assertion failed: invalid regex pattern: {e}"),
                ),
            }
        }
        "not_null" => {
            let expect_present = truthy(expected);
            let passed = if expect_present {
                !actual.is_null()
            } else {
                actual.is_null()
            };
            verdict(assertion, expected, actual, passed)
        }
        "type" => {
            let actual_type = type_name(actual);
            let passed = expected.as_str() == Some(actual_type);
            verdict(assertion, expected, &json!(actual_type), passed)
        }
        _ => {
            warn!(operator = %op, code = %ErrorCode::ASSERTION_UNKNOWN_OPERATOR, "unknown assertion operator");
            AssertionResult::failed(
                assertion.clone(),
                expected.clone(),
                actual.clone(),
                "Unknown assertion operator".to_string(),
            )
        }
    }
}

fn verdict(assertion: String, expected: &Value, actual: &Value, passed: bool) -> AssertionResult {
    if passed {
        AssertionResult::passed(assertion, expected.clone(), actual.clone())
    } else {
        let detail = format!(
            "Assertion failed: {} expected {} (got {})",
            assertion, expected, actual
        );
        AssertionResult::failed(assertion, expected.clone(), actual.clone(), detail)
    }
}

/// Deep equality by JSON serialization.
fn json_eq(a: &Value, b: &Value) -> bool {
    serde_json::to_string(a).ok() == serde_json::to_string(b).ok()
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(s) => s.contains(&text_of(expected)),
        Value::Array(items) => items.iter().any(|item| json_eq(item, expected)),
        Value::Object(_) => {
            let haystack = serde_json::to_string(actual).unwrap_or_default();
            let needle = match expected {
                Value::String(s) => s.clone(),
                other => serde_json::to_string(other).unwrap_or_default(),
            };
            haystack.contains(&needle)
        }
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::Array(items) => Some(items.len()),
        Value::String(s) => Some(s.chars().count()),
        Value::Object(map) => Some(map.len()),
        _ => None,
    }
}

fn combined_object(response: &ResponseSnapshot) -> Value {
    let mut headers = Map::new();
    for (name, value) in &response.headers {
        headers.insert(name.to_ascii_lowercase(), json!(value));
    }
    json!({
        "status_code": response.status_code,
        "headers": headers,
        "body": response.body,
        "response_time": response.response_time_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: Value) -> ResponseSnapshot {
        ResponseSnapshot {
            status_code: status,
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("X-Request-Id".to_string(), "r-1".to_string()),
            ],
            body,
            size_bytes: 0,
            response_time_ms: 42,
            raw_response: String::new(),
        }
    }

    #[test]
    fn equality_shorthand_on_status_code() {
        let results = evaluate(&json!({"status_code": 200}), &response(200, json!({})));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].assertion, "status_code.equals");
        assert!(results[0].passed);
    }

    #[test]
    fn failed_status_carries_a_message_with_both_values() {
        let results = evaluate(&json!({"status_code": 200}), &response(500, json!({})));
        assert!(!results[0].passed);
        assert!(results[0].message.contains("200"));
        assert!(results[0].message.contains("500"));
    }

    #[test]
    fn operator_coverage_over_array_lengths() {
        // Response {"items":[1,2,3]}: length gt 2, length lt 5, contains 2.
        // All pass, three results total.
        let body = json!({"items": [1, 2, 3]});
        let doc = json!({
            "body": {
                "items": {
                    "length": {"greater_than": 2, "less_than": 5},
                    "contains": 2
                }
            }
        });
        let results = evaluate(&doc, &response(200, body));

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.passed), "{results:#?}");
        assert!(results
            .iter()
            .any(|r| r.assertion == "body.items.length.greater_than"));
        assert!(results
            .iter()
            .any(|r| r.assertion == "body.items.length.less_than"));
    }

    #[test]
    fn multiple_operators_emit_one_result_each() {
        let doc = json!({"status_code": {"greater_than": 199, "less_than": 300}});
        let results = evaluate(&doc, &response(204, json!({})));
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.passed));
    }

    #[test]
    fn headers_are_case_insensitive() {
        let doc = json!({"headers": {"content-type": {"contains": "json"}}});
        let results = evaluate(&doc, &response(200, json!({})));
        assert!(results[0].passed);
    }

    #[test]
    fn body_paths_use_dot_notation() {
        let body = json!({"user": {"email": "a@b.co"}});
        let doc = json!({"body": {"user.email": {"regex": "^[a-z]+@[a-z.]+$"}}});
        let results = evaluate(&doc, &response(200, body));
        assert!(results[0].passed, "{}", results[0].message);
    }

    #[test]
    fn invalid_regex_fails_the_assertion() {
        let doc = json!({"body": {"x": {"regex": "(["}}});
        let results = evaluate(&doc, &response(200, json!({"x": "v"})));
        assert!(!results[0].passed);
        assert!(results[0].message.contains("invalid regex"));
    }

    #[test]
    fn unknown_operator_is_reported_as_such() {
        let doc = json!({"status_code": {"approximately": 200}});
        let results = evaluate(&doc, &response(200, json!({})));
        assert!(!results[0].passed);
        assert_eq!(results[0].message, "Unknown assertion operator");
    }

    #[test]
    fn non_numeric_comparison_fails() {
        let doc = json!({"body": {"name": {"greater_than": 5}}});
        let results = evaluate(&doc, &response(200, json!({"name": "abc"})));
        assert!(!results[0].passed);
        assert!(results[0].message.contains("numeric"));
    }

    #[test]
    fn not_null_respects_expected_truthiness() {
        let body = json!({"present": 1, "absent": null});
        let doc = json!({"body": {
            "present": {"not_null": true},
            "absent": {"not_null": false}
        }});
        let results = evaluate(&doc, &response(200, body));
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.passed));
    }

    #[test]
    fn type_operator_reports_arrays_as_array() {
        let body = json!({"items": [1]});
        let doc = json!({"body": {"items": {"type": "array"}}});
        let results = evaluate(&doc, &response(200, body));
        assert!(results[0].passed);
    }

    #[test]
    fn length_of_scalar_fails() {
        let doc = json!({"body": {"n": {"length": {"equals": 1}}}});
        let results = evaluate(&doc, &response(200, json!({"n": 7})));
        assert!(!results[0].passed);
        assert!(results[0].message.contains("cannot take length"));
    }

    #[test]
    fn length_over_object_counts_keys() {
        let doc = json!({"body": {"obj": {"length": {"equals": 2}}}});
        let results = evaluate(&doc, &response(200, json!({"obj": {"a": 1, "b": 2}})));
        assert!(results[0].passed, "{}", results[0].message);
    }

    #[test]
    fn contains_on_string_array_and_object() {
        let body = json!({
            "text": "hello world",
            "list": [1, 2, 3],
            "obj": {"inner": "needle"}
        });
        let doc = json!({"body": {
            "text": {"contains": "world"},
            "list": {"contains": 2},
            "obj": {"contains": "needle"}
        }});
        let results = evaluate(&doc, &response(200, body));
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.passed), "{results:#?}");
    }

    #[test]
    fn arbitrary_keys_are_paths_over_the_combined_object() {
        let doc = json!({"response_time": {"less_than": 1000}});
        let results = evaluate(&doc, &response(200, json!({})));
        assert!(results[0].passed);
    }

    #[test]
    fn missing_path_extraction_yields_null_actual() {
        let doc = json!({"body": {"missing.deep": {"not_null": true}}});
        let results = evaluate(&doc, &response(200, json!({})));
        assert!(!results[0].passed);
    }

    #[test]
    fn failing_helper_filters() {
        let doc = json!({"status_code": {"equals": 200, "less_than": 100}});
        let results = evaluate(&doc, &response(200, json!({})));
        assert_eq!(failing(&results).len(), 1);
    }
}
