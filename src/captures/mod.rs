//! Response capture engine.
//!
//! Pulls named values out of a step's response into the runtime scope.
//! One failed extraction nulls that name and logs why; the rest still
//! land.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::context::VariableStore;
use crate::expr::{self, ScriptEngine};
use crate::http::ResponseSnapshot;

/// Runs a `name -> expression` capture map against a response.
///
/// Recognized expression forms:
/// - `status_code`, `response_time`: direct properties
/// - `headers.<name>`: case-insensitive header lookup
/// - `body.<path>`: path extraction on the body
/// - `js:<expr>`: script with the response object and variables bound
/// - anything else: path over the synthesized response object
pub fn run_captures(
    capture: &BTreeMap<String, String>,
    response: &ResponseSnapshot,
    store: &VariableStore,
    scripts: &dyn ScriptEngine,
) -> BTreeMap<String, Value> {
    let mut captured = BTreeMap::new();

    for (name, expression) in capture {
        let value = extract(expression, response, store, scripts);
        match value {
            Ok(value) => {
                debug!(capture = %name, expr = %expression, "capture resolved");
                captured.insert(name.clone(), value);
            }
            Err(reason) => {
                warn!(capture = %name, expr = %expression, error = %reason, "capture failed, storing null");
                captured.insert(name.clone(), Value::Null);
            }
        }
    }

    captured
}

fn extract(
    expression: &str,
    response: &ResponseSnapshot,
    store: &VariableStore,
    scripts: &dyn ScriptEngine,
) -> Result<Value, String> {
    let expression = expression.trim();

    if expression == "status_code" {
        return Ok(json!(response.status_code));
    }
    if expression == "response_time" {
        return Ok(json!(response.response_time_ms));
    }

    if let Some(header) = expression.strip_prefix("headers.") {
        return match response.header(header) {
            Some(value) => Ok(Value::String(value.to_string())),
            None => Err(format!("header '{header}' not present")),
        };
    }

    if let Some(path) = expression.strip_prefix("body.") {
        let value = expr::query_path(&response.body, path).map_err(|e| e.to_string())?;
        if value.is_null() {
            return Err(format!("body path '{path}' resolved to null"));
        }
        return Ok(value);
    }

    if let Some(script) = expression.strip_prefix("js:") {
        let mut ctx = store.merged();
        for (k, v) in response_object(response) {
            ctx.insert(k, v);
        }
        return scripts
            .eval(script.trim(), &ctx)
            .map_err(|e| e.to_string());
    }

    let root = Value::Object(response_object(response));
    let value = expr::query_path(&root, expression).map_err(|e| e.to_string())?;
    if value.is_null() {
        return Err(format!("path '{expression}' resolved to null"));
    }
    Ok(value)
}

/// The synthesized response object captures and scripts run against.
pub(crate) fn response_object(response: &ResponseSnapshot) -> Map<String, Value> {
    let mut headers = Map::new();
    for (name, value) in &response.headers {
        headers.insert(name.to_ascii_lowercase(), json!(value));
    }
    let mut object = Map::new();
    object.insert("status_code".to_string(), json!(response.status_code));
    object.insert("headers".to_string(), Value::Object(headers));
    object.insert("body".to_string(), response.body.clone());
    object.insert(
        "response_time".to_string(),
        json!(response.response_time_ms),
    );
    object
}
