//! Step execution pipeline.
//!
//! Every step goes through the same stations: interpolate the authored
//! fields, short-circuit on `skip`, dispatch on the step kind, validate
//! assertions, run captures, build the record. Step-level retry wraps the
//! whole attempt, so a failed assertion re-runs the request too.
//!
//! A transport-level failure preempts assertions: the step fails with the
//! typed transport message and the assertion phase never runs.

use chrono::Utc;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::assertions::{self, AssertionResult};
use crate::calls;
use crate::captures::{self, response_object};
use crate::context::{stringify, VariableStore};
use crate::engine::ExecContext;
use crate::errors::ErrorCode;
use crate::http::{RequestSnapshot, ResolvedRequest, ResponseSnapshot};
use crate::runs::{StepRunRecord, StepStatus};
use crate::suite::validate::parse_range;
use crate::suite::{
    CallSpec, InputSpec, InputType, IterateSpec, RequestSpec, ScenarioClause, Step, StepKind,
};

pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;

/// Outcome of one attempt, before retry bookkeeping.
#[derive(Debug, Default)]
struct Attempt {
    status: Option<StepStatus>,
    request_snapshot: Option<RequestSnapshot>,
    response_snapshot: Option<ResponseSnapshot>,
    captures: BTreeMap<String, Value>,
    assertion_results: Vec<AssertionResult>,
    error_message: Option<String>,
}

impl Attempt {
    fn status(&self) -> StepStatus {
        self.status.unwrap_or(StepStatus::Success)
    }

    fn failed(message: String) -> Self {
        Self {
            status: Some(StepStatus::Failed),
            error_message: Some(message),
            ..Default::default()
        }
    }
}

/// Boxed entry point for recursion (iterate bodies, call targets).
pub fn execute_step_boxed<'a>(
    step: &'a Step,
    index: usize,
    store: &'a mut VariableStore,
    ctx: &'a ExecContext,
) -> Pin<Box<dyn Future<Output = StepRunRecord> + Send + 'a>> {
    Box::pin(execute_step(step, index, store, ctx))
}

/// Executes one step, retries included, and returns its durable record.
pub async fn execute_step(
    step: &Step,
    index: usize,
    store: &mut VariableStore,
    ctx: &ExecContext,
) -> StepRunRecord {
    let started_at = Utc::now();
    let timer = Instant::now();
    let qualified_step_id = format!("{}::{}", ctx.suite_namespace, step.identifier());

    if step.skip {
        info!(step = %step.name, "step skipped");
        return StepRunRecord {
            step_index: index,
            step_name: step.name.clone(),
            step_id: step.step_id.clone(),
            qualified_step_id,
            status: StepStatus::Skipped,
            duration_ms: 0,
            request_snapshot: None,
            response_snapshot: None,
            captures: BTreeMap::new(),
            assertion_results: Vec::new(),
            error_message: None,
            started_at,
            finished_at: Utc::now(),
        };
    }

    let max_attempts = step.retry().map(|r| r.max_attempts.max(1)).unwrap_or(1);
    let delay_ms = step.retry().map(|r| r.delay_ms).unwrap_or(0);

    let mut attempt = attempt_with_timeout(step, store, ctx).await;
    let mut attempts_made = 1;
    while attempt.status() == StepStatus::Failed && attempts_made < max_attempts {
        warn!(
            step = %step.name,
            attempt = attempts_made,
            max_attempts,
            error = attempt.error_message.as_deref().unwrap_or("unknown"),
            "step attempt failed, retrying"
        );
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        attempt = attempt_with_timeout(step, store, ctx).await;
        attempts_made += 1;
    }

    let status = attempt.status();
    let duration_ms = timer.elapsed().as_millis() as u64;
    info!(
        step = %step.name,
        status = ?status,
        duration_ms,
        attempts = attempts_made,
        "step finished"
    );

    StepRunRecord {
        step_index: index,
        step_name: step.name.clone(),
        step_id: step.step_id.clone(),
        qualified_step_id,
        status,
        duration_ms,
        request_snapshot: attempt.request_snapshot,
        response_snapshot: attempt.response_snapshot,
        captures: attempt.captures,
        assertion_results: attempt.assertion_results,
        error_message: attempt.error_message,
        started_at,
        finished_at: Utc::now(),
    }
}

/// Step metadata may bound the whole attempt, on top of the per-request
/// timeout the HTTP layer applies.
async fn attempt_with_timeout(
    step: &Step,
    store: &mut VariableStore,
    ctx: &ExecContext,
) -> Attempt {
    match step.timeout_ms() {
        Some(ms) => {
            match tokio::time::timeout(Duration::from_millis(ms), run_attempt(step, store, ctx))
                .await
            {
                Ok(attempt) => attempt,
                Err(_) => Attempt::failed(format!("Timeout after {ms}ms")),
            }
        }
        None => run_attempt(step, store, ctx).await,
    }
}

async fn run_attempt(step: &Step, store: &mut VariableStore, ctx: &ExecContext) -> Attempt {
    match &step.kind {
        StepKind::Request(spec) => run_request(step, spec, store, ctx).await,
        StepKind::Call(spec) => run_call(spec, store, ctx).await,
        StepKind::Input(spec) => run_input(spec, store, ctx),
        StepKind::Iterate(spec) => run_iterate(spec, store, ctx).await,
        StepKind::Scenarios(clauses) => run_scenarios_only(clauses, store, ctx),
    }
}

async fn run_request(
    step: &Step,
    spec: &RequestSpec,
    store: &mut VariableStore,
    ctx: &ExecContext,
) -> Attempt {
    let scripts = ctx.scripts.as_ref();

    let url = stringify(&store.interpolate_str(&spec.url, scripts));
    let headers: Vec<(String, String)> = spec
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), stringify(&store.interpolate(v, scripts))))
        .collect();
    let params: Vec<(String, String)> = spec
        .params
        .iter()
        .map(|(k, v)| (k.clone(), stringify(&store.interpolate(v, scripts))))
        .collect();
    let body = spec.body.as_ref().map(|b| store.interpolate(b, scripts));

    let timeout_ms = spec
        .timeout_ms
        .or_else(|| step.timeout_ms())
        .unwrap_or(DEFAULT_STEP_TIMEOUT_MS);

    let resolved = ResolvedRequest {
        method: spec.method,
        url,
        headers,
        params,
        body,
        timeout: Duration::from_millis(timeout_ms),
    };

    let outcome = ctx
        .http
        .execute(&step.name, &resolved, ctx.base_url.as_deref())
        .await;

    let mut attempt = Attempt {
        request_snapshot: Some(outcome.request),
        ..Default::default()
    };

    // Transport failure: the typed message is the step error and
    // assertions are not attempted.
    if let Some(error) = outcome.error {
        attempt.status = Some(StepStatus::Failed);
        attempt.error_message = Some(error);
        return attempt;
    }
    let response = outcome.response.expect("response present without error");

    let (extra_assertions, extra_captures) =
        apply_scenarios(&spec.scenarios, Some(&response), store, ctx);

    let mut results = Vec::new();
    if let Some(assertions_doc) = &spec.assertions {
        results.extend(assertions::evaluate(assertions_doc, &response));
    }
    for doc in &extra_assertions {
        results.extend(assertions::evaluate(doc, &response));
    }

    let failing: Vec<String> = results
        .iter()
        .filter(|r| !r.passed)
        .map(|r| r.message.clone())
        .collect();

    if !failing.is_empty() {
        warn!(step = %step.name, code = %ErrorCode::ASSERTION_FAILED, failures = failing.len(), "assertions failed");
        attempt.status = Some(StepStatus::Failed);
        attempt.error_message = Some(failing.join("; "));
        attempt.assertion_results = results;
        attempt.response_snapshot = Some(response);
        return attempt;
    }

    let mut capture_map = spec.capture.clone();
    capture_map.extend(extra_captures);
    if !capture_map.is_empty() {
        let captured = captures::run_captures(&capture_map, &response, store, scripts);
        for (name, value) in &captured {
            store.set_runtime(name.clone(), value.clone());
        }
        attempt.captures = captured;
    }

    attempt.status = Some(StepStatus::Success);
    attempt.assertion_results = results;
    attempt.response_snapshot = Some(response);
    attempt
}

async fn run_call(spec: &CallSpec, store: &mut VariableStore, ctx: &ExecContext) -> Attempt {
    let scripts = ctx.scripts.as_ref();

    // Target fields may themselves be templated.
    let mut call = spec.clone();
    call.test = stringify(&store.interpolate_str(&spec.test, scripts));
    call.step = stringify(&store.interpolate_str(&spec.step, scripts));
    if let Some(alias) = &spec.alias {
        call.alias = Some(stringify(&store.interpolate_str(alias, scripts)));
    }

    let outcome = calls::execute_call(&call, store, ctx).await;

    let mut attempt = Attempt::default();
    if let Some(callee) = &outcome.callee_step {
        attempt.request_snapshot = callee.request_snapshot.clone();
        attempt.response_snapshot = callee.response_snapshot.clone();
        attempt.assertion_results = callee.assertion_results.clone();
    }

    if outcome.succeeded {
        for (name, value) in &outcome.propagated {
            store.set_runtime(name.clone(), value.clone());
        }
        attempt.captures = outcome.propagated;
        match outcome.warning {
            Some(warning) => {
                attempt.status = Some(StepStatus::Warning);
                attempt.error_message = Some(warning);
            }
            None => attempt.status = Some(StepStatus::Success),
        }
    } else {
        attempt.status = Some(StepStatus::Failed);
        attempt.error_message = outcome.error;
    }
    attempt
}

fn run_input(spec: &InputSpec, store: &mut VariableStore, ctx: &ExecContext) -> Attempt {
    let scripts = ctx.scripts.as_ref();

    let provided = ctx.input_payload.get(&spec.variable).cloned().or_else(|| {
        spec.default
            .as_ref()
            .map(|default| store.interpolate(default, scripts))
    });

    let Some(value) = provided else {
        if !spec.required {
            return Attempt {
                status: Some(StepStatus::Success),
                ..Default::default()
            };
        }
        warn!(
            variable = %spec.variable,
            code = %ErrorCode::INPUT_MISSING,
            "required input not provided, suspending run"
        );
        return Attempt {
            status: Some(StepStatus::WaitingInput),
            error_message: Some(format!(
                "waiting for input '{}' ({})",
                spec.variable, spec.prompt
            )),
            ..Default::default()
        };
    };

    let value = match coerce_input(spec, value) {
        Ok(value) => value,
        Err(reason) => return Attempt::failed(reason),
    };

    store.set_runtime(spec.variable.clone(), value.clone());

    let mut captures = BTreeMap::new();
    let recorded = if spec.input_type == InputType::Password {
        json!("***")
    } else {
        value
    };
    captures.insert(spec.variable.clone(), recorded);

    Attempt {
        status: Some(StepStatus::Success),
        captures,
        ..Default::default()
    }
}

/// Validates and coerces an input value against its declared type.
fn coerce_input(spec: &InputSpec, value: Value) -> Result<Value, String> {
    let value = match spec.input_type {
        InputType::Number => match &value {
            Value::Number(_) => value,
            Value::String(s) => match s.parse::<f64>() {
                Ok(n) => json!(n),
                Err(_) => {
                    return Err(format!("input '{}' is not a number: '{s}'", spec.variable))
                }
            },
            _ => return Err(format!("input '{}' is not a number", spec.variable)),
        },
        InputType::Confirm => match &value {
            Value::Bool(_) => value,
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" => json!(true),
                "false" | "no" | "n" => json!(false),
                other => {
                    return Err(format!(
                        "input '{}' is not a confirmation: '{other}'",
                        spec.variable
                    ))
                }
            },
            _ => return Err(format!("input '{}' is not a confirmation", spec.variable)),
        },
        InputType::Email => {
            let text = value.as_str().unwrap_or_default();
            if !text.contains('@') || !text.contains('.') {
                return Err(format!(
                    "input '{}' is not a valid email: '{text}'",
                    spec.variable
                ));
            }
            value
        }
        InputType::Url => {
            let text = value.as_str().unwrap_or_default();
            if !text.starts_with("http://") && !text.starts_with("https://") {
                return Err(format!(
                    "input '{}' is not a valid url: '{text}'",
                    spec.variable
                ));
            }
            value
        }
        InputType::Select => {
            if !spec.options.is_empty() && !spec.options.contains(&value) {
                return Err(format!(
                    "input '{}' is not one of the allowed options",
                    spec.variable
                ));
            }
            value
        }
        InputType::Text | InputType::Password | InputType::Multiline => value,
    };

    if let Some(pattern) = &spec.pattern {
        let re = Regex::new(pattern)
            .map_err(|e| format!("input '{}' has an invalid pattern: {e}", spec.variable))?;
        let text = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if !re.is_match(&text) {
            return Err(format!(
                "input '{}' does not match pattern '{pattern}'",
                spec.variable
            ));
        }
    }

    Ok(value)
}

async fn run_iterate(spec: &IterateSpec, store: &mut VariableStore, ctx: &ExecContext) -> Attempt {
    let scripts = ctx.scripts.as_ref();

    let items: Vec<Value> = if let Some(over) = &spec.over {
        match store.interpolate_str(over, scripts) {
            Value::Array(items) => items,
            other => {
                return Attempt::failed(format!(
                    "iterate 'over' did not resolve to an array (got {})",
                    type_label(&other)
                ));
            }
        }
    } else if let Some(range) = &spec.range {
        let resolved = stringify(&store.interpolate_str(range, scripts));
        match parse_range(&resolved) {
            Some((start, end)) => (start..end).map(|n| json!(n)).collect(),
            None => {
                return Attempt::failed(format!(
                    "iterate range '{resolved}' is not of the form start..end"
                ));
            }
        }
    } else {
        return Attempt::failed("iterate needs 'over' or 'range'".to_string());
    };

    let mut attempt = Attempt::default();

    for (position, item) in items.into_iter().enumerate() {
        store.set_runtime(spec.bind.clone(), item);
        store.set_runtime(format!("{}_index", spec.bind), json!(position));

        let inner = execute_step_boxed(&spec.body, position, store, ctx).await;

        attempt.assertion_results.extend(inner.assertion_results);
        attempt.captures.extend(inner.captures);
        if inner.request_snapshot.is_some() {
            attempt.request_snapshot = inner.request_snapshot;
            attempt.response_snapshot = inner.response_snapshot;
        }

        if inner.status == StepStatus::Failed && !spec.body.continue_on_failure {
            attempt.status = Some(StepStatus::Failed);
            attempt.error_message = Some(format!(
                "iteration {position} failed: {}",
                inner.error_message.unwrap_or_else(|| "unknown error".into())
            ));
            return attempt;
        }
    }

    attempt.status = Some(StepStatus::Success);
    attempt
}

fn run_scenarios_only(
    clauses: &[ScenarioClause],
    store: &mut VariableStore,
    ctx: &ExecContext,
) -> Attempt {
    let (_, _) = apply_scenarios(clauses, None, store, ctx);
    Attempt {
        status: Some(StepStatus::Success),
        ..Default::default()
    }
}

/// Evaluates scenario clauses in order. Branch variables land in the
/// runtime scope immediately; branch assertions and captures are returned
/// to the caller, which only makes sense when a response exists.
fn apply_scenarios(
    clauses: &[ScenarioClause],
    response: Option<&ResponseSnapshot>,
    store: &mut VariableStore,
    ctx: &ExecContext,
) -> (Vec<Value>, BTreeMap<String, String>) {
    let scripts = ctx.scripts.as_ref();

    let mut condition_ctx: Map<String, Value> = store.merged();
    if let Some(response) = response {
        for (k, v) in response_object(response) {
            condition_ctx.insert(k, v);
        }
    }

    let mut extra_assertions = Vec::new();
    let mut extra_captures = BTreeMap::new();

    for clause in clauses {
        let taken = match scripts.eval(&clause.condition, &condition_ctx) {
            Ok(value) => truthy(&value),
            Err(e) => {
                warn!(condition = %clause.condition, error = %e, "scenario condition failed, treating as false");
                false
            }
        };

        let branch = if taken {
            clause.then.as_ref()
        } else {
            clause.otherwise.as_ref()
        };
        let Some(branch) = branch else { continue };

        for (name, value) in &branch.variables {
            let resolved = store.interpolate(value, scripts);
            store.set_runtime(name.clone(), resolved.clone());
            condition_ctx.insert(name.clone(), resolved);
        }

        if response.is_some() {
            if let Some(doc) = &branch.assertions {
                extra_assertions.push(doc.clone());
            }
            extra_captures.extend(branch.capture.clone());
        } else if branch.assertions.is_some() || !branch.capture.is_empty() {
            warn!("scenario branch declares assertions or captures but the step has no response; ignored");
        }
    }

    (extra_assertions, extra_captures)
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

fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecContext;

    fn ctx() -> ExecContext {
        ExecContext::for_tests()
    }

    fn ctx_with_payload(payload: Map<String, Value>) -> ExecContext {
        let mut ctx = ExecContext::for_tests();
        ctx.input_payload = payload;
        ctx
    }

    fn step_from(yaml: &str) -> Step {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn skipped_steps_do_not_execute() {
        let step = step_from(
            "name: skipped\nskip: true\nrequest: { method: GET, url: 'http://127.0.0.1:1/x' }\n",
        );
        let mut store = VariableStore::new();
        let record = execute_step(&step, 0, &mut store, &ctx()).await;
        assert_eq!(record.status, StepStatus::Skipped);
        assert!(record.request_snapshot.is_none());
    }

    #[tokio::test]
    async fn transport_failure_preempts_assertions() {
        let step = step_from(
            r#"
name: unreachable
request:
  method: GET
  url: "http://127.0.0.1:1/x"
  timeout_ms: 2000
  assertions:
    status_code: 200
"#,
        );
        let mut store = VariableStore::new();
        let record = execute_step(&step, 0, &mut store, &ctx()).await;
        assert_eq!(record.status, StepStatus::Failed);
        // No assertion ran; the error is the typed transport message.
        assert!(record.assertion_results.is_empty());
        assert!(record.error_message.is_some());
        assert!(record.request_snapshot.is_some());
    }

    #[tokio::test]
    async fn request_url_is_interpolated_into_the_snapshot() {
        let step = step_from(
            "name: templated\nrequest: { method: GET, url: 'http://127.0.0.1:1/users/{{user_id}}', timeout_ms: 2000 }\n",
        );
        let mut store = VariableStore::new();
        store.set_runtime("user_id", json!(42));
        let record = execute_step(&step, 0, &mut store, &ctx()).await;
        let snapshot = record.request_snapshot.unwrap();
        assert_eq!(snapshot.url, "http://127.0.0.1:1/users/42");
    }

    #[tokio::test]
    async fn input_resolves_from_payload() {
        let step = step_from(
            "name: ask\ninput: { prompt: 'user id?', variable: user_id, type: number }\n",
        );
        let mut payload = Map::new();
        payload.insert("user_id".to_string(), json!("17"));
        let mut store = VariableStore::new();
        let record = execute_step(&step, 0, &mut store, &ctx_with_payload(payload)).await;
        assert_eq!(record.status, StepStatus::Success);
        assert_eq!(store.lookup("user_id"), Some(json!(17.0)));
    }

    #[tokio::test]
    async fn input_falls_back_to_default() {
        let step = step_from(
            "name: ask\ninput: { prompt: 'env?', variable: env_name, default: staging }\n",
        );
        let mut store = VariableStore::new();
        let record = execute_step(&step, 0, &mut store, &ctx()).await;
        assert_eq!(record.status, StepStatus::Success);
        assert_eq!(store.lookup("env_name"), Some(json!("staging")));
    }

    #[tokio::test]
    async fn missing_required_input_suspends() {
        let step =
            step_from("name: ask\ninput: { prompt: 'token?', variable: token }\n");
        let mut store = VariableStore::new();
        let record = execute_step(&step, 0, &mut store, &ctx()).await;
        assert_eq!(record.status, StepStatus::WaitingInput);
        assert!(record.error_message.unwrap().contains("token"));
    }

    #[tokio::test]
    async fn invalid_select_input_fails() {
        let step = step_from(
            "name: ask\ninput: { prompt: 'env?', variable: env, type: select, options: [dev, prod] }\n",
        );
        let mut payload = Map::new();
        payload.insert("env".to_string(), json!("staging"));
        let mut store = VariableStore::new();
        let record = execute_step(&step, 0, &mut store, &ctx_with_payload(payload)).await;
        assert_eq!(record.status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn password_inputs_are_masked_in_the_record() {
        let step = step_from(
            "name: ask\ninput: { prompt: 'secret?', variable: secret, type: password }\n",
        );
        let mut payload = Map::new();
        payload.insert("secret".to_string(), json!("hunter2"));
        let mut store = VariableStore::new();
        let record = execute_step(&step, 0, &mut store, &ctx_with_payload(payload)).await;
        assert_eq!(record.captures["secret"], json!("***"));
        assert_eq!(store.lookup("secret"), Some(json!("hunter2")));
    }

    #[tokio::test]
    async fn iterate_over_array_binds_the_iterator() {
        let step = step_from(
            r#"
name: loop
iterate:
  over: "{{ids}}"
  as: current
  body:
    name: record current
    scenarios:
      - condition: "true"
        then:
          variables:
            last_seen: "{{current}}"
"#,
        );
        let mut store = VariableStore::new();
        store.set_suite("ids", json!([10, 20, 30]));
        let record = execute_step(&step, 0, &mut store, &ctx()).await;
        assert_eq!(record.status, StepStatus::Success);
        assert_eq!(store.lookup("last_seen"), Some(json!(30)));
        assert_eq!(store.lookup("current_index"), Some(json!(2)));
    }

    #[tokio::test]
    async fn iterate_range_counts_iterations() {
        let step = step_from(
            r#"
name: loop
iterate:
  range: "0..4"
  as: i
  body:
    name: bump
    scenarios:
      - condition: "true"
        then:
          variables:
            seen: "{{i}}"
"#,
        );
        let mut store = VariableStore::new();
        let record = execute_step(&step, 0, &mut store, &ctx()).await;
        assert_eq!(record.status, StepStatus::Success);
        assert_eq!(store.lookup("seen"), Some(json!(3)));
    }

    #[tokio::test]
    async fn iterate_over_non_array_fails() {
        let step = step_from(
            r#"
name: loop
iterate:
  over: "{{not_a_list}}"
  as: x
  body:
    name: inner
    scenarios:
      - condition: "true"
"#,
        );
        let mut store = VariableStore::new();
        store.set_suite("not_a_list", json!("scalar"));
        let record = execute_step(&step, 0, &mut store, &ctx()).await;
        assert_eq!(record.status, StepStatus::Failed);
        assert!(record.error_message.unwrap().contains("array"));
    }

    #[tokio::test]
    async fn scenario_only_steps_set_variables_by_condition() {
        let step = step_from(
            r#"
name: pick environment
scenarios:
  - condition: "env == \"prod\""
    then:
      variables:
        host: "https://api.example.com"
    else:
      variables:
        host: "http://localhost:3000"
"#,
        );
        let mut store = VariableStore::new();
        store.set_suite("env", json!("dev"));
        let record = execute_step(&step, 0, &mut store, &ctx()).await;
        assert_eq!(record.status, StepStatus::Success);
        assert_eq!(store.lookup("host"), Some(json!("http://localhost:3000")));
    }

    #[tokio::test]
    async fn retry_reattempts_failed_steps() {
        let step = step_from(
            r#"
name: flaky
metadata:
  retry:
    max_attempts: 3
    delay_ms: 1
request:
  method: GET
  url: "http://127.0.0.1:1/x"
  timeout_ms: 1000
"#,
        );
        let mut store = VariableStore::new();
        let started = Instant::now();
        let record = execute_step(&step, 0, &mut store, &ctx()).await;
        assert_eq!(record.status, StepStatus::Failed);
        // Three attempts with delays in between took at least 2ms.
        assert!(started.elapsed() >= Duration::from_millis(2));
    }

    #[test]
    fn coerce_rejects_bad_emails_and_urls() {
        let email: InputSpec = serde_yaml::from_str(
            "prompt: p\nvariable: v\ntype: email\n",
        )
        .unwrap();
        assert!(coerce_input(&email, json!("not-an-email")).is_err());
        assert!(coerce_input(&email, json!("a@b.co")).is_ok());

        let url: InputSpec =
            serde_yaml::from_str("prompt: p\nvariable: v\ntype: url\n").unwrap();
        assert!(coerce_input(&url, json!("ftp://x")).is_err());
        assert!(coerce_input(&url, json!("https://x")).is_ok());
    }

    #[test]
    fn coerce_applies_patterns() {
        let spec: InputSpec = serde_yaml::from_str(
            "prompt: p\nvariable: v\npattern: '^[A-Z]{3}$'\n",
        )
        .unwrap();
        assert!(coerce_input(&spec, json!("ABC")).is_ok());
        assert!(coerce_input(&spec, json!("abc")).is_err());
    }
}
