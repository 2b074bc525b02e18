//! Cross-suite step invocation.
//!
//! A `call` step locates a step in another suite document, executes it in
//! its own context, and propagates its captures back to the caller under a
//! namespace prefix. The call stack is threaded through the execution
//! context, never stored globally, so cycle detection works with runs
//! executing in parallel.
//!
//! Cycle and depth violations are fatal for the step no matter what
//! `on_error` says; everything else goes through the configured error
//! strategy after retries are exhausted.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::context::VariableStore;
use crate::engine::ExecContext;
use crate::errors::ErrorCode;
use crate::loader;
use crate::runs::StepRunRecord;
use crate::suite::validate::validate_suite;
use crate::suite::{CallErrorMode, CallSpec};

/// One entry on the cross-suite call stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    pub suite_path: String,
    pub step_identifier: String,
}

impl CallFrame {
    pub fn new(suite_path: impl Into<String>, step_identifier: impl Into<String>) -> Self {
        Self {
            suite_path: suite_path.into(),
            step_identifier: step_identifier.into(),
        }
    }

    /// Identity used for loop detection.
    pub fn key(&self) -> String {
        format!("{}::{}", self.suite_path, self.step_identifier)
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call target '{path}' escapes the allowed suites root")]
    PathEscape { path: String },

    #[error("call target '{path}' could not be loaded: {message}")]
    TargetNotFound { path: String, message: String },

    #[error("call target '{path}' failed validation: {message}")]
    TargetInvalid { path: String, message: String },

    #[error("step '{step}' not found in suite '{suite}'")]
    StepNotFound { step: String, suite: String },

    #[error("call loop detected at '{key}'")]
    LoopDetected { key: String },

    #[error("call depth {depth} exceeds the configured maximum of {max}")]
    DepthExceeded { depth: usize, max: usize },
}

impl CallError {
    /// Loop and depth violations (and path escapes) bypass `on_error`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LoopDetected { .. } | Self::DepthExceeded { .. } | Self::PathEscape { .. }
        )
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::PathEscape { .. } => ErrorCode::CALL_PATH_ESCAPE,
            Self::TargetNotFound { .. } | Self::TargetInvalid { .. } => {
                ErrorCode::CALL_TARGET_NOT_FOUND
            }
            Self::StepNotFound { .. } => ErrorCode::CALL_STEP_NOT_FOUND,
            Self::LoopDetected { .. } => ErrorCode::CALL_LOOP_DETECTED,
            Self::DepthExceeded { .. } => ErrorCode::CALL_DEPTH_EXCEEDED,
        }
    }
}

/// What a call produced, already filtered through the error strategy.
#[derive(Debug)]
pub struct CallOutcome {
    pub succeeded: bool,

    /// Fatal failures ignore `on_error` entirely.
    pub fatal: bool,

    /// Namespaced captures for the caller's runtime scope.
    pub propagated: BTreeMap<String, Value>,

    /// Set when the error strategy downgraded a failure.
    pub warning: Option<String>,

    pub error: Option<String>,

    /// The callee's own step record, for diagnostics.
    pub callee_step: Option<Box<StepRunRecord>>,
}

impl CallOutcome {
    fn failure(error: String, fatal: bool) -> Self {
        Self {
            succeeded: false,
            fatal,
            propagated: BTreeMap::new(),
            warning: None,
            error: Some(error),
            callee_step: None,
        }
    }
}

/// Executes a `call` step end to end: resolve, guard, run (with retries),
/// propagate, and apply the error strategy.
pub async fn execute_call(
    call: &CallSpec,
    store: &mut VariableStore,
    ctx: &ExecContext,
) -> CallOutcome {
    let target_path = match resolve_within(&ctx.config.suites_dir, &ctx.suite_dir, &call.test) {
        Ok(path) => path,
        Err(e) => return CallOutcome::failure(e.to_string(), true),
    };

    let callee = match loader::load_suite(&target_path) {
        Ok(suite) => suite,
        Err(e) => {
            let err = CallError::TargetNotFound {
                path: call.test.clone(),
                message: e.to_string(),
            };
            return apply_error_mode(call.on_error, err.to_string(), false);
        }
    };
    if let Err(report) = validate_suite(&callee) {
        let messages: Vec<String> = report.iter().map(|e| e.to_string()).collect();
        let err = CallError::TargetInvalid {
            path: call.test.clone(),
            message: messages.join("; "),
        };
        return apply_error_mode(call.on_error, err.to_string(), false);
    }

    let Some((step_index, target_step)) = callee.find_step(&call.step) else {
        let err = CallError::StepNotFound {
            step: call.step.clone(),
            suite: callee.suite_name.clone(),
        };
        return apply_error_mode(call.on_error, err.to_string(), false);
    };

    let frame = CallFrame::new(target_path.to_string_lossy(), target_step.identifier());
    if ctx.call_stack.iter().any(|f| f.key() == frame.key()) {
        let err = CallError::LoopDetected { key: frame.key() };
        warn!(code = %err.code(), key = %frame.key(), "call loop detected");
        return CallOutcome::failure(err.to_string(), true);
    }
    let depth = ctx.call_stack.len() + 1;
    if depth > ctx.config.max_call_depth {
        let err = CallError::DepthExceeded {
            depth,
            max: ctx.config.max_call_depth,
        };
        warn!(code = %err.code(), depth, "call depth exceeded");
        return CallOutcome::failure(err.to_string(), true);
    }

    let callee_dir = target_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| ctx.config.suites_dir.clone());
    let child_ctx = ctx.child_for_call(
        callee.namespace().to_string(),
        callee.base_url.clone(),
        callee_dir,
        frame,
    );

    // Variables handed to the callee are interpolated in the caller's
    // context first.
    let passed_vars: Map<String, Value> = call
        .variables
        .iter()
        .map(|(k, v)| (k.clone(), store.interpolate(v, ctx.scripts.as_ref())))
        .collect();

    let prefix = call
        .alias
        .clone()
        .unwrap_or_else(|| callee.namespace().to_string());

    let max_attempts = call.retry.as_ref().map(|r| r.max_attempts.max(1)).unwrap_or(1);
    let delay_ms = call.retry.as_ref().map(|r| r.delay_ms).unwrap_or(0);

    let mut last_record: Option<StepRunRecord> = None;
    let mut last_error: Option<String> = None;

    for attempt in 1..=max_attempts {
        let mut callee_store = seed_callee_store(call, store, &callee.variables, &passed_vars);
        let invocation = crate::steps::execute_step_boxed(
            target_step,
            step_index,
            &mut callee_store,
            &child_ctx,
        );
        let record = match call.timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(std::time::Duration::from_millis(ms), invocation).await
                {
                    Ok(record) => Some(record),
                    Err(_) => {
                        last_error =
                            Some(format!("call to '{}' timed out after {ms}ms", call.test));
                        None
                    }
                }
            }
            None => Some(invocation.await),
        };

        if let Some(record) = record {
            if record.status.is_passing() {
                let propagated: BTreeMap<String, Value> = record
                    .captures
                    .iter()
                    .map(|(name, value)| (format!("{prefix}.{name}"), value.clone()))
                    .collect();

                if !call.isolate_context {
                    share_runtime_back(store, &callee_store, &record);
                }

                info!(
                    target = %call.test,
                    step = %call.step,
                    attempt,
                    propagated = propagated.len(),
                    "cross-suite call succeeded"
                );
                return CallOutcome {
                    succeeded: true,
                    fatal: false,
                    propagated,
                    warning: None,
                    error: None,
                    callee_step: Some(Box::new(record)),
                };
            }
            last_error = record.error_message.clone();
            last_record = Some(record);
        }

        warn!(
            target = %call.test,
            step = %call.step,
            attempt,
            max_attempts,
            error = last_error.as_deref().unwrap_or("unknown"),
            "cross-suite call attempt failed"
        );
        if attempt < max_attempts && delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
    }

    let error = last_error.unwrap_or_else(|| format!("call to '{}' failed", call.test));
    let mut outcome = apply_error_mode(call.on_error, error, false);
    outcome.callee_step = last_record.map(Box::new);
    outcome
}

/// Builds the callee's variable store per the isolation contract: caller
/// suite scope, explicitly passed variables, and the imported scope. When
/// sharing, the caller's runtime comes along too.
fn seed_callee_store(
    call: &CallSpec,
    caller: &VariableStore,
    callee_vars: &Map<String, Value>,
    passed: &Map<String, Value>,
) -> VariableStore {
    let mut suite_scope = callee_vars.clone();
    for (k, v) in caller.suite_vars() {
        suite_scope.entry(k.clone()).or_insert_with(|| v.clone());
    }
    for (k, v) in passed {
        suite_scope.insert(k.clone(), v.clone());
    }

    let mut store = VariableStore::for_run(
        &suite_scope,
        &Map::new(),
        caller.imported_vars().clone(),
        caller.warn_on_missing,
    );
    if !call.isolate_context {
        store.replace_runtime(caller.runtime_vars().clone());
    }
    store
}

/// Non-isolated calls share runtime mutations back with the caller, except
/// the callee's own captures, which only travel under the namespace prefix.
fn share_runtime_back(caller: &mut VariableStore, callee: &VariableStore, record: &StepRunRecord) {
    let mut runtime = callee.runtime_vars().clone();
    for name in record.captures.keys() {
        match caller.runtime_vars().get(name) {
            // The caller's own value wins over the callee's capture.
            Some(original) => {
                runtime.insert(name.clone(), original.clone());
            }
            None => {
                runtime.remove(name);
            }
        }
    }
    caller.replace_runtime(runtime);
}

fn apply_error_mode(mode: CallErrorMode, error: String, fatal: bool) -> CallOutcome {
    if fatal {
        return CallOutcome::failure(error, true);
    }
    match mode {
        CallErrorMode::Fail => CallOutcome::failure(error, false),
        CallErrorMode::Continue => CallOutcome {
            succeeded: true,
            fatal: false,
            propagated: BTreeMap::new(),
            warning: Some(error),
            error: None,
            callee_step: None,
        },
        CallErrorMode::Warn => {
            warn!(error = %error, "call failed, continuing per on_error=warn");
            CallOutcome {
                succeeded: true,
                fatal: false,
                propagated: BTreeMap::new(),
                warning: None,
                error: None,
                callee_step: None,
            }
        }
    }
}

/// Resolves a call target against the caller's directory (or the suites
/// root for absolute-style paths) and rejects anything that escapes the
/// root. Purely lexical, so nonexistent paths still resolve predictably.
pub fn resolve_within(
    root: &Path,
    caller_dir: &Path,
    target: &str,
) -> Result<PathBuf, CallError> {
    let base = if let Some(stripped) = target.strip_prefix('/') {
        root.join(stripped)
    } else {
        caller_dir.join(target)
    };

    let root_norm = normalize(root);
    let target_norm = normalize(&base);

    if !target_norm.starts_with(&root_norm) {
        return Err(CallError::PathEscape {
            path: target.to_string(),
        });
    }
    Ok(target_norm)
}

/// Component-wise normalization without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}
