//! Whole-suite orchestration.
//!
//! The flow engine owns the run's variable store, walks the steps in
//! declared order, applies the stop policy, streams progress events, and
//! persists step records as it goes. Broadcaster and persistence failures
//! are logged and swallowed; the in-memory aggregate is always produced.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::calls::CallFrame;
use crate::config::EngineConfig;
use crate::context::VariableStore;
use crate::errors::ErrorCode;
use crate::events::{progress_percentage, EventBroadcaster, FlowEvent};
use crate::expr::{RhaiScriptEngine, ScriptEngine};
use crate::http::HttpEngine;
use crate::registry::ExportRegistry;
use crate::runs::{ExecutionOptions, FlowResult, FlowStatus, StepRunRecord, StepStatus};
use crate::steps;
use crate::store::RunRepository;
use crate::suite::validate::validate_suite;
use crate::suite::{FlowSuite, Step, StepKind};

/// Everything a step needs from its surroundings. Cloned and adjusted for
/// cross-suite calls; the call stack rides along here, never in a global.
pub struct ExecContext {
    pub config: Arc<EngineConfig>,
    pub http: Arc<HttpEngine>,
    pub scripts: Arc<dyn ScriptEngine>,
    pub registry: Arc<ExportRegistry>,
    pub run_id: Uuid,
    pub suite_namespace: String,
    pub base_url: Option<String>,
    /// Directory of the current suite document; call targets resolve
    /// relative to it.
    pub suite_dir: PathBuf,
    pub call_stack: Vec<CallFrame>,
    pub input_payload: Map<String, Value>,
}

impl ExecContext {
    /// Context for executing a call target: callee namespace, base URL and
    /// directory, with the new frame pushed onto the stack.
    pub fn child_for_call(
        &self,
        namespace: String,
        base_url: Option<String>,
        suite_dir: PathBuf,
        frame: CallFrame,
    ) -> Self {
        let mut call_stack = self.call_stack.clone();
        call_stack.push(frame);
        Self {
            config: Arc::clone(&self.config),
            http: Arc::clone(&self.http),
            scripts: Arc::clone(&self.scripts),
            registry: Arc::clone(&self.registry),
            run_id: self.run_id,
            suite_namespace: namespace,
            base_url,
            suite_dir,
            call_stack,
            input_payload: self.input_payload.clone(),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            config: Arc::new(EngineConfig::default()),
            http: Arc::new(HttpEngine::new()),
            scripts: Arc::new(RhaiScriptEngine::new()),
            registry: Arc::new(ExportRegistry::new()),
            run_id: Uuid::new_v4(),
            suite_namespace: "test".to_string(),
            base_url: None,
            suite_dir: std::env::temp_dir(),
            call_stack: Vec::new(),
            input_payload: Map::new(),
        }
    }
}

pub struct FlowEngine {
    config: Arc<EngineConfig>,
    http: Arc<HttpEngine>,
    scripts: Arc<dyn ScriptEngine>,
    registry: Arc<ExportRegistry>,
    broadcaster: Option<EventBroadcaster>,
    repository: Option<Arc<dyn RunRepository>>,
}

impl FlowEngine {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self {
            config,
            http: Arc::new(HttpEngine::new()),
            scripts: Arc::new(RhaiScriptEngine::new()),
            registry: Arc::new(ExportRegistry::new()),
            broadcaster: None,
            repository: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<ExportRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: EventBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn RunRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Drives a suite to completion (or to its first stop point).
    ///
    /// Steps run strictly in declared order. On a step failure the suite
    /// stops unless the run-level `continue_on_failure` option or the
    /// step's own flag says otherwise; either way the step stays FAILED.
    pub async fn execute_flow(
        &self,
        suite: &FlowSuite,
        options: &ExecutionOptions,
        run_id: Uuid,
        suite_path: Option<&Path>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> FlowResult {
        let started_at = Utc::now();
        let timer = Instant::now();

        if let Err(report) = validate_suite(suite) {
            let messages: Vec<String> = report
                .iter()
                .map(|e| format!("[{}] {e}", e.code()))
                .collect();
            let message = format!("suite validation failed: {}", messages.join("; "));
            error!(suite = %suite.suite_name, error = %message, "refusing to execute invalid suite");
            return FlowResult {
                run_id,
                suite_name: suite.suite_name.clone(),
                status: FlowStatus::Failure,
                steps: Vec::new(),
                duration_ms: timer.elapsed().as_millis() as u64,
                started_at,
                finished_at: Utc::now(),
                error_message: Some(message),
            };
        }

        let imported = self.registry.snapshot_for(&suite.depends);
        let mut store = VariableStore::for_run(
            &suite.variables,
            &options.variables,
            imported,
            self.config.warn_on_missing_vars,
        );
        store.set_global("run_id", json!(run_id.to_string()));
        store.set_global("suite_name", json!(suite.suite_name.clone()));

        let suite_dir = suite_path
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.suites_dir.clone());

        let ctx = ExecContext {
            config: Arc::clone(&self.config),
            http: Arc::clone(&self.http),
            scripts: Arc::clone(&self.scripts),
            registry: Arc::clone(&self.registry),
            run_id,
            suite_namespace: suite.namespace().to_string(),
            base_url: suite.base_url.clone(),
            suite_dir,
            call_stack: Vec::new(),
            input_payload: options.input_payload.clone(),
        };

        let total_steps = suite.steps.len();
        self.emit(FlowEvent::FlowStarted {
            run_id,
            ts: Utc::now(),
            suite_name: suite.suite_name.clone(),
            total_steps,
            start_time: started_at,
        });
        info!(suite = %suite.suite_name, total_steps, %run_id, "flow started");

        let mut records: Vec<StepRunRecord> = Vec::with_capacity(total_steps);
        let mut cancelled = false;
        let mut awaiting_input = false;
        let mut stopped_on_failure = false;

        for (index, step) in suite.steps.iter().enumerate() {
            if let Some(rx) = &cancel {
                if *rx.borrow() {
                    info!(step_index = index, "cancellation observed at step boundary");
                    cancelled = true;
                    break;
                }
            }

            self.emit(step_started_event(run_id, index, step, total_steps));

            let record = steps::execute_step(step, index, &mut store, &ctx).await;
            self.persist_step(run_id, &record).await;

            match record.status {
                StepStatus::Failed | StepStatus::Aborted => {
                    self.emit(FlowEvent::StepFailed {
                        run_id,
                        ts: Utc::now(),
                        step_index: index,
                        step_name: record.step_name.clone(),
                        error_message: record
                            .error_message
                            .clone()
                            .unwrap_or_else(|| "step failed".to_string()),
                        duration_ms: record.duration_ms,
                    });
                }
                _ => {
                    self.emit(FlowEvent::StepCompleted {
                        run_id,
                        ts: Utc::now(),
                        step_index: index,
                        step_name: record.step_name.clone(),
                        duration_ms: record.duration_ms,
                        assertions_passed: record
                            .assertion_results
                            .iter()
                            .filter(|r| r.passed)
                            .count(),
                        variables_captured: record.captures.len(),
                    });
                }
            }

            let completed = index + 1;
            self.emit(FlowEvent::ProgressUpdate {
                run_id,
                ts: Utc::now(),
                total_steps,
                completed_steps: completed,
                current_step: record.step_name.clone(),
                status: format!("{:?}", record.status),
                progress_percentage: progress_percentage(completed, total_steps),
            });

            let status = record.status;
            records.push(record);

            if status == StepStatus::WaitingInput {
                awaiting_input = true;
                break;
            }
            if status == StepStatus::Failed
                && !options.continue_on_failure
                && !step.continue_on_failure
            {
                stopped_on_failure = true;
                break;
            }
        }

        let duration_ms = timer.elapsed().as_millis() as u64;
        let passed = records.iter().filter(|r| r.status.is_passing()).count();
        let failed = records
            .iter()
            .filter(|r| matches!(r.status, StepStatus::Failed | StepStatus::Aborted))
            .count();

        let status = if cancelled {
            FlowStatus::Cancelled
        } else if awaiting_input {
            FlowStatus::AwaitingInput
        } else if failed > 0 {
            FlowStatus::Failure
        } else {
            FlowStatus::Success
        };

        let error_message = if status == FlowStatus::Failure {
            records
                .iter()
                .find(|r| r.status == StepStatus::Failed)
                .and_then(|r| {
                    r.error_message
                        .clone()
                        .map(|e| format!("step '{}' failed: {e}", r.step_name))
                })
        } else {
            None
        };

        match status {
            FlowStatus::Success => {
                self.emit(FlowEvent::FlowCompleted {
                    run_id,
                    ts: Utc::now(),
                    duration_ms,
                    passed_steps: passed,
                    failed_steps: failed,
                    total_steps,
                });
                self.publish_exports(suite, &store);
            }
            FlowStatus::Failure => {
                self.emit(FlowEvent::FlowFailed {
                    run_id,
                    ts: Utc::now(),
                    error_message: error_message
                        .clone()
                        .unwrap_or_else(|| "flow failed".to_string()),
                    duration_ms,
                    passed_steps: passed,
                    failed_steps: failed,
                });
            }
            FlowStatus::Cancelled | FlowStatus::AwaitingInput => {}
        }

        info!(
            suite = %suite.suite_name,
            ?status,
            duration_ms,
            passed,
            failed,
            stopped_on_failure,
            "flow finished"
        );

        FlowResult {
            run_id,
            suite_name: suite.suite_name.clone(),
            status,
            steps: records,
            duration_ms,
            started_at,
            finished_at: Utc::now(),
            error_message,
        }
    }

    fn emit(&self, event: FlowEvent) {
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.publish(event);
        }
    }

    async fn persist_step(&self, run_id: Uuid, record: &StepRunRecord) {
        if let Some(repository) = &self.repository {
            if let Err(e) = repository.insert_step_run(run_id, record).await {
                warn!(
                    code = %ErrorCode::STORE_WRITE_FAILED,
                    step = %record.step_name,
                    error = %e,
                    "failed to persist step record, continuing"
                );
            }
        }
    }

    /// Exports become visible to other runs only after success, and in one
    /// atomic publish.
    fn publish_exports(&self, suite: &FlowSuite, store: &VariableStore) {
        if suite.exports.is_empty() {
            return;
        }
        let mut exports = Map::new();
        for name in &suite.exports {
            match store.lookup(name) {
                Some(value) => {
                    exports.insert(name.clone(), value);
                }
                None => {
                    warn!(export = %name, suite = %suite.suite_name, "declared export was never set");
                }
            }
        }
        self.registry.publish(suite.namespace(), exports);
        info!(suite = %suite.suite_name, count = suite.exports.len(), "exports published");
    }
}

fn step_started_event(run_id: Uuid, index: usize, step: &Step, total_steps: usize) -> FlowEvent {
    let (method, url) = match &step.kind {
        StepKind::Request(spec) => (
            Some(spec.method.as_str().to_string()),
            Some(spec.url.clone()),
        ),
        _ => (None, None),
    };
    FlowEvent::StepStarted {
        run_id,
        ts: Utc::now(),
        step_index: index,
        step_name: step.name.clone(),
        method,
        url,
        step_index_1based: index + 1,
        total_steps,
    }
}
