//! Run dispatch: queue, workers, and the inline fallback.
//!
//! Submission creates the QUEUED run row first, then tries to enqueue a
//! job envelope. If the queue is down the run executes inline in the
//! submitting task: a broken queue costs latency, never a run. Jobs are
//! delivered at most once (`attempts = 1`) so a crash after a completed
//! run does not re-execute it; the run row, not the job, is the source of
//! truth.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::FlowEngine;
use crate::errors::ErrorCode;
use crate::loader;
use crate::runs::{
    ExecutionOptions, FlowResult, FlowStatus, RunRecord, RunStatus, RunSummary, RunTrigger,
    SuiteRef,
};
use crate::store::{RunRepository, StoreError};

/// Transport envelope carrying a run from submission to a worker.
#[derive(Debug, Clone)]
pub struct Job {
    pub run_id: Uuid,
    pub options: ExecutionOptions,
    pub label: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue '{name}' unavailable: {message}")]
    Unavailable { name: String, message: String },
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError>;
}

/// In-process queue over a bounded channel, consumed by [`WorkerPool`].
pub struct InProcessQueue {
    name: String,
    backoff: std::time::Duration,
    tx: mpsc::Sender<Job>,
}

impl InProcessQueue {
    pub fn new(config: &EngineConfig, capacity: usize) -> (Self, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: config.queue.name.clone(),
                backoff: config.queue.backoff,
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl JobQueue for InProcessQueue {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        let attempts = job.attempts.max(1);
        let mut backoff = self.backoff;
        for attempt in 1..=attempts {
            match self.tx.try_send(job.clone()) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if attempt == attempts {
                        return Err(QueueError::Unavailable {
                            name: self.name.clone(),
                            message: e.to_string(),
                        });
                    }
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
        unreachable!("enqueue loop always returns");
    }
}

/// Record of a finished job, kept for inspection. Bounded retention.
#[derive(Debug, Clone)]
pub struct FinishedJob {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub label: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct JobHistory {
    retention: usize,
    entries: Mutex<VecDeque<FinishedJob>>,
}

impl JobHistory {
    pub fn new(retention: usize) -> Self {
        Self {
            retention,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn record(&self, entry: FinishedJob) {
        let mut entries = self.entries.lock().await;
        entries.push_back(entry);
        while entries.len() > self.retention {
            entries.pop_front();
        }
    }

    pub async fn snapshot(&self) -> Vec<FinishedJob> {
        self.entries.lock().await.iter().cloned().collect()
    }
}

/// Executes one run end to end: status transitions, document loading,
/// flow execution, final summary. Used by workers and by the inline
/// fallback alike.
pub struct RunExecutor {
    config: Arc<EngineConfig>,
    repository: Arc<dyn RunRepository>,
    engine: Arc<FlowEngine>,
    history: Arc<JobHistory>,
}

impl RunExecutor {
    pub fn new(
        config: Arc<EngineConfig>,
        repository: Arc<dyn RunRepository>,
        engine: Arc<FlowEngine>,
        history: Arc<JobHistory>,
    ) -> Self {
        Self {
            config,
            repository,
            engine,
            history,
        }
    }

    /// Runs a queued (or resumed) run to a settled status. Uncaught errors
    /// mark the run FAILED; this function itself does not fail the caller.
    pub async fn execute(&self, run_id: Uuid, options: &ExecutionOptions) -> Option<FlowResult> {
        let run = match self.repository.fetch_run(run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                error!(%run_id, code = %ErrorCode::INTERNAL, "job referenced an unknown run");
                return None;
            }
            Err(e) => {
                error!(%run_id, error = %e, "failed to load run record");
                return None;
            }
        };

        if let Err(e) = self
            .repository
            .transition(run_id, RunStatus::Running, None)
            .await
        {
            error!(%run_id, error = %e, "failed to transition run to RUNNING");
            return None;
        }

        let suite_path = self.resolve_suite_path(&run.suite_ref);
        let suite = match loader::load_suite(&suite_path) {
            Ok(suite) => suite,
            Err(e) => {
                let message = format!(
                    "[{}] failed to load suite '{}': {e}",
                    ErrorCode::SUITE_FILE_NOT_FOUND,
                    suite_path.display()
                );
                error!(%run_id, error = %message, "run failed before execution");
                self.finish(run_id, RunStatus::Failed, failure_summary(&message))
                    .await;
                return None;
            }
        };

        let timeout = options
            .timeout_ms
            .map(std::time::Duration::from_millis)
            .unwrap_or(self.config.run_timeout);

        let execution = self
            .engine
            .execute_flow(&suite, options, run_id, Some(&suite_path), None);

        let result = match tokio::time::timeout(timeout, execution).await {
            Ok(result) => result,
            Err(_) => {
                let message = format!("run timeout exceeded after {}ms", timeout.as_millis());
                warn!(%run_id, error = %message, "run aborted by global timeout");
                self.finish(run_id, RunStatus::Failed, failure_summary(&message))
                    .await;
                return None;
            }
        };

        let next = match result.status {
            FlowStatus::Success => RunStatus::Completed,
            FlowStatus::Failure => RunStatus::Failed,
            FlowStatus::Cancelled => RunStatus::Cancelled,
            FlowStatus::AwaitingInput => RunStatus::WaitingInput,
        };
        self.finish(run_id, next, result.summary()).await;

        self.history
            .record(FinishedJob {
                run_id,
                status: next,
                label: run.label,
                finished_at: Utc::now(),
            })
            .await;

        Some(result)
    }

    async fn finish(&self, run_id: Uuid, next: RunStatus, summary: RunSummary) {
        if let Err(e) = self
            .repository
            .transition(run_id, next, Some(summary))
            .await
        {
            error!(
                %run_id,
                code = %ErrorCode::INVALID_STATUS_TRANSITION,
                error = %e,
                "failed to persist final run status"
            );
        }
    }

    /// Resolves a suite reference to a document path under the suites
    /// directory.
    fn resolve_suite_path(&self, suite_ref: &SuiteRef) -> PathBuf {
        match suite_ref {
            SuiteRef::Version(path) => {
                let path = PathBuf::from(path);
                if path.is_absolute() {
                    path
                } else {
                    self.config.suites_dir.join(path)
                }
            }
            SuiteRef::Node { node_id, version } => {
                let file = match version {
                    Some(version) => format!("{node_id}@{version}.yaml"),
                    None => format!("{node_id}.yaml"),
                };
                self.config.suites_dir.join(file)
            }
        }
    }
}

/// Pool of workers draining the in-process queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        worker_count: usize,
        rx: mpsc::Receiver<Job>,
        executor: Arc<RunExecutor>,
    ) -> Self {
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(worker_count.max(1));

        for worker_id in 0..worker_count.max(1) {
            let rx = Arc::clone(&rx);
            let executor = Arc::clone(&executor);
            handles.push(tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else {
                        info!(worker_id, "queue closed, worker exiting");
                        break;
                    };
                    info!(worker_id, run_id = %job.run_id, label = ?job.label, "worker picked up job");
                    executor.execute(job.run_id, &job.options).await;
                }
            }));
        }

        Self { handles }
    }

    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Submission boundary: persists the run, enqueues the job, and falls back
/// to inline execution when the queue refuses it.
pub struct Dispatcher {
    config: Arc<EngineConfig>,
    repository: Arc<dyn RunRepository>,
    queue: Arc<dyn JobQueue>,
    executor: Arc<RunExecutor>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<EngineConfig>,
        repository: Arc<dyn RunRepository>,
        queue: Arc<dyn JobQueue>,
        executor: Arc<RunExecutor>,
    ) -> Self {
        Self {
            config,
            repository,
            queue,
            executor,
        }
    }

    /// Creates the run and hands it to the queue. On queue failure the run
    /// executes inline before this returns, so it still reaches a terminal
    /// status.
    pub async fn submit(&self, trigger: RunTrigger) -> Result<RunRecord, StoreError> {
        let run = RunRecord::from_trigger(&trigger);
        self.repository.insert_run(&run).await?;
        info!(run_id = %run.run_id, suite = %run.suite_ref.describe(), "run queued");

        let job = Job {
            run_id: run.run_id,
            options: run.options.clone(),
            label: run.label.clone(),
            attempts: self.config.queue.default_attempts,
        };

        if let Err(e) = self.queue.enqueue(job).await {
            warn!(
                run_id = %run.run_id,
                code = %ErrorCode::QUEUE_UNAVAILABLE,
                error = %e,
                "queue unavailable, falling back to inline execution"
            );
            self.executor.execute(run.run_id, &run.options).await;
        }

        Ok(self
            .repository
            .fetch_run(run.run_id)
            .await?
            .unwrap_or(run))
    }

    /// Clones the trigger of a prior run into a fresh submission. The
    /// original run is untouched.
    pub async fn retry_run(&self, run_id: Uuid) -> Result<RunRecord, StoreError> {
        let prior = self
            .repository
            .fetch_run(run_id)
            .await?
            .ok_or(StoreError::NotFound(run_id))?;
        self.submit(prior.to_trigger()).await
    }

    /// Resumes a WAITING_INPUT run: merges the new payload over the stored
    /// one and drives the same run again from the first step. Completed
    /// steps are re-executed rather than replayed, since their captures may
    /// depend on live responses.
    pub async fn resume(
        &self,
        run_id: Uuid,
        input_payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<RunRecord, StoreError> {
        let mut run = self
            .repository
            .fetch_run(run_id)
            .await?
            .ok_or(StoreError::NotFound(run_id))?;
        if run.status != RunStatus::WaitingInput {
            return Err(StoreError::InvalidTransition {
                from: run.status,
                to: RunStatus::Running,
            });
        }

        for (k, v) in input_payload {
            run.options.input_payload.insert(k, v);
        }
        self.repository.insert_run(&run).await?;
        info!(run_id = %run.run_id, "resuming run with merged input payload");

        let job = Job {
            run_id: run.run_id,
            options: run.options.clone(),
            label: run.label.clone(),
            attempts: self.config.queue.default_attempts,
        };
        if let Err(e) = self.queue.enqueue(job).await {
            warn!(
                run_id = %run.run_id,
                code = %ErrorCode::QUEUE_UNAVAILABLE,
                error = %e,
                "queue unavailable, resuming inline"
            );
            self.executor.execute(run.run_id, &run.options).await;
        }

        Ok(self
            .repository
            .fetch_run(run.run_id)
            .await?
            .unwrap_or(run))
    }
}

fn failure_summary(message: &str) -> RunSummary {
    RunSummary {
        status: FlowStatus::Failure,
        total_steps: 0,
        passed_steps: 0,
        failed_steps: 0,
        skipped_steps: 0,
        duration_ms: 0,
        error_message: Some(message.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileRunStore;
    use crate::runs::TriggerSource;
    use std::fs;

    struct BrokenQueue;

    #[async_trait]
    impl JobQueue for BrokenQueue {
        async fn enqueue(&self, _job: Job) -> Result<(), QueueError> {
            Err(QueueError::Unavailable {
                name: "flow-runs".into(),
                message: "connection refused".into(),
            })
        }
    }

    fn temp_config() -> Arc<EngineConfig> {
        let base = std::env::temp_dir().join(format!("flowrunner-queue-{}", Uuid::new_v4()));
        fs::create_dir_all(base.join("suites")).unwrap();
        Arc::new(EngineConfig {
            suites_dir: base.join("suites"),
            data_dir: base.join("data"),
            ..Default::default()
        })
    }

    fn write_suite(config: &EngineConfig, name: &str, yaml: &str) {
        fs::write(config.suites_dir.join(name), yaml).unwrap();
    }

    fn offline_suite() -> &'static str {
        r#"
suite_name: offline
steps:
  - name: decide
    scenarios:
      - condition: "true"
        then:
          variables:
            done: yes
"#
    }

    fn build(
        config: Arc<EngineConfig>,
        queue: Arc<dyn JobQueue>,
    ) -> (Dispatcher, Arc<dyn RunRepository>, Arc<JobHistory>) {
        let repository: Arc<dyn RunRepository> =
            Arc::new(FileRunStore::new(config.data_dir.clone()));
        let engine = Arc::new(FlowEngine::new(Arc::clone(&config)));
        let history = Arc::new(JobHistory::new(config.queue.retention));
        let executor = Arc::new(RunExecutor::new(
            Arc::clone(&config),
            Arc::clone(&repository),
            engine,
            Arc::clone(&history),
        ));
        (
            Dispatcher::new(config, Arc::clone(&repository), queue, executor),
            repository,
            history,
        )
    }

    fn trigger(suite: &str) -> RunTrigger {
        RunTrigger {
            suite: SuiteRef::Version(suite.to_string()),
            priority: None,
            trigger_source: TriggerSource::Api,
            label: Some("test".into()),
            options: ExecutionOptions::default(),
            requested_by: None,
        }
    }

    #[tokio::test]
    async fn broken_queue_falls_back_to_inline_execution() {
        let config = temp_config();
        write_suite(&config, "offline.yaml", offline_suite());
        let (dispatcher, repository, history) = build(Arc::clone(&config), Arc::new(BrokenQueue));

        let run = dispatcher.submit(trigger("offline.yaml")).await.unwrap();

        // The inline path already drove the run to a terminal status.
        assert_eq!(run.status, RunStatus::Completed);
        let stored = repository.fetch_run(run.run_id).await.unwrap().unwrap();
        assert!(stored.started_at.is_some());
        assert!(stored.finished_at.is_some());
        assert!(stored.result_summary.is_some());
        assert_eq!(history.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn worker_pool_drains_the_queue() {
        let config = temp_config();
        write_suite(&config, "offline.yaml", offline_suite());

        let (queue, rx) = InProcessQueue::new(&config, 16);
        let (dispatcher, repository, _history) = build(Arc::clone(&config), Arc::new(queue));

        // Rebuild an executor for the pool from the same components.
        let engine = Arc::new(FlowEngine::new(Arc::clone(&config)));
        let history = Arc::new(JobHistory::new(8));
        let executor = Arc::new(RunExecutor::new(
            Arc::clone(&config),
            Arc::clone(&repository),
            engine,
            history,
        ));
        let pool = WorkerPool::start(2, rx, executor);

        let run = dispatcher.submit(trigger("offline.yaml")).await.unwrap();

        let mut status = run.status;
        for _ in 0..100 {
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            status = repository
                .fetch_run(run.run_id)
                .await
                .unwrap()
                .unwrap()
                .status;
        }
        assert_eq!(status, RunStatus::Completed);
        pool.abort();
    }

    #[tokio::test]
    async fn missing_suite_marks_the_run_failed() {
        let config = temp_config();
        let (dispatcher, repository, _history) = build(Arc::clone(&config), Arc::new(BrokenQueue));

        let run = dispatcher.submit(trigger("nope.yaml")).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        let stored = repository.fetch_run(run.run_id).await.unwrap().unwrap();
        let summary = stored.result_summary.unwrap();
        assert!(summary.error_message.unwrap().contains("failed to load suite"));
    }

    #[tokio::test]
    async fn retry_creates_a_new_run_and_leaves_the_original_alone() {
        let config = temp_config();
        write_suite(&config, "offline.yaml", offline_suite());
        let (dispatcher, repository, _history) = build(Arc::clone(&config), Arc::new(BrokenQueue));

        let first = dispatcher.submit(trigger("offline.yaml")).await.unwrap();
        let second = dispatcher.retry_run(first.run_id).await.unwrap();

        assert_ne!(first.run_id, second.run_id);
        assert_eq!(second.status, RunStatus::Completed);
        let original = repository.fetch_run(first.run_id).await.unwrap().unwrap();
        assert_eq!(original.run_id, first.run_id);
        assert_eq!(original.label.as_deref(), Some("test"));
    }

    #[tokio::test]
    async fn node_refs_resolve_under_the_suites_dir() {
        let config = temp_config();
        write_suite(&config, "auth@2.yaml", offline_suite());
        let (dispatcher, _repository, _history) = build(Arc::clone(&config), Arc::new(BrokenQueue));

        let run = dispatcher
            .submit(RunTrigger {
                suite: SuiteRef::Node {
                    node_id: "auth".into(),
                    version: Some("2".into()),
                },
                priority: None,
                trigger_source: TriggerSource::Dependency,
                label: None,
                options: ExecutionOptions::default(),
                requested_by: None,
            })
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn waiting_input_run_resumes_with_merged_payload() {
        let config = temp_config();
        write_suite(
            &config,
            "ask.yaml",
            r#"
suite_name: ask
steps:
  - name: need token
    input:
      prompt: "token?"
      variable: api_token
"#,
        );
        let (dispatcher, repository, _history) = build(Arc::clone(&config), Arc::new(BrokenQueue));

        let run = dispatcher.submit(trigger("ask.yaml")).await.unwrap();
        assert_eq!(run.status, RunStatus::WaitingInput);

        let mut payload = serde_json::Map::new();
        payload.insert("api_token".to_string(), serde_json::json!("tok"));
        let resumed = dispatcher.resume(run.run_id, payload).await.unwrap();

        assert_eq!(resumed.run_id, run.run_id);
        assert_eq!(resumed.status, RunStatus::Completed);
        let stored = repository.fetch_run(run.run_id).await.unwrap().unwrap();
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn resume_rejects_runs_not_waiting_for_input() {
        let config = temp_config();
        write_suite(&config, "offline.yaml", offline_suite());
        let (dispatcher, _repository, _history) = build(Arc::clone(&config), Arc::new(BrokenQueue));

        let run = dispatcher.submit(trigger("offline.yaml")).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let err = dispatcher
            .resume(run.run_id, serde_json::Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn history_retention_is_bounded() {
        let history = JobHistory::new(2);
        for _ in 0..5 {
            history
                .record(FinishedJob {
                    run_id: Uuid::new_v4(),
                    status: RunStatus::Completed,
                    label: None,
                    finished_at: Utc::now(),
                })
                .await;
        }
        assert_eq!(history.snapshot().await.len(), 2);
    }
}
