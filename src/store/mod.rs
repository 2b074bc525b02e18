//! Durable run persistence.
//!
//! The engine talks to a [`RunRepository`]; the default implementation
//! writes JSON records under the data directory, one folder per run:
//!
//! ```text
//! <data_dir>/runs/<run_id>/run.json
//! <data_dir>/runs/<run_id>/steps/00000.json
//! ```
//!
//! Writes are serialized through one mutex; status changes go through the
//! state-machine guard so an illegal transition is a visible error, not a
//! corrupted record. Persistence failures are logged by callers and never
//! abort execution; the in-memory aggregate still carries the result.

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use chrono::Utc;

use crate::runs::{RunRecord, RunStatus, RunSummary, StepRunRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run {0} not found")]
    NotFound(Uuid),

    #[error("illegal status transition {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn insert_run(&self, run: &RunRecord) -> Result<(), StoreError>;

    async fn fetch_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError>;

    /// Moves a run along the state machine. `started_at` is stamped
    /// together with the RUNNING transition, `finished_at` and the summary
    /// with a terminal one.
    async fn transition(
        &self,
        run_id: Uuid,
        next: RunStatus,
        summary: Option<RunSummary>,
    ) -> Result<RunRecord, StoreError>;

    async fn insert_step_run(
        &self,
        run_id: Uuid,
        step: &StepRunRecord,
    ) -> Result<(), StoreError>;

    async fn fetch_step_runs(&self, run_id: Uuid) -> Result<Vec<StepRunRecord>, StoreError>;
}

pub struct FileRunStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRunStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: data_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join("runs").join(run_id.to_string())
    }

    fn run_file(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    fn step_file(&self, run_id: Uuid, index: usize) -> PathBuf {
        self.run_dir(run_id)
            .join("steps")
            .join(format!("{index:05}.json"))
    }

    fn read_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        let path = self.run_file(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn write_json(path: &Path, value: &impl serde::Serialize) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(value)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[async_trait]
impl RunRepository for FileRunStore {
    async fn insert_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        Self::write_json(&self.run_file(run.run_id), run)
    }

    async fn fetch_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        self.read_run(run_id)
    }

    async fn transition(
        &self,
        run_id: Uuid,
        next: RunStatus,
        summary: Option<RunSummary>,
    ) -> Result<RunRecord, StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut run = self
            .read_run(run_id)?
            .ok_or(StoreError::NotFound(run_id))?;

        if !run.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: run.status,
                to: next,
            });
        }

        run.status = next;
        if next == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            run.finished_at = Some(Utc::now());
        }
        if let Some(summary) = summary {
            run.result_summary = Some(summary);
        }

        Self::write_json(&self.run_file(run_id), &run)?;
        Ok(run)
    }

    async fn insert_step_run(
        &self,
        run_id: Uuid,
        step: &StepRunRecord,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        Self::write_json(&self.step_file(run_id, step.step_index), step)
    }

    async fn fetch_step_runs(&self, run_id: Uuid) -> Result<Vec<StepRunRecord>, StoreError> {
        let dir = self.run_dir(run_id).join("steps");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        // File names are zero-padded indexes, so lexical order is step order.
        entries.sort();

        let mut steps = Vec::with_capacity(entries.len());
        for path in entries {
            let content = fs::read_to_string(path)?;
            steps.push(serde_json::from_str(&content)?);
        }
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::{
        ExecutionOptions, FlowStatus, RunTrigger, StepStatus, SuiteRef, TriggerSource,
    };
    use std::collections::BTreeMap;

    fn temp_store() -> FileRunStore {
        let dir = std::env::temp_dir().join(format!("flowrunner-store-{}", Uuid::new_v4()));
        FileRunStore::new(dir)
    }

    fn queued_run() -> RunRecord {
        RunRecord::from_trigger(&RunTrigger {
            suite: SuiteRef::Version("flows/ping.yaml".into()),
            priority: None,
            trigger_source: TriggerSource::Cli,
            label: None,
            options: ExecutionOptions::default(),
            requested_by: None,
        })
    }

    fn step(index: usize) -> StepRunRecord {
        StepRunRecord {
            step_index: index,
            step_name: format!("step-{index}"),
            step_id: None,
            qualified_step_id: format!("s::step-{index}"),
            status: StepStatus::Success,
            duration_ms: 5,
            request_snapshot: None,
            response_snapshot: None,
            captures: BTreeMap::new(),
            assertion_results: vec![],
            error_message: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_round_trip() {
        let store = temp_store();
        let run = queued_run();
        store.insert_run(&run).await.unwrap();

        let fetched = store.fetch_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(fetched.run_id, run.run_id);
        assert_eq!(fetched.status, RunStatus::Queued);
    }

    #[tokio::test]
    async fn transition_stamps_started_and_finished() {
        let store = temp_store();
        let run = queued_run();
        store.insert_run(&run).await.unwrap();

        let running = store
            .transition(run.run_id, RunStatus::Running, None)
            .await
            .unwrap();
        assert!(running.started_at.is_some());
        assert!(running.finished_at.is_none());

        let summary = RunSummary {
            status: FlowStatus::Success,
            total_steps: 1,
            passed_steps: 1,
            failed_steps: 0,
            skipped_steps: 0,
            duration_ms: 12,
            error_message: None,
        };
        let completed = store
            .transition(run.run_id, RunStatus::Completed, Some(summary))
            .await
            .unwrap();
        assert!(completed.finished_at.is_some());
        assert!(completed.result_summary.is_some());
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let store = temp_store();
        let run = queued_run();
        store.insert_run(&run).await.unwrap();

        let err = store
            .transition(run.run_id, RunStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        // The record is untouched.
        let fetched = store.fetch_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::Queued);
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let store = temp_store();
        let err = store
            .transition(Uuid::new_v4(), RunStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn step_runs_come_back_in_index_order() {
        let store = temp_store();
        let run = queued_run();
        store.insert_run(&run).await.unwrap();

        for index in [2usize, 0, 1] {
            store.insert_step_run(run.run_id, &step(index)).await.unwrap();
        }

        let steps = store.fetch_step_runs(run.run_id).await.unwrap();
        let indexes: Vec<usize> = steps.iter().map(|s| s.step_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }
}
