//! Run and step-run records.
//!
//! A run is one attempt to execute one suite version. Its status only moves
//! along the state machine below; every transition is checked by
//! [`RunStatus::can_transition_to`] before the store accepts it.
//!
//! ```text
//! QUEUED ──start──> RUNNING ──complete──> COMPLETED
//!                     │   ├─fail────────> FAILED
//!                     │   ├─await input─> WAITING_INPUT ──resume──> RUNNING
//!                     │   └─cancel─────> CANCELLED
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::assertions::AssertionResult;
use crate::http::{RequestSnapshot, ResponseSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Running,
    WaitingInput,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (RunStatus::Queued, RunStatus::Running)
                | (RunStatus::Queued, RunStatus::Failed)
                | (RunStatus::Queued, RunStatus::Cancelled)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::WaitingInput)
                | (RunStatus::Running, RunStatus::Cancelled)
                | (RunStatus::WaitingInput, RunStatus::Running)
                | (RunStatus::WaitingInput, RunStatus::Failed)
                | (RunStatus::WaitingInput, RunStatus::Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Queued => write!(f, "QUEUED"),
            RunStatus::Running => write!(f, "RUNNING"),
            RunStatus::WaitingInput => write!(f, "WAITING_INPUT"),
            RunStatus::Completed => write!(f, "COMPLETED"),
            RunStatus::Failed => write!(f, "FAILED"),
            RunStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Status of a single step execution. Independent of the run status: a
/// FAILED step only fails the run through the stop policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    WaitingInput,
    Success,
    Warning,
    Failed,
    Skipped,
    Aborted,
}

impl StepStatus {
    /// Counts toward suite success. WARNING is a success with a note.
    pub fn is_passing(self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Warning)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerSource {
    Cli,
    Api,
    Schedule,
    Dependency,
}

impl Default for TriggerSource {
    fn default() -> Self {
        TriggerSource::Cli
    }
}

/// Per-run options supplied at trigger time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Overrides merged over the suite's declared variables; these win.
    #[serde(default)]
    pub variables: Map<String, Value>,

    /// Run-level "keep going on failure". Steps still record FAILED.
    #[serde(default)]
    pub continue_on_failure: bool,

    /// Values consumed by `input` steps, keyed by variable name.
    #[serde(default)]
    pub input_payload: Map<String, Value>,

    /// Overrides the configured global run timeout, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// What to execute: a concrete version document, or a suite known to the
/// registry directory by node id (optionally pinned to a version).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteRef {
    /// Path to the suite version document.
    Version(String),
    /// Node id resolved under the configured suites directory.
    Node {
        node_id: String,
        #[serde(default)]
        version: Option<String>,
    },
}

impl SuiteRef {
    pub fn describe(&self) -> String {
        match self {
            SuiteRef::Version(path) => path.clone(),
            SuiteRef::Node { node_id, version } => match version {
                Some(v) => format!("{node_id}@{v}"),
                None => node_id.clone(),
            },
        }
    }
}

/// Submission request crossing the boundary into the execution core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTrigger {
    pub suite: SuiteRef,

    #[serde(default)]
    pub priority: Option<String>,

    #[serde(default)]
    pub trigger_source: TriggerSource,

    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub options: ExecutionOptions,

    #[serde(default)]
    pub requested_by: Option<String>,
}

/// The durable record of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub suite_ref: SuiteRef,

    #[serde(default)]
    pub version_ref: Option<String>,

    pub status: RunStatus,

    #[serde(default)]
    pub priority: Option<String>,

    pub trigger_source: TriggerSource,

    #[serde(default)]
    pub label: Option<String>,

    /// Retained verbatim so `retry` can clone the original submission.
    pub options: ExecutionOptions,

    pub queued_at: DateTime<Utc>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub result_summary: Option<RunSummary>,

    #[serde(default)]
    pub requested_by: Option<String>,
}

impl RunRecord {
    pub fn from_trigger(trigger: &RunTrigger) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            suite_ref: trigger.suite.clone(),
            version_ref: match &trigger.suite {
                SuiteRef::Node { version, .. } => version.clone(),
                SuiteRef::Version(_) => None,
            },
            status: RunStatus::Queued,
            priority: trigger.priority.clone(),
            trigger_source: trigger.trigger_source,
            label: trigger.label.clone(),
            options: trigger.options.clone(),
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result_summary: None,
            requested_by: trigger.requested_by.clone(),
        }
    }

    /// Rebuilds the submission this run came from, for the retry operation.
    pub fn to_trigger(&self) -> RunTrigger {
        RunTrigger {
            suite: self.suite_ref.clone(),
            priority: self.priority.clone(),
            trigger_source: self.trigger_source,
            label: self.label.clone(),
            options: self.options.clone(),
            requested_by: self.requested_by.clone(),
        }
    }
}

/// Aggregate outcome persisted with the terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub status: FlowStatus,
    pub total_steps: usize,
    pub passed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub duration_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Outcome of one suite execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Success,
    Failure,
    Cancelled,
    AwaitingInput,
}

/// Record of one step execution within a run. `(run_id, step_index)` is the
/// storage key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRunRecord {
    pub step_index: usize,
    pub step_name: String,

    #[serde(default)]
    pub step_id: Option<String>,

    /// `<suite namespace>::<step identifier>`.
    pub qualified_step_id: String,

    pub status: StepStatus,
    pub duration_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_snapshot: Option<RequestSnapshot>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_snapshot: Option<ResponseSnapshot>,

    #[serde(default)]
    pub captures: BTreeMap<String, Value>,

    #[serde(default)]
    pub assertion_results: Vec<AssertionResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// In-memory aggregate of a finished (or paused) suite execution. The
/// persisted rows are the source of truth; this is what the engine hands
/// back to the worker and the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowResult {
    pub run_id: Uuid,
    pub suite_name: String,
    pub status: FlowStatus,
    pub steps: Vec<StepRunRecord>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl FlowResult {
    pub fn summary(&self) -> RunSummary {
        let passed = self
            .steps
            .iter()
            .filter(|s| s.status.is_passing())
            .count();
        let failed = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed || s.status == StepStatus::Aborted)
            .count();
        let skipped = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Skipped)
            .count();
        RunSummary {
            status: self.status,
            total_steps: self.steps.len(),
            passed_steps: passed,
            failed_steps: failed,
            skipped_steps: skipped,
            duration_ms: self.duration_ms,
            error_message: self.error_message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_the_state_machine() {
        assert!(RunStatus::Queued.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::WaitingInput));
        assert!(RunStatus::WaitingInput.can_transition_to(RunStatus::Running));

        assert!(!RunStatus::Queued.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Queued));
        assert!(!RunStatus::Cancelled.can_transition_to(RunStatus::Running));
    }

    #[test]
    fn terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::WaitingInput.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
    }

    #[test]
    fn retry_clones_the_original_trigger() {
        let trigger = RunTrigger {
            suite: SuiteRef::Node {
                node_id: "auth".into(),
                version: Some("3".into()),
            },
            priority: Some("high".into()),
            trigger_source: TriggerSource::Api,
            label: Some("nightly".into()),
            options: ExecutionOptions {
                continue_on_failure: true,
                ..Default::default()
            },
            requested_by: Some("ops".into()),
        };
        let run = RunRecord::from_trigger(&trigger);
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.version_ref.as_deref(), Some("3"));

        let cloned = run.to_trigger();
        assert_eq!(cloned.suite, trigger.suite);
        assert_eq!(cloned.label, trigger.label);
        assert!(cloned.options.continue_on_failure);
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&RunStatus::WaitingInput).unwrap();
        assert_eq!(json, "\"WAITING_INPUT\"");
    }
}
