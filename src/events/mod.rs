//! Progress event streaming.
//!
//! The flow engine publishes lifecycle events to whoever subscribed; the
//! suite keeps executing whether anyone listens or not. Per subscriber,
//! events arrive in emit order. Subscriber work never counts against step
//! durations; publishing is a non-blocking channel send.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// One progress event. Every variant carries the run id and a timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FlowEvent {
    FlowStarted {
        run_id: Uuid,
        ts: DateTime<Utc>,
        suite_name: String,
        total_steps: usize,
        start_time: DateTime<Utc>,
    },
    StepStarted {
        run_id: Uuid,
        ts: DateTime<Utc>,
        step_index: usize,
        step_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        step_index_1based: usize,
        total_steps: usize,
    },
    StepCompleted {
        run_id: Uuid,
        ts: DateTime<Utc>,
        step_index: usize,
        step_name: String,
        duration_ms: u64,
        assertions_passed: usize,
        variables_captured: usize,
    },
    StepFailed {
        run_id: Uuid,
        ts: DateTime<Utc>,
        step_index: usize,
        step_name: String,
        error_message: String,
        duration_ms: u64,
    },
    ProgressUpdate {
        run_id: Uuid,
        ts: DateTime<Utc>,
        total_steps: usize,
        completed_steps: usize,
        current_step: String,
        status: String,
        progress_percentage: u32,
    },
    FlowCompleted {
        run_id: Uuid,
        ts: DateTime<Utc>,
        duration_ms: u64,
        passed_steps: usize,
        failed_steps: usize,
        total_steps: usize,
    },
    FlowFailed {
        run_id: Uuid,
        ts: DateTime<Utc>,
        error_message: String,
        duration_ms: u64,
        passed_steps: usize,
        failed_steps: usize,
    },
}

impl FlowEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::FlowStarted { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::StepFailed { run_id, .. }
            | Self::ProgressUpdate { run_id, .. }
            | Self::FlowCompleted { run_id, .. }
            | Self::FlowFailed { run_id, .. } => *run_id,
        }
    }
}

/// Integer percentage the progress events carry.
pub fn progress_percentage(completed: usize, total: usize) -> u32 {
    if total == 0 {
        return 100;
    }
    ((completed as f64 / total as f64) * 100.0).round() as u32
}

/// In-memory broadcast bus. Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<FlowEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event. Having no subscribers is not an error, and no
    /// publish failure ever reaches the engine.
    pub fn publish(&self, event: FlowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
