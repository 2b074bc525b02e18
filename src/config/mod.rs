//! Engine-wide configuration.
//!
//! Loaded once from environment variables with safe defaults, then shared
//! read-only across workers. The fake-data generators are deliberately not
//! seedable: suites relying on generator output must capture it, not
//! predict it.

use std::path::PathBuf;
use std::time::Duration;

/// Maximum depth of a cross-suite call chain.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 10;

/// Number of workers consuming the run queue.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Wall-clock limit for a single run.
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 300;

/// Delay between enqueue attempts when the queue pushes back.
pub const DEFAULT_QUEUE_BACKOFF_MS: u64 = 3_000;

/// How many finished job records the queue keeps for inspection.
pub const DEFAULT_QUEUE_RETENTION: usize = 50;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory suites may be resolved from; `call` targets must not
    /// escape it.
    pub suites_dir: PathBuf,

    /// Directory for persisted run and step-run records.
    pub data_dir: PathBuf,

    /// Cross-suite call chain limit. Exceeding it is fatal for the step.
    pub max_call_depth: usize,

    pub worker_count: usize,

    /// Global per-run timeout enforced by the worker.
    pub run_timeout: Duration,

    pub queue: QueueConfig,

    /// When false, unresolved `{{...}}` tokens are left in place silently
    /// instead of producing a warning log.
    pub warn_on_missing_vars: bool,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    /// Delivery attempts per job. Kept at 1 so a crash after a run
    /// completed does not re-execute it.
    pub default_attempts: u32,
    pub backoff: Duration,
    pub retention: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            suites_dir: PathBuf::from("."),
            data_dir: PathBuf::from(".flowrunner"),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            worker_count: DEFAULT_WORKER_COUNT,
            run_timeout: Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS),
            queue: QueueConfig::default(),
            warn_on_missing_vars: true,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "flow-runs".to_string(),
            default_attempts: 1,
            backoff: Duration::from_millis(DEFAULT_QUEUE_BACKOFF_MS),
            retention: DEFAULT_QUEUE_RETENTION,
        }
    }
}

impl EngineConfig {
    /// Builds the configuration from `FLOWRUNNER_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("FLOWRUNNER_SUITES_DIR") {
            config.suites_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("FLOWRUNNER_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(depth) = env_parse::<usize>("FLOWRUNNER_MAX_CALL_DEPTH") {
            config.max_call_depth = depth.max(1);
        }
        if let Some(workers) = env_parse::<usize>("FLOWRUNNER_WORKERS") {
            config.worker_count = workers.max(1);
        }
        if let Some(secs) = env_parse::<u64>("FLOWRUNNER_RUN_TIMEOUT_SECS") {
            config.run_timeout = Duration::from_secs(secs);
        }
        if let Ok(name) = std::env::var("FLOWRUNNER_QUEUE_NAME") {
            if !name.trim().is_empty() {
                config.queue.name = name;
            }
        }
        if let Some(attempts) = env_parse::<u32>("FLOWRUNNER_QUEUE_ATTEMPTS") {
            config.queue.default_attempts = attempts.max(1);
        }
        if let Some(ms) = env_parse::<u64>("FLOWRUNNER_QUEUE_BACKOFF_MS") {
            config.queue.backoff = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>("FLOWRUNNER_QUEUE_RETENTION") {
            config.queue.retention = n;
        }
        if let Some(warn) = env_parse::<bool>("FLOWRUNNER_WARN_MISSING_VARS") {
            config.warn_on_missing_vars = warn;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
