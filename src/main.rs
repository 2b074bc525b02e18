//! flowrunner: a declarative API flow testing engine.
//!
//! Suites are YAML documents describing ordered HTTP interactions with
//! variable interpolation, assertions, captures and cross-suite calls.
//! `execute` submits a run through the queue dispatcher (with inline
//! fallback) and waits for its terminal status; `validate` checks a
//! document without executing anything.

mod assertions;
mod calls;
mod captures;
mod config;
mod context;
mod engine;
mod errors;
mod events;
mod expr;
mod http;
mod loader;
mod queue;
mod registry;
mod runs;
mod steps;
mod store;
mod suite;
mod telemetry;

use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};

use crate::config::EngineConfig;
use crate::engine::FlowEngine;
use crate::events::{EventBroadcaster, FlowEvent};
use crate::queue::{Dispatcher, InProcessQueue, JobHistory, RunExecutor, WorkerPool};
use crate::runs::{ExecutionOptions, RunStatus, RunTrigger, SuiteRef, TriggerSource};
use crate::store::{FileRunStore, RunRepository};
use crate::suite::validate::validate_suite;
use crate::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "flowrunner")]
#[command(about = "Declarative API flow testing engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Executes a flow suite and reports the run result.
    Execute {
        /// Path to the suite document (YAML or JSON).
        #[arg(short, long)]
        file: PathBuf,

        /// Where to write the run report. Prints to stdout when omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Run-level "keep going on failure".
        #[arg(long, default_value = "false")]
        continue_on_failure: bool,

        /// Input payload as JSON, consumed by `input` steps.
        #[arg(long)]
        input: Option<String>,

        /// Enable OTLP trace export.
        #[arg(long, default_value = "false")]
        otel: bool,

        /// OTLP collector endpoint; defaults to the standard env variable
        /// or http://localhost:4317.
        #[arg(long)]
        otel_endpoint: Option<String>,

        /// Only critical errors on stderr.
        #[arg(long, short = 's', default_value = "false")]
        silent: bool,

        /// Detailed debug logging.
        #[arg(long, short = 'v', default_value = "false")]
        verbose: bool,

        /// Label attached to the run and its queue job.
        #[arg(long)]
        label: Option<String>,
    },

    /// Validates a suite document without executing it.
    Validate {
        /// Path to the suite document.
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Execute {
            file,
            output,
            continue_on_failure,
            input,
            otel,
            otel_endpoint,
            silent,
            verbose,
            label,
        } => {
            let mut telemetry_config = TelemetryConfig::from_env();
            telemetry_config.log_level = if *silent {
                Level::ERROR
            } else if *verbose {
                Level::DEBUG
            } else {
                Level::INFO
            };
            if *otel {
                if let Some(endpoint) = otel_endpoint {
                    telemetry_config.otlp_endpoint = Some(endpoint.clone());
                } else if telemetry_config.otlp_endpoint.is_none() {
                    telemetry_config.otlp_endpoint = Some("http://localhost:4317".to_string());
                }
            }
            if let Err(e) = init_telemetry(telemetry_config) {
                if !*silent {
                    eprintln!("warning: failed to initialize telemetry: {e}");
                }
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                    .try_init();
            }

            let exit_code =
                execute_suite(file, output, *continue_on_failure, input, label, *silent).await;

            shutdown_telemetry();
            std::process::exit(exit_code);
        }
        Commands::Validate { file } => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();
            std::process::exit(validate_file(file));
        }
    }
}

async fn execute_suite(
    file: &PathBuf,
    output: &Option<PathBuf>,
    continue_on_failure: bool,
    input: &Option<String>,
    label: &Option<String>,
    silent: bool,
) -> i32 {
    let file = match file.canonicalize() {
        Ok(path) => path,
        Err(e) => {
            error!(file = %file.display(), error = %e, "suite file not found");
            return 1;
        }
    };

    let mut config = EngineConfig::from_env();
    if std::env::var("FLOWRUNNER_SUITES_DIR").is_err() {
        // Calls resolve relative to the executed suite by default.
        if let Some(parent) = file.parent() {
            config.suites_dir = parent.to_path_buf();
        }
    }
    let config = Arc::new(config);

    let input_payload = match input {
        Some(raw) => match serde_json::from_str(raw) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) => {
                error!("--input must be a JSON object");
                return 1;
            }
            Err(e) => {
                error!(error = %e, "--input is not valid JSON");
                return 1;
            }
        },
        None => serde_json::Map::new(),
    };

    let repository: Arc<dyn RunRepository> = Arc::new(FileRunStore::new(config.data_dir.clone()));
    let broadcaster = EventBroadcaster::default();
    let engine = Arc::new(
        FlowEngine::new(Arc::clone(&config))
            .with_broadcaster(broadcaster.clone())
            .with_repository(Arc::clone(&repository)),
    );
    let history = Arc::new(JobHistory::new(config.queue.retention));
    let executor = Arc::new(RunExecutor::new(
        Arc::clone(&config),
        Arc::clone(&repository),
        engine,
        history,
    ));
    let (queue, rx) = InProcessQueue::new(&config, 64);
    let pool = WorkerPool::start(config.worker_count, rx, Arc::clone(&executor));
    let dispatcher = Dispatcher::new(
        Arc::clone(&config),
        Arc::clone(&repository),
        Arc::new(queue),
        executor,
    );

    if !silent {
        let mut events = broadcaster.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let FlowEvent::ProgressUpdate {
                    completed_steps,
                    total_steps,
                    current_step,
                    progress_percentage,
                    ..
                } = event
                {
                    info!(
                        step = %current_step,
                        completed = completed_steps,
                        total = total_steps,
                        percent = progress_percentage,
                        "progress"
                    );
                }
            }
        });
    }

    let trigger = RunTrigger {
        suite: SuiteRef::Version(file.to_string_lossy().to_string()),
        priority: None,
        trigger_source: TriggerSource::Cli,
        label: label.clone(),
        options: ExecutionOptions {
            continue_on_failure,
            input_payload,
            ..Default::default()
        },
        requested_by: None,
    };

    let submitted = match dispatcher.submit(trigger).await {
        Ok(run) => run,
        Err(e) => {
            error!(error = %e, "failed to submit run");
            pool.abort();
            return 1;
        }
    };

    // Poll until the worker settles the run. The inline fallback may have
    // settled it already.
    let run = {
        let mut current = submitted;
        while !current.status.is_terminal() && current.status != RunStatus::WaitingInput {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            match repository.fetch_run(current.run_id).await {
                Ok(Some(run)) => current = run,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "failed to poll run status");
                    break;
                }
            }
        }
        current
    };
    pool.abort();

    let steps = repository
        .fetch_step_runs(run.run_id)
        .await
        .unwrap_or_default();
    let report = json!({ "run": run, "steps": steps });
    let rendered = serde_json::to_string_pretty(&report).unwrap_or_else(|_| "{}".to_string());

    if let Some(path) = output {
        if let Err(e) = std::fs::write(path, &rendered) {
            error!(path = %path.display(), error = %e, "failed to write report");
        } else if !silent {
            info!(path = %path.display(), "report written");
        }
    } else if !silent {
        println!("{rendered}");
    }

    let run_id = run.run_id;
    match run.status {
        RunStatus::Completed => 0,
        RunStatus::WaitingInput => {
            info!(%run_id, "run is waiting for input; resume with --input");
            2
        }
        _ => 1,
    }
}

fn validate_file(file: &PathBuf) -> i32 {
    let suite = match loader::load_suite(file) {
        Ok(suite) => suite,
        Err(e) => {
            error!(file = %file.display(), error = %e, "failed to load suite");
            return 1;
        }
    };
    match validate_suite(&suite) {
        Ok(()) => {
            info!(suite = %suite.suite_name, steps = suite.steps.len(), "suite is valid");
            0
        }
        Err(report) => {
            error!(suite = %suite.suite_name, errors = report.len(), "suite failed validation");
            for problem in &report {
                error!("  [{}] {problem}", problem.code());
            }
            1
        }
    }
}
