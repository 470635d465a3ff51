//! Sample worker — completes `sample-task` jobs with a fresh `updateId`.
//!
//! Runs against the in-process engine, seeded with demo jobs, until every
//! job is done or Ctrl-C is pressed.
//!
//! Usage:
//!   cargo run --features cli --bin zb-sample-worker -- --jobs 20 --max-jobs-active 4
//!   cargo run --features cli --bin zb-sample-worker -- --config zb.yaml

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::json;

use zb_worker::gateway::memory::NewJob;
use zb_worker::{
    telemetry, ClientConfig, InMemoryGateway, Job, JobControls, WorkerConfig, WorkerEvent,
    ZbClient,
};

#[derive(Parser, Debug)]
#[command(name = "zb-sample-worker", about = "Complete sample-task jobs")]
struct Args {
    /// Client configuration file (YAML). Defaults come from the environment.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Job type to work on.
    #[arg(long, short = 't', default_value = "sample-task")]
    job_type: String,

    /// Number of demo jobs to seed.
    #[arg(long, short = 'n', default_value_t = 10)]
    jobs: usize,

    /// Concurrency bound for the worker.
    #[arg(long, default_value_t = 4)]
    max_jobs_active: usize,

    /// Simulated work per job, in milliseconds.
    #[arg(long, default_value_t = 50)]
    work_ms: u64,
}

async fn sample_task(job: Job, controls: JobControls) -> anyhow::Result<()> {
    tracing::info!(
        job_key = job.key,
        bpmn_process_id = %job.headers.bpmn_process_id,
        variables = %serde_json::Value::Object(job.variables.clone()),
        "sample-task received"
    );
    let work_ms = job
        .variable("workMs")
        .and_then(|v| v.as_u64())
        .unwrap_or_default();
    tokio::time::sleep(Duration::from_millis(work_ms)).await;

    controls.succeed_with(&json!({ "updateId": uuid::Uuid::new_v4().to_string() }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ClientConfig::load_from_file(path)?,
        None => ClientConfig::from_env()?,
    };
    tracing::info!(gateway = %config.gateway_address, "sample worker starting (in-memory engine)");

    let gateway = Arc::new(InMemoryGateway::new());
    let keys: Vec<_> = (0..args.jobs)
        .map(|i| {
            let mut variables = zb_worker::Variables::new();
            variables.insert("orderId".to_string(), json!(31243 + i));
            variables.insert("workMs".to_string(), json!(args.work_ms));
            gateway.create_job(NewJob::new(args.job_type.clone()).with_variables(variables))
        })
        .collect();

    let client = ZbClient::new(gateway.clone(), config);
    let mut events = client
        .take_events()
        .context("event channel already taken")?;

    let handle = client.create_worker(
        WorkerConfig::new(args.job_type.clone())
            .with_worker_name("sample-worker")
            .with_max_jobs_active(args.max_jobs_active)
            .with_request_timeout(Duration::from_secs(1)),
        Arc::new(sample_task),
    )?;

    let all_done = async {
        loop {
            let done = keys.iter().all(|key| {
                matches!(
                    gateway.job_status(*key),
                    Some(zb_worker::gateway::memory::JobStatus::Completed { .. })
                )
            });
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };

    let worker_stopped = async {
        while let Some(event) = events.recv().await {
            match event {
                WorkerEvent::WorkerStopped { error, .. } => return error,
                WorkerEvent::CompletionFailed { error, .. } => {
                    tracing::warn!(error = %error, "outcome not delivered")
                }
            }
        }
        None
    };

    tokio::select! {
        _ = all_done => tracing::info!(jobs = keys.len(), "all sample jobs completed"),
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
        stopped = worker_stopped => {
            if let Some(e) = stopped {
                tracing::error!(error = %e, "worker stopped");
            }
        }
    }

    if let Some(stats) = client.pool().stats(&handle) {
        tracing::info!(
            completed = stats.completed,
            peak_in_flight = stats.peak_in_flight,
            "sample worker stats"
        );
    }
    let report = client.close().await;
    tracing::info!(drained = report.drained.len(), forced = report.forced.len(), "shutdown complete");
    Ok(())
}
