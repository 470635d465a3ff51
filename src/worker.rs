//! JobWorker — the polling and dispatch loop for one registered worker.
//!
//! ```text
//!   Idle ──permit──▶ Polling ──jobs──▶ Dispatching ──▶ Idle
//!     ▲                 │ empty / transient error           │
//!     └──── sleep ◀─────┘                                    │
//!   any state ──stop──▶ Draining ──in-flight done──▶ Stopped
//! ```
//!
//! Admission is a semaphore sized to `max_jobs_active`. The loop waits for
//! one free permit, grabs whatever else is free, and asks the engine for that
//! many jobs. Each job's permit is shared by its dispatch task and its
//! handler task and is returned only when both have finished: a handler that
//! outlives its lease keeps its slot even though the job was abandoned, so
//! running handlers never exceed the configured bound.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use crate::codec;
use crate::completion::CompletionPipeline;
use crate::config::WorkerConfig;
use crate::error::{CompletionError, WorkerError, WorkerResult};
use crate::gateway::{ActivateJobsRequest, Gateway};
use crate::handler::{self, Invocation, JobHandler, PAYLOAD_DECODE_ERROR_CODE};
use crate::lease::LeaseTracker;
use crate::pool::{self, WorkerEvent};
use crate::types::{deadline_from_millis, ActivatedJob, Outcome, OutcomeKind};

// ---------------------------------------------------------------------------
// State & stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Polling,
    Dispatching,
    Draining,
    Stopped,
}

/// Live counters for one worker.
#[derive(Debug, Default)]
pub struct WorkerStats {
    activated: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    errored: AtomicU64,
    abandoned: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub activated: u64,
    pub completed: u64,
    pub failed: u64,
    pub errored: u64,
    pub abandoned: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            activated: self.activated.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
        }
    }

    fn job_started(&self) {
        self.activated.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
    }

    fn job_finished(&self) {
        // Saturating: a forced stop may already have zeroed the gauge.
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn record(&self, kind: OutcomeKind) {
        let counter = match kind {
            OutcomeKind::Success => &self.completed,
            OutcomeKind::Failure => &self.failed,
            OutcomeKind::Error => &self.errored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    /// Count every in-flight job as abandoned (the dispatch tasks were aborted).
    pub(crate) fn abandon_in_flight(&self) {
        let n = self.in_flight.swap(0, Ordering::AcqRel);
        self.abandoned.fetch_add(n as u64, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// JobWorker
// ---------------------------------------------------------------------------

/// Polls one job type and dispatches jobs to a handler.
pub struct JobWorker {
    id: Uuid,
    config: WorkerConfig,
    gateway: Arc<dyn Gateway>,
    handler: Arc<dyn JobHandler>,
    completion: Arc<CompletionPipeline>,
    gate: Arc<Semaphore>,
    stats: Arc<WorkerStats>,
    state_tx: watch::Sender<WorkerState>,
    events: Option<mpsc::Sender<WorkerEvent>>,
}

/// Everything a dispatch task needs, detached from the loop.
#[derive(Clone)]
struct DispatchContext {
    worker_id: Uuid,
    worker: String,
    handler: Arc<dyn JobHandler>,
    leases: Arc<LeaseTracker>,
    completion: Arc<CompletionPipeline>,
    stats: Arc<WorkerStats>,
    events: Option<mpsc::Sender<WorkerEvent>>,
}

impl JobWorker {
    pub fn new(config: WorkerConfig, gateway: Arc<dyn Gateway>, handler: Arc<dyn JobHandler>) -> Self {
        let leases = Arc::new(LeaseTracker::new());
        let completion = Arc::new(CompletionPipeline::new(
            gateway.clone(),
            leases,
            config.completion_retry.clone(),
            config.worker_name.clone(),
        ));
        let (state_tx, _) = watch::channel(WorkerState::Idle);
        Self {
            id: Uuid::new_v4(),
            gate: Arc::new(Semaphore::new(config.max_jobs_active)),
            config,
            gateway,
            handler,
            completion,
            stats: Arc::new(WorkerStats::default()),
            state_tx,
            events: None,
        }
    }

    /// Send completion failures and the stop notice to `events`.
    pub fn with_events(mut self, events: mpsc::Sender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    pub fn leases(&self) -> &Arc<LeaseTracker> {
        self.completion.leases()
    }

    pub fn completion(&self) -> &Arc<CompletionPipeline> {
        &self.completion
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: WorkerState) {
        self.state_tx.send_replace(state);
    }

    fn dispatch_context(&self) -> DispatchContext {
        DispatchContext {
            worker_id: self.id,
            worker: self.config.worker_name.clone(),
            handler: self.handler.clone(),
            leases: self.completion.leases().clone(),
            completion: self.completion.clone(),
            stats: self.stats.clone(),
            events: self.events.clone(),
        }
    }

    /// Run until `shutdown_rx` flips (or its sender is dropped), then drain.
    ///
    /// Returns `Err` only for fatal activation errors; the worker has stopped
    /// and drained by then.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> WorkerResult<()> {
        let worker = self.config.worker_name.as_str();
        tracing::info!(
            worker,
            job_type = %self.config.job_type,
            max_jobs_active = self.config.max_jobs_active,
            "JobWorker started"
        );

        let mut dispatches: JoinSet<()> = JoinSet::new();
        let mut poll_failures = 0u32;

        let result = 'poll: loop {
            if *shutdown_rx.borrow() {
                break Ok(());
            }
            while let Some(joined) = dispatches.try_join_next() {
                log_dispatch_join(worker, joined);
            }
            self.set_state(WorkerState::Idle);

            let first = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break Ok(()),
                permit = self.gate.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };
            let mut permits = vec![first];
            while permits.len() < self.config.max_jobs_active {
                match self.gate.clone().try_acquire_owned() {
                    Ok(permit) => permits.push(permit),
                    Err(_) => break,
                }
            }

            self.set_state(WorkerState::Polling);
            let request = self.activation_request(permits.len());
            let polled = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    tracing::debug!(worker, "JobWorker: stop requested during long-poll, aborting it");
                    break Ok(());
                }
                polled = self.gateway.activate_jobs(request) => polled,
            };

            match polled {
                Ok(jobs) if jobs.is_empty() => {
                    poll_failures = 0;
                    drop(permits);
                    tracing::debug!(worker, "JobWorker: no jobs activated");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                        _ = shutdown_rx.changed() => break Ok(()),
                    }
                }
                Ok(jobs) => {
                    poll_failures = 0;
                    self.set_state(WorkerState::Dispatching);
                    tracing::debug!(worker, count = jobs.len(), "JobWorker: jobs activated");
                    for job in jobs {
                        let permit = match permits.pop() {
                            Some(permit) => permit,
                            None => {
                                tracing::warn!(
                                    worker,
                                    job_key = job.key,
                                    "JobWorker: engine returned more jobs than requested, waiting for capacity"
                                );
                                tokio::select! {
                                    biased;
                                    _ = shutdown_rx.changed() => {
                                        tracing::debug!(
                                            worker,
                                            "JobWorker: stop requested while waiting for capacity, undispatched jobs left to lease expiry"
                                        );
                                        break 'poll Ok(());
                                    }
                                    permit = self.gate.clone().acquire_owned() => match permit {
                                        Ok(permit) => permit,
                                        Err(_) => break 'poll Ok(()),
                                    },
                                }
                            }
                        };
                        let ctx = self.dispatch_context();
                        dispatches.spawn(dispatch(ctx, job, permit));
                    }
                }
                Err(err) if err.is_transient() => {
                    drop(permits);
                    poll_failures += 1;
                    if !self.config.poll_retry.allows_retry(poll_failures) {
                        tracing::error!(
                            worker,
                            attempts = poll_failures,
                            error = %err,
                            "JobWorker: activation retries exhausted"
                        );
                        break Err(WorkerError::FatalRpc {
                            worker: worker.to_string(),
                            source: err,
                        });
                    }
                    let delay = self.config.poll_retry.delay_for(poll_failures);
                    tracing::warn!(
                        worker,
                        attempt = poll_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "JobWorker: transient activation failure, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => break Ok(()),
                    }
                }
                Err(err) => {
                    tracing::error!(
                        worker,
                        job_type = %self.config.job_type,
                        error = %err,
                        "JobWorker: fatal activation error, stopping"
                    );
                    break Err(WorkerError::FatalRpc {
                        worker: worker.to_string(),
                        source: err,
                    });
                }
            }
        };

        self.set_state(WorkerState::Draining);
        if !dispatches.is_empty() {
            tracing::info!(
                worker,
                in_flight = dispatches.len(),
                "JobWorker draining"
            );
        }
        while let Some(joined) = dispatches.join_next().await {
            log_dispatch_join(worker, joined);
        }
        self.set_state(WorkerState::Stopped);

        let stats = self.stats.snapshot();
        tracing::info!(
            worker,
            activated = stats.activated,
            completed = stats.completed,
            failed = stats.failed,
            errored = stats.errored,
            abandoned = stats.abandoned,
            "JobWorker stopped"
        );
        result
    }

    fn activation_request(&self, capacity: usize) -> ActivateJobsRequest {
        ActivateJobsRequest {
            job_type: self.config.job_type.clone(),
            worker: self.config.worker_name.clone(),
            timeout: self.config.job_timeout(),
            max_jobs_to_activate: capacity as u32,
            fetch_variables: self.config.fetch_variables.clone(),
            request_timeout: self.config.request_timeout(),
        }
    }
}

fn log_dispatch_join(worker: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(worker, error = %e, "JobWorker: dispatch task panicked");
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Decode, lease, run the handler and submit the outcome of one job.
async fn dispatch(ctx: DispatchContext, activated: ActivatedJob, permit: OwnedSemaphorePermit) {
    let slot = Arc::new(permit);
    let job_key = activated.key;
    let span = tracing::info_span!(
        "job",
        job_key,
        job_type = %activated.job_type,
        worker = %ctx.worker
    );

    async move {
        ctx.stats.job_started();
        let generation = ctx
            .leases
            .register(job_key, deadline_from_millis(activated.deadline));

        let outcome = match codec::parse_job(activated) {
            Ok(job) => {
                let budget = ctx
                    .leases
                    .remaining(job_key)
                    .map(|r| r.as_duration())
                    .unwrap_or_default();
                match handler::invoke(ctx.handler.clone(), job, budget, slot.clone()).await {
                    Invocation::Reported(outcome) => Some(outcome),
                    Invocation::Unreported => {
                        tracing::warn!(
                            "JobWorker: handler dropped its controls without reporting, job left to lease expiry"
                        );
                        None
                    }
                    Invocation::TimedOut => {
                        tracing::warn!(
                            "JobWorker: lease expired before the handler reported, job abandoned, handler keeps its slot"
                        );
                        None
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "JobWorker: payload decode failed");
                Some(Outcome::Error {
                    code: PAYLOAD_DECODE_ERROR_CODE.to_string(),
                    message: e.to_string(),
                })
            }
        };

        match outcome {
            Some(outcome) => {
                let kind = outcome.kind();
                match ctx.completion.submit(job_key, outcome).await {
                    Ok(_) => ctx.stats.record(kind),
                    Err(err) => report_completion_error(&ctx, err),
                }
            }
            None => {
                ctx.leases.release_generation(job_key, generation);
                ctx.stats.record_abandoned();
            }
        }
        ctx.stats.job_finished();
        drop(slot);
    }
    .instrument(span)
    .await
}

fn report_completion_error(ctx: &DispatchContext, err: CompletionError) {
    match &err {
        CompletionError::DuplicateCompletion { .. } => {
            tracing::debug!(error = %err, "JobWorker: duplicate outcome ignored");
            return;
        }
        CompletionError::LeaseExpired { .. } => {
            tracing::warn!(error = %err, "JobWorker: outcome arrived after lease expiry");
            ctx.stats.record_abandoned();
            return;
        }
        _ => {
            tracing::warn!(error = %err, "JobWorker: outcome could not be delivered");
            ctx.stats.record_abandoned();
        }
    }
    if let Some(events) = &ctx.events {
        pool::emit(
            events,
            WorkerEvent::CompletionFailed {
                worker_id: ctx.worker_id,
                worker: ctx.worker.clone(),
                error: err,
            },
        );
    }
}
