//! WorkerPool — owns the running workers and coordinates their shutdown.
//!
//! Every registered worker runs its [`JobWorker`] loop on its own task with
//! a private shutdown signal. Worker-level failures and undeliverable
//! outcomes reach the application through a single event channel
//! ([`WorkerPool::take_events`]); nothing is raised as a panic. The channel
//! holds at most [`EVENT_BUFFER`] undelivered events; past that, or when
//! nobody has taken the receiver, new events are logged and dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{CompletionError, WorkerError, WorkerResult};
use crate::gateway::Gateway;
use crate::handler::JobHandler;
use crate::types::JobKey;
use crate::worker::{JobWorker, WorkerState, WorkerStats, WorkerStatsSnapshot};

/// Capacity of the worker event channel.
pub const EVENT_BUFFER: usize = 1024;

/// Reference to a registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerHandle {
    pub id: Uuid,
    pub name: String,
    pub job_type: String,
}

/// Notifications from running workers.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// An outcome could not be delivered; the job is left to lease expiry.
    CompletionFailed {
        worker_id: Uuid,
        worker: String,
        error: CompletionError,
    },
    /// A worker loop ended. `error` is set when it stopped on its own
    /// (fatal activation error) or was force-stopped.
    WorkerStopped {
        worker_id: Uuid,
        worker: String,
        error: Option<WorkerError>,
    },
}

impl WorkerEvent {
    pub fn worker_id(&self) -> Uuid {
        match self {
            WorkerEvent::CompletionFailed { worker_id, .. }
            | WorkerEvent::WorkerStopped { worker_id, .. } => *worker_id,
        }
    }

    pub fn job_key(&self) -> Option<JobKey> {
        match self {
            WorkerEvent::CompletionFailed { error, .. } => Some(error.job_key()),
            WorkerEvent::WorkerStopped { .. } => None,
        }
    }
}

/// How a single worker stop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// Every in-flight job finished before the timeout.
    Drained,
    /// The timeout passed; in-flight jobs were abandoned to lease expiry.
    Forced,
}

/// Result of [`WorkerPool::stop_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    pub drained: Vec<WorkerHandle>,
    pub forced: Vec<WorkerHandle>,
}

impl StopReport {
    pub fn total(&self) -> usize {
        self.drained.len() + self.forced.len()
    }
}

struct RunningWorker {
    handle: WorkerHandle,
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<WorkerState>,
    stats: Arc<WorkerStats>,
    task: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

pub struct WorkerPool {
    gateway: Arc<dyn Gateway>,
    shutdown_timeout: Duration,
    workers: Mutex<HashMap<Uuid, RunningWorker>>,
    events_tx: mpsc::Sender<WorkerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<WorkerEvent>>>,
}

impl WorkerPool {
    pub fn new(gateway: Arc<dyn Gateway>, shutdown_timeout: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            gateway,
            shutdown_timeout,
            workers: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<Uuid, RunningWorker>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The event receiver. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<WorkerEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Validate `config` and start its worker loop. Must be called from
    /// within a tokio runtime.
    pub fn register_worker(
        &self,
        config: WorkerConfig,
        handler: Arc<dyn JobHandler>,
    ) -> WorkerResult<WorkerHandle> {
        config.validate()?;

        let worker = JobWorker::new(config, self.gateway.clone(), handler)
            .with_events(self.events_tx.clone());
        let handle = WorkerHandle {
            id: worker.id(),
            name: worker.config().worker_name.clone(),
            job_type: worker.config().job_type.clone(),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state_rx = worker.subscribe_state();
        let stats = worker.stats();

        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let result = worker.run(shutdown_rx).await;
            emit(
                &events,
                WorkerEvent::WorkerStopped {
                    worker_id: worker.id(),
                    worker: worker.config().worker_name.clone(),
                    error: result.err(),
                },
            );
        });

        tracing::info!(
            worker = %handle.name,
            job_type = %handle.job_type,
            worker_id = %handle.id,
            "WorkerPool: worker registered"
        );
        self.workers().insert(
            handle.id,
            RunningWorker {
                handle: handle.clone(),
                shutdown_tx,
                state_rx,
                stats,
                task,
            },
        );
        Ok(handle)
    }

    /// Stop one worker: stop polling, drain within the shutdown timeout,
    /// force-stop past it.
    pub async fn stop(&self, handle: &WorkerHandle) -> WorkerResult<StopKind> {
        let running = self
            .workers()
            .remove(&handle.id)
            .ok_or_else(|| WorkerError::NotFound(handle.id.to_string()))?;
        let _ = running.shutdown_tx.send(true);
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        Ok(self.await_stopped(running, deadline).await.0)
    }

    /// Stop every worker concurrently, bounded by the shutdown timeout.
    pub async fn stop_all(&self) -> StopReport {
        let running: Vec<RunningWorker> = self.workers().drain().map(|(_, w)| w).collect();
        if running.is_empty() {
            return StopReport::default();
        }
        tracing::info!(
            workers = running.len(),
            timeout_ms = self.shutdown_timeout.as_millis() as u64,
            "WorkerPool: stopping all workers"
        );
        for worker in &running {
            let _ = worker.shutdown_tx.send(true);
        }

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let stopped =
            futures::future::join_all(running.into_iter().map(|w| self.await_stopped(w, deadline)))
                .await;

        let mut report = StopReport::default();
        for (kind, handle) in stopped {
            match kind {
                StopKind::Drained => report.drained.push(handle),
                StopKind::Forced => report.forced.push(handle),
            }
        }
        tracing::info!(
            drained = report.drained.len(),
            forced = report.forced.len(),
            "WorkerPool: all workers stopped"
        );
        report
    }

    async fn await_stopped(
        &self,
        mut running: RunningWorker,
        deadline: tokio::time::Instant,
    ) -> (StopKind, WorkerHandle) {
        match tokio::time::timeout_at(deadline, &mut running.task).await {
            Ok(Ok(())) => (StopKind::Drained, running.handle),
            Ok(Err(e)) => {
                tracing::error!(
                    worker = %running.handle.name,
                    error = %e,
                    "WorkerPool: worker task ended abnormally"
                );
                emit(
                    &self.events_tx,
                    WorkerEvent::WorkerStopped {
                        worker_id: running.handle.id,
                        worker: running.handle.name.clone(),
                        error: Some(WorkerError::Aborted {
                            worker: running.handle.name.clone(),
                            message: e.to_string(),
                        }),
                    },
                );
                (StopKind::Drained, running.handle)
            }
            Err(_) => {
                running.task.abort();
                let in_flight = running.stats.snapshot().in_flight;
                running.stats.abandon_in_flight();
                tracing::warn!(
                    worker = %running.handle.name,
                    abandoned = in_flight,
                    "WorkerPool: drain timed out, worker force-stopped"
                );
                emit(
                    &self.events_tx,
                    WorkerEvent::WorkerStopped {
                        worker_id: running.handle.id,
                        worker: running.handle.name.clone(),
                        error: Some(WorkerError::Aborted {
                            worker: running.handle.name.clone(),
                            message: format!(
                                "force-stopped after {} ms shutdown timeout",
                                self.shutdown_timeout.as_millis()
                            ),
                        }),
                    },
                );
                (StopKind::Forced, running.handle)
            }
        }
    }

    pub fn state(&self, handle: &WorkerHandle) -> Option<WorkerState> {
        self.workers()
            .get(&handle.id)
            .map(|w| *w.state_rx.borrow())
    }

    pub fn stats(&self, handle: &WorkerHandle) -> Option<WorkerStatsSnapshot> {
        self.workers().get(&handle.id).map(|w| w.stats.snapshot())
    }

    pub fn handles(&self) -> Vec<WorkerHandle> {
        self.workers().values().map(|w| w.handle.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.workers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Queue an event without waiting. Dropped (and logged) when the buffer is
/// full or the receiver is gone.
pub(crate) fn emit(events: &mpsc::Sender<WorkerEvent>, event: WorkerEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => tracing::warn!(
            worker_id = %event.worker_id(),
            job_key = event.job_key(),
            "WorkerPool: event buffer full, dropping event"
        ),
        Err(mpsc::error::TrySendError::Closed(event)) => tracing::debug!(
            worker_id = %event.worker_id(),
            "WorkerPool: event receiver dropped, discarding event"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::memory::{InMemoryGateway, NewJob};
    use crate::handler::JobControls;
    use crate::types::Job;

    async fn complete(_job: Job, controls: JobControls) -> anyhow::Result<()> {
        controls.succeed_empty();
        Ok(())
    }

    fn quick(job_type: &str) -> WorkerConfig {
        WorkerConfig::new(job_type)
            .with_poll_interval(Duration::from_millis(10))
            .with_request_timeout(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_config() {
        let pool = WorkerPool::new(Arc::new(InMemoryGateway::new()), Duration::from_secs(1));
        let err = pool
            .register_worker(quick("t").with_max_jobs_active(0), Arc::new(complete))
            .unwrap_err();
        assert!(matches!(err, WorkerError::FatalConfig { .. }));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_register_and_stop() {
        let gateway = Arc::new(InMemoryGateway::new());
        let pool = WorkerPool::new(gateway.clone(), Duration::from_secs(2));
        let handle = pool.register_worker(quick("t"), Arc::new(complete)).unwrap();
        gateway.create_job(NewJob::new("t"));

        for _ in 0..200 {
            if pool.stats(&handle).map(|s| s.completed) == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.stats(&handle).unwrap().completed, 1);

        assert_eq!(pool.stop(&handle).await.unwrap(), StopKind::Drained);
        assert!(pool.state(&handle).is_none());
        assert!(matches!(
            pool.stop(&handle).await,
            Err(WorkerError::NotFound(_))
        ));
    }

    #[test]
    fn test_emit_drops_when_buffer_full() {
        let (tx, mut rx) = mpsc::channel(2);
        for _ in 0..5 {
            emit(
                &tx,
                WorkerEvent::WorkerStopped {
                    worker_id: Uuid::nil(),
                    worker: "w".to_string(),
                    error: None,
                },
            );
        }
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        drop(rx);
        emit(
            &tx,
            WorkerEvent::WorkerStopped {
                worker_id: Uuid::nil(),
                worker: "w".to_string(),
                error: None,
            },
        );
    }

    #[tokio::test]
    async fn test_untaken_events_stay_bounded() {
        let gateway = Arc::new(InMemoryGateway::new());
        let pool = WorkerPool::new(gateway, Duration::from_secs(2));
        for i in 0..(EVENT_BUFFER + 8) {
            pool.register_worker(quick(&format!("t{}", i % 4)), Arc::new(complete))
                .unwrap();
        }
        let report = pool.stop_all().await;
        assert_eq!(report.drained.len(), EVENT_BUFFER + 8);

        let mut events = pool.take_events().unwrap();
        let mut queued = 0;
        while events.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, EVENT_BUFFER);
    }

    #[tokio::test]
    async fn test_stop_all_reports_each_worker() {
        let pool = WorkerPool::new(Arc::new(InMemoryGateway::new()), Duration::from_secs(2));
        let mut events = pool.take_events().unwrap();
        assert!(pool.take_events().is_none());

        pool.register_worker(quick("a"), Arc::new(complete)).unwrap();
        pool.register_worker(quick("b"), Arc::new(complete)).unwrap();

        let report = pool.stop_all().await;
        assert_eq!(report.drained.len(), 2);
        assert!(report.forced.is_empty());
        assert!(pool.is_empty());

        for _ in 0..2 {
            let event = events.recv().await.unwrap();
            assert!(matches!(event, WorkerEvent::WorkerStopped { error: None, .. }));
        }
    }
}
