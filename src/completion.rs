//! Completion pipeline — turns a handler outcome into exactly one resolution
//! of the job on the engine.
//!
//! ## Exactly once
//!
//! `submit` first claims the job in the [`LeaseTracker`] (leased → resolving).
//! Only the winning claim issues RPCs; every other submission for the same key
//! returns `DuplicateCompletion` without touching the engine. The lease entry
//! is released when the submission finishes, whatever the result.
//!
//! ## Retries
//!
//! Transient RPC failures are retried with back-off while the lease is still
//! valid. A `NOT_FOUND` / `FAILED_PRECONDITION` answer means an earlier
//! attempt already landed (or the engine reclaimed the job) and is never
//! resent. A submission for an already expired lease gets a single attempt.

use std::sync::Arc;

use chrono::Utc;

use crate::backoff::RetryPolicy;
use crate::codec;
use crate::error::CompletionError;
use crate::gateway::{CompleteJobRequest, FailJobRequest, Gateway, RpcError, ThrowErrorRequest};
use crate::lease::{remaining_between, ClaimError, LeaseTracker, ResolveClaim};
use crate::types::{JobKey, Outcome};

/// How a submitted outcome ended on the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    /// `terminal` when no retries are left: the engine raises an incident
    /// instead of handing the job out again.
    Failed { terminal: bool },
    ErrorThrown,
    /// The engine reported the job as no longer open; an earlier attempt
    /// resolved it.
    AlreadyResolved,
}

/// Delivers outcomes for the jobs of one worker.
pub struct CompletionPipeline {
    gateway: Arc<dyn Gateway>,
    leases: Arc<LeaseTracker>,
    retry: RetryPolicy,
    worker: String,
}

impl CompletionPipeline {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        leases: Arc<LeaseTracker>,
        retry: RetryPolicy,
        worker: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            leases,
            retry,
            worker: worker.into(),
        }
    }

    pub fn leases(&self) -> &Arc<LeaseTracker> {
        &self.leases
    }

    /// Submit the single outcome for `job_key`.
    pub async fn submit(
        &self,
        job_key: JobKey,
        outcome: Outcome,
    ) -> Result<Resolution, CompletionError> {
        let claim = self.leases.begin_resolving(job_key).map_err(|e| match e {
            ClaimError::AlreadyClaimed => {
                tracing::debug!(
                    job_key,
                    worker = %self.worker,
                    "CompletionPipeline: duplicate outcome ignored, earlier submission wins"
                );
                CompletionError::DuplicateCompletion { job_key }
            }
            ClaimError::Unknown => CompletionError::UnknownJob { job_key },
        })?;

        let result = self.deliver(claim, &outcome).await;
        self.leases.release_claim(&claim);
        result
    }

    async fn deliver(
        &self,
        claim: ResolveClaim,
        outcome: &Outcome,
    ) -> Result<Resolution, CompletionError> {
        let job_key = claim.job_key;
        let expired_on_entry = remaining_between(claim.deadline, Utc::now()).is_expired();
        let policy = if expired_on_entry {
            tracing::debug!(
                job_key,
                worker = %self.worker,
                "CompletionPipeline: lease already expired, single late attempt"
            );
            RetryPolicy::no_retry()
        } else {
            self.retry.clone()
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let err = match self.send(job_key, outcome).await {
                Ok(()) => return Ok(self.resolved(job_key, outcome)),
                Err(err) => err,
            };

            if err.code.is_already_resolved() {
                if expired_on_entry {
                    return Err(CompletionError::LeaseExpired { job_key });
                }
                tracing::debug!(
                    job_key,
                    worker = %self.worker,
                    code = %err.code,
                    "CompletionPipeline: job already resolved on engine"
                );
                return Ok(Resolution::AlreadyResolved);
            }

            if !err.is_transient() {
                tracing::error!(
                    job_key,
                    worker = %self.worker,
                    error = %err,
                    "CompletionPipeline: engine rejected outcome"
                );
                return Err(CompletionError::Rejected {
                    job_key,
                    source: err,
                });
            }

            if expired_on_entry {
                return Err(CompletionError::LeaseExpired { job_key });
            }

            if !policy.allows_retry(attempts) {
                tracing::error!(
                    job_key,
                    worker = %self.worker,
                    attempts,
                    error = %err,
                    "CompletionPipeline: retries exhausted, job left to lease expiry"
                );
                return Err(CompletionError::RetriesExhausted {
                    job_key,
                    attempts,
                    source: err,
                });
            }

            let delay = policy.delay_for(attempts);
            tracing::warn!(
                job_key,
                worker = %self.worker,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "CompletionPipeline: transient failure, retrying"
            );
            tokio::time::sleep(delay).await;

            if remaining_between(claim.deadline, Utc::now()).is_expired() {
                tracing::warn!(
                    job_key,
                    worker = %self.worker,
                    attempts,
                    "CompletionPipeline: lease expired while retrying"
                );
                return Err(CompletionError::LeaseExpired { job_key });
            }
        }
    }

    async fn send(&self, job_key: JobKey, outcome: &Outcome) -> Result<(), RpcError> {
        match outcome {
            Outcome::Success { variables } => {
                self.gateway
                    .complete_job(CompleteJobRequest {
                        job_key,
                        variables: codec::encode_variables(variables),
                    })
                    .await
            }
            Outcome::Failure {
                retries,
                message,
                retry_back_off,
            } => {
                self.gateway
                    .fail_job(FailJobRequest {
                        job_key,
                        retries: *retries,
                        error_message: message.clone(),
                        retry_back_off: retry_back_off.unwrap_or_default(),
                    })
                    .await
            }
            Outcome::Error { code, message } => {
                self.gateway
                    .throw_error(ThrowErrorRequest {
                        job_key,
                        error_code: code.clone(),
                        error_message: message.clone(),
                    })
                    .await
            }
        }
    }

    fn resolved(&self, job_key: JobKey, outcome: &Outcome) -> Resolution {
        let resolution = match outcome {
            Outcome::Success { .. } => Resolution::Completed,
            Outcome::Failure { retries, .. } => Resolution::Failed {
                terminal: *retries == 0,
            },
            Outcome::Error { .. } => Resolution::ErrorThrown,
        };
        if resolution == (Resolution::Failed { terminal: true }) {
            tracing::info!(
                job_key,
                worker = %self.worker,
                "CompletionPipeline: job failed with no retries left, engine raises an incident"
            );
        } else {
            tracing::debug!(
                job_key,
                worker = %self.worker,
                outcome = outcome.kind().as_str(),
                "CompletionPipeline: outcome delivered"
            );
        }
        resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::memory::{Fault, GatewayCall, GatewayOp, InMemoryGateway, NewJob};
    use crate::gateway::{ActivateJobsRequest, RpcCode};
    use crate::types::{deadline_from_millis, Variables};
    use std::time::Duration;

    struct Fixture {
        gateway: Arc<InMemoryGateway>,
        pipeline: Arc<CompletionPipeline>,
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::completion()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
            .with_max_attempts(Some(3))
    }

    fn fixture() -> Fixture {
        let gateway = Arc::new(InMemoryGateway::new());
        let pipeline = Arc::new(CompletionPipeline::new(
            gateway.clone(),
            Arc::new(LeaseTracker::new()),
            fast_retry(),
            "test-worker",
        ));
        Fixture { gateway, pipeline }
    }

    /// Create, activate and lease one job.
    async fn leased_job(fx: &Fixture, lease: Duration) -> JobKey {
        let key = fx.gateway.create_job(NewJob::new("task"));
        let jobs = fx
            .gateway
            .activate_jobs(ActivateJobsRequest {
                job_type: "task".to_string(),
                worker: "test-worker".to_string(),
                timeout: lease,
                max_jobs_to_activate: 1,
                fetch_variables: None,
                request_timeout: Duration::ZERO,
            })
            .await
            .unwrap();
        fx.pipeline
            .leases()
            .register(key, deadline_from_millis(jobs[0].deadline));
        key
    }

    fn success() -> Outcome {
        let mut variables = Variables::new();
        variables.insert("done".to_string(), serde_json::json!(true));
        Outcome::Success { variables }
    }

    #[tokio::test]
    async fn test_success_completes_and_releases() {
        let fx = fixture();
        let key = leased_job(&fx, Duration::from_secs(30)).await;

        let resolution = fx.pipeline.submit(key, success()).await.unwrap();
        assert_eq!(resolution, Resolution::Completed);
        assert!(fx.pipeline.leases().is_empty());
        assert_eq!(fx.gateway.outcome_calls_for(key).len(), 1);
    }

    #[tokio::test]
    async fn test_second_submit_is_duplicate() {
        let fx = fixture();
        let key = leased_job(&fx, Duration::from_secs(30)).await;

        fx.pipeline.submit(key, success()).await.unwrap();
        let err = fx.pipeline.submit(key, success()).await.unwrap_err();
        assert!(matches!(err, CompletionError::DuplicateCompletion { .. }));
        assert_eq!(fx.gateway.outcome_calls_for(key).len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_submits_issue_one_rpc() {
        let fx = fixture();
        let key = leased_job(&fx, Duration::from_secs(30)).await;

        let submits: Vec<_> = (0..8)
            .map(|_| {
                let pipeline = fx.pipeline.clone();
                tokio::spawn(async move { pipeline.submit(key, success()).await })
            })
            .collect();
        let results = futures::future::join_all(submits).await;

        let ok = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
        let dup = results
            .iter()
            .filter(|r| matches!(r, Ok(Err(CompletionError::DuplicateCompletion { .. }))))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(dup, 7);
        assert_eq!(fx.gateway.outcome_calls_for(key).len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let fx = fixture();
        let err = fx.pipeline.submit(404, success()).await.unwrap_err();
        assert!(matches!(err, CompletionError::UnknownJob { job_key: 404 }));
        assert!(fx.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let fx = fixture();
        let key = leased_job(&fx, Duration::from_secs(30)).await;
        fx.gateway.inject(
            GatewayOp::CompleteJob,
            Fault::Reject(RpcError::unavailable("broker restarting")),
        );

        let resolution = fx.pipeline.submit(key, success()).await.unwrap();
        assert_eq!(resolution, Resolution::Completed);
        // The rejected attempt never reached the job store.
        assert_eq!(fx.gateway.outcome_calls_for(key).len(), 1);
    }

    #[tokio::test]
    async fn test_lost_reply_then_not_found_is_already_resolved() {
        let fx = fixture();
        let key = leased_job(&fx, Duration::from_secs(30)).await;
        fx.gateway.inject(
            GatewayOp::CompleteJob,
            Fault::ApplyThenReject(RpcError::new(RpcCode::DeadlineExceeded, "reply lost")),
        );

        let resolution = fx.pipeline.submit(key, success()).await.unwrap();
        assert_eq!(resolution, Resolution::AlreadyResolved);
        assert!(fx.pipeline.leases().is_empty());
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let fx = fixture();
        let key = leased_job(&fx, Duration::from_secs(30)).await;
        for _ in 0..3 {
            fx.gateway.inject(
                GatewayOp::CompleteJob,
                Fault::Reject(RpcError::unavailable("down")),
            );
        }

        let err = fx.pipeline.submit(key, success()).await.unwrap_err();
        assert!(matches!(
            err,
            CompletionError::RetriesExhausted { attempts: 3, .. }
        ));
        assert!(fx.pipeline.leases().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_rejection_is_not_retried() {
        let fx = fixture();
        let key = leased_job(&fx, Duration::from_secs(30)).await;
        fx.gateway.inject(
            GatewayOp::CompleteJob,
            Fault::Reject(RpcError::new(RpcCode::InvalidArgument, "bad variables")),
        );

        let err = fx.pipeline.submit(key, success()).await.unwrap_err();
        assert!(matches!(err, CompletionError::Rejected { .. }));
        // Nothing was resent after the rejection.
        assert!(fx.gateway.outcome_calls_for(key).is_empty());
    }

    #[tokio::test]
    async fn test_late_submit_after_lease_expiry() {
        let fx = fixture();
        let key = leased_job(&fx, Duration::from_millis(5)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fx.pipeline.leases().remaining(key).unwrap().is_expired());

        // The engine reclaimed the job; a late outcome is answered NOT_FOUND.
        fx.gateway
            .activate_jobs(ActivateJobsRequest {
                job_type: "task".to_string(),
                worker: "other-worker".to_string(),
                timeout: Duration::from_secs(30),
                max_jobs_to_activate: 1,
                fetch_variables: None,
                request_timeout: Duration::ZERO,
            })
            .await
            .unwrap();
        fx.gateway.inject(
            GatewayOp::CompleteJob,
            Fault::Reject(RpcError::not_found("reclaimed")),
        );

        let err = fx.pipeline.submit(key, success()).await.unwrap_err();
        assert!(matches!(err, CompletionError::LeaseExpired { .. }));
        let again = fx.pipeline.submit(key, success()).await.unwrap_err();
        assert!(matches!(again, CompletionError::DuplicateCompletion { .. }));
    }

    #[tokio::test]
    async fn test_reactivation_during_retry_keeps_new_lease() {
        let fx = fixture();
        let key = leased_job(&fx, Duration::from_secs(30)).await;
        fx.gateway.inject(GatewayOp::CompleteJob, Fault::Delay(Duration::from_millis(50)));

        let stale = tokio::spawn({
            let pipeline = fx.pipeline.clone();
            async move { pipeline.submit(key, success()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.pipeline.leases().state(key), Some(crate::lease::LeaseState::Resolving));

        // Handed out again before the first submission returns.
        let deadline = Utc::now() + chrono::Duration::seconds(30);
        fx.pipeline.leases().register(key, deadline);
        stale.await.unwrap().unwrap();

        assert_eq!(fx.pipeline.leases().len(), 1);
        let second = fx.pipeline.submit(key, success()).await.unwrap();
        assert_eq!(second, Resolution::AlreadyResolved);
        assert!(fx.pipeline.leases().is_empty());
    }

    #[tokio::test]
    async fn test_failure_with_zero_retries_is_terminal() {
        let fx = fixture();
        let key = leased_job(&fx, Duration::from_secs(30)).await;

        let resolution = fx
            .pipeline
            .submit(
                key,
                Outcome::Failure {
                    retries: 0,
                    message: "gave up".to_string(),
                    retry_back_off: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Failed { terminal: true });
        assert_eq!(
            fx.gateway.outcome_calls_for(key),
            vec![GatewayCall::FailJob {
                job_key: key,
                retries: 0,
                message: "gave up".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_error_outcome_throws() {
        let fx = fixture();
        let key = leased_job(&fx, Duration::from_secs(30)).await;

        let resolution = fx
            .pipeline
            .submit(
                key,
                Outcome::Error {
                    code: "NO_STOCK".to_string(),
                    message: "out of stock".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::ErrorThrown);
    }
}
