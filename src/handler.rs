//! Handler interface exposed to user code.
//!
//! A handler receives the decoded [`Job`] and a [`JobControls`] value. The
//! controls are the job's outcome channel: each reporting method consumes
//! them, so a handler can report at most once. Controls may be moved into
//! background work; the dispatch loop keeps the job's admission slot until
//! an outcome arrives, the controls are dropped, or the lease runs out. The
//! slot is also held for as long as the handler task itself is running, so a
//! handler that outlives its lease still counts against the worker's bound.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinError;

use crate::types::{Job, JobKey, Outcome, Variables};

/// Error code reported when a handler returns `Err` or panics without
/// reporting an outcome first.
pub const UNHANDLED_ERROR_CODE: &str = "UNHANDLED_HANDLER_ERROR";

/// Error code reported when a job's variables or headers cannot be decoded.
pub const PAYLOAD_DECODE_ERROR_CODE: &str = "PAYLOAD_DECODE_ERROR";

// ---------------------------------------------------------------------------
// JobHandler
// ---------------------------------------------------------------------------

/// User logic for one job type.
///
/// Returning `Err` before reporting an outcome is translated into an
/// `Outcome::Error` with [`UNHANDLED_ERROR_CODE`]; it never stops the worker.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job, controls: JobControls) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job, JobControls) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, job: Job, controls: JobControls) -> anyhow::Result<()> {
        (self)(job, controls).await
    }
}

// ---------------------------------------------------------------------------
// JobControls
// ---------------------------------------------------------------------------

/// One-shot outcome reporter for a single job.
#[derive(Debug)]
pub struct JobControls {
    job_key: JobKey,
    retries: u32,
    reply: oneshot::Sender<Outcome>,
}

impl JobControls {
    pub(crate) fn new(job: &Job) -> (Self, oneshot::Receiver<Outcome>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                job_key: job.key,
                retries: job.retries,
                reply,
            },
            rx,
        )
    }

    pub fn job_key(&self) -> JobKey {
        self.job_key
    }

    /// Complete the job, merging `variables` into the process scope.
    pub fn succeed(self, variables: Variables) {
        self.report(Outcome::Success { variables });
    }

    /// Complete the job with no variable updates.
    pub fn succeed_empty(self) {
        self.succeed(Variables::new());
    }

    /// Complete the job with any serializable struct as variables.
    ///
    /// Fails (and keeps nothing reported) if `value` does not serialize to an
    /// object; the controls are consumed either way.
    pub fn succeed_with<T: Serialize>(self, value: &T) -> anyhow::Result<()> {
        match serde_json::to_value(value)? {
            serde_json::Value::Object(variables) => {
                self.succeed(variables);
                Ok(())
            }
            other => anyhow::bail!("job variables must serialize to an object, got {}", other),
        }
    }

    /// Fail the job. Without explicit `retries` the engine is told one retry
    /// fewer than the job had left.
    pub fn fail(self, message: impl Into<String>, retries: Option<u32>) {
        let retries = retries.unwrap_or_else(|| self.retries.saturating_sub(1));
        self.report(Outcome::Failure {
            retries,
            message: message.into(),
            retry_back_off: None,
        });
    }

    /// Fail the job and ask the engine to wait `back_off` before handing it out again.
    pub fn fail_with_back_off(
        self,
        message: impl Into<String>,
        retries: Option<u32>,
        back_off: Duration,
    ) {
        let retries = retries.unwrap_or_else(|| self.retries.saturating_sub(1));
        self.report(Outcome::Failure {
            retries,
            message: message.into(),
            retry_back_off: Some(back_off),
        });
    }

    /// Throw a business error the process model can catch.
    pub fn throw_error(self, code: impl Into<String>, message: impl Into<String>) {
        self.report(Outcome::Error {
            code: code.into(),
            message: message.into(),
        });
    }

    fn report(self, outcome: Outcome) {
        if self.reply.send(outcome).is_err() {
            tracing::debug!(
                job_key = self.job_key,
                "JobControls: outcome reported after the job was abandoned, ignoring"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation wrapper
// ---------------------------------------------------------------------------

/// How a handler invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Invocation {
    /// An outcome to submit (reported by the handler, or synthesised from
    /// an error or panic).
    Reported(Outcome),
    /// The controls were dropped without reporting.
    Unreported,
    /// The lease budget ran out first. The handler task keeps running
    /// detached (still holding its slot); anything it reports later is
    /// ignored.
    TimedOut,
}

/// Run `handler` on its own task and wait, at most `budget`, for its outcome.
///
/// `slot` moves into the handler task and is dropped only when the handler
/// returns, whether or not `invoke` is still waiting for it.
pub(crate) async fn invoke<S>(
    handler: Arc<dyn JobHandler>,
    job: Job,
    budget: Duration,
    slot: S,
) -> Invocation
where
    S: Send + 'static,
{
    let (controls, mut rx) = JobControls::new(&job);
    let mut task = tokio::spawn(async move {
        let _slot = slot;
        handler.handle(job, controls).await
    });

    let waited = tokio::time::timeout(budget, async {
        tokio::select! {
            biased;
            reported = &mut rx => match reported {
                Ok(outcome) => Invocation::Reported(outcome),
                // Controls dropped: the task result decides between an
                // unhandled error and a silent return.
                Err(_) => match task.await {
                    Ok(Ok(())) => Invocation::Unreported,
                    Ok(Err(e)) => Invocation::Reported(unhandled(format!("{:#}", e))),
                    Err(e) => Invocation::Reported(unhandled(join_error_message(e))),
                },
            },
            joined = &mut task => match joined {
                Ok(Ok(())) => match rx.await {
                    Ok(outcome) => Invocation::Reported(outcome),
                    Err(_) => Invocation::Unreported,
                },
                Ok(Err(e)) => reported_or(rx.try_recv().ok(), format!("{:#}", e)),
                Err(e) => reported_or(rx.try_recv().ok(), join_error_message(e)),
            },
        }
    })
    .await;

    waited.unwrap_or(Invocation::TimedOut)
}

fn reported_or(reported: Option<Outcome>, failure: String) -> Invocation {
    Invocation::Reported(reported.unwrap_or_else(|| unhandled(failure)))
}

fn unhandled(message: String) -> Outcome {
    Outcome::Error {
        code: UNHANDLED_ERROR_CODE.to_string(),
        message,
    }
}

fn join_error_message(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("handler task ended abnormally: {}", err);
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("handler panicked: {}", detail)
}
