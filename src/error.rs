//! Error taxonomy for the job worker.
//!
//! Per-job errors (`PayloadDecodeError`, `CompletionError`) stay local to the
//! job they belong to. Worker-level errors (`WorkerError`) stop a worker and
//! are surfaced once through the pool's event channel.

use thiserror::Error;

use crate::gateway::RpcError;
use crate::types::JobKey;

/// Malformed variables or headers text received from the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("payload decode error{}: {message} (line {line}, column {column})", field_suffix(.field))]
pub struct PayloadDecodeError {
    /// Name of the offending field, when it can be located in the text.
    pub field: Option<String>,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

fn field_suffix(field: &Option<String>) -> String {
    match field {
        Some(name) => format!(" in field '{}'", name),
        None => String::new(),
    }
}

impl PayloadDecodeError {
    pub(crate) fn not_an_object(field: Option<&str>) -> Self {
        Self {
            field: field.map(str::to_string),
            line: 1,
            column: 1,
            message: "expected a JSON object".to_string(),
        }
    }
}

/// Errors returned by the completion pipeline for a single job.
#[derive(Error, Debug, Clone)]
pub enum CompletionError {
    /// A second outcome was submitted for a job that is already resolving or resolved.
    #[error("job {job_key} already received an outcome")]
    DuplicateCompletion { job_key: JobKey },

    /// The job was never leased by this worker.
    #[error("job {job_key} is not leased by this worker")]
    UnknownJob { job_key: JobKey },

    /// The lease ran out before the outcome could be delivered.
    #[error("lease for job {job_key} expired before completion")]
    LeaseExpired { job_key: JobKey },

    /// Transient RPC failures persisted through every retry attempt.
    #[error("completion of job {job_key} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        job_key: JobKey,
        attempts: u32,
        #[source]
        source: RpcError,
    },

    /// The engine refused the call with a non-retriable error.
    #[error("engine rejected outcome for job {job_key}: {source}")]
    Rejected {
        job_key: JobKey,
        #[source]
        source: RpcError,
    },
}

impl CompletionError {
    pub fn job_key(&self) -> JobKey {
        match self {
            CompletionError::DuplicateCompletion { job_key }
            | CompletionError::UnknownJob { job_key }
            | CompletionError::LeaseExpired { job_key }
            | CompletionError::RetriesExhausted { job_key, .. }
            | CompletionError::Rejected { job_key, .. } => *job_key,
        }
    }
}

/// Worker-level errors. These stop the affected worker.
#[derive(Error, Debug, Clone)]
pub enum WorkerError {
    /// Configuration the engine (or the client) can never accept.
    #[error("worker '{worker}' misconfigured: {message}")]
    FatalConfig { worker: String, message: String },

    /// Activation failed with a non-retriable error, or retries ran out.
    #[error("worker '{worker}' stopped by fatal RPC error: {source}")]
    FatalRpc {
        worker: String,
        #[source]
        source: RpcError,
    },

    /// The worker task ended abnormally (panic or forced abort).
    #[error("worker '{worker}' terminated abnormally: {message}")]
    Aborted { worker: String, message: String },

    /// No worker is registered under the given handle.
    #[error("no worker registered for handle {0}")]
    NotFound(String),
}

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::RpcCode;

    #[test]
    fn test_decode_error_names_field() {
        let err = PayloadDecodeError {
            field: Some("subtaskCount".to_string()),
            line: 1,
            column: 14,
            message: "expected value".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("'subtaskCount'"));
        assert!(text.contains("column 14"));
    }

    #[test]
    fn test_decode_error_without_field() {
        let err = PayloadDecodeError::not_an_object(None);
        assert_eq!(
            err.to_string(),
            "payload decode error: expected a JSON object (line 1, column 1)"
        );
    }

    #[test]
    fn test_completion_error_job_key() {
        let err = CompletionError::Rejected {
            job_key: 42,
            source: RpcError::new(RpcCode::InvalidArgument, "bad variables"),
        };
        assert_eq!(err.job_key(), 42);
        assert!(err.to_string().contains("bad variables"));
    }
}
