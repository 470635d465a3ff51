//! Gateway — the RPC boundary to the workflow engine.
//!
//! The worker never talks to a transport directly; everything goes through
//! the [`Gateway`] trait. A connection is shared read-only by every worker,
//! so implementations must be `Send + Sync` and do their own internal
//! synchronisation. [`memory::InMemoryGateway`] is a complete in-process
//! engine used by tests and the sample binary.

pub mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ActivatedJob, JobKey};

// ---------------------------------------------------------------------------
// RpcError
// ---------------------------------------------------------------------------

/// Status codes the engine gateway answers with (gRPC status semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    Unimplemented,
    Internal,
    Unavailable,
    Unauthenticated,
}

impl RpcCode {
    /// Worth retrying with back-off: connectivity loss, timeouts and
    /// engine back-pressure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcCode::Unavailable
                | RpcCode::DeadlineExceeded
                | RpcCode::ResourceExhausted
                | RpcCode::Internal
                | RpcCode::Unknown
                | RpcCode::Cancelled
                | RpcCode::Aborted
        )
    }

    /// On a completion call: the job is no longer open on the engine
    /// (completed by an earlier attempt, or reclaimed).
    pub fn is_already_resolved(&self) -> bool {
        matches!(self, RpcCode::NotFound | RpcCode::FailedPrecondition)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RpcCode::Cancelled => "CANCELLED",
            RpcCode::Unknown => "UNKNOWN",
            RpcCode::InvalidArgument => "INVALID_ARGUMENT",
            RpcCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            RpcCode::NotFound => "NOT_FOUND",
            RpcCode::AlreadyExists => "ALREADY_EXISTS",
            RpcCode::PermissionDenied => "PERMISSION_DENIED",
            RpcCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            RpcCode::FailedPrecondition => "FAILED_PRECONDITION",
            RpcCode::Aborted => "ABORTED",
            RpcCode::Unimplemented => "UNIMPLEMENTED",
            RpcCode::Internal => "INTERNAL",
            RpcCode::Unavailable => "UNAVAILABLE",
            RpcCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed gateway call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: RpcCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Unavailable, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RpcCode::NotFound, message)
    }

    pub fn is_transient(&self) -> bool {
        self.code.is_transient()
    }
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;

// ---------------------------------------------------------------------------
// Requests / responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivateJobsRequest {
    pub job_type: String,
    pub worker: String,
    /// Lease the engine grants each activated job.
    pub timeout: Duration,
    pub max_jobs_to_activate: u32,
    /// `None` fetches every variable.
    pub fetch_variables: Option<Vec<String>>,
    /// Long-poll: how long the engine may hold the request open when no job
    /// is available. Zero answers immediately.
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteJobRequest {
    pub job_key: JobKey,
    /// Serialized variables document.
    pub variables: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailJobRequest {
    pub job_key: JobKey,
    pub retries: u32,
    pub error_message: String,
    pub retry_back_off: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrowErrorRequest {
    pub job_key: JobKey,
    pub error_code: String,
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployResourceRequest {
    pub name: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployResourceResponse {
    pub key: i64,
    pub processes: Vec<ProcessMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetadata {
    pub bpmn_process_id: String,
    pub version: i32,
    pub process_definition_key: i64,
    pub resource_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateProcessInstanceRequest {
    pub bpmn_process_id: String,
    /// `None` = latest version.
    pub version: Option<i32>,
    /// Serialized variables document.
    pub variables: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateProcessInstanceResponse {
    pub process_definition_key: i64,
    pub bpmn_process_id: String,
    pub version: i32,
    pub process_instance_key: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishMessageRequest {
    pub name: String,
    pub correlation_key: String,
    pub time_to_live: Duration,
    pub message_id: Option<String>,
    /// Serialized variables document.
    pub variables: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishMessageResponse {
    pub key: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub brokers: Vec<BrokerInfo>,
    pub cluster_size: u32,
    pub partitions_count: u32,
    pub replication_factor: u32,
    pub gateway_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub node_id: u32,
    pub host: String,
    pub port: u16,
    pub version: String,
}

// ---------------------------------------------------------------------------
// Gateway trait
// ---------------------------------------------------------------------------

/// The engine's request/response surface.
///
/// `activate_jobs` must support long-polling bounded by
/// `ActivateJobsRequest::request_timeout`, and failures must carry an
/// [`RpcCode`] so callers can tell transient from fatal errors.
#[async_trait]
pub trait Gateway: Send + Sync {
    // ── Jobs ──

    async fn activate_jobs(&self, request: ActivateJobsRequest) -> RpcResult<Vec<ActivatedJob>>;
    async fn complete_job(&self, request: CompleteJobRequest) -> RpcResult<()>;
    async fn fail_job(&self, request: FailJobRequest) -> RpcResult<()>;
    async fn throw_error(&self, request: ThrowErrorRequest) -> RpcResult<()>;

    // ── Processes & messages ──

    async fn deploy_resource(
        &self,
        request: DeployResourceRequest,
    ) -> RpcResult<DeployResourceResponse>;
    async fn create_process_instance(
        &self,
        request: CreateProcessInstanceRequest,
    ) -> RpcResult<CreateProcessInstanceResponse>;
    async fn publish_message(
        &self,
        request: PublishMessageRequest,
    ) -> RpcResult<PublishMessageResponse>;

    // ── Cluster ──

    async fn topology(&self) -> RpcResult<Topology>;
}
