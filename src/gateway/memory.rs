//! InMemoryGateway — an in-process engine behind the [`Gateway`] trait.
//!
//! Holds a job queue with real lease semantics: activated jobs carry a
//! deadline, expired leases are reclaimed on the next activation, completed
//! jobs answer `NOT_FOUND` to further outcomes. Activation long-polls until a
//! job is created or the request timeout passes. Faults can be injected per
//! operation and every call is logged for assertions.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::{
    ActivateJobsRequest, BrokerInfo, CompleteJobRequest, CreateProcessInstanceRequest,
    CreateProcessInstanceResponse, DeployResourceRequest, DeployResourceResponse, FailJobRequest,
    Gateway, ProcessMetadata, PublishMessageRequest, PublishMessageResponse, RpcCode, RpcError,
    RpcResult, ThrowErrorRequest, Topology,
};
use crate::codec;
use crate::types::{ActivatedJob, Job, JobHeaders, JobKey, Variables};

// ---------------------------------------------------------------------------
// Public bookkeeping types
// ---------------------------------------------------------------------------

/// Gateway operations, for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    ActivateJobs,
    CompleteJob,
    FailJob,
    ThrowError,
    DeployResource,
    CreateProcessInstance,
    PublishMessage,
    Topology,
}

/// An injected failure for the next call of an operation.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Answer with the error without touching state.
    Reject(RpcError),
    /// Apply the call, then answer with the error (reply lost in transit).
    ApplyThenReject(RpcError),
    /// Sleep before handling the call normally.
    Delay(Duration),
    /// Activation only: hand out up to this many jobs beyond the requested
    /// maximum.
    OverDeliver(u32),
}

/// How many calls the log keeps; older entries are dropped first.
pub const CALL_LOG_LIMIT: usize = 10_000;

/// One logged gateway call.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    ActivateJobs {
        job_type: String,
        worker: String,
        max_jobs: u32,
        activated: Vec<JobKey>,
    },
    CompleteJob {
        job_key: JobKey,
        variables: Variables,
    },
    FailJob {
        job_key: JobKey,
        retries: u32,
        message: String,
    },
    ThrowError {
        job_key: JobKey,
        code: String,
        message: String,
    },
    DeployResource {
        name: String,
    },
    CreateProcessInstance {
        bpmn_process_id: String,
    },
    PublishMessage {
        name: String,
        correlation_key: String,
    },
    Topology,
}

impl GatewayCall {
    pub fn op(&self) -> GatewayOp {
        match self {
            GatewayCall::ActivateJobs { .. } => GatewayOp::ActivateJobs,
            GatewayCall::CompleteJob { .. } => GatewayOp::CompleteJob,
            GatewayCall::FailJob { .. } => GatewayOp::FailJob,
            GatewayCall::ThrowError { .. } => GatewayOp::ThrowError,
            GatewayCall::DeployResource { .. } => GatewayOp::DeployResource,
            GatewayCall::CreateProcessInstance { .. } => GatewayOp::CreateProcessInstance,
            GatewayCall::PublishMessage { .. } => GatewayOp::PublishMessage,
            GatewayCall::Topology => GatewayOp::Topology,
        }
    }
}

/// Engine-side lifecycle of a stored job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Activatable { available_at: DateTime<Utc> },
    Activated { worker: String, deadline: DateTime<Utc> },
    Completed { variables: Variables },
    /// Failed with no retries left; the engine raised an incident.
    Incident { message: String },
    ErrorThrown { code: String },
}

/// A job to seed into the engine.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub variables: Variables,
    pub custom_headers: HashMap<String, String>,
    pub retries: u32,
    pub bpmn_process_id: String,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            variables: Variables::new(),
            custom_headers: HashMap::new(),
            retries: 3,
            bpmn_process_id: "in-memory-process".to_string(),
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_custom_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct StoredJob {
    job: Job,
    status: JobStatus,
}

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<JobKey, StoredJob>,
    calls: VecDeque<GatewayCall>,
    call_counts: HashMap<GatewayOp, usize>,
    faults: HashMap<GatewayOp, VecDeque<Fault>>,
    process_versions: HashMap<String, i32>,
    raw_variables: HashMap<JobKey, String>,
}

impl State {
    fn record(&mut self, call: GatewayCall) {
        *self.call_counts.entry(call.op()).or_default() += 1;
        if self.calls.len() == CALL_LOG_LIMIT {
            self.calls.pop_front();
        }
        self.calls.push_back(call);
    }
}

/// In-process engine implementing [`Gateway`].
#[derive(Debug)]
pub struct InMemoryGateway {
    state: Mutex<State>,
    job_created: Notify,
    next_key: AtomicI64,
    address: String,
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            job_created: Notify::new(),
            next_key: AtomicI64::new(2_251_799_813_685_249),
            address: "in-memory:26500".to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_key(&self) -> i64 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    // ── Seeding ──

    /// Create an activatable job and wake any long-polling activation.
    pub fn create_job(&self, new_job: NewJob) -> JobKey {
        let key = self.next_key();
        let job = Job {
            key,
            job_type: new_job.job_type,
            worker: String::new(),
            headers: JobHeaders {
                process_instance_key: self.next_key(),
                bpmn_process_id: new_job.bpmn_process_id,
                process_definition_version: 1,
                process_definition_key: 1,
                element_id: "ServiceTask_1".to_string(),
                element_instance_key: self.next_key(),
            },
            custom_headers: new_job.custom_headers,
            variables: new_job.variables,
            retries: new_job.retries,
            deadline: DateTime::<Utc>::UNIX_EPOCH,
        };
        self.lock().jobs.insert(
            key,
            StoredJob {
                job,
                status: JobStatus::Activatable {
                    available_at: DateTime::<Utc>::UNIX_EPOCH,
                },
            },
        );
        self.job_created.notify_waiters();
        key
    }

    /// Create a job whose variables text is served verbatim (e.g. malformed).
    pub fn create_job_with_raw_variables(&self, job_type: &str, raw: &str) -> JobKey {
        let key = self.create_job(NewJob::new(job_type));
        self.lock().raw_variables.insert(key, raw.to_string());
        key
    }

    /// Queue a fault for the next call of `op`.
    pub fn inject(&self, op: GatewayOp, fault: Fault) {
        self.lock().faults.entry(op).or_default().push_back(fault);
    }

    // ── Inspection ──

    /// The most recent calls, oldest first (at most [`CALL_LOG_LIMIT`]).
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.lock().calls.iter().cloned().collect()
    }

    /// Calls of `op` since creation, including ones dropped from the log.
    pub fn call_count(&self, op: GatewayOp) -> usize {
        self.lock().call_counts.get(&op).copied().unwrap_or(0)
    }

    /// Completion-type calls (complete / fail / throw) logged for one job.
    pub fn outcome_calls_for(&self, job_key: JobKey) -> Vec<GatewayCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| match c {
                GatewayCall::CompleteJob { job_key: k, .. }
                | GatewayCall::FailJob { job_key: k, .. }
                | GatewayCall::ThrowError { job_key: k, .. } => *k == job_key,
                _ => false,
            })
            .cloned()
            .collect()
    }

    pub fn job_status(&self, job_key: JobKey) -> Option<JobStatus> {
        self.lock().jobs.get(&job_key).map(|j| j.status.clone())
    }

    pub fn job_retries(&self, job_key: JobKey) -> Option<u32> {
        self.lock().jobs.get(&job_key).map(|j| j.job.retries)
    }

    // ── Internals ──

    fn take_fault(&self, op: GatewayOp) -> Option<Fault> {
        self.lock().faults.get_mut(&op).and_then(|q| q.pop_front())
    }

    /// Apply injected faults. Returns the error to report after applying the
    /// call, if the fault says so.
    async fn before_call(&self, op: GatewayOp) -> RpcResult<Option<RpcError>> {
        self.apply_fault(self.take_fault(op)).await
    }

    async fn apply_fault(&self, fault: Option<Fault>) -> RpcResult<Option<RpcError>> {
        match fault {
            Some(Fault::Reject(err)) => Err(err),
            Some(Fault::ApplyThenReject(err)) => Ok(Some(err)),
            Some(Fault::Delay(d)) => {
                tokio::time::sleep(d).await;
                Ok(None)
            }
            Some(Fault::OverDeliver(_)) | None => Ok(None),
        }
    }

    fn try_activate(&self, request: &ActivateJobsRequest) -> Vec<ActivatedJob> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(request.timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let mut state = self.lock();

        // Reclaim expired leases.
        for stored in state.jobs.values_mut() {
            if let JobStatus::Activated { deadline, .. } = &stored.status {
                if *deadline <= now {
                    stored.status = JobStatus::Activatable { available_at: now };
                }
            }
        }

        let keys: Vec<JobKey> = state
            .jobs
            .iter()
            .filter(|(_, s)| s.job.job_type == request.job_type)
            .filter(|(_, s)| {
                matches!(s.status, JobStatus::Activatable { available_at } if available_at <= now)
            })
            .map(|(k, _)| *k)
            .take(request.max_jobs_to_activate as usize)
            .collect();

        let mut activated = Vec::with_capacity(keys.len());
        for key in keys {
            let raw = state.raw_variables.get(&key).cloned();
            let Some(stored) = state.jobs.get_mut(&key) else {
                continue;
            };
            let deadline = now + lease;
            stored.status = JobStatus::Activated {
                worker: request.worker.clone(),
                deadline,
            };
            stored.job.worker = request.worker.clone();
            stored.job.deadline = deadline;

            let mut job = stored.job.clone();
            if let Some(names) = &request.fetch_variables {
                job.variables.retain(|name, _| names.contains(name));
            }
            let mut wire = codec::stringify_job(&job);
            if let Some(raw) = raw {
                wire.variables = raw;
            }
            activated.push(wire);
        }
        activated
    }

    /// Transition an activated job to a resolved status.
    fn resolve(
        &self,
        job_key: JobKey,
        call: GatewayCall,
        apply: impl FnOnce(&mut StoredJob),
    ) -> RpcResult<()> {
        let mut state = self.lock();
        state.record(call);
        let Some(stored) = state.jobs.get_mut(&job_key) else {
            return Err(RpcError::not_found(format!("job {} not found", job_key)));
        };
        if !matches!(stored.status, JobStatus::Activated { .. }) {
            return Err(RpcError::not_found(format!(
                "job {} is not activated (already completed or reclaimed)",
                job_key
            )));
        }
        apply(stored);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Gateway impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Gateway for InMemoryGateway {
    async fn activate_jobs(&self, mut request: ActivateJobsRequest) -> RpcResult<Vec<ActivatedJob>> {
        let requested = request.max_jobs_to_activate;
        match self.take_fault(GatewayOp::ActivateJobs) {
            Some(Fault::OverDeliver(extra)) => {
                request.max_jobs_to_activate = requested.saturating_add(extra);
            }
            other => {
                self.apply_fault(other).await?;
            }
        }

        if request.job_type.is_empty() {
            return Err(RpcError::new(
                RpcCode::InvalidArgument,
                "job type must not be empty",
            ));
        }

        let long_poll_until = tokio::time::Instant::now() + request.request_timeout;
        let activated = loop {
            let notified = self.job_created.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let activated = if request.max_jobs_to_activate == 0 {
                Vec::new()
            } else {
                self.try_activate(&request)
            };
            if !activated.is_empty() || tokio::time::Instant::now() >= long_poll_until {
                break activated;
            }
            if tokio::time::timeout_at(long_poll_until, notified).await.is_err() {
                break Vec::new();
            }
        };

        self.lock().record(GatewayCall::ActivateJobs {
            job_type: request.job_type.clone(),
            worker: request.worker.clone(),
            max_jobs: requested,
            activated: activated.iter().map(|j| j.key).collect(),
        });
        Ok(activated)
    }

    async fn complete_job(&self, request: CompleteJobRequest) -> RpcResult<()> {
        let late_error = self.before_call(GatewayOp::CompleteJob).await?;
        let variables = codec::decode_variables(&request.variables)
            .map_err(|e| RpcError::new(RpcCode::InvalidArgument, e.to_string()))?;

        self.resolve(
            request.job_key,
            GatewayCall::CompleteJob {
                job_key: request.job_key,
                variables: variables.clone(),
            },
            |stored| stored.status = JobStatus::Completed { variables },
        )?;
        late_error.map_or(Ok(()), Err)
    }

    async fn fail_job(&self, request: FailJobRequest) -> RpcResult<()> {
        let late_error = self.before_call(GatewayOp::FailJob).await?;
        let back_off = chrono::Duration::from_std(request.retry_back_off)
            .unwrap_or_else(|_| chrono::Duration::zero());

        self.resolve(
            request.job_key,
            GatewayCall::FailJob {
                job_key: request.job_key,
                retries: request.retries,
                message: request.error_message.clone(),
            },
            |stored| {
                stored.job.retries = request.retries;
                stored.status = if request.retries == 0 {
                    JobStatus::Incident {
                        message: request.error_message,
                    }
                } else {
                    JobStatus::Activatable {
                        available_at: Utc::now() + back_off,
                    }
                };
            },
        )?;
        if request.retries > 0 {
            self.job_created.notify_waiters();
        }
        late_error.map_or(Ok(()), Err)
    }

    async fn throw_error(&self, request: ThrowErrorRequest) -> RpcResult<()> {
        let late_error = self.before_call(GatewayOp::ThrowError).await?;
        self.resolve(
            request.job_key,
            GatewayCall::ThrowError {
                job_key: request.job_key,
                code: request.error_code.clone(),
                message: request.error_message.clone(),
            },
            |stored| {
                stored.status = JobStatus::ErrorThrown {
                    code: request.error_code,
                }
            },
        )?;
        late_error.map_or(Ok(()), Err)
    }

    async fn deploy_resource(
        &self,
        request: DeployResourceRequest,
    ) -> RpcResult<DeployResourceResponse> {
        self.before_call(GatewayOp::DeployResource).await?;
        if request.content.is_empty() {
            return Err(RpcError::new(
                RpcCode::InvalidArgument,
                format!("resource '{}' is empty", request.name),
            ));
        }
        let bpmn_process_id = std::path::Path::new(&request.name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(request.name.as_str())
            .to_string();

        let mut state = self.lock();
        state.record(GatewayCall::DeployResource {
            name: request.name.clone(),
        });
        let version = state
            .process_versions
            .entry(bpmn_process_id.clone())
            .and_modify(|v| *v += 1)
            .or_insert(1);
        let version = *version;
        drop(state);

        Ok(DeployResourceResponse {
            key: self.next_key(),
            processes: vec![ProcessMetadata {
                bpmn_process_id,
                version,
                process_definition_key: self.next_key(),
                resource_name: request.name,
            }],
        })
    }

    async fn create_process_instance(
        &self,
        request: CreateProcessInstanceRequest,
    ) -> RpcResult<CreateProcessInstanceResponse> {
        self.before_call(GatewayOp::CreateProcessInstance).await?;
        codec::decode_variables(&request.variables)
            .map_err(|e| RpcError::new(RpcCode::InvalidArgument, e.to_string()))?;

        let mut state = self.lock();
        state.record(GatewayCall::CreateProcessInstance {
            bpmn_process_id: request.bpmn_process_id.clone(),
        });
        let Some(latest) = state.process_versions.get(&request.bpmn_process_id).copied() else {
            return Err(RpcError::not_found(format!(
                "no process deployed with id '{}'",
                request.bpmn_process_id
            )));
        };
        drop(state);

        Ok(CreateProcessInstanceResponse {
            process_definition_key: self.next_key(),
            bpmn_process_id: request.bpmn_process_id,
            version: request.version.unwrap_or(latest),
            process_instance_key: self.next_key(),
        })
    }

    async fn publish_message(
        &self,
        request: PublishMessageRequest,
    ) -> RpcResult<PublishMessageResponse> {
        self.before_call(GatewayOp::PublishMessage).await?;
        self.lock().record(GatewayCall::PublishMessage {
            name: request.name,
            correlation_key: request.correlation_key,
        });
        Ok(PublishMessageResponse {
            key: self.next_key(),
        })
    }

    async fn topology(&self) -> RpcResult<Topology> {
        self.before_call(GatewayOp::Topology).await?;
        self.lock().record(GatewayCall::Topology);
        let (host, port) = self
            .address
            .rsplit_once(':')
            .map(|(h, p)| (h.to_string(), p.parse::<u16>().unwrap_or(26500)))
            .unwrap_or_else(|| (self.address.clone(), 26500));
        Ok(Topology {
            brokers: vec![BrokerInfo {
                node_id: 0,
                host,
                port,
                version: env!("CARGO_PKG_VERSION").to_string(),
            }],
            cluster_size: 1,
            partitions_count: 1,
            replication_factor: 1,
            gateway_version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}
