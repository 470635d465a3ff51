//! zb-worker — job worker client for Zeebe-style workflow engines.
//!
//! A [`ZbClient`] owns a shared [`Gateway`] connection and a [`WorkerPool`].
//! Each registered worker long-polls the engine for jobs of one type, runs
//! them through a user [`JobHandler`] under a concurrency bound, and reports
//! exactly one outcome per job through the [`CompletionPipeline`].
//!
//! ```ignore
//! let gateway = Arc::new(InMemoryGateway::new());
//! let client = ZbClient::new(gateway, ClientConfig::default());
//!
//! client.create_worker(
//!     WorkerConfig::new("payment-service").with_max_jobs_active(8),
//!     Arc::new(|job: Job, controls: JobControls| async move {
//!         let mut variables = job.variables.clone();
//!         variables.insert("paid".into(), true.into());
//!         controls.succeed(variables);
//!         Ok(())
//!     }),
//! )?;
//!
//! // ...
//! client.close().await;
//! ```

pub mod backoff;
pub mod client;
pub mod codec;
pub mod completion;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod lease;
pub mod pool;
pub mod telemetry;
pub mod types;
pub mod worker;

pub use backoff::RetryPolicy;
pub use client::ZbClient;
pub use completion::{CompletionPipeline, Resolution};
pub use config::{ClientConfig, WorkerConfig};
pub use error::{CompletionError, PayloadDecodeError, WorkerError, WorkerResult};
pub use gateway::memory::InMemoryGateway;
pub use gateway::{Gateway, RpcCode, RpcError, RpcResult};
pub use handler::{JobControls, JobHandler, PAYLOAD_DECODE_ERROR_CODE, UNHANDLED_ERROR_CODE};
pub use lease::{LeaseTracker, Remaining};
pub use pool::{StopKind, StopReport, WorkerEvent, WorkerHandle, WorkerPool};
pub use types::{ActivatedJob, Job, JobHeaders, JobKey, Outcome, OutcomeKind, Variables};
pub use worker::{JobWorker, WorkerState, WorkerStats, WorkerStatsSnapshot};
