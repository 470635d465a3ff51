//! ZbClient — the client context shared by application code.
//!
//! Holds the gateway connection (reference-counted, shared read-only by every
//! worker) and the worker pool. Process deployment, instance creation,
//! message publication and topology are thin pass-throughs to the gateway
//! and are not retried.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;

use crate::codec;
use crate::config::{ClientConfig, WorkerConfig};
use crate::error::WorkerResult;
use crate::gateway::{
    CreateProcessInstanceRequest, CreateProcessInstanceResponse, DeployResourceRequest,
    DeployResourceResponse, Gateway, PublishMessageRequest, PublishMessageResponse, RpcResult,
    Topology,
};
use crate::handler::JobHandler;
use crate::pool::{StopReport, WorkerEvent, WorkerHandle, WorkerPool};
use crate::types::Variables;

pub struct ZbClient {
    gateway: Arc<dyn Gateway>,
    config: ClientConfig,
    pool: WorkerPool,
}

impl ZbClient {
    pub fn new(gateway: Arc<dyn Gateway>, config: ClientConfig) -> Self {
        let pool = WorkerPool::new(gateway.clone(), config.shutdown_timeout());
        Self {
            gateway,
            config,
            pool,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Worker lifecycle and completion-failure notifications. Only the
    /// first caller gets the receiver.
    pub fn take_events(&self) -> Option<tokio::sync::mpsc::Receiver<WorkerEvent>> {
        self.pool.take_events()
    }

    // ── Workers ──

    pub fn create_worker(
        &self,
        config: WorkerConfig,
        handler: Arc<dyn JobHandler>,
    ) -> WorkerResult<WorkerHandle> {
        self.pool.register_worker(config, handler)
    }

    /// Start every worker declared in the configuration, each with the
    /// handler `handler_for` returns for its job type.
    pub fn start_configured_workers(
        &self,
        mut handler_for: impl FnMut(&WorkerConfig) -> Option<Arc<dyn JobHandler>>,
    ) -> WorkerResult<Vec<WorkerHandle>> {
        let mut handles = Vec::new();
        for config in &self.config.workers {
            match handler_for(config) {
                Some(handler) => handles.push(self.pool.register_worker(config.clone(), handler)?),
                None => tracing::warn!(
                    job_type = %config.job_type,
                    "ZbClient: no handler for configured worker, skipping"
                ),
            }
        }
        Ok(handles)
    }

    /// Drain every worker, bounded by the configured shutdown timeout.
    pub async fn close(&self) -> StopReport {
        self.pool.stop_all().await
    }

    // ── Pass-through calls ──

    pub async fn deploy_resource(
        &self,
        name: impl Into<String>,
        content: Vec<u8>,
    ) -> RpcResult<DeployResourceResponse> {
        self.gateway
            .deploy_resource(DeployResourceRequest {
                name: name.into(),
                content,
            })
            .await
    }

    /// Read a process definition from disk and deploy it under its file name.
    pub async fn deploy_file(&self, path: &Path) -> anyhow::Result<DeployResourceResponse> {
        let content =
            std::fs::read(path).with_context(|| format!("Reading {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("resource.bpmn")
            .to_string();
        let deployed = self
            .deploy_resource(name, content)
            .await
            .with_context(|| format!("Deploying {}", path.display()))?;
        Ok(deployed)
    }

    pub async fn create_process_instance(
        &self,
        bpmn_process_id: impl Into<String>,
        variables: &Variables,
    ) -> RpcResult<CreateProcessInstanceResponse> {
        self.gateway
            .create_process_instance(CreateProcessInstanceRequest {
                bpmn_process_id: bpmn_process_id.into(),
                version: None,
                variables: codec::encode_variables(variables),
            })
            .await
    }

    pub async fn publish_message(
        &self,
        name: impl Into<String>,
        correlation_key: impl Into<String>,
        time_to_live: std::time::Duration,
        variables: &Value,
    ) -> RpcResult<PublishMessageResponse> {
        self.gateway
            .publish_message(PublishMessageRequest {
                name: name.into(),
                correlation_key: correlation_key.into(),
                time_to_live,
                message_id: None,
                variables: codec::encode(variables),
            })
            .await
    }

    pub async fn topology(&self) -> RpcResult<Topology> {
        self.gateway.topology().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::memory::{GatewayCall, InMemoryGateway, JobStatus, NewJob};
    use crate::handler::JobControls;
    use crate::types::Job;
    use serde_json::json;
    use std::io::Write;
    use std::time::Duration;

    async fn complete(_job: Job, controls: JobControls) -> anyhow::Result<()> {
        controls.succeed_empty();
        Ok(())
    }

    #[tokio::test]
    async fn test_deploy_and_create_instance() {
        let client = ZbClient::new(Arc::new(InMemoryGateway::new()), ClientConfig::default());

        let mut file = tempfile::Builder::new().suffix(".bpmn").tempfile().unwrap();
        write!(file, "<definitions/>").unwrap();
        let deployed = client.deploy_file(file.path()).await.unwrap();
        let process_id = deployed.processes[0].bpmn_process_id.clone();

        let mut variables = Variables::new();
        variables.insert("orderId".to_string(), json!(31243));
        let created = client
            .create_process_instance(process_id.clone(), &variables)
            .await
            .unwrap();
        assert_eq!(created.bpmn_process_id, process_id);
        assert_eq!(created.version, 1);
    }

    #[tokio::test]
    async fn test_publish_and_topology() {
        let gateway = Arc::new(InMemoryGateway::new());
        let client = ZbClient::new(gateway.clone(), ClientConfig::default());

        client
            .publish_message("payment-received", "order-31243", Duration::from_secs(10), &json!({"paid": true}))
            .await
            .unwrap();
        let topology = client.topology().await.unwrap();
        assert_eq!(topology.brokers.len(), 1);
        assert_eq!(
            gateway.calls(),
            vec![
                GatewayCall::PublishMessage {
                    name: "payment-received".to_string(),
                    correlation_key: "order-31243".to_string()
                },
                GatewayCall::Topology
            ]
        );
    }

    #[tokio::test]
    async fn test_configured_workers_and_close() {
        let gateway = Arc::new(InMemoryGateway::new());
        let config = ClientConfig {
            workers: vec![
                WorkerConfig::new("payment-service")
                    .with_poll_interval(Duration::from_millis(10))
                    .with_request_timeout(Duration::ZERO),
                WorkerConfig::new("unhandled-type"),
            ],
            ..ClientConfig::default()
        };
        let client = ZbClient::new(gateway.clone(), config);

        let handles = client
            .start_configured_workers(|c| {
                (c.job_type == "payment-service").then(|| Arc::new(complete) as Arc<dyn JobHandler>)
            })
            .unwrap();
        assert_eq!(handles.len(), 1);

        let key = gateway.create_job(NewJob::new("payment-service"));
        for _ in 0..200 {
            if matches!(gateway.job_status(key), Some(JobStatus::Completed { .. })) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(gateway.job_status(key), Some(JobStatus::Completed { .. })));

        let report = client.close().await;
        assert_eq!(report.total(), 1);
    }
}
