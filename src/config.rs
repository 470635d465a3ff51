//! Client and worker configuration — YAML file, environment, builders.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backoff::RetryPolicy;
use crate::error::{WorkerError, WorkerResult};

/// Environment variable holding the gateway address.
pub const ENV_ADDRESS: &str = "ZEEBE_ADDRESS";

/// Environment variable holding the pool shutdown timeout in milliseconds.
pub const ENV_SHUTDOWN_TIMEOUT_MS: &str = "ZEEBE_SHUTDOWN_TIMEOUT_MS";

const DEFAULT_ADDRESS: &str = "localhost:26500";

// ---------------------------------------------------------------------------
// WorkerConfig
// ---------------------------------------------------------------------------

/// Registration of one job worker. Immutable once the worker is started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Job type to activate.
    pub job_type: String,
    /// Name reported to the engine on activation.
    #[serde(default = "default_worker_name")]
    pub worker_name: String,
    /// Upper bound on jobs in flight for this worker.
    #[serde(default = "default_max_jobs_active")]
    pub max_jobs_active: usize,
    /// Pause after a poll that returned no jobs.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long the engine may hold an activation open (long-poll).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Lease requested for each activated job.
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
    /// Variables to fetch. `None` fetches all.
    #[serde(default)]
    pub fetch_variables: Option<Vec<String>>,
    #[serde(default = "RetryPolicy::polling")]
    pub poll_retry: RetryPolicy,
    #[serde(default = "RetryPolicy::completion")]
    pub completion_retry: RetryPolicy,
}

fn default_worker_name() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_max_jobs_active() -> usize {
    32
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_job_timeout_ms() -> u64 {
    60_000
}

impl WorkerConfig {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            worker_name: default_worker_name(),
            max_jobs_active: default_max_jobs_active(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            job_timeout_ms: default_job_timeout_ms(),
            fetch_variables: None,
            poll_retry: RetryPolicy::polling(),
            completion_retry: RetryPolicy::completion(),
        }
    }

    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn with_max_jobs_active(mut self, max: usize) -> Self {
        self.max_jobs_active = max;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_fetch_variables<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fetch_variables = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_poll_retry(mut self, policy: RetryPolicy) -> Self {
        self.poll_retry = policy;
        self
    }

    pub fn with_completion_retry(mut self, policy: RetryPolicy) -> Self {
        self.completion_retry = policy;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    /// Reject settings no engine accepts.
    pub fn validate(&self) -> WorkerResult<()> {
        let fail = |message: &str| {
            Err(WorkerError::FatalConfig {
                worker: self.worker_name.clone(),
                message: message.to_string(),
            })
        };
        if self.job_type.trim().is_empty() {
            return fail("job_type must not be empty");
        }
        if self.worker_name.trim().is_empty() {
            return fail("worker_name must not be empty");
        }
        if self.max_jobs_active == 0 {
            return fail("max_jobs_active must be at least 1");
        }
        if self.max_jobs_active > u32::MAX as usize {
            return fail("max_jobs_active does not fit an activation request");
        }
        if self.job_timeout_ms == 0 {
            return fail("job_timeout_ms must be greater than zero");
        }
        if self.completion_retry.max_attempts == Some(0) || self.poll_retry.max_attempts == Some(0)
        {
            return fail("retry max_attempts must be at least 1 when set");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Root client configuration loaded from YAML or the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_gateway_address")]
    pub gateway_address: String,
    /// Bound on `stop_all`; workers still draining afterwards are forced.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

fn default_gateway_address() -> String {
    DEFAULT_ADDRESS.to_string()
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gateway_address: default_gateway_address(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            workers: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Load from a YAML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Parsing {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml::from_str(content)?;
        for worker in &config.workers {
            worker.validate()?;
        }
        Ok(config)
    }

    /// Defaults overridden by `ZEEBE_ADDRESS` / `ZEEBE_SHUTDOWN_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(address) = lookup(ENV_ADDRESS).filter(|a| !a.trim().is_empty()) {
            config.gateway_address = address;
        }
        if let Some(raw) = lookup(ENV_SHUTDOWN_TIMEOUT_MS) {
            config.shutdown_timeout_ms = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be milliseconds, got '{}'", ENV_SHUTDOWN_TIMEOUT_MS, raw))?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_worker_defaults() {
        let config = WorkerConfig::new("payment-service");
        assert_eq!(config.max_jobs_active, 32);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(uuid::Uuid::parse_str(&config.worker_name).is_ok());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let empty = WorkerConfig::new("  ");
        assert!(matches!(
            empty.validate(),
            Err(WorkerError::FatalConfig { .. })
        ));

        let zero = WorkerConfig::new("t").with_max_jobs_active(0);
        assert!(zero.validate().is_err());

        let no_lease = WorkerConfig::new("t").with_job_timeout(Duration::ZERO);
        assert!(no_lease.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
gateway_address: "broker:26500"
shutdown_timeout_ms: 2500
workers:
  - job_type: payment-service
    worker_name: payments
    max_jobs_active: 4
    fetch_variables: [orderId]
    completion_retry:
      max_attempts: 2
      initial_backoff_ms: 50
      max_backoff_ms: 200
  - job_type: inventory-service
"#
        )
        .unwrap();

        let config = ClientConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.gateway_address, "broker:26500");
        assert_eq!(config.shutdown_timeout(), Duration::from_millis(2500));
        assert_eq!(config.workers.len(), 2);

        let payments = &config.workers[0];
        assert_eq!(payments.worker_name, "payments");
        assert_eq!(payments.max_jobs_active, 4);
        assert_eq!(payments.fetch_variables, Some(vec!["orderId".to_string()]));
        assert_eq!(payments.completion_retry.max_attempts, Some(2));
        assert_eq!(payments.poll_retry, RetryPolicy::polling());

        let inventory = &config.workers[1];
        assert_eq!(inventory.max_jobs_active, 32);
        assert_ne!(inventory.worker_name, payments.worker_name);
    }

    #[test]
    fn test_load_rejects_invalid_worker() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "workers:\n  - job_type: t\n    max_jobs_active: 0\n").unwrap();
        let err = ClientConfig::load_from_file(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("max_jobs_active"));
    }

    #[test]
    fn test_load_missing_file_has_context() {
        let err = ClientConfig::load_from_file(Path::new("/nonexistent/zb.yaml")).unwrap_err();
        assert!(err.to_string().contains("Reading /nonexistent/zb.yaml"));
    }

    #[test]
    fn test_from_lookup() {
        let env: HashMap<&str, &str> = [
            (ENV_ADDRESS, "zeebe.internal:26500"),
            (ENV_SHUTDOWN_TIMEOUT_MS, "1500"),
        ]
        .into_iter()
        .collect();
        let config = ClientConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.gateway_address, "zeebe.internal:26500");
        assert_eq!(config.shutdown_timeout_ms, 1500);

        let defaults = ClientConfig::from_lookup(|_| None).unwrap();
        assert_eq!(defaults, ClientConfig::default());

        let bad = ClientConfig::from_lookup(|k| (k == ENV_SHUTDOWN_TIMEOUT_MS).then(|| "soon".to_string()));
        assert!(bad.is_err());
    }
}
