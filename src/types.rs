//! Core job types shared by the codec, the dispatch loop and the completion
//! pipeline.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engine-assigned job identity.
pub type JobKey = i64;

/// Decoded job variables: variable name → structured value.
pub type Variables = serde_json::Map<String, serde_json::Value>;

// ─── Activated job (wire form) ───────────────────────────────────────────────

/// A job exactly as the engine hands it over from an activation call.
///
/// Variables and custom headers are still serialized text; the codec turns
/// this into a [`Job`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivatedJob {
    pub key: JobKey,
    #[serde(rename = "type")]
    pub job_type: String,
    pub worker: String,
    pub headers: JobHeaders,
    /// Serialized `string → string` map.
    pub custom_headers: String,
    /// Serialized variables document.
    pub variables: String,
    pub retries: u32,
    /// Lease deadline as epoch milliseconds.
    pub deadline: i64,
}

/// Where in which process the job was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHeaders {
    pub process_instance_key: i64,
    pub bpmn_process_id: String,
    pub process_definition_version: i32,
    pub process_definition_key: i64,
    pub element_id: String,
    pub element_instance_key: i64,
}

// ─── Job (decoded form) ──────────────────────────────────────────────────────

/// One unit of work, decoded and ready for a handler.
///
/// Owned by the dispatch loop from activation until one outcome has been
/// reported for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub key: JobKey,
    #[serde(rename = "type")]
    pub job_type: String,
    /// Name of the worker that activated the job.
    pub worker: String,
    pub headers: JobHeaders,
    pub custom_headers: HashMap<String, String>,
    pub variables: Variables,
    pub retries: u32,
    pub deadline: DateTime<Utc>,
}

impl Job {
    /// Look up a single variable.
    pub fn variable(&self, name: &str) -> Option<&serde_json::Value> {
        self.variables.get(name)
    }

    /// Deserialize all variables into a typed struct.
    pub fn variables_as<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.variables.clone()))
    }
}

/// Converts an epoch-millisecond deadline to a wall-clock timestamp.
///
/// Out-of-range values clamp to the epoch, which reads as already expired.
pub fn deadline_from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

// ─── Outcome ─────────────────────────────────────────────────────────────────

/// The terminal result a handler produces for a job. Exactly one per job.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Complete the job, merging `variables` into the process scope.
    Success { variables: Variables },
    /// Fail the job. `retries` is what the engine should have left.
    Failure {
        retries: u32,
        message: String,
        retry_back_off: Option<Duration>,
    },
    /// Throw a business error the process model can catch.
    Error { code: String, message: String },
}

impl Outcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Success { .. } => OutcomeKind::Success,
            Outcome::Failure { .. } => OutcomeKind::Failure,
            Outcome::Error { .. } => OutcomeKind::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Failure,
    Error,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::Failure => "failure",
            OutcomeKind::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_variables_as_typed() {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Order {
            order_id: u32,
        }

        let mut variables = Variables::new();
        variables.insert("orderId".to_string(), json!(31243));
        let job = Job {
            key: 1,
            job_type: "payment-service".to_string(),
            worker: "w".to_string(),
            headers: JobHeaders::default(),
            custom_headers: HashMap::new(),
            variables,
            retries: 3,
            deadline: Utc::now(),
        };

        let order: Order = job.variables_as().unwrap();
        assert_eq!(order.order_id, 31243);
        assert_eq!(job.variable("orderId"), Some(&json!(31243)));
    }

    #[test]
    fn test_deadline_from_millis() {
        let deadline = deadline_from_millis(1_547_595_187_455);
        assert_eq!(deadline.timestamp_millis(), 1_547_595_187_455);
    }

    #[test]
    fn test_outcome_kind() {
        let outcome = Outcome::Error {
            code: "E".to_string(),
            message: "m".to_string(),
        };
        assert_eq!(outcome.kind(), OutcomeKind::Error);
        assert_eq!(outcome.kind().as_str(), "error");
    }
}
