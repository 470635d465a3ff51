//! Payload codec — converts job variables between the engine's serialized
//! text and structured values.
//!
//! `encode` and `decode` are inverses for every value the engine's variable
//! type system can hold (objects, arrays, strings, numbers, booleans, null).
//! Neither function touches its input; both return freshly owned values.
//! Key presence is preserved, including keys holding an explicit `null`.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::PayloadDecodeError;
use crate::types::{deadline_from_millis, ActivatedJob, Job, Variables};

/// Field name reported when custom headers cannot be decoded.
pub const CUSTOM_HEADERS_FIELD: &str = "customHeaders";

// ---------------------------------------------------------------------------
// Value level
// ---------------------------------------------------------------------------

/// Serialize a structured value to wire text.
pub fn encode(value: &Value) -> String {
    value.to_string()
}

/// Serialize a variables document to wire text.
pub fn encode_variables(variables: &Variables) -> String {
    // Map<String, Value> serialization cannot fail: keys are strings and
    // every Value is representable.
    serde_json::to_string(variables).unwrap_or_else(|_| "{}".to_string())
}

/// Parse wire text into a structured value.
pub fn decode(text: &str) -> Result<Value, PayloadDecodeError> {
    serde_json::from_str(text).map_err(|e| decode_error(text, &e))
}

/// Parse a variables document. Empty text decodes to an empty document.
pub fn decode_variables(text: &str) -> Result<Variables, PayloadDecodeError> {
    if text.trim().is_empty() {
        return Ok(Variables::new());
    }
    match decode(text)? {
        Value::Object(map) => Ok(map),
        _ => Err(PayloadDecodeError::not_an_object(None)),
    }
}

/// Parse the custom headers text into a `string → string` map.
pub fn decode_custom_headers(text: &str) -> Result<HashMap<String, String>, PayloadDecodeError> {
    if text.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let value = decode(text).map_err(|mut e| {
        e.field = Some(CUSTOM_HEADERS_FIELD.to_string());
        e
    })?;
    let Value::Object(map) = value else {
        return Err(PayloadDecodeError::not_an_object(Some(CUSTOM_HEADERS_FIELD)));
    };

    let mut headers = HashMap::with_capacity(map.len());
    for (name, value) in map {
        match value {
            Value::String(s) => {
                headers.insert(name, s);
            }
            other => {
                return Err(PayloadDecodeError {
                    field: Some(format!("{}.{}", CUSTOM_HEADERS_FIELD, name)),
                    line: 1,
                    column: 1,
                    message: format!("header value must be a string, got {}", other),
                })
            }
        }
    }
    Ok(headers)
}

// ---------------------------------------------------------------------------
// Job level
// ---------------------------------------------------------------------------

/// Decode an activated job into a handler-ready [`Job`].
///
/// Every field of the wire job is carried over; only variables, custom
/// headers and the deadline change representation.
pub fn parse_job(activated: ActivatedJob) -> Result<Job, PayloadDecodeError> {
    let variables = decode_variables(&activated.variables)?;
    let custom_headers = decode_custom_headers(&activated.custom_headers)?;

    Ok(Job {
        key: activated.key,
        job_type: activated.job_type,
        worker: activated.worker,
        headers: activated.headers,
        custom_headers,
        variables,
        retries: activated.retries,
        deadline: deadline_from_millis(activated.deadline),
    })
}

/// Encode a decoded job back to its wire form.
pub fn stringify_job(job: &Job) -> ActivatedJob {
    let headers: serde_json::Map<String, Value> = job
        .custom_headers
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    ActivatedJob {
        key: job.key,
        job_type: job.job_type.clone(),
        worker: job.worker.clone(),
        headers: job.headers.clone(),
        custom_headers: encode(&Value::Object(headers)),
        variables: encode_variables(&job.variables),
        retries: job.retries,
        deadline: job.deadline.timestamp_millis(),
    }
}

// ---------------------------------------------------------------------------
// Error location
// ---------------------------------------------------------------------------

fn decode_error(text: &str, err: &serde_json::Error) -> PayloadDecodeError {
    let offset = byte_offset(text, err.line(), err.column());
    PayloadDecodeError {
        field: last_key_before(&text[..offset]),
        line: err.line(),
        column: err.column(),
        message: err.to_string(),
    }
}

/// Byte offset of a 1-based line / column position, clamped to the text.
fn byte_offset(text: &str, line: usize, column: usize) -> usize {
    let mut offset = 0;
    for (idx, l) in text.split_inclusive('\n').enumerate() {
        if idx + 1 == line {
            let within = l
                .char_indices()
                .nth(column.saturating_sub(1))
                .map(|(b, _)| b)
                .unwrap_or(l.len());
            return offset + within;
        }
        offset += l.len();
    }
    text.len()
}

/// The most recent object key that precedes the end of `prefix`.
fn last_key_before(prefix: &str) -> Option<String> {
    let mut last_key = None;
    let mut pending: Option<String> = None;
    let mut current = String::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in prefix.chars() {
        if in_string {
            if escaped {
                escaped = false;
                current.push(c);
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                pending = Some(std::mem::take(&mut current));
            } else {
                current.push(c);
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                current.clear();
            }
            ':' => {
                if let Some(key) = pending.take() {
                    last_key = Some(key);
                }
            }
            c if c.is_whitespace() => {}
            _ => pending = None,
        }
    }
    last_key
}
