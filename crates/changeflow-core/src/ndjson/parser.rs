//! NDJSON reader and writer for the worker protocol.
//!
//! Implements tolerant reader pattern: unknown fields ignored, unknown kinds rejected.

use serde_json::{Value, json};

use super::types::{Job, PoolMessage, WorkerMessage};
use crate::error::{Error, Result};

/// Parse one line written by a worker.
pub fn parse_worker_line(line: &str) -> Result<WorkerMessage> {
    let raw: Value = serde_json::from_str(line.trim())?;
    match message_kind(&raw)? {
        "ready" => Ok(WorkerMessage::Ready),
        "done" => Ok(WorkerMessage::Done {
            change_id: optional_str(&raw, "changeId")?,
            error: optional_str(&raw, "error")?,
        }),
        other => Err(Error::NdjsonParse(format!("Unknown worker message kind '{other}'"))),
    }
}

/// Parse one line written by the pool.
pub fn parse_pool_line(line: &str) -> Result<PoolMessage> {
    let raw: Value = serde_json::from_str(line.trim())?;
    match message_kind(&raw)? {
        "load" => {
            let module = raw
                .get("module")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::NdjsonParse("Missing 'module' field".into()))?;
            Ok(PoolMessage::Load {
                module: module.to_string(),
            })
        }
        "job" => {
            let job = raw
                .get("job")
                .ok_or_else(|| Error::NdjsonParse("Missing 'job' field".into()))?;
            Ok(PoolMessage::Job(parse_job(job)?))
        }
        "stop" => Ok(PoolMessage::Stop),
        other => Err(Error::NdjsonParse(format!("Unknown pool message kind '{other}'"))),
    }
}

/// Parse a job object.
pub fn parse_job(raw: &Value) -> Result<Job> {
    let job_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::NdjsonParse("Missing job 'type' field".into()))?;
    match job_type {
        "available" | "change" | "delete" => Ok(serde_json::from_value(raw.clone())?),
        other => Err(Error::NdjsonParse(format!("Unknown job type '{other}'"))),
    }
}

/// Encode a message as a single line, without the trailing newline.
pub fn encode_line<M: Encode>(message: &M) -> String {
    message.to_value().to_string()
}

/// Conversion of protocol messages into their JSON form.
pub trait Encode {
    fn to_value(&self) -> Value;
}

impl Encode for Job {
    fn to_value(&self) -> Value {
        match self {
            Self::Available { path } => json!({ "type": "available", "path": path }),
            Self::Change { change_id } => json!({ "type": "change", "changeId": change_id }),
            Self::Delete { change_id } => json!({ "type": "delete", "changeId": change_id }),
            // Never a job on the wire; PoolMessage::from maps it to Stop.
            Self::Terminate => json!({ "kind": "stop" }),
        }
    }
}

impl Encode for PoolMessage {
    fn to_value(&self) -> Value {
        match self {
            Self::Load { module } => json!({ "kind": "load", "module": module }),
            Self::Job(Job::Terminate) | Self::Stop => json!({ "kind": "stop" }),
            Self::Job(job) => json!({ "kind": "job", "job": job.to_value() }),
        }
    }
}

impl Encode for WorkerMessage {
    fn to_value(&self) -> Value {
        match self {
            Self::Ready => json!({ "kind": "ready" }),
            Self::Done { change_id, error } => {
                let mut value = json!({ "kind": "done" });
                if let Some(id) = change_id {
                    value["changeId"] = json!(id);
                }
                if let Some(error) = error {
                    value["error"] = json!(error);
                }
                value
            }
        }
    }
}

fn message_kind(raw: &Value) -> Result<&str> {
    raw.get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::NdjsonParse("Missing 'kind' field".into()))
}

fn optional_str(raw: &Value, field: &str) -> Result<Option<String>> {
    match raw.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(Error::NdjsonParse(format!("Field '{field}' must be a string"))),
    }
}
