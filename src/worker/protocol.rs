//! IPC protocol between the host and a worker process.
//!
//! Messages are JSON-serialized and newline-delimited. The host writes
//! [`Request`]s to the worker's stdin and reads [`Response`]s from its stdout.

use crate::error::InvokeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-call metadata handed to the function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    pub function_name: String,
    /// Call timeout in seconds.
    pub timeout: f64,
    #[serde(rename = "memoryLimitInMB")]
    pub memory_limit_in_mb: u32,
    pub invoked_function_arn: String,
    pub aws_request_id: String,
}

/// Request from host to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, unique within one worker's lifetime.
    pub id: u64,
    #[serde(default)]
    pub event: Value,
    pub context: InvocationContext,
}

/// Resource usage reported by the worker alongside a response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryUsage {
    pub rss: u64,
    pub heap_total: u64,
    pub heap_used: u64,
}

/// Response from worker to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    /// Function error, passed through verbatim.
    #[serde(default)]
    pub err: Option<Value>,
    /// Result as JSON text. `null` means a `null` result.
    #[serde(default)]
    pub res: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<MemoryUsage>,
}

impl Request {
    pub fn new(id: u64, event: Value, context: InvocationContext) -> Self {
        Self { id, event, context }
    }

    /// Serialize to a JSON line (with trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

impl Response {
    /// Successful response carrying `value`.
    pub fn success(id: u64, value: &Value) -> serde_json::Result<Self> {
        Ok(Self {
            id,
            err: None,
            res: Some(serde_json::to_string(value)?),
            mem: None,
        })
    }

    /// Response carrying a function error.
    pub fn failure(id: u64, error: Value) -> Self {
        Self {
            id,
            err: Some(error),
            res: None,
            mem: None,
        }
    }

    pub fn with_memory(mut self, mem: MemoryUsage) -> Self {
        self.mem = Some(mem);
        self
    }

    /// Serialize to a JSON line (with trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }

    /// Turn the response into the caller-facing outcome for function `name`.
    ///
    /// A non-null `err` wins over `res`. An undecodable `res` is a parse
    /// error; the worker that produced it is still healthy.
    pub fn decode(self, name: &str) -> Result<Value, InvokeError> {
        match (self.err, self.res) {
            (Some(error), _) if !error.is_null() => Err(InvokeError::Function {
                name: name.to_string(),
                error,
            }),
            (_, None) => Ok(Value::Null),
            (_, Some(payload)) => {
                serde_json::from_str(&payload).map_err(|e| InvokeError::Parse {
                    name: name.to_string(),
                    detail: e.to_string(),
                    payload,
                })
            }
        }
    }
}
