//! Error types for lambda-pool.

use serde_json::{Value, json};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for lambda-pool.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to spawn worker for \"{name}\": {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker error: {0}")]
    Worker(String),
}

/// Result type alias for lambda-pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to turn a function name into a [`FunctionConfig`](crate::config::FunctionConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{variable}' required by '{key}' is not set")]
    MissingVariable { key: String, variable: String },

    #[error("Failed to read descriptor {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid descriptor {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid timeout in descriptor {}: {value}", .path.display())]
    InvalidTimeout { path: PathBuf, value: f64 },
}

/// Outcome of a failed invocation, delivered through the same channel as results.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvokeError {
    /// Configuration or spawning failed before any process existed.
    #[error("Failed to launch \"{name}\"")]
    Launch { name: String, reason: String },

    /// The call exceeded its deadline and the worker was killed.
    #[error("Lambda \"{name}\" timed out after {}ms", .timeout.as_millis())]
    Timeout { name: String, timeout: Duration },

    /// The worker died or was killed while the call was outstanding.
    #[error("Lambda \"{name}\" failed: {reason}")]
    Failed { name: String, reason: String },

    /// The response payload could not be decoded. The worker survives.
    #[error("Lambda {name} message parse error: {detail} in {payload:?}")]
    Parse {
        name: String,
        payload: String,
        detail: String,
    },

    /// The function reported an error of its own.
    #[error("{}", function_error_message(.error))]
    Function { name: String, error: Value },
}

impl InvokeError {
    /// Error code for calls that exceeded their deadline.
    pub const TIMEOUT_CODE: &'static str = "E_TIMEOUT";
    /// Error code for calls whose worker process died.
    pub const FAILED_CODE: &'static str = "ERR_FAILED";

    /// Name of the function the failed call was addressed to.
    pub fn function_name(&self) -> &str {
        match self {
            Self::Launch { name, .. }
            | Self::Timeout { name, .. }
            | Self::Failed { name, .. }
            | Self::Parse { name, .. }
            | Self::Function { name, .. } => name,
        }
    }

    /// Machine-readable code, if this failure class has one.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Timeout { .. } => Some(Self::TIMEOUT_CODE),
            Self::Failed { .. } => Some(Self::FAILED_CODE),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Structured JSON form handed to callers and printed by the CLI.
    ///
    /// Function errors are passed through verbatim.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Launch { .. } => json!({ "message": self.to_string() }),
            Self::Timeout { .. } | Self::Failed { .. } => json!({
                "code": self.code(),
                "message": self.to_string(),
            }),
            Self::Parse { .. } => json!({ "name": "Error", "message": self.to_string() }),
            Self::Function { error, .. } => error.clone(),
        }
    }
}

/// Best-effort message for an error value reported by a function.
fn function_error_message(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Object(map) => match map.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => error.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_launch_error_json() {
        let err = InvokeError::Launch {
            name: "env-file".to_string(),
            reason: "missing variable".to_string(),
        };
        assert_eq!(
            err.to_json(),
            json!({ "message": "Failed to launch \"env-file\"" })
        );
        assert_eq!(err.code(), None);
    }

    #[test]
    fn test_timeout_error_code() {
        let err = InvokeError::Timeout {
            name: "timeout".to_string(),
            timeout: Duration::from_millis(100),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_json()["code"], "E_TIMEOUT");
        assert!(err.to_string().contains("100ms"));
    }

    #[test]
    fn test_failed_error_code() {
        let err = InvokeError::Failed {
            name: "crash".to_string(),
            reason: "exited with code 70".to_string(),
        };
        assert!(err.is_failed());
        assert_eq!(err.to_json()["code"], "ERR_FAILED");
        assert!(err.to_string().contains("exited with code 70"));
    }

    #[test]
    fn test_parse_error_names_function_and_payload() {
        let err = InvokeError::Parse {
            name: "invalid-response".to_string(),
            payload: "{oops".to_string(),
            detail: "key must be a string".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Lambda invalid-response message parse error"));
        assert!(msg.contains("{oops"));
        assert_eq!(err.to_json()["name"], "Error");
    }

    #[test]
    fn test_function_error_passthrough() {
        let value = json!({ "name": "Error", "message": "Ouch!", "stack": "Error: Ouch!" });
        let err = InvokeError::Function {
            name: "error".to_string(),
            error: value.clone(),
        };
        assert_eq!(err.to_string(), "Ouch!");
        assert_eq!(err.to_json(), value);

        let err = InvokeError::Function {
            name: "error".to_string(),
            error: json!("plain"),
        };
        assert_eq!(err.to_string(), "plain");
    }

    #[test]
    fn test_missing_variable_message() {
        let err = ConfigError::MissingVariable {
            key: "SECRET".to_string(),
            variable: "STUDIO_SECRET".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("STUDIO_SECRET"));
        assert!(msg.contains("SECRET"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_error_is_transparent() {
        let err: Error = ConfigError::MissingVariable {
            key: "A".to_string(),
            variable: "B".to_string(),
        }
        .into();
        assert!(err.to_string().starts_with("Environment variable 'B'"));
    }
}
