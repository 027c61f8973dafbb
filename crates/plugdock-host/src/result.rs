//! Serializable result shapes crossing the host↔worker boundary.
//!
//! Everything here is plain data: results, errors, log lines, and fetch
//! records round-trip through JSON so they can cross a worker boundary
//! without carrying native handles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SandboxError;

// ─── Well-known error names ─────────────────────────────────────────────

/// Error names recognized across the host, the workers, and the HTTP
/// façade. They are data, not types, so they survive serialization.
pub mod names {
    pub const ABORT_ERROR: &str = "AbortError";
    pub const TERMINATE_ERROR: &str = "TerminateError";
    pub const NOT_FOUND_ERROR: &str = "NotFoundError";
    pub const LOAD_ERROR: &str = "LoadError";
    pub const RUNTIME_ERROR: &str = "RuntimeError";
    pub const INTERNAL_ERROR: &str = "InternalError";
    pub const NOT_SUPPORTED_ERROR: &str = "NotSupportedError";
    pub const TYPE_ERROR: &str = "TypeError";
}

// ─── ErrorDetails ───────────────────────────────────────────────────────

/// A serializable error: name, message, and an optional stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorDetails {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// The caller's abort signal fired.
    pub fn aborted() -> Self {
        Self::new(names::ABORT_ERROR, "Invocation was aborted")
    }

    /// The host was terminated while the invocation was pending.
    pub fn terminated() -> Self {
        Self::new(names::TERMINATE_ERROR, "Worker was terminated")
    }

    /// The requested function is not among the discovered exports.
    pub fn not_found(function: &str) -> Self {
        Self::new(
            names::NOT_FOUND_ERROR,
            format!("function \"{function}\" is not found"),
        )
    }

    /// An invoke arrived before any module was loaded.
    pub fn not_loaded() -> Self {
        Self::new(names::LOAD_ERROR, "no plugin is loaded")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(names::INTERNAL_ERROR, message)
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl From<SandboxError> for ErrorDetails {
    fn from(err: SandboxError) -> Self {
        match &err {
            SandboxError::Aborted => Self::aborted(),
            SandboxError::Unsupported(_) => {
                Self::new(names::NOT_SUPPORTED_ERROR, err.to_string())
            }
            SandboxError::Reenter | SandboxError::NoActiveContext => {
                Self::internal(err.to_string())
            }
            _ => Self::new(names::RUNTIME_ERROR, err.to_string()),
        }
    }
}

// ─── Log and fetch records ──────────────────────────────────────────────

/// One captured log line from a plugin invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub logger_name: String,
    pub level: String,
    pub message: String,
}

/// Telemetry for one outbound HTTP call made by a plugin.
///
/// Emitted when the response body is fully consumed or when the enclosing
/// invocation ends, whichever comes first. `start_time` is stamped before
/// the request leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRecord {
    pub scheme: String,
    pub host: String,
    pub method: String,
    pub status: u16,
    pub status_text: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub sent_bytes: u64,
    pub received_bytes: u64,
}

// ─── Load / invoke results ──────────────────────────────────────────────

/// Outcome of loading a plugin module into a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResult {
    pub success: bool,
    pub function_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

impl LoadResult {
    pub fn ok(function_names: Vec<String>) -> Self {
        Self {
            success: true,
            function_names,
            error: None,
        }
    }

    pub fn failure(error: ErrorDetails) -> Self {
        Self {
            success: false,
            function_names: Vec::new(),
            error: Some(error),
        }
    }
}

/// Outcome of one invocation: exactly one of `value`/`error` is
/// meaningful, plus the logs and fetch records captured while it ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    #[serde(default)]
    pub logs: Vec<LogRecord>,
    #[serde(default)]
    pub fetches: Vec<FetchRecord>,
}

impl InvokeResult {
    pub fn ok(value: Value) -> Self {
        Self {
            value: Some(value),
            error: None,
            logs: Vec::new(),
            fetches: Vec::new(),
        }
    }

    pub fn failure(error: ErrorDetails) -> Self {
        Self {
            value: None,
            error: Some(error),
            logs: Vec::new(),
            fetches: Vec::new(),
        }
    }

    pub fn aborted() -> Self {
        Self::failure(ErrorDetails::aborted())
    }

    pub fn terminated() -> Self {
        Self::failure(ErrorDetails::terminated())
    }

    pub fn with_telemetry(mut self, logs: Vec<LogRecord>, fetches: Vec<FetchRecord>) -> Self {
        self.logs = logs;
        self.fetches = fetches;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.name.as_str())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
