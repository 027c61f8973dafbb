//! Worker-wide log buffer.
//!
//! Plugin log calls append here and are also forwarded to the process
//! tracing subscriber. The worker runtime drains the buffer atomically
//! between invocations, so each `InvokeResult` carries the lines emitted
//! while its sandbox was open.

use std::sync::Mutex;

use crate::result::LogRecord;

/// Maximum log message length accepted from plugins.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

/// Sanitize a log message from a plugin.
///
/// Strips control characters (except newline/tab), truncates to max length.
fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.len() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

/// Append-only buffer of plugin log records.
#[derive(Debug, Default)]
pub struct LogBuffer {
    records: Mutex<Vec<LogRecord>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record and forward it to the tracing subscriber.
    pub fn append(&self, logger_name: &str, level: &str, message: &str) {
        let message = sanitize_log_message(message);
        match level.to_ascii_lowercase().as_str() {
            "error" => tracing::error!(logger = %logger_name, "{message}"),
            "warn" | "warning" => tracing::warn!(logger = %logger_name, "{message}"),
            "debug" => tracing::debug!(logger = %logger_name, "{message}"),
            "trace" => tracing::trace!(logger = %logger_name, "{message}"),
            _ => tracing::info!(logger = %logger_name, "{message}"),
        }
        let mut records = self.records.lock().unwrap();
        records.push(LogRecord {
            logger_name: logger_name.to_string(),
            level: level.to_string(),
            message,
        });
    }

    /// Return all buffered records and clear the buffer.
    pub fn drain(&self) -> Vec<LogRecord> {
        std::mem::take(&mut *self.records.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
