//! HTTP façade over a [`PluginHost`].
//!
//! Thin by design: handlers map host state and invocation results onto
//! HTTP status codes and a stable JSON body shape. The `X-Timeout`
//! request header arms a caller-side timeout whose expiry fires the
//! invocation's abort signal (and thereby worker replacement).

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use plugdock_host::host::{HostState, InvokeOptions, PluginHost};
use plugdock_host::result::names;
use plugdock_host::{ErrorDetails, FetchRecord, LogRecord, INVOCATION_ID_HEADER};

/// Caller-side timeout header, in integer milliseconds.
pub const TIMEOUT_HEADER: &str = "X-Timeout";

pub fn router(host: PluginHost) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/invoke/{func}", post(invoke))
        .layer(TraceLayer::new_for_http())
        .with_state(host)
}

// ─── /status ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    module: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_usage: Option<u64>,
}

async fn status(State(host): State<PluginHost>) -> (StatusCode, Json<StatusBody>) {
    let module = host.module().to_string();
    match host.state() {
        HostState::Ready => (
            StatusCode::OK,
            Json(StatusBody {
                module,
                status: "OK",
                error: None,
                function_names: host.function_names(),
                memory_usage: current_rss_bytes(),
            }),
        ),
        HostState::Failed => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(StatusBody {
                module,
                status: "LoadFailed",
                error: host.load_error(),
                function_names: None,
                memory_usage: None,
            }),
        ),
        _ => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(StatusBody {
                module,
                status: "Loading",
                error: None,
                function_names: None,
                memory_usage: None,
            }),
        ),
    }
}

/// Resident set size of this process, when the platform exposes it.
fn current_rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(rss_pages * 4096)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

// ─── /invoke/:func ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InvokeBody {
    module: String,
    function_name: String,
    status: &'static str,
    result: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorDetails>,
    logs: Vec<LogRecord>,
    fetches: Vec<FetchRecord>,
}

fn plain_reply(
    code: StatusCode,
    module: String,
    function_name: String,
    status: &'static str,
    error: Option<ErrorDetails>,
) -> (StatusCode, Json<InvokeBody>) {
    (
        code,
        Json(InvokeBody {
            module,
            function_name,
            status,
            result: serde_json::Value::Null,
            error,
            logs: Vec::new(),
            fetches: Vec::new(),
        }),
    )
}

async fn invoke(
    State(host): State<PluginHost>,
    Path(func): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<InvokeBody>) {
    let module = host.module().to_string();

    if host.state() != HostState::Ready {
        return plain_reply(
            StatusCode::SERVICE_UNAVAILABLE,
            module,
            func,
            "Unavailable",
            None,
        );
    }

    // An empty body invokes with a null argument; anything else must be
    // valid JSON.
    let argument = if body.is_empty() {
        serde_json::Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(e) => {
                return plain_reply(
                    StatusCode::BAD_REQUEST,
                    module,
                    func,
                    "InvalidArgument",
                    Some(ErrorDetails::new(
                        "SyntaxError",
                        format!("invalid JSON argument: {e}"),
                    )),
                );
            }
        }
    };

    let timeout_ms = match headers.get(TIMEOUT_HEADER) {
        None => None,
        Some(value) => match value.to_str().ok().and_then(|v| v.parse::<u64>().ok()) {
            Some(ms) => Some(ms),
            None => {
                return plain_reply(
                    StatusCode::BAD_REQUEST,
                    module,
                    func,
                    "InvalidArgument",
                    Some(ErrorDetails::new(
                        "SyntaxError",
                        format!("{TIMEOUT_HEADER} must be an integer millisecond count"),
                    )),
                );
            }
        },
    };

    let invocation_id = headers
        .get(INVOCATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut timeout_task = None;
    let abort = timeout_ms.map(|ms| {
        let token = CancellationToken::new();
        let armed = token.clone();
        timeout_task = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            armed.cancel();
        }));
        token
    });

    let outcome = host
        .invoke(
            &func,
            argument,
            InvokeOptions {
                invocation_id,
                abort,
            },
        )
        .await;

    if let Some(task) = timeout_task {
        task.abort();
    }

    let result = match outcome {
        Ok(result) => result,
        Err(plugdock_host::HostError::NotReady(_)) => {
            return plain_reply(
                StatusCode::SERVICE_UNAVAILABLE,
                module,
                func,
                "Unavailable",
                None,
            );
        }
        Err(e) => {
            tracing::error!(function = %func, "invoke failed: {e}");
            return plain_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                module,
                func,
                "InternalError",
                Some(ErrorDetails::internal(e.to_string())),
            );
        }
    };

    let (code, status) = match result.error.as_ref().map(|e| e.name.as_str()) {
        None => (StatusCode::OK, "OK"),
        Some(names::NOT_FOUND_ERROR) => (StatusCode::NOT_FOUND, "NotFound"),
        Some(names::TERMINATE_ERROR) | Some(names::INTERNAL_ERROR) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "InternalError")
        }
        Some(_) => (StatusCode::INTERNAL_SERVER_ERROR, "RuntimeError"),
    };

    (
        code,
        Json(InvokeBody {
            module,
            function_name: func,
            status,
            result: result.value.unwrap_or(serde_json::Value::Null),
            error: result.error,
            logs: result.logs,
            fetches: result.fetches,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_rss_on_linux() {
        #[cfg(target_os = "linux")]
        assert!(current_rss_bytes().is_some());
        #[cfg(not(target_os = "linux"))]
        assert!(current_rss_bytes().is_none());
    }

    #[test]
    fn test_invoke_body_serialization() {
        let body = InvokeBody {
            module: "file:///p.wasm".into(),
            function_name: "up".into(),
            status: "OK",
            result: serde_json::json!("STR"),
            error: None,
            logs: Vec::new(),
            fetches: Vec::new(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["functionName"], "up");
        assert_eq!(json["status"], "OK");
        assert_eq!(json["result"], "STR");
        assert!(json.get("error").is_none());
    }
}
