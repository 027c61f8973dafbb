//! HTTP façade integration tests: status/invoke mapping, invalid
//! arguments, and the X-Timeout caller-side timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use plugdock_host::host::{HostConfig, PluginHost};
use plugdock_host::result::names;
use plugdock_host::{ErrorDetails, NativeEngine, NativeModule, PluginDescriptor};
use plugdock_server::api;

fn demo_engine() -> Arc<NativeEngine> {
    let engine = NativeEngine::new();
    engine.register("mem://demo", || {
        Ok(NativeModule::new()
            .function("up", |arg, _| match arg.as_str() {
                Some(s) => Ok(Value::String(s.to_uppercase())),
                None => Err(ErrorDetails::new(
                    names::TYPE_ERROR,
                    "argument is not a string",
                )),
            })
            .function("wait", |arg, ctx| {
                let delay_ms = arg.as_u64().unwrap_or(0);
                let started = ctx.dispatch("timer.start", json!({ "delayMs": delay_ms }))?;
                ctx.dispatch("timer.wait", json!({ "id": started["id"] }))?;
                Ok(arg)
            })
            .function("logline", |_, ctx| {
                ctx.log("default", "info", "plugin says hi");
                Ok(Value::Null)
            }))
    });
    engine.register("mem://broken", || {
        Err(ErrorDetails::new("Error", "exploded at import time"))
    });
    Arc::new(engine)
}

fn fast_config() -> HostConfig {
    HostConfig {
        reload_delay: Duration::from_millis(20),
        ..HostConfig::default()
    }
}

async fn serve(module: &str) -> (SocketAddr, PluginHost) {
    let host = PluginHost::launch(
        PluginDescriptor::new(module),
        demo_engine(),
        fast_config(),
    );
    host.ensure_loaded().await;

    let app = api::router(host.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, host)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_status_ok() {
    let (addr, host) = serve("mem://demo").await;
    let resp = reqwest::get(format!("http://{addr}/status")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "OK");
    assert_eq!(body["module"], "mem://demo");
    let functions = body["functionNames"].as_array().unwrap();
    assert!(functions.iter().any(|f| f == "up"));
    host.terminate();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_status_load_failed() {
    let (addr, host) = serve("mem://broken").await;
    let resp = reqwest::get(format!("http://{addr}/status")).await.unwrap();
    assert_eq!(resp.status(), 500);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "LoadFailed");
    assert_eq!(body["error"]["message"], "exploded at import time");
    host.terminate();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invoke_ok() {
    let (addr, host) = serve("mem://demo").await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/invoke/up"))
        .body("\"str\"")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "OK");
    assert_eq!(body["functionName"], "up");
    assert_eq!(body["result"], "STR");
    host.terminate();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invoke_runtime_error() {
    let (addr, host) = serve("mem://demo").await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/invoke/up"))
        .body(r#"{"unexpected":"type"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "RuntimeError");
    assert_eq!(body["error"]["name"], "TypeError");
    host.terminate();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invoke_unknown_function_is_404() {
    let (addr, host) = serve("mem://demo").await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/invoke/missing"))
        .body("null")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "NotFound");
    assert_eq!(body["error"]["name"], "NotFoundError");
    host.terminate();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invoke_invalid_json_is_400() {
    let (addr, host) = serve("mem://demo").await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/invoke/up"))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "InvalidArgument");
    host.terminate();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invoke_empty_body_is_null_argument() {
    let (addr, host) = serve("mem://demo").await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/invoke/logline"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["logs"][0]["message"], "plugin says hi");
    assert_eq!(body["logs"][0]["loggerName"], "default");
    host.terminate();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_x_timeout_aborts_invocation() {
    let (addr, host) = serve("mem://demo").await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/invoke/wait"))
        .header(api::TIMEOUT_HEADER, "20")
        .body("10000")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "RuntimeError");
    assert_eq!(body["error"]["name"], "AbortError");
    assert_eq!(body["error"]["message"], "Invocation was aborted");

    // The replaced worker serves the next call.
    let resp = client
        .post(format!("http://{addr}/invoke/up"))
        .body("\"a\"")
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"], "A");
    host.terminate();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_x_timeout_is_400() {
    let (addr, host) = serve("mem://demo").await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/invoke/up"))
        .header(api::TIMEOUT_HEADER, "soon")
        .body("\"a\"")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    host.terminate();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_terminated_host_is_unavailable() {
    let (addr, host) = serve("mem://demo").await;
    host.terminate();

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/invoke/up"))
        .body("\"a\"")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "Unavailable");
}
