//! Worker runtime.
//!
//! A worker is a task holding exactly one loaded plugin instance. It
//! receives load/invoke messages from its host, runs plugin code on
//! blocking threads inside a fresh sandbox per invocation, buffers the
//! logs emitted meanwhile, and posts correlated results back. A worker
//! is owned by exactly one host and never rejoins the pool once the host
//! terminates it.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::descriptor::PluginDescriptor;
use crate::engine::{ModuleEngine, ModuleInstance};
use crate::error::{HostError, SandboxError};
use crate::logbuf::LogBuffer;
use crate::protocol::{HostReceiver, HostSender, HostToWorker, WorkerSender, WorkerToHost};
use crate::result::{names, ErrorDetails, InvokeResult, LoadResult};
use crate::sandbox::{ContextSlot, InvocationContext, SandboxConfig};

// ─── Worker identity and handle ─────────────────────────────────────────

/// Identifier of one worker replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(Uuid);

impl WorkerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The host's grip on one spawned worker.
pub struct WorkerHandle {
    id: WorkerId,
    tx: HostSender,
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Post a protocol message to the worker.
    pub fn post(&self, msg: HostToWorker) -> Result<(), HostError> {
        self.tx.send(msg).map_err(|_| HostError::ChannelClosed)
    }

    /// Whether the worker task has stopped receiving messages.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Kill the worker unilaterally. It cannot rejoin the pool. The
    /// worker-level cancel signal propagates into any active context, so
    /// plugin code blocked on a capability call unwinds promptly.
    pub fn terminate(&self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// Spawn a fresh worker. Replies flow out on `outbound`; the first reply
/// is always the `LoadResult`.
pub fn spawn(
    engine: Arc<dyn ModuleEngine>,
    sandbox: SandboxConfig,
    outbound: WorkerSender,
) -> WorkerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = WorkerId::new();
    let http = sandbox.build_http_client();
    let cancel = CancellationToken::new();
    let worker = Worker {
        id,
        engine,
        sandbox,
        http,
        cancel: cancel.clone(),
        surface: ContextSlot::new(),
        log: Arc::new(LogBuffer::new()),
        instance: None,
        plugin: None,
        outbound,
    };
    let task = tokio::spawn(worker.run(rx));
    WorkerHandle {
        id,
        tx,
        task,
        cancel,
    }
}

// ─── Worker task ────────────────────────────────────────────────────────

struct Worker {
    id: WorkerId,
    engine: Arc<dyn ModuleEngine>,
    sandbox: SandboxConfig,
    http: reqwest::Client,
    cancel: CancellationToken,
    surface: ContextSlot,
    log: Arc<LogBuffer>,
    instance: Option<Box<dyn ModuleInstance>>,
    plugin: Option<Arc<PluginDescriptor>>,
    outbound: WorkerSender,
}

impl Worker {
    async fn run(mut self, mut rx: HostReceiver) {
        while let Some(msg) = rx.recv().await {
            match msg {
                HostToWorker::Load { plugin } => {
                    let result = self.load(plugin).await;
                    if self.outbound.send(WorkerToHost::Load(result)).is_err() {
                        break;
                    }
                }
                HostToWorker::Invoke {
                    token,
                    invocation_id,
                    function,
                    argument,
                } => {
                    let (result, fatal) = self.invoke(invocation_id, function, argument).await;
                    let sent = self
                        .outbound
                        .send(WorkerToHost::Invoke { token, result })
                        .is_ok();
                    if fatal || !sent {
                        break;
                    }
                }
            }
        }
        tracing::debug!(worker = %self.id, "worker task exited");
    }

    fn open_context(
        &self,
        call_id: String,
        plugin: &PluginDescriptor,
    ) -> Result<(), SandboxError> {
        let ctx = InvocationContext::with_cancel(
            call_id,
            plugin.globals.clone(),
            self.log.clone(),
            &self.sandbox,
            self.http.clone(),
            self.cancel.child_token(),
        )?;
        self.surface.activate(Arc::new(ctx))
    }

    /// Load the plugin module once; module top-level code runs under the
    /// same sandbox policies as invocations.
    async fn load(&mut self, plugin: Arc<PluginDescriptor>) -> LoadResult {
        if self.instance.is_some() {
            return LoadResult::failure(ErrorDetails::new(
                names::LOAD_ERROR,
                "plugin is already loaded",
            ));
        }
        if let Err(e) = self.open_context(String::new(), &plugin) {
            return LoadResult::failure(e.into());
        }

        let engine = self.engine.clone();
        let module = plugin.module.clone();
        let surface = self.surface.clone();
        let loaded = tokio::task::spawn_blocking(move || engine.load(&module, &surface)).await;

        let _ = self.surface.close();
        // Module top-level logs belong to no invocation.
        self.log.drain();

        match loaded {
            Ok(Ok(instance)) => {
                let function_names = instance.function_names();
                tracing::debug!(
                    worker = %self.id,
                    module = %plugin.module,
                    functions = ?function_names,
                    "module loaded"
                );
                self.instance = Some(instance);
                self.plugin = Some(plugin);
                LoadResult::ok(function_names)
            }
            Ok(Err(error)) => LoadResult::failure(error),
            Err(e) => LoadResult::failure(ErrorDetails::internal(format!(
                "module load panicked: {e}"
            ))),
        }
    }

    /// Run one invocation inside a fresh sandbox. The second element of
    /// the return marks the worker as unusable (the host recycles it).
    async fn invoke(
        &mut self,
        invocation_id: Option<String>,
        function: String,
        argument: Value,
    ) -> (InvokeResult, bool) {
        let Some(plugin) = self.plugin.clone() else {
            return (InvokeResult::failure(ErrorDetails::not_loaded()), false);
        };
        let known = self
            .instance
            .as_ref()
            .map(|i| i.function_names().iter().any(|n| n == &function))
            .unwrap_or(false);
        if !known {
            return (
                InvokeResult::failure(ErrorDetails::not_found(&function)),
                false,
            );
        }

        if let Err(e) = self.open_context(invocation_id.unwrap_or_default(), &plugin) {
            return (InvokeResult::failure(e.into()), false);
        }

        let Some(mut instance) = self.instance.take() else {
            let _ = self.surface.close();
            return (InvokeResult::failure(ErrorDetails::not_loaded()), false);
        };
        let outcome = tokio::task::spawn_blocking(move || {
            let result = instance.call(&function, argument);
            (instance, result)
        })
        .await;

        // Close unconditionally, then drain the log buffer atomically.
        let fetches = self.surface.close().unwrap_or_default();
        let logs = self.log.drain();

        match outcome {
            Ok((instance, result)) => {
                self.instance = Some(instance);
                let result = match result {
                    Ok(value) => InvokeResult::ok(value),
                    Err(error) => InvokeResult::failure(error),
                };
                (result.with_telemetry(logs, fetches), false)
            }
            Err(e) => {
                tracing::error!(worker = %self.id, "plugin call panicked: {e}");
                let result = InvokeResult::failure(ErrorDetails::internal(format!(
                    "plugin call panicked: {e}"
                )))
                .with_telemetry(logs, fetches);
                (result, true)
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{NativeEngine, NativeModule};
    use crate::protocol::WorkerReceiver;

    fn echo_engine() -> Arc<NativeEngine> {
        let engine = NativeEngine::new();
        engine.register("mem://echo", || {
            Ok(NativeModule::new()
                .function("up", |arg, _| match arg.as_str() {
                    Some(s) => Ok(Value::String(s.to_uppercase())),
                    None => Err(ErrorDetails::new(
                        names::TYPE_ERROR,
                        "argument is not a string",
                    )),
                })
                .function("shout", |arg, ctx| {
                    ctx.log("default", "info", "shouting");
                    Ok(arg)
                }))
        });
        Arc::new(engine)
    }

    fn start_worker(engine: Arc<NativeEngine>) -> (WorkerHandle, WorkerReceiver) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let handle = spawn(engine, SandboxConfig::default(), out_tx);
        (handle, out_rx)
    }

    async fn load(
        handle: &WorkerHandle,
        rx: &mut WorkerReceiver,
        module: &str,
    ) -> LoadResult {
        handle
            .post(HostToWorker::Load {
                plugin: Arc::new(PluginDescriptor::new(module)),
            })
            .unwrap();
        match rx.recv().await.unwrap() {
            WorkerToHost::Load(result) => result,
            other => panic!("expected load result, got {other:?}"),
        }
    }

    async fn invoke(
        handle: &WorkerHandle,
        rx: &mut WorkerReceiver,
        function: &str,
        argument: Value,
    ) -> InvokeResult {
        let token = Uuid::new_v4();
        handle
            .post(HostToWorker::Invoke {
                token,
                invocation_id: None,
                function: function.to_string(),
                argument,
            })
            .unwrap();
        match rx.recv().await.unwrap() {
            WorkerToHost::Invoke { token: t, result } => {
                assert_eq!(t, token);
                result
            }
            other => panic!("expected invoke result, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_load_reports_function_names() {
        let (handle, mut rx) = start_worker(echo_engine());
        let result = load(&handle, &mut rx, "mem://echo").await;
        assert!(result.success);
        assert_eq!(result.function_names, vec!["shout", "up"]);
        handle.terminate();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_load_fails() {
        let (handle, mut rx) = start_worker(echo_engine());
        assert!(load(&handle, &mut rx, "mem://echo").await.success);

        let result = load(&handle, &mut rx, "mem://echo").await;
        assert!(!result.success);
        assert_eq!(
            result.error.unwrap().message,
            "plugin is already loaded"
        );
        handle.terminate();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invoke_before_load_fails() {
        let (handle, mut rx) = start_worker(echo_engine());
        let result = invoke(&handle, &mut rx, "up", Value::String("a".into())).await;
        assert_eq!(result.error_name(), Some(names::LOAD_ERROR));
        handle.terminate();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invoke_unknown_function() {
        let (handle, mut rx) = start_worker(echo_engine());
        load(&handle, &mut rx, "mem://echo").await;
        let result = invoke(&handle, &mut rx, "missing", Value::Null).await;
        let error = result.error.unwrap();
        assert_eq!(error.name, names::NOT_FOUND_ERROR);
        assert_eq!(error.message, "function \"missing\" is not found");
        handle.terminate();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invoke_echo() {
        let (handle, mut rx) = start_worker(echo_engine());
        load(&handle, &mut rx, "mem://echo").await;
        let result = invoke(&handle, &mut rx, "up", Value::String("str".into())).await;
        assert_eq!(result.value, Some(Value::String("STR".into())));
        assert!(result.logs.is_empty());
        handle.terminate();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invoke_type_error() {
        let (handle, mut rx) = start_worker(echo_engine());
        load(&handle, &mut rx, "mem://echo").await;
        let result = invoke(
            &handle,
            &mut rx,
            "up",
            serde_json::json!({ "unexpected": "type" }),
        )
        .await;
        assert_eq!(result.error_name(), Some(names::TYPE_ERROR));
        handle.terminate();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_logs_are_per_invocation() {
        let (handle, mut rx) = start_worker(echo_engine());
        load(&handle, &mut rx, "mem://echo").await;

        let result = invoke(&handle, &mut rx, "shout", Value::Null).await;
        assert_eq!(result.logs.len(), 1);
        assert_eq!(result.logs[0].message, "shouting");

        // The buffer was drained; a quiet invocation sees no leftovers.
        let result = invoke(&handle, &mut rx, "up", Value::String("a".into())).await;
        assert!(result.logs.is_empty());
        handle.terminate();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_globals_reach_plugin() {
        let engine = NativeEngine::new();
        engine.register("mem://globals", || {
            Ok(NativeModule::new().function("useGlobal", |arg, ctx| {
                let prefix = arg.as_str().unwrap_or_default();
                let value = ctx.global("MY_KEY").cloned().unwrap_or(Value::Null);
                Ok(Value::String(format!("{prefix}: {value}")))
            }))
        });

        let (out_tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn(Arc::new(engine), SandboxConfig::default(), out_tx);
        handle
            .post(HostToWorker::Load {
                plugin: Arc::new(
                    PluginDescriptor::new("mem://globals")
                        .with_global("MY_KEY", serde_json::json!(12345)),
                ),
            })
            .unwrap();
        match rx.recv().await.unwrap() {
            WorkerToHost::Load(result) => assert!(result.success),
            other => panic!("unexpected {other:?}"),
        }

        let result = invoke(&handle, &mut rx, "useGlobal", Value::String("test".into())).await;
        assert_eq!(result.value, Some(Value::String("test: 12345".into())));
        handle.terminate();
    }
}
