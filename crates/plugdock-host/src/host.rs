//! PluginHost — worker pool, state machine, and invocation registry.
//!
//! The host owns N replica workers, each holding an independently loaded
//! copy of the plugin module. Invocations reserve an idle worker (or
//! queue as waiters), travel to the worker as correlated protocol
//! messages, and resolve through a registry of completion signals. A
//! maintenance loop keeps the pool at size, rebuilding workers after
//! crashes and aborts with a reload delay and a consecutive-failure
//! ceiling.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::descriptor::PluginDescriptor;
use crate::engine::ModuleEngine;
use crate::error::HostError;
use crate::protocol::{HostToWorker, WorkerReceiver, WorkerToHost};
use crate::result::{ErrorDetails, InvokeResult, LoadResult};
use crate::sandbox::SandboxConfig;
use crate::worker::{self, WorkerHandle, WorkerId};

// ─── Constants ──────────────────────────────────────────────────────────

/// Consecutive load failures tolerated before the host gives up.
pub const MAX_LOAD_FAILURES: u32 = 3;

/// Delay before rebuilding workers while some replicas are still alive.
pub const RELOAD_DELAY: Duration = Duration::from_secs(30);

// ─── State machine ──────────────────────────────────────────────────────

/// Host lifecycle state. Transitions are monotonic except that a ready
/// host whose workers all die and cannot be rebuilt becomes failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    Loading,
    Ready,
    Failed,
    Closing,
    Closed,
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loading => write!(f, "loading"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

// ─── Configuration and options ──────────────────────────────────────────

/// Tunables for one host. Defaults match production behavior; tests
/// shrink the reload delay.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub max_load_failures: u32,
    pub reload_delay: Duration,
    pub sandbox: SandboxConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_load_failures: MAX_LOAD_FAILURES,
            reload_delay: RELOAD_DELAY,
            sandbox: SandboxConfig::default(),
        }
    }
}

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Caller-supplied tracing id, propagated into outbound HTTP.
    pub invocation_id: Option<String>,
    /// Caller-side cancellation; firing it completes the invocation with
    /// `AbortError` and recycles the assigned worker.
    pub abort: Option<CancellationToken>,
}

/// Snapshot of host state for status surfaces.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    pub module: String,
    pub state: HostState,
    pub workers: usize,
    pub invocations: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_error: Option<ErrorDetails>,
}

// ─── Host ───────────────────────────────────────────────────────────────

struct PendingInvocation {
    tx: oneshot::Sender<InvokeResult>,
    worker: Option<WorkerId>,
}

#[derive(Default)]
struct Pool {
    workers: HashMap<WorkerId, WorkerHandle>,
    /// Ready workers not serving an invocation. FIFO, so sequential load
    /// cycles through the replicas instead of pinning one.
    idle: VecDeque<WorkerId>,
    /// Invocations awaiting a worker, FIFO.
    waiters: VecDeque<oneshot::Sender<WorkerId>>,
}

struct HostInner {
    plugin: Arc<PluginDescriptor>,
    engine: Arc<dyn ModuleEngine>,
    config: HostConfig,
    state: watch::Sender<HostState>,
    pool: Mutex<Pool>,
    registry: Mutex<HashMap<Uuid, PendingInvocation>>,
    last_success: Mutex<Option<LoadResult>>,
    last_failure: Mutex<Option<LoadResult>>,
    invocations: AtomicU64,
    reload: Notify,
    drained: Notify,
    shutdown: CancellationToken,
}

/// A pool of sandboxed workers serving invocations of one plugin.
#[derive(Clone)]
pub struct PluginHost {
    inner: Arc<HostInner>,
}

impl PluginHost {
    /// Create the host and start its pool maintenance loop.
    pub fn launch(
        plugin: PluginDescriptor,
        engine: Arc<dyn ModuleEngine>,
        config: HostConfig,
    ) -> Self {
        let (state, _) = watch::channel(HostState::Loading);
        let inner = Arc::new(HostInner {
            plugin: Arc::new(plugin),
            engine,
            config,
            state,
            pool: Mutex::new(Pool::default()),
            registry: Mutex::new(HashMap::new()),
            last_success: Mutex::new(None),
            last_failure: Mutex::new(None),
            invocations: AtomicU64::new(0),
            reload: Notify::new(),
            drained: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(run_pool(inner.clone()));
        Self { inner }
    }

    pub fn state(&self) -> HostState {
        *self.inner.state.borrow()
    }

    pub fn module(&self) -> &str {
        &self.inner.plugin.module
    }

    pub fn worker_count(&self) -> usize {
        self.inner.pool.lock().unwrap().workers.len()
    }

    pub fn invocation_count(&self) -> u64 {
        self.inner.invocations.load(Ordering::Relaxed)
    }

    /// Exports discovered by the most recent successful load.
    pub fn function_names(&self) -> Option<Vec<String>> {
        self.inner
            .last_success
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.function_names.clone())
    }

    /// Error from the most recent failed load.
    pub fn load_error(&self) -> Option<ErrorDetails> {
        self.inner
            .last_failure
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|r| r.error.clone())
    }

    pub fn status(&self) -> HostStatus {
        HostStatus {
            module: self.inner.plugin.module.clone(),
            state: self.state(),
            workers: self.worker_count(),
            invocations: self.invocation_count(),
            function_names: self.function_names(),
            load_error: self.load_error(),
        }
    }

    /// Resolve once the host first leaves `loading` (to ready or failed).
    pub async fn ensure_loaded(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s != HostState::Loading).await;
    }

    /// Invoke a named export with a JSON argument on some pool worker.
    ///
    /// Rejects when the host is not ready; anything that goes wrong
    /// inside the invocation resolves as an `InvokeResult` with error
    /// details instead.
    pub async fn invoke(
        &self,
        function: &str,
        argument: Value,
        opts: InvokeOptions,
    ) -> Result<InvokeResult, HostError> {
        let state = self.state();
        if state != HostState::Ready {
            return Err(HostError::NotReady(state));
        }

        let token = Uuid::new_v4();
        let (tx, mut rx) = oneshot::channel();
        self.inner
            .registry
            .lock()
            .unwrap()
            .insert(token, PendingInvocation { tx, worker: None });
        self.inner.invocations.fetch_add(1, Ordering::Relaxed);

        // The host may have been terminated between the state check and
        // the registration; synthesize the completion ourselves then.
        let reserved = if self.state() == HostState::Closed {
            self.inner.complete(token, InvokeResult::terminated());
            None
        } else {
            self.reserve_worker(opts.abort.clone()).await
        };
        match reserved {
            Some(worker) => {
                if let Some(entry) = self.inner.registry.lock().unwrap().get_mut(&token) {
                    entry.worker = Some(worker);
                }
                let posted = {
                    let pool = self.inner.pool.lock().unwrap();
                    match pool.workers.get(&worker) {
                        Some(handle) => handle
                            .post(HostToWorker::Invoke {
                                token,
                                invocation_id: opts.invocation_id.clone(),
                                function: function.to_string(),
                                argument,
                            })
                            .is_ok(),
                        None => false,
                    }
                };
                if !posted {
                    self.inner.complete(
                        token,
                        InvokeResult::failure(ErrorDetails::internal("worker channel closed")),
                    );
                    self.inner.worker_failed(worker);
                }
            }
            None => {
                // The caller aborted while waiting, or the host went away.
                self.inner.complete(token, InvokeResult::aborted());
            }
        }

        let dropped =
            || InvokeResult::failure(ErrorDetails::internal("invocation completion dropped"));
        let result = match opts.abort.clone() {
            Some(abort) => {
                tokio::select! {
                    res = &mut rx => res.unwrap_or_else(|_| dropped()),
                    _ = abort.cancelled() => {
                        // Authoritative: the abort wins regardless of any
                        // later worker reply.
                        self.inner.complete(token, InvokeResult::aborted());
                        rx.await.unwrap_or_else(|_| dropped())
                    }
                }
            }
            None => rx.await.unwrap_or_else(|_| dropped()),
        };

        if let Some(worker) = reserved {
            let aborted = opts
                .abort
                .as_ref()
                .map(|t| t.is_cancelled())
                .unwrap_or(false);
            if aborted {
                // Leaked async work in the worker must not observe a
                // future invocation; discard the replica entirely.
                tracing::warn!(worker = %worker, "invocation aborted, recycling worker");
                self.inner.worker_failed(worker);
            } else {
                self.inner.worker_ready(worker);
            }
        }

        Ok(result)
    }

    /// Reserve an idle worker, or queue as a waiter until one frees up.
    async fn reserve_worker(&self, abort: Option<CancellationToken>) -> Option<WorkerId> {
        let mut rx = {
            let mut pool = self.inner.pool.lock().unwrap();
            let mut stale = false;
            let mut reserved = None;
            while let Some(id) = pool.idle.pop_front() {
                let alive = pool.workers.get(&id).map(|h| !h.is_closed()).unwrap_or(false);
                if alive {
                    reserved = Some(id);
                    break;
                }
                if let Some(handle) = pool.workers.remove(&id) {
                    handle.terminate();
                }
                stale = true;
            }
            if stale {
                self.inner.reload.notify_one();
            }
            if let Some(id) = reserved {
                return Some(id);
            }
            // Checked under the pool lock so a concurrent shutdown either
            // sees this waiter (and clears it) or is already visible here.
            if *self.inner.state.borrow() != HostState::Ready {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            pool.waiters.push_back(tx);
            rx
        };

        let aborted = async {
            match abort {
                Some(token) => token.cancelled_owned().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            res = &mut rx => res.ok(),
            _ = aborted => {
                // A worker may have been assigned in the same instant the
                // caller gave up; hand it back so it is not lost.
                match rx.try_recv() {
                    Ok(id) => {
                        self.inner.worker_ready(id);
                        None
                    }
                    Err(_) => None,
                }
            }
        }
    }

    /// Graceful shutdown: stop accepting work, wait for every registered
    /// invocation to complete, then terminate.
    ///
    /// Idempotent once closed; a second call *during* closing fails fast.
    pub async fn shutdown(&self) -> Result<(), HostError> {
        let mut prior = HostState::Closed;
        self.inner.state.send_if_modified(|s| {
            prior = *s;
            if matches!(s, HostState::Loading | HostState::Ready | HostState::Failed) {
                *s = HostState::Closing;
                true
            } else {
                false
            }
        });
        match prior {
            HostState::Closed => return Ok(()),
            HostState::Closing => return Err(HostError::AlreadyClosing),
            _ => {}
        }

        tracing::info!(module = %self.inner.plugin.module, "host shutting down");
        self.inner.shutdown.cancel();

        // Reservations starved by shutdown are released as aborted
        // invocations rather than waiting for workers that will never come.
        self.inner.pool.lock().unwrap().waiters.clear();

        loop {
            let mut notified = std::pin::pin!(self.inner.drained.notified());
            notified.as_mut().enable();
            if self.inner.registry.lock().unwrap().is_empty() {
                break;
            }
            notified.await;
        }

        self.terminate();
        Ok(())
    }

    /// Hard stop: complete every registered invocation with
    /// `TerminateError`, kill every worker, drop idle and waiter queues.
    /// Idempotent.
    pub fn terminate(&self) {
        let mut prior = HostState::Closed;
        self.inner.state.send_if_modified(|s| {
            prior = *s;
            if *s == HostState::Closed {
                false
            } else {
                *s = HostState::Closed;
                true
            }
        });
        if prior == HostState::Closed {
            return;
        }

        self.inner.shutdown.cancel();

        let pending: Vec<PendingInvocation> = {
            let mut registry = self.inner.registry.lock().unwrap();
            registry.drain().map(|(_, entry)| entry).collect()
        };
        for entry in pending {
            let _ = entry.tx.send(InvokeResult::terminated());
        }

        let handles: Vec<WorkerHandle> = {
            let mut pool = self.inner.pool.lock().unwrap();
            pool.idle.clear();
            pool.waiters.clear();
            pool.workers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.terminate();
        }

        self.inner.drained.notify_waiters();
        tracing::info!(module = %self.inner.plugin.module, "host terminated");
    }
}

impl HostInner {
    fn running(&self) -> bool {
        matches!(*self.state.borrow(), HostState::Loading | HostState::Ready)
    }

    /// Resolve an invocation's completion signal. First completion wins;
    /// late worker replies for an already-completed token are dropped.
    fn complete(&self, token: Uuid, result: InvokeResult) {
        let entry = self.registry.lock().unwrap().remove(&token);
        if let Some(entry) = entry {
            let _ = entry.tx.send(result);
        }
        if *self.state.borrow() == HostState::Closing
            && self.registry.lock().unwrap().is_empty()
        {
            self.drained.notify_waiters();
        }
    }

    /// Hand a worker to the next waiter or push it onto the idle queue.
    fn worker_ready(&self, id: WorkerId) {
        let state = *self.state.borrow();
        let mut pool = self.pool.lock().unwrap();
        if !pool.workers.contains_key(&id) {
            return;
        }
        // A worker whose task already exited must not re-enter rotation.
        let closed = pool.workers.get(&id).map(|h| h.is_closed()).unwrap_or(true);
        if closed {
            if let Some(handle) = pool.workers.remove(&id) {
                handle.terminate();
            }
            drop(pool);
            self.reload.notify_one();
            return;
        }
        if !matches!(state, HostState::Loading | HostState::Ready) {
            if let Some(handle) = pool.workers.remove(&id) {
                handle.terminate();
            }
            return;
        }
        let mut id = id;
        while let Some(waiter) = pool.waiters.pop_front() {
            match waiter.send(id) {
                Ok(()) => return,
                // The waiter abandoned its reservation; try the next one.
                Err(returned) => id = returned,
            }
        }
        pool.idle.push_back(id);
    }

    /// Terminate a worker and signal the reload loop to build a
    /// replacement.
    fn worker_failed(&self, id: WorkerId) {
        let handle = {
            let mut pool = self.pool.lock().unwrap();
            pool.idle.retain(|w| *w != id);
            pool.workers.remove(&id)
        };
        if let Some(handle) = handle {
            handle.terminate();
            tracing::warn!(worker = %id, "worker removed from pool");
        }
        self.reload.notify_one();
    }
}

// ─── Pool maintenance loop ──────────────────────────────────────────────

enum BuildOutcome {
    Added,
    Failed,
    Stopped,
}

async fn run_pool(inner: Arc<HostInner>) {
    let mut failures: u32 = 0;
    loop {
        while inner.running() {
            let live = inner.pool.lock().unwrap().workers.len();
            if live >= inner.plugin.concurrency() {
                break;
            }
            match build_worker(&inner).await {
                BuildOutcome::Added => failures = 0,
                BuildOutcome::Failed => {
                    failures += 1;
                    if failures >= inner.config.max_load_failures {
                        let live = inner.pool.lock().unwrap().workers.len();
                        if live == 0 {
                            tracing::error!(
                                module = %inner.plugin.module,
                                failures,
                                "giving up loading plugin"
                            );
                            // Fires the loaded signal for ensure_loaded.
                            inner.state.send_if_modified(|s| {
                                if matches!(s, HostState::Loading | HostState::Ready) {
                                    *s = HostState::Failed;
                                    true
                                } else {
                                    false
                                }
                            });
                        } else {
                            tracing::warn!(
                                module = %inner.plugin.module,
                                failures,
                                live,
                                "load failure ceiling reached, keeping surviving workers"
                            );
                        }
                        break;
                    }
                }
                BuildOutcome::Stopped => return,
            }
        }

        if !inner.running() {
            break;
        }

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.reload.notified() => {}
        }

        if !inner.running() {
            break;
        }

        // Back off before rebuilding while replicas are still serving;
        // rebuild immediately when the pool is empty.
        if inner.pool.lock().unwrap().workers.len() > 0 {
            tokio::select! {
                _ = tokio::time::sleep(inner.config.reload_delay) => {}
                _ = inner.shutdown.cancelled() => break,
            }
        }
    }
    tracing::debug!(module = %inner.plugin.module, "pool maintenance loop exited");
}

/// Spawn one worker, load the plugin into it, and pool it on success.
async fn build_worker(inner: &Arc<HostInner>) -> BuildOutcome {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let handle = worker::spawn(
        inner.engine.clone(),
        inner.config.sandbox.clone(),
        out_tx,
    );
    let id = handle.id();
    tracing::debug!(worker = %id, module = %inner.plugin.module, "loading plugin into worker");

    if handle
        .post(HostToWorker::Load {
            plugin: inner.plugin.clone(),
        })
        .is_err()
    {
        handle.terminate();
        return BuildOutcome::Failed;
    }

    let load = match out_rx.recv().await {
        Some(WorkerToHost::Load(result)) => result,
        Some(other) => {
            tracing::error!(worker = %id, "protocol violation: {other:?}");
            LoadResult::failure(ErrorDetails::internal("protocol violation during load"))
        }
        None => LoadResult::failure(ErrorDetails::internal("worker exited during load")),
    };

    if !inner.running() {
        handle.terminate();
        return BuildOutcome::Stopped;
    }

    if load.success {
        tracing::info!(
            worker = %id,
            module = %inner.plugin.module,
            functions = ?load.function_names,
            "worker ready"
        );
        *inner.last_success.lock().unwrap() = Some(load);
        inner.pool.lock().unwrap().workers.insert(id, handle);
        tokio::spawn(relay(inner.clone(), id, out_rx));
        inner.worker_ready(id);
        // First successful load flips the host to ready.
        inner.state.send_if_modified(|s| {
            if *s == HostState::Loading {
                *s = HostState::Ready;
                true
            } else {
                false
            }
        });
        BuildOutcome::Added
    } else {
        let message = load
            .error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "unknown load error".to_string());
        tracing::error!(worker = %id, module = %inner.plugin.module, "plugin load failed: {message}");
        *inner.last_failure.lock().unwrap() = Some(load);
        handle.terminate();
        BuildOutcome::Failed
    }
}

/// Pump one worker's replies into the invocation registry. When the
/// worker's channel closes while it is still pooled, its in-flight
/// invocation fails and the reload loop builds a replacement.
async fn relay(inner: Arc<HostInner>, worker: WorkerId, mut rx: WorkerReceiver) {
    while let Some(msg) = rx.recv().await {
        match msg {
            WorkerToHost::Invoke { token, result } => inner.complete(token, result),
            WorkerToHost::Load(_) => {
                tracing::warn!(worker = %worker, "unexpected load result, ignoring");
            }
        }
    }

    // Terminate drains the registry itself; anywhere short of closed, an
    // unexpected exit must fail the worker's in-flight invocation or a
    // closing host would wait on it forever.
    let still_pooled = inner.pool.lock().unwrap().workers.contains_key(&worker);
    if still_pooled && *inner.state.borrow() != HostState::Closed {
        tracing::warn!(worker = %worker, "worker exited unexpectedly");
        let orphaned: Vec<Uuid> = inner
            .registry
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| entry.worker == Some(worker))
            .map(|(token, _)| *token)
            .collect();
        for token in orphaned {
            inner.complete(
                token,
                InvokeResult::failure(ErrorDetails::internal("worker terminated unexpectedly")),
            );
        }
        inner.worker_failed(worker);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
