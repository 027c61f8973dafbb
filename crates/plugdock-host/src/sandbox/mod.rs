//! Per-invocation sandbox.
//!
//! Every capability a plugin can reach on the host is named, and every
//! name carries a policy: pass through, forbid, wrap with
//! instrumentation, or replace with a controlled equivalent. An
//! [`InvocationContext`] is activated in the worker's [`ContextSlot`]
//! before each plugin call and closed afterwards; closing cancels every
//! tracked timer, fires the context's cancel signal (which propagates
//! into in-flight wrapped fetches), and flushes any fetch records whose
//! response body was never fully consumed.

mod fetch;
mod timer;

pub use fetch::{FetchRequest, FetchResponse, INVOCATION_ID_HEADER};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::SandboxError;
use crate::logbuf::LogBuffer;
use crate::result::FetchRecord;

use fetch::FetchLedger;
use timer::TimerTable;

// ─── Capability names ───────────────────────────────────────────────────

/// Named host capabilities visible to plugin code.
pub mod capability {
    // Forbidden by default.
    pub const EVAL: &str = "eval";
    pub const WASM_COMPILE: &str = "wasm.compile";
    pub const MICROTASK: &str = "microtask";
    pub const OS: &str = "os";
    pub const WORKER_CLOSE: &str = "worker.close";
    pub const WORKER_POST_MESSAGE: &str = "worker.post_message";
    pub const WORKER_ON_MESSAGE: &str = "worker.on_message";
    pub const WORKER_ON_ERROR: &str = "worker.on_error";
    pub const NAVIGATOR: &str = "navigator";

    // Wrapped: outbound HTTP with instrumentation.
    pub const FETCH: &str = "fetch";

    // Replaced: timers tracked per context and cancelled on close.
    pub const TIMER_START: &str = "timer.start";
    pub const TIMER_CANCEL: &str = "timer.cancel";
    pub const TIMER_WAIT: &str = "timer.wait";

    // Allowed host utilities.
    pub const LOG: &str = "log";
    pub const GLOBAL_GET: &str = "global.get";
    pub const CLOCK_NOW: &str = "clock.now";
    pub const RANDOM: &str = "random";

    /// Every capability name, in a stable order. Module engines bind a
    /// host function per name; the policy table decides what happens when
    /// one is called.
    pub const ALL: &[&str] = &[
        EVAL,
        WASM_COMPILE,
        MICROTASK,
        OS,
        WORKER_CLOSE,
        WORKER_POST_MESSAGE,
        WORKER_ON_MESSAGE,
        WORKER_ON_ERROR,
        NAVIGATOR,
        FETCH,
        TIMER_START,
        TIMER_CANCEL,
        TIMER_WAIT,
        LOG,
        GLOBAL_GET,
        CLOCK_NOW,
        RANDOM,
    ];
}

// ─── Policy table ───────────────────────────────────────────────────────

/// Policy assigned to one named capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityPolicy {
    /// Pass through unchanged.
    Allow,
    /// Any read or invocation fails with "<name> is not supported".
    Forbid,
    /// Delegated to an instrumented wrapper.
    Wrap,
    /// Substituted with a controlled equivalent.
    Replace,
}

/// The full ambient-surface policy map. Names absent from the table are
/// treated as forbidden.
#[derive(Debug, Clone)]
pub struct CapabilityTable {
    policies: HashMap<String, CapabilityPolicy>,
}

impl CapabilityTable {
    /// The default surface required of every sandbox.
    pub fn defaults() -> Self {
        use capability::*;
        use CapabilityPolicy::*;
        let mut policies = HashMap::new();
        for name in [
            EVAL,
            WASM_COMPILE,
            MICROTASK,
            OS,
            WORKER_CLOSE,
            WORKER_POST_MESSAGE,
            WORKER_ON_MESSAGE,
            WORKER_ON_ERROR,
            NAVIGATOR,
        ] {
            policies.insert(name.to_string(), Forbid);
        }
        policies.insert(FETCH.to_string(), Wrap);
        for name in [TIMER_START, TIMER_CANCEL, TIMER_WAIT] {
            policies.insert(name.to_string(), Replace);
        }
        for name in [LOG, GLOBAL_GET, CLOCK_NOW, RANDOM] {
            policies.insert(name.to_string(), Allow);
        }
        Self { policies }
    }

    /// Override the policy for one capability (embedder hook).
    pub fn set(&mut self, name: impl Into<String>, policy: CapabilityPolicy) {
        self.policies.insert(name.into(), policy);
    }

    /// Policy for `name`; unknown names are forbidden.
    pub fn policy(&self, name: &str) -> CapabilityPolicy {
        self.policies
            .get(name)
            .copied()
            .unwrap_or(CapabilityPolicy::Forbid)
    }

    /// Whether `name` is part of the ambient surface.
    pub fn is_ambient(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    /// All capability names in the table.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::defaults()
    }
}

// ─── Sandbox configuration ──────────────────────────────────────────────

/// Configuration shared by all contexts of one worker.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Outbound HTTP request timeout in seconds (default: 30).
    pub http_timeout_secs: u64,
    pub policies: CapabilityTable,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: 30,
            policies: CapabilityTable::defaults(),
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self {
            http_timeout_secs: std::env::var("PLUGDOCK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            policies: CapabilityTable::defaults(),
        }
    }

    /// Shared outbound HTTP client for contexts using this config.
    pub fn build_http_client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(self.http_timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default()
    }
}

// ─── Invocation context ─────────────────────────────────────────────────

/// The restricted ambient environment for one invocation.
///
/// Created by the worker runtime with the caller-opaque invocation id
/// (empty during module load), the plugin's custom globals, and the
/// worker's log buffer. Must be constructed on a tokio runtime; capability
/// dispatch from plugin code happens on blocking threads and re-enters the
/// runtime through the captured handle.
#[derive(Debug)]
pub struct InvocationContext {
    call_id: String,
    globals: Map<String, Value>,
    policies: CapabilityTable,
    log: Arc<LogBuffer>,
    http: reqwest::Client,
    handle: tokio::runtime::Handle,
    cancel: CancellationToken,
    pub(crate) timers: Arc<Mutex<TimerTable>>,
    pub(crate) fetches: Mutex<FetchLedger>,
}

impl InvocationContext {
    pub fn new(
        call_id: impl Into<String>,
        globals: Map<String, Value>,
        log: Arc<LogBuffer>,
        config: &SandboxConfig,
        http: reqwest::Client,
    ) -> Result<Self, SandboxError> {
        Self::with_cancel(call_id, globals, log, config, http, CancellationToken::new())
    }

    /// Like [`new`](Self::new), with the cancel signal parented to the
    /// given token. Worker termination fires the parent so in-flight
    /// capability calls unwind even when the context is never closed.
    pub fn with_cancel(
        call_id: impl Into<String>,
        globals: Map<String, Value>,
        log: Arc<LogBuffer>,
        config: &SandboxConfig,
        http: reqwest::Client,
        cancel: CancellationToken,
    ) -> Result<Self, SandboxError> {
        let policies = config.policies.clone();
        // Injected globals may not shadow a pre-existing ambient name.
        for name in globals.keys() {
            if policies.is_ambient(name) {
                return Err(SandboxError::ReservedGlobal(name.clone()));
            }
        }
        Ok(Self {
            call_id: call_id.into(),
            globals,
            policies,
            log,
            http,
            handle: tokio::runtime::Handle::current(),
            cancel,
            timers: Arc::new(Mutex::new(TimerTable::new())),
            fetches: Mutex::new(FetchLedger::new()),
        })
    }

    /// The caller-opaque invocation id ("" during module load).
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Cancel signal fired when the context closes.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Look up an injected custom global.
    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub(crate) fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn runtime(&self) -> &tokio::runtime::Handle {
        &self.handle
    }

    /// Append a plugin log line to the worker's buffer.
    pub fn log(&self, logger_name: &str, level: &str, message: &str) {
        self.log.append(logger_name, level, message);
    }

    /// Register a timer and sleep until it fires or the context closes.
    pub async fn sleep(&self, delay_ms: u64) -> Result<(), SandboxError> {
        let id = self.timer_start(delay_ms);
        self.timer_wait(id).await
    }

    /// Dispatch a named capability call from plugin code.
    ///
    /// Synchronous by design: module engines call this from blocking
    /// threads, and asynchronous capabilities block on the captured
    /// runtime handle. Do not call from an async task; use the dedicated
    /// async methods (`fetch`, `sleep`, `timer_wait`) there instead.
    pub fn dispatch(&self, name: &str, payload: Value) -> Result<Value, SandboxError> {
        match self.policies.policy(name) {
            CapabilityPolicy::Forbid => {
                return Err(SandboxError::Unsupported(name.to_string()));
            }
            CapabilityPolicy::Allow
            | CapabilityPolicy::Wrap
            | CapabilityPolicy::Replace => {}
        }

        match name {
            capability::FETCH => {
                let request: FetchRequest = serde_json::from_value(payload)?;
                let response = self.handle.clone().block_on(self.fetch(request))?;
                Ok(serde_json::to_value(response)?)
            }
            capability::TIMER_START => {
                let args: TimerStartArgs = serde_json::from_value(payload)?;
                Ok(serde_json::json!({ "id": self.timer_start(args.delay_ms) }))
            }
            capability::TIMER_CANCEL => {
                let args: TimerIdArgs = serde_json::from_value(payload)?;
                Ok(serde_json::json!({ "cancelled": self.timer_cancel(args.id) }))
            }
            capability::TIMER_WAIT => {
                let args: TimerIdArgs = serde_json::from_value(payload)?;
                self.handle.clone().block_on(self.timer_wait(args.id))?;
                Ok(Value::Null)
            }
            capability::LOG => {
                let args: LogArgs = serde_json::from_value(payload)?;
                self.log(&args.logger, &args.level, &args.message);
                Ok(Value::Null)
            }
            capability::GLOBAL_GET => {
                let args: GlobalGetArgs = serde_json::from_value(payload)?;
                Ok(self.global(&args.name).cloned().unwrap_or(Value::Null))
            }
            capability::CLOCK_NOW => Ok(Value::String(chrono::Utc::now().to_rfc3339())),
            capability::RANDOM => Ok(Value::String(Uuid::new_v4().to_string())),
            other => Err(SandboxError::Unsupported(other.to_string())),
        }
    }

    /// Close the context: flush pending fetch records, cancel every
    /// tracked timer, and fire the cancel signal. Returns the ordered
    /// fetch records emitted during the invocation.
    pub(crate) fn close(&self) -> Vec<FetchRecord> {
        let records = {
            let mut ledger = self.fetches.lock().unwrap();
            ledger.flush_pending();
            ledger.take_emitted()
        };
        self.timers.lock().unwrap().cancel_all();
        self.cancel.cancel();
        records
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimerStartArgs {
    delay_ms: u64,
}

#[derive(serde::Deserialize)]
struct TimerIdArgs {
    id: u64,
}

#[derive(serde::Deserialize)]
struct LogArgs {
    #[serde(default = "default_logger")]
    logger: String,
    #[serde(default = "default_level")]
    level: String,
    message: String,
}

fn default_logger() -> String {
    "default".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(serde::Deserialize)]
struct GlobalGetArgs {
    name: String,
}

// ─── Context slot ───────────────────────────────────────────────────────

/// Worker-owned slot holding the active context, if any.
///
/// At most one context may be active per worker; activating while
/// another is active fails with "cannot reenter context". Module engines
/// keep a clone and resolve the current context at capability-call time.
#[derive(Clone, Default)]
pub struct ContextSlot {
    inner: Arc<Mutex<Option<Arc<InvocationContext>>>>,
}

impl ContextSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate a context. Fails if one is already active.
    pub fn activate(&self, ctx: Arc<InvocationContext>) -> Result<(), SandboxError> {
        let mut slot = self.inner.lock().unwrap();
        if slot.is_some() {
            return Err(SandboxError::Reenter);
        }
        *slot = Some(ctx);
        Ok(())
    }

    /// The active context, or an error when none is.
    pub fn current(&self) -> Result<Arc<InvocationContext>, SandboxError> {
        self.inner
            .lock()
            .unwrap()
            .clone()
            .ok_or(SandboxError::NoActiveContext)
    }

    /// Deactivate and clean up the active context, restoring the
    /// unrestricted slot for the worker's next invocation. Returns the
    /// fetch records emitted during the invocation.
    pub fn close(&self) -> Result<Vec<FetchRecord>, SandboxError> {
        let ctx = self
            .inner
            .lock()
            .unwrap()
            .take()
            .ok_or(SandboxError::NoActiveContext)?;
        Ok(ctx.close())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
