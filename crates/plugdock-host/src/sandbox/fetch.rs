//! Instrumented outbound HTTP for sandboxed plugins.
//!
//! Each wrapped fetch allocates a record before the request leaves,
//! carries the invocation id as a correlation header, and tallies bytes
//! in both directions. Records are emitted when the response body is
//! fully consumed or when the invocation ends, whichever comes first.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::SandboxError;
use crate::result::FetchRecord;

use super::InvocationContext;

/// Correlation header injected on outbound requests when the context
/// carries a non-empty invocation id.
pub const INVOCATION_ID_HEADER: &str = "Yext-Invocation-ID";

/// Maximum response body size accepted from an outbound call (10 MB).
const MAX_FETCH_RESPONSE_BYTES: u64 = 10 * 1024 * 1024;

// ─── Request / response shapes ──────────────────────────────────────────

fn default_method() -> String {
    "GET".to_string()
}

/// Normalized outbound request as plugins hand it to the wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            body: Some(body.into()),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Response handed back to the plugin, body fully read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

impl FetchResponse {
    /// Synthesized when the context's cancel signal (not the caller's)
    /// interrupts an in-flight request.
    fn request_aborted() -> Self {
        Self {
            status: 408,
            status_text: "Request aborted.".to_string(),
            headers: HashMap::new(),
            body: String::new(),
        }
    }
}

// ─── Fetch ledger ───────────────────────────────────────────────────────

/// A fetch whose record has not been emitted yet.
#[derive(Debug)]
struct PendingFetch {
    scheme: String,
    host: String,
    method: String,
    start_time: DateTime<Utc>,
    status: u16,
    status_text: String,
    sent_bytes: u64,
    received_bytes: u64,
}

impl PendingFetch {
    fn finish(self, end_time: DateTime<Utc>) -> FetchRecord {
        FetchRecord {
            scheme: self.scheme,
            host: self.host,
            method: self.method,
            status: self.status,
            status_text: self.status_text,
            start_time: self.start_time,
            end_time,
            sent_bytes: self.sent_bytes,
            received_bytes: self.received_bytes,
        }
    }
}

/// Per-context bookkeeping: pending fetches (keyed in allocation order)
/// plus records already emitted, in emission order.
#[derive(Debug)]
pub(crate) struct FetchLedger {
    next_id: u64,
    pending: BTreeMap<u64, PendingFetch>,
    emitted: Vec<FetchRecord>,
}

impl FetchLedger {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            pending: BTreeMap::new(),
            emitted: Vec::new(),
        }
    }

    fn begin(&mut self, scheme: String, host: String, method: String, sent_bytes: u64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(
            id,
            PendingFetch {
                scheme,
                host,
                method,
                start_time: Utc::now(),
                status: 0,
                status_text: String::new(),
                sent_bytes,
                received_bytes: 0,
            },
        );
        id
    }

    fn emit(&mut self, id: u64) {
        if let Some(pending) = self.pending.remove(&id) {
            self.emitted.push(pending.finish(Utc::now()));
        }
    }

    /// Emit every fetch whose body was never fully consumed.
    pub(crate) fn flush_pending(&mut self) {
        let ids: Vec<u64> = self.pending.keys().copied().collect();
        for id in ids {
            self.emit(id);
        }
    }

    pub(crate) fn take_emitted(&mut self) -> Vec<FetchRecord> {
        std::mem::take(&mut self.emitted)
    }
}

// ─── Wrapped fetch ──────────────────────────────────────────────────────

/// Resolves when the optional token is cancelled; pends forever otherwise.
async fn cancelled_opt(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled_owned().await,
        None => std::future::pending().await,
    }
}

impl InvocationContext {
    /// Instrumented outbound HTTP call under the context's cancel signal.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, SandboxError> {
        self.fetch_with_signal(request, None).await
    }

    /// Same as [`fetch`](Self::fetch), joining a caller-supplied cancel
    /// signal with the context's own. A caller abort surfaces as
    /// `Aborted`; a context abort (the invocation ended) synthesizes a
    /// 408 response so the plugin's abandoned call settles quietly.
    pub async fn fetch_with_signal(
        &self,
        request: FetchRequest,
        caller: Option<CancellationToken>,
    ) -> Result<FetchResponse, SandboxError> {
        let url = Url::parse(&request.url)
            .map_err(|_| SandboxError::Http(format!("invalid URL: {}", request.url)))?;
        let method = request.method.to_ascii_uppercase();
        let parsed_method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| SandboxError::Http(format!("invalid method: {}", request.method)))?;

        let scheme = url.scheme().to_string();
        let host = url.host_str().unwrap_or_default().to_string();
        let sent_bytes = request.body.as_ref().map(|b| b.len() as u64).unwrap_or(0);

        let id = {
            let mut ledger = self.fetches.lock().unwrap();
            ledger.begin(scheme, host, method, sent_bytes)
        };

        let mut builder = self.http_client().request(parsed_method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !self.call_id().is_empty() {
            builder = builder.header(INVOCATION_ID_HEADER, self.call_id());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let send = builder.send();
        tokio::pin!(send);

        let mut response = tokio::select! {
            resp = &mut send => resp.map_err(|e| SandboxError::Http(e.to_string()))?,
            _ = self.cancel_token().cancelled() => {
                return Ok(self.synthesize_aborted(id));
            }
            _ = cancelled_opt(caller.clone()) => {
                return Err(SandboxError::Aborted);
            }
        };

        let status = response.status().as_u16();
        let status_text = response
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_string();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        {
            let mut ledger = self.fetches.lock().unwrap();
            if let Some(pending) = ledger.pending.get_mut(&id) {
                pending.status = status;
                pending.status_text = status_text.clone();
            }
        }

        // Observe the response body chunk by chunk, tallying bytes; the
        // record is emitted once the stream completes.
        let mut body = Vec::new();
        loop {
            tokio::select! {
                chunk = response.chunk() => match chunk {
                    Ok(Some(bytes)) => {
                        {
                            let mut ledger = self.fetches.lock().unwrap();
                            if let Some(pending) = ledger.pending.get_mut(&id) {
                                pending.received_bytes += bytes.len() as u64;
                            }
                        }
                        body.extend_from_slice(&bytes);
                        if body.len() as u64 > MAX_FETCH_RESPONSE_BYTES {
                            return Err(SandboxError::Http(format!(
                                "response body too large (max: {MAX_FETCH_RESPONSE_BYTES} bytes)"
                            )));
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return Err(SandboxError::Http(e.to_string())),
                },
                _ = self.cancel_token().cancelled() => {
                    return Ok(self.synthesize_aborted(id));
                }
                _ = cancelled_opt(caller.clone()) => {
                    return Err(SandboxError::Aborted);
                }
            }
        }

        self.fetches.lock().unwrap().emit(id);

        Ok(FetchResponse {
            status,
            status_text,
            headers,
            body: String::from_utf8_lossy(&body).to_string(),
        })
    }

    fn synthesize_aborted(&self, id: u64) -> FetchResponse {
        let mut ledger = self.fetches.lock().unwrap();
        if let Some(pending) = ledger.pending.get_mut(&id) {
            pending.status = 408;
            pending.status_text = "Request aborted.".to_string();
        }
        ledger.emit(id);
        FetchResponse::request_aborted()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
