//! Typed message protocol between the host and its workers.
//!
//! Messages travel over in-process channels as tagged variants; replies
//! are correlated back to their request through a UUID token. A worker
//! sends exactly one `Load` reply (first), then one `Invoke` reply per
//! invoke message, in order.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::descriptor::PluginDescriptor;
use crate::result::{InvokeResult, LoadResult};

/// Messages the host posts to a worker.
#[derive(Debug)]
pub enum HostToWorker {
    /// Load the plugin module and report discovered exports. Sent exactly
    /// once; a second load fails with "plugin is already loaded".
    Load { plugin: Arc<PluginDescriptor> },
    /// Call `function` with `argument` inside a fresh sandbox. `token`
    /// correlates the reply; `invocation_id` is a caller-opaque id the
    /// sandbox propagates into outbound HTTP.
    Invoke {
        token: Uuid,
        invocation_id: Option<String>,
        function: String,
        argument: Value,
    },
}

/// Messages a worker posts back to its host.
#[derive(Debug)]
pub enum WorkerToHost {
    Load(LoadResult),
    Invoke { token: Uuid, result: InvokeResult },
}

pub type HostSender = mpsc::UnboundedSender<HostToWorker>;
pub type HostReceiver = mpsc::UnboundedReceiver<HostToWorker>;
pub type WorkerSender = mpsc::UnboundedSender<WorkerToHost>;
pub type WorkerReceiver = mpsc::UnboundedReceiver<WorkerToHost>;
