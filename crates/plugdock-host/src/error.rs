//! Host and sandbox error types.

use thiserror::Error;

use crate::host::HostState;

/// Errors surfaced by [`crate::host::PluginHost`] operations.
///
/// Note that `invoke` resolves with an `InvokeResult` carrying
/// `ErrorDetails` for anything that went wrong *inside* an invocation;
/// these variants cover state-precondition failures only.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("host is not ready (state: {0})")]
    NotReady(HostState),

    #[error("host is already closing")]
    AlreadyClosing,

    #[error("worker channel closed")]
    ChannelClosed,
}

/// Errors raised by the per-invocation sandbox.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// A forbidden capability was read or invoked.
    #[error("{0} is not supported")]
    Unsupported(String),

    /// A second context was activated while one is already active.
    #[error("cannot reenter context")]
    Reenter,

    /// A capability was dispatched with no active context.
    #[error("no active invocation context")]
    NoActiveContext,

    /// A custom global collides with a pre-existing ambient name.
    #[error("cannot redefine ambient name: {0}")]
    ReservedGlobal(String),

    /// The invocation was cancelled by the caller's signal.
    #[error("Invocation was aborted")]
    Aborted,

    #[error("unknown timer: {0}")]
    UnknownTimer(u64),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("invalid capability payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Errors internal to a module engine, before they are flattened into
/// serializable `ErrorDetails` at the worker boundary.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("module validation error: {0}")]
    Validation(String),

    #[error("module not found: {0}")]
    NotFound(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
