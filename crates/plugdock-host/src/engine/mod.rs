//! Module engines — the seam between the host and the runtime that
//! actually executes plugin code.
//!
//! The host never interprets user code itself; it hands the module URI
//! to an engine and calls discovered exports through the
//! [`ModuleInstance`] it gets back. Both traits are blocking: the worker
//! runtime drives them from `spawn_blocking` threads, and capability
//! calls re-enter the async world through the worker's [`ContextSlot`].

mod native;
mod wasm;

pub use native::{NativeEngine, NativeModule};
pub use wasm::{WasmConfig, WasmEngine};

use serde_json::Value;

use crate::result::ErrorDetails;
use crate::sandbox::ContextSlot;

/// Loads plugin modules into isolated instances.
pub trait ModuleEngine: Send + Sync {
    /// Load `module` (a URI) and return a fresh instance. The worker's
    /// context slot is handed over so the engine can resolve the active
    /// invocation context at capability-call time. Failures come back as
    /// serializable `ErrorDetails` suitable for a `LoadResult`.
    fn load(
        &self,
        module: &str,
        surface: &ContextSlot,
    ) -> Result<Box<dyn ModuleInstance>, ErrorDetails>;
}

/// One loaded copy of a plugin module.
pub trait ModuleInstance: Send {
    /// Callable exports, in discovery order.
    fn function_names(&self) -> Vec<String>;

    /// Invoke a named export with a JSON argument. Runs inside the
    /// currently active invocation context.
    fn call(&mut self, function: &str, argument: Value) -> Result<Value, ErrorDetails>;
}
