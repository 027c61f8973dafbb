//! plugdock host core.
//!
//! A plugin host: it loads an untrusted user-supplied module into a pool
//! of isolated workers and invokes its exported functions with JSON
//! arguments, returning the result plus per-invocation telemetry
//! (captured logs and outbound fetch records). Supports caller-side
//! cancellation, concurrent invocations across the pool, and transparent
//! replacement of crashed or aborted workers.

pub mod descriptor;
pub mod engine;
pub mod error;
pub mod host;
pub mod logbuf;
pub mod protocol;
pub mod result;
pub mod sandbox;
pub mod worker;

pub use descriptor::PluginDescriptor;
pub use engine::{ModuleEngine, ModuleInstance, NativeEngine, NativeModule, WasmConfig, WasmEngine};
pub use error::{EngineError, HostError, SandboxError};
pub use host::{HostConfig, HostState, HostStatus, InvokeOptions, PluginHost};
pub use result::{ErrorDetails, FetchRecord, InvokeResult, LoadResult, LogRecord};
pub use sandbox::{
    CapabilityPolicy, CapabilityTable, ContextSlot, FetchRequest, FetchResponse,
    InvocationContext, SandboxConfig, INVOCATION_ID_HEADER,
};
