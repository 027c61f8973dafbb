//! WASM module engine using Extism (wasmtime).
//!
//! Each worker holds its own plugin instance with configurable memory
//! limits and fuel-based execution limits. Module binaries are validated
//! before instantiation: size ceiling, magic bytes, and an import
//! analysis that rejects namespaces outside the allowed list. Callable
//! exports are discovered from the export section; capability host
//! functions dispatch through the worker's active invocation context.

use std::path::PathBuf;

use serde_json::Value;
use url::Url;

use crate::error::EngineError;
use crate::result::{names, ErrorDetails};
use crate::sandbox::{capability, ContextSlot};

use super::{ModuleEngine, ModuleInstance};

// ─── Constants ──────────────────────────────────────────────────────────

/// WASM magic bytes: `\0asm`
const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Allowed WASM import namespaces. Imports outside these are rejected.
const ALLOWED_IMPORT_NAMESPACES: &[&str] = &[
    "env",                    // Extism kernel imports
    "extism:host/env",        // Extism host SDK
    "extism:host/user",       // capability host functions
    "wasi_snapshot_preview1", // WASI preview 1 (only when enabled)
    "wasi_unstable",          // legacy WASI
];

// ─── Configuration ──────────────────────────────────────────────────────

/// Configuration for the WASM sandbox.
#[derive(Debug, Clone)]
pub struct WasmConfig {
    /// Maximum memory in bytes (default: 32 MB).
    pub memory_limit: usize,
    /// Maximum fuel (instructions) per execution (default: 1_000_000).
    pub fuel_limit: u64,
    /// Maximum module binary size in bytes (default: 50 MB).
    pub max_module_size: u64,
    /// Whether to enable WASI (default: false for security).
    /// When false, plugins cannot access env vars, filesystem, or stdio.
    pub wasi_enabled: bool,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            memory_limit: 32 * 1024 * 1024,
            fuel_limit: 1_000_000,
            max_module_size: 50 * 1024 * 1024,
            wasi_enabled: false,
        }
    }
}

impl WasmConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self {
            memory_limit: std::env::var("PLUGDOCK_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(32)
                * 1024
                * 1024,
            fuel_limit: std::env::var("PLUGDOCK_FUEL_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000_000),
            max_module_size: std::env::var("PLUGDOCK_MAX_WASM_SIZE_MB")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(50)
                * 1024
                * 1024,
            wasi_enabled: std::env::var("PLUGDOCK_WASI_ENABLED")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
        }
    }
}

// ─── Engine ─────────────────────────────────────────────────────────────

/// Module engine backed by Extism WASM sandboxes.
#[derive(Debug, Clone, Default)]
pub struct WasmEngine {
    config: WasmConfig,
}

impl WasmEngine {
    pub fn new(config: WasmConfig) -> Self {
        Self { config }
    }

    /// Resolve a module URI to a filesystem path. Only `file://` URIs
    /// (or plain paths) are accepted.
    fn resolve_module_path(module: &str) -> Result<PathBuf, EngineError> {
        match Url::parse(module) {
            Ok(url) if url.scheme() == "file" => url.to_file_path().map_err(|_| {
                EngineError::Validation(format!("invalid file URI: {module}"))
            }),
            Ok(url) => Err(EngineError::Validation(format!(
                "unsupported module scheme '{}' in {module}",
                url.scheme()
            ))),
            // Not a URL at all: treat it as a filesystem path.
            Err(_) => Ok(PathBuf::from(module)),
        }
    }

    /// Validate a WASM binary.
    ///
    /// Checks:
    /// 1. Size within limits
    /// 2. Magic bytes (0x00 0x61 0x73 0x6D = "\0asm")
    /// 3. Import analysis: only allowed namespaces
    fn validate(&self, wasm_bytes: &[u8]) -> Result<(), EngineError> {
        if wasm_bytes.len() as u64 > self.config.max_module_size {
            return Err(EngineError::Validation(format!(
                "WASM binary too large: {} bytes (max: {} bytes)",
                wasm_bytes.len(),
                self.config.max_module_size
            )));
        }

        if wasm_bytes.len() < 4 || &wasm_bytes[..4] != WASM_MAGIC {
            return Err(EngineError::Validation(
                "invalid WASM binary: magic bytes mismatch".into(),
            ));
        }

        validate_imports(wasm_bytes)
    }
}

/// Validate WASM imports against the allowed namespace list.
fn validate_imports(wasm_bytes: &[u8]) -> Result<(), EngineError> {
    use wasmparser::{Parser, Payload};

    for payload in Parser::new(0).parse_all(wasm_bytes) {
        let payload = payload
            .map_err(|e| EngineError::Validation(format!("failed to parse WASM: {e}")))?;

        if let Payload::ImportSection(reader) = payload {
            for import in reader {
                let import = import.map_err(|e| {
                    EngineError::Validation(format!("failed to read import: {e}"))
                })?;

                if !ALLOWED_IMPORT_NAMESPACES.contains(&import.module) {
                    return Err(EngineError::Validation(format!(
                        "unauthorized import namespace: '{}' (function: '{}'); \
                         allowed namespaces: {ALLOWED_IMPORT_NAMESPACES:?}",
                        import.module, import.name
                    )));
                }
            }
        }
    }

    Ok(())
}

/// Discover callable exports from the export section.
///
/// Function exports are kept in declaration order; names starting with
/// `_` (toolchain intrinsics) are skipped.
fn discover_exports(wasm_bytes: &[u8]) -> Result<Vec<String>, EngineError> {
    use wasmparser::{ExternalKind, Parser, Payload};

    let mut functions = Vec::new();
    for payload in Parser::new(0).parse_all(wasm_bytes) {
        let payload = payload
            .map_err(|e| EngineError::Validation(format!("failed to parse WASM: {e}")))?;

        if let Payload::ExportSection(reader) = payload {
            for export in reader {
                let export = export.map_err(|e| {
                    EngineError::Validation(format!("failed to read export: {e}"))
                })?;
                if export.kind == ExternalKind::Func && !export.name.starts_with('_') {
                    functions.push(export.name.to_string());
                }
            }
        }
    }
    Ok(functions)
}

impl ModuleEngine for WasmEngine {
    fn load(
        &self,
        module: &str,
        surface: &ContextSlot,
    ) -> Result<Box<dyn ModuleInstance>, ErrorDetails> {
        let path = Self::resolve_module_path(module)
            .map_err(|e| ErrorDetails::new(names::LOAD_ERROR, e.to_string()))?;
        let wasm_bytes = std::fs::read(&path).map_err(|e| {
            ErrorDetails::new(
                names::LOAD_ERROR,
                format!("failed to read module {}: {e}", path.display()),
            )
        })?;

        self.validate(&wasm_bytes)
            .map_err(|e| ErrorDetails::new(names::LOAD_ERROR, e.to_string()))?;

        let function_names = discover_exports(&wasm_bytes)
            .map_err(|e| ErrorDetails::new(names::LOAD_ERROR, e.to_string()))?;

        let manifest = extism::Manifest::new([extism::Wasm::data(wasm_bytes)])
            .with_memory_max((self.config.memory_limit / 65536) as u32);

        let mut builder = extism::PluginBuilder::new(manifest)
            .with_wasi(self.config.wasi_enabled)
            .with_fuel_limit(self.config.fuel_limit);

        if self.config.wasi_enabled {
            tracing::warn!(
                module = %module,
                "WASI enabled for plugin — plugin can access environment variables. \
                 Avoid running with sensitive env vars exposed."
            );
        }

        for &name in capability::ALL {
            builder = builder.with_function(
                name,
                [extism::PTR],
                [extism::PTR],
                extism::UserData::new(surface.clone()),
                move |plugin, inputs, outputs, user_data| {
                    capability_host_call(name, plugin, inputs, outputs, user_data)
                },
            );
        }

        let plugin = builder
            .build()
            .map_err(|e| ErrorDetails::new(names::LOAD_ERROR, e.to_string()))?;

        Ok(Box::new(WasmInstance {
            plugin,
            function_names,
            module: module.to_string(),
        }))
    }
}

/// Bridge one capability call out of the guest: decode the JSON payload
/// from plugin memory, dispatch through the active invocation context,
/// and write the JSON reply back. Dispatch failures (including forbidden
/// capabilities) trap the guest call.
fn capability_host_call(
    name: &str,
    plugin: &mut extism::CurrentPlugin,
    inputs: &[extism::Val],
    outputs: &mut [extism::Val],
    user_data: extism::UserData<ContextSlot>,
) -> Result<(), extism::Error> {
    let handle = plugin
        .memory_from_val(&inputs[0])
        .ok_or_else(|| extism::Error::msg("invalid capability payload pointer"))?;
    let payload = plugin.memory_bytes(handle)?.to_vec();
    let argument: Value = if payload.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&payload)?
    };

    let surface = user_data.get()?;
    let surface = surface
        .lock()
        .map_err(|_| extism::Error::msg("context surface poisoned"))?;
    let ctx = surface
        .current()
        .map_err(|e| extism::Error::msg(e.to_string()))?;

    let reply = ctx
        .dispatch(name, argument)
        .map_err(|e| extism::Error::msg(e.to_string()))?;

    let reply_bytes = serde_json::to_vec(&reply)?;
    let out = plugin.memory_new(&reply_bytes)?;
    outputs[0] = plugin.memory_to_val(out);
    Ok(())
}

struct WasmInstance {
    plugin: extism::Plugin,
    function_names: Vec<String>,
    module: String,
}

impl ModuleInstance for WasmInstance {
    fn function_names(&self) -> Vec<String> {
        self.function_names.clone()
    }

    fn call(&mut self, function: &str, argument: Value) -> Result<Value, ErrorDetails> {
        if !self.plugin.function_exists(function) {
            return Err(ErrorDetails::not_found(function));
        }

        let input = serde_json::to_vec(&argument)
            .map_err(|e| ErrorDetails::internal(e.to_string()))?;

        let output = self
            .plugin
            .call::<&[u8], Vec<u8>>(function, &input)
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("fuel") {
                    ErrorDetails::new(
                        names::RUNTIME_ERROR,
                        format!("execution timeout: {} exceeded fuel limit", self.module),
                    )
                } else if msg.contains("memory") {
                    ErrorDetails::new(
                        names::RUNTIME_ERROR,
                        format!(
                            "memory limit exceeded: {} exceeded the configured memory cap",
                            self.module
                        ),
                    )
                } else {
                    ErrorDetails::new(names::RUNTIME_ERROR, msg)
                }
            })?;

        if output.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output).map_err(|e| {
            ErrorDetails::new(
                names::RUNTIME_ERROR,
                format!("plugin returned invalid JSON: {e}"),
            )
        })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
