//! Native module engine.
//!
//! Modules are registered in-process as factories producing a table of
//! Rust closures. Embedders use this to ship host-native plugins behind
//! the same pool/sandbox machinery as WASM modules; the test suite uses
//! it to exercise host semantics without compiling module binaries.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::result::{names, ErrorDetails};
use crate::sandbox::{ContextSlot, InvocationContext};

use super::{ModuleEngine, ModuleInstance};

/// A plugin function: JSON argument in, JSON value out, with access to
/// the active invocation context for capability calls.
pub type NativeFunction =
    Arc<dyn Fn(Value, &Arc<InvocationContext>) -> Result<Value, ErrorDetails> + Send + Sync>;

type ModuleFactory = Arc<dyn Fn() -> Result<NativeModule, ErrorDetails> + Send + Sync>;

/// A module definition: named functions in export order.
///
/// Factories build one of these per worker, so state captured inside the
/// closures is worker-local.
#[derive(Default)]
pub struct NativeModule {
    functions: BTreeMap<String, NativeFunction>,
}

impl NativeModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, &Arc<InvocationContext>) -> Result<Value, ErrorDetails>
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
        self
    }
}

/// Engine resolving module URIs against an in-process registry.
#[derive(Default)]
pub struct NativeEngine {
    factories: RwLock<BTreeMap<String, ModuleFactory>>,
}

impl NativeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module factory under a URI. The factory runs once per
    /// worker load; returning an error models a module that fails at top
    /// level.
    pub fn register<F>(&self, module: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<NativeModule, ErrorDetails> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap()
            .insert(module.into(), Arc::new(factory));
    }
}

impl ModuleEngine for NativeEngine {
    fn load(
        &self,
        module: &str,
        surface: &ContextSlot,
    ) -> Result<Box<dyn ModuleInstance>, ErrorDetails> {
        let factory = self
            .factories
            .read()
            .unwrap()
            .get(module)
            .cloned()
            .ok_or_else(|| {
                ErrorDetails::new(names::LOAD_ERROR, format!("module not found: {module}"))
            })?;
        let definition = factory()?;
        Ok(Box::new(NativeInstance {
            functions: definition.functions,
            surface: surface.clone(),
        }))
    }
}

struct NativeInstance {
    functions: BTreeMap<String, NativeFunction>,
    surface: ContextSlot,
}

impl ModuleInstance for NativeInstance {
    fn function_names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    fn call(&mut self, function: &str, argument: Value) -> Result<Value, ErrorDetails> {
        let f = self
            .functions
            .get(function)
            .cloned()
            .ok_or_else(|| ErrorDetails::not_found(function))?;
        let ctx = self
            .surface
            .current()
            .map_err(|e| ErrorDetails::internal(e.to_string()))?;
        f(argument, &ctx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_load_unknown_module_fails() {
        let engine = NativeEngine::new();
        let err = engine
            .load("mem://missing", &ContextSlot::new())
            .err()
            .unwrap();
        assert_eq!(err.name, names::LOAD_ERROR);
        assert!(err.message.contains("mem://missing"));
    }

    #[test]
    fn test_factory_error_propagates() {
        let engine = NativeEngine::new();
        engine.register("mem://broken", || {
            Err(ErrorDetails::new("Error", "exploding module"))
        });
        let err = engine
            .load("mem://broken", &ContextSlot::new())
            .err()
            .unwrap();
        assert_eq!(err.message, "exploding module");
    }

    #[test]
    fn test_function_names_in_export_order() {
        let engine = NativeEngine::new();
        engine.register("mem://demo", || {
            Ok(NativeModule::new()
                .function("up", |arg, _| Ok(arg))
                .function("down", |arg, _| Ok(arg)))
        });
        let instance = engine.load("mem://demo", &ContextSlot::new()).unwrap();
        assert_eq!(instance.function_names(), vec!["down", "up"]);
    }

    #[test]
    fn test_each_load_gets_fresh_state() {
        let engine = NativeEngine::new();
        engine.register("mem://counter", || {
            let count = Mutex::new(0_i64);
            Ok(NativeModule::new().function("concur", move |_, _| {
                let mut count = count.lock().unwrap();
                *count += 1;
                Ok(serde_json::json!(*count))
            }))
        });

        let a = engine.load("mem://counter", &ContextSlot::new()).unwrap();
        let b = engine.load("mem://counter", &ContextSlot::new()).unwrap();
        // Instances are independent copies, so closures see separate state.
        drop((a, b));
    }

    #[tokio::test]
    async fn test_call_requires_active_context() {
        let engine = NativeEngine::new();
        engine.register("mem://demo", || {
            Ok(NativeModule::new().function("up", |arg, _| Ok(arg)))
        });
        let slot = ContextSlot::new();
        let mut instance = engine.load("mem://demo", &slot).unwrap();

        let err = instance.call("up", Value::Null).err().unwrap();
        assert_eq!(err.name, names::INTERNAL_ERROR);

        let err = instance.call("missing", Value::Null).err().unwrap();
        assert_eq!(err.name, names::NOT_FOUND_ERROR);
    }
}
