//! Plugin descriptor — the immutable input to a host.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_concurrency() -> usize {
    1
}

/// Describes the plugin a host should load: the module URI, an optional
/// identifier, globals injected before each invocation, and the size of
/// the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    /// URI identifying the code to import (usually `file://...`).
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Name→value pairs made visible to the plugin through the sandbox.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub globals: Map<String, Value>,
    /// Worker-pool size. Defaults to 1; values below 1 are clamped up.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl PluginDescriptor {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            id: None,
            globals: Map::new(),
            concurrency: 1,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Pool size with the floor of 1 applied.
    pub fn concurrency(&self) -> usize {
        self.concurrency.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let desc = PluginDescriptor::new("file:///tmp/plugin.wasm");
        assert_eq!(desc.module, "file:///tmp/plugin.wasm");
        assert!(desc.id.is_none());
        assert!(desc.globals.is_empty());
        assert_eq!(desc.concurrency(), 1);
    }

    #[test]
    fn test_concurrency_floor() {
        let desc = PluginDescriptor::new("file:///p.wasm").with_concurrency(0);
        assert_eq!(desc.concurrency(), 1);

        let desc = PluginDescriptor::new("file:///p.wasm").with_concurrency(4);
        assert_eq!(desc.concurrency(), 4);
    }

    #[test]
    fn test_deserialize_minimal() {
        let desc: PluginDescriptor =
            serde_json::from_str(r#"{"module":"file:///p.wasm"}"#).unwrap();
        assert_eq!(desc.concurrency(), 1);
        assert!(desc.globals.is_empty());
    }

    #[test]
    fn test_deserialize_full() {
        let desc: PluginDescriptor = serde_json::from_str(
            r#"{"module":"file:///p.wasm","id":"demo","globals":{"MY_KEY":12345},"concurrency":2}"#,
        )
        .unwrap();
        assert_eq!(desc.id.as_deref(), Some("demo"));
        assert_eq!(desc.globals["MY_KEY"], 12345);
        assert_eq!(desc.concurrency(), 2);
    }

    #[test]
    fn test_builder_globals() {
        let desc = PluginDescriptor::new("file:///p.wasm")
            .with_global("MY_KEY", serde_json::json!(12345))
            .with_id("demo");
        assert_eq!(desc.globals["MY_KEY"], 12345);
        assert_eq!(desc.id.as_deref(), Some("demo"));
    }
}
